//! `/execute`, `/submit`, and `/health` request handlers.

use std::sync::Arc;
use std::time::Instant;

use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::batch::TestInput;
use crate::dispatch::{
    BatchExecuteRequest, Dispatcher, DispatchError, ExecuteRequest, ExecutionErrorKind,
};
use crate::http::request_id::RequestId;
use crate::language::LanguageRegistry;
use crate::validator::{ValidationError, Validator};

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub registry: Arc<LanguageRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub language: String,
    pub code: String,
    pub input: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MetricsBody {
    pub execution_time_ms: u128,
    pub memory_used_kb: u64,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponseBody {
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsBody>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitTestCase {
    pub input: String,
    pub expected_output: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub language: String,
    pub code: String,
    pub test_cases: Vec<SubmitTestCase>,
}

#[derive(Debug, Serialize)]
pub struct SubmitCaseResult {
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub passed: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponseBody {
    pub status: String,
    pub total_cases: usize,
    pub passed_cases: usize,
    pub results: Vec<SubmitCaseResult>,
    pub execution_time_ms: u128,
    pub timestamp: chrono::DateTime<Utc>,
    pub request_id: String,
}

fn request_id(req: &HttpRequest) -> String {
    req.extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

fn validation_status(error: &ValidationError) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({ "error": error.to_string() }))
}

pub async fn execute_code(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<ExecuteBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let request_id = request_id(&req);

    let validator = Validator::new(&state.registry);
    if let Err(e) = validator.validate_execute(&body.language, &body.code, body.input.as_deref()) {
        log::warn!("rejected /execute submission: {e}");
        return validation_status(&e);
    }

    let result = state
        .dispatcher
        .submit_execute(
            ExecuteRequest {
                language: body.language,
                code: body.code,
                input: body.input,
            },
            CancellationToken::new(),
        )
        .await;

    match result {
        Ok(result) => {
            let status_code = match result.error {
                None => actix_web::http::StatusCode::OK,
                Some(ExecutionErrorKind::Timeout) => actix_web::http::StatusCode::GATEWAY_TIMEOUT,
                Some(ExecutionErrorKind::SandboxUnavailable)
                | Some(ExecutionErrorKind::WorkspaceCreateFailure) => {
                    actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
                }
                Some(ExecutionErrorKind::RuntimeFailure) => actix_web::http::StatusCode::OK,
            };

            let metrics = match (result.execution_time_ms, result.memory_used_kb) {
                (Some(execution_time_ms), Some(memory_used_kb)) => Some(MetricsBody {
                    execution_time_ms,
                    memory_used_kb,
                }),
                _ => None,
            };

            let body = ExecuteResponseBody {
                output: result.output,
                error: result.error.map(|e| format!("{e:?}")),
                status: if status_code.is_success() {
                    "success".to_string()
                } else {
                    "error".to_string()
                },
                timestamp: Utc::now(),
                request_id,
                metrics,
            };
            HttpResponse::build(status_code).json(body)
        }
        Err(DispatchError::QueueFull) => {
            HttpResponse::TooManyRequests().json(serde_json::json!({
                "error": "queue is full, try again later",
                "request_id": request_id,
            }))
        }
        Err(DispatchError::Cancelled) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "submission was cancelled",
            "request_id": request_id,
        })),
    }
}

/// Trims surrounding whitespace and line endings before byte comparison.
fn normalize(output: &str) -> String {
    output.trim_end_matches(['\n', '\r']).trim().to_string()
}

pub async fn submit_code(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<SubmitBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let request_id = request_id(&req);

    let cases: Vec<TestInput> = body
        .test_cases
        .iter()
        .enumerate()
        .map(|(i, case)| TestInput {
            id: i.to_string(),
            input: case.input.clone(),
        })
        .collect();

    let validator = Validator::new(&state.registry);
    if let Err(e) = validator.validate_batch(&body.language, &body.code, &cases) {
        log::warn!("rejected /submit submission: {e}");
        return validation_status(&e);
    }

    let start = Instant::now();
    let result = state
        .dispatcher
        .submit_batch(
            BatchExecuteRequest {
                language: body.language,
                code: body.code,
                cases,
            },
            CancellationToken::new(),
        )
        .await;
    let execution_time_ms = start.elapsed().as_millis();

    match result {
        Ok(batch_result) => {
            let mut passed_cases = 0;
            let results: Vec<SubmitCaseResult> = body
                .test_cases
                .into_iter()
                .enumerate()
                .map(|(i, case)| {
                    let id = i.to_string();
                    let actual_output = batch_result
                        .get(&id)
                        .map(|c| c.output.clone())
                        .unwrap_or_else(|| "Failed to read output".to_string());
                    let passed = normalize(&actual_output) == normalize(&case.expected_output);
                    if passed {
                        passed_cases += 1;
                    }
                    SubmitCaseResult {
                        input: case.input,
                        expected_output: case.expected_output,
                        actual_output,
                        passed,
                    }
                })
                .collect();

            HttpResponse::Ok().json(SubmitResponseBody {
                status: "completed".to_string(),
                total_cases: results.len(),
                passed_cases,
                results,
                execution_time_ms,
                timestamp: Utc::now(),
                request_id,
            })
        }
        Err(DispatchError::QueueFull) => {
            HttpResponse::TooManyRequests().json(serde_json::json!({
                "error": "queue is full, try again later",
                "request_id": request_id,
            }))
        }
        Err(DispatchError::Cancelled) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": "submission was cancelled",
            "request_id": request_id,
        })),
    }
}

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_newlines_and_carriage_returns() {
        assert_eq!(normalize("6\r\n"), "6");
        assert_eq!(normalize("  6  \n"), "6");
        assert_eq!(normalize("6"), "6");
    }
}
