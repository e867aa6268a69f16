//! Batch execution: one container amortized across many test-case inputs.
//!
//! Materializes per-case input files plus a generated shell driver, runs the
//! driver once inside a single container, then harvests per-case output
//! files. Shelled out with the same `tokio::process::Command` idiom as
//! [`crate::sandbox::SandboxLauncher`]; input values never enter the driver
//! script as substituted text — they're written to files instead, so a test
//! case can't smuggle shell syntax into the driver. Case ids are still
//! interpolated into both the driver script and filesystem paths, so they're
//! restricted to a safe character class ([`is_valid_test_case_id`]) before
//! `prepare_workspace` writes anything.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::language::LanguageSpec;
use crate::metrics::MetricsProbe;

pub const PER_CASE_TIMEOUT_SECS: u64 = 5;
const PER_CASE_TIMEOUT_SENTINEL: &str =
    "Execution timed out. Your code may contain an infinite loop.";

#[derive(Debug, Clone)]
pub struct TestInput {
    pub id: String,
    pub input: String,
}

/// `id` is an opaque string chosen by the caller but still ends up
/// interpolated into a shell literal in the generated driver and joined
/// onto filesystem paths, so it's restricted to a safe character class
/// rather than trusted verbatim.
pub fn is_valid_test_case_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("failed to launch batch container: {0}")]
    Launch(String),
    #[error("batch execution timed out")]
    Timeout,
    #[error("invalid test case id: {0}")]
    InvalidTestCaseId(String),
    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One test case's raw program output plus the aggregate (whole-container)
/// metrics for the batch run. Kept structurally separate from `output` so
/// the submit path can compare raw program output for equality without
/// stripping free-text metric suffixes first.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseOutput {
    pub output: String,
    pub memory_used_kb: u64,
    pub execution_time_ms: u128,
}

/// Output per `TestInput.id`, in no particular order — callers that need
/// submission order should zip it back against the original request.
pub type BatchResult = HashMap<String, CaseOutput>;

#[derive(Debug, Clone)]
pub struct BatchRunner {
    runtime_binary: String,
}

impl BatchRunner {
    pub fn new() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
        }
    }

    /// Writes the source file, per-case input files, and driver script under `dir`.
    ///
    /// Rejects any case whose `id` falls outside [`is_valid_test_case_id`]
    /// before it reaches a filesystem path or the generated driver script.
    pub fn prepare_workspace(
        &self,
        dir: &Path,
        spec: &LanguageSpec,
        code: &str,
        cases: &[TestInput],
    ) -> Result<(), BatchError> {
        for case in cases {
            if !is_valid_test_case_id(&case.id) {
                return Err(BatchError::InvalidTestCaseId(case.id.clone()));
            }
        }

        std::fs::write(dir.join(spec.filename), code)?;

        let testcases_dir = dir.join("testcases");
        std::fs::create_dir_all(&testcases_dir)?;
        for case in cases {
            std::fs::write(testcases_dir.join(format!("{}.in", case.id)), &case.input)?;
        }

        let driver = generate_driver(spec, cases);
        std::fs::write(dir.join("run_tests.sh"), driver)?;

        Ok(())
    }

    /// Runs `run_tests.sh` inside a single container under `deadline`, then
    /// harvests per-case outputs and the aggregate memory/time metrics.
    pub async fn run(
        &self,
        workspace: &Path,
        cases: &[TestInput],
        container_name: &str,
        deadline: Duration,
        metrics: &MetricsProbe,
    ) -> Result<BatchResult, BatchError> {
        self.check_runtime_available().await?;

        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--memory".to_string(),
            "512m".to_string(),
            "--cpus".to_string(),
            "1".to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--pids-limit".to_string(),
            "100".to_string(),
            "-v".to_string(),
            format!("{}:/code", workspace.display()),
            "-w".to_string(),
            "/code".to_string(),
            "sh".to_string(),
            "run_tests.sh".to_string(),
        ];

        let start = Instant::now();
        let run = async {
            let child = Command::new(&self.runtime_binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| BatchError::Launch(e.to_string()))?;
            child
                .wait_with_output()
                .await
                .map_err(|e| BatchError::Launch(e.to_string()))
        };

        match timeout(deadline, run).await {
            Ok(Ok(_output)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                self.force_kill(container_name).await;
                return Err(BatchError::Timeout);
            }
        }
        let elapsed_ms = start.elapsed().as_millis();

        let memory_kb = metrics
            .sample(container_name)
            .await
            .ok()
            .map(|m| m.0)
            .unwrap_or(0);

        Ok(self.harvest(workspace, cases, memory_kb, elapsed_ms))
    }

    /// Reads back per-case outputs (or the replicated compile-error text)
    /// and pairs each with the aggregate memory/time metrics for the whole
    /// container run, kept out of the output string itself.
    fn harvest(
        &self,
        workspace: &Path,
        cases: &[TestInput],
        memory_kb: u64,
        elapsed_ms: u128,
    ) -> BatchResult {
        let compile_error_path = workspace.join("compile_error.txt");
        let compile_error = std::fs::read_to_string(&compile_error_path).ok();

        let mut result = BatchResult::new();
        for case in cases {
            let output = if let Some(err) = &compile_error {
                format!("Compilation error: {}", err.trim_end())
            } else {
                let out_path = workspace.join("testcases").join(format!("{}.out", case.id));
                std::fs::read_to_string(&out_path)
                    .unwrap_or_else(|_| "Failed to read output".to_string())
            };

            result.insert(
                case.id.clone(),
                CaseOutput {
                    output,
                    memory_used_kb: memory_kb,
                    execution_time_ms: elapsed_ms,
                },
            );
        }
        result
    }

    async fn check_runtime_available(&self) -> Result<(), BatchError> {
        let output = Command::new(&self.runtime_binary)
            .arg("info")
            .output()
            .await
            .map_err(|e| BatchError::RuntimeUnavailable(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(BatchError::RuntimeUnavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ))
        }
    }

    async fn force_kill(&self, container_name: &str) {
        log::warn!("force-killing batch container {container_name} after timeout");
        if let Err(e) = Command::new(&self.runtime_binary)
            .args(["kill", container_name])
            .stdin(Stdio::null())
            .output()
            .await
        {
            log::warn!("failed to kill container {container_name}: {e}");
        }
    }
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates the POSIX shell driver: compile once (if needed), define
/// `run_test_case`, then invoke it once per case in submission order.
fn generate_driver(spec: &LanguageSpec, cases: &[TestInput]) -> String {
    let mut script = String::from("#!/bin/sh\nset -u\n\n");

    if let Some(compile_step) = spec.compile_step {
        script.push_str(&format!(
            "if ! {compile_step} > compile_error.txt 2>&1; then\n  exit 1\nfi\nrm -f compile_error.txt\n\n",
        ));
    }

    script.push_str(&format!(
        "run_test_case() {{\n\
        \x20 id=\"$1\"\n\
        \x20 timeout {timeout}s sh -c '{run}' < \"testcases/${{id}}.in\" > \"testcases/${{id}}.out\" 2>&1\n\
        \x20 code=$?\n\
        \x20 if [ \"$code\" -eq 124 ]; then\n\
        \x20   echo '{sentinel}' > \"testcases/${{id}}.out\"\n\
        \x20 elif [ \"$code\" -ne 0 ]; then\n\
        \x20   echo \"Execution failed with exit code $code\" >> \"testcases/${{id}}.out\"\n\
        \x20 fi\n\
        }}\n\n",
        timeout = PER_CASE_TIMEOUT_SECS,
        run = spec.batch_run_command,
        sentinel = PER_CASE_TIMEOUT_SENTINEL,
    ));

    for case in cases {
        script.push_str(&format!("run_test_case '{}'\n", case.id));
    }

    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageRegistry;

    fn cases() -> Vec<TestInput> {
        vec![
            TestInput {
                id: "1".to_string(),
                input: "3".to_string(),
            },
            TestInput {
                id: "2".to_string(),
                input: "10".to_string(),
            },
        ]
    }

    #[test]
    fn valid_ids_are_accepted_shell_and_path_metacharacters_are_not() {
        assert!(is_valid_test_case_id("case-1_a"));
        assert!(!is_valid_test_case_id(""));
        assert!(!is_valid_test_case_id("1'; rm -rf /"));
        assert!(!is_valid_test_case_id("../../etc/passwd"));
        assert!(!is_valid_test_case_id("has spaces"));
    }

    #[test]
    fn prepare_workspace_rejects_an_id_outside_the_safe_character_class() {
        let dir = std::env::temp_dir().join(format!("isobox-batch-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let registry = LanguageRegistry::new();
        let spec = registry.get("python").unwrap();
        let runner = BatchRunner::new();
        let bad_cases = vec![TestInput {
            id: "../escape".to_string(),
            input: "1".to_string(),
        }];

        let result = runner.prepare_workspace(&dir, spec, "print(1)", &bad_cases);
        assert!(matches!(result, Err(BatchError::InvalidTestCaseId(_))));
        assert!(!dir.join("testcases").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn driver_invokes_every_case_in_submission_order() {
        let registry = LanguageRegistry::new();
        let spec = registry.get("python").unwrap();
        let script = generate_driver(spec, &cases());

        let first = script.find("run_test_case '1'").unwrap();
        let second = script.find("run_test_case '2'").unwrap();
        assert!(first < second);
    }

    #[test]
    fn compiled_language_driver_captures_compile_errors() {
        let registry = LanguageRegistry::new();
        let spec = registry.get("cpp").unwrap();
        let script = generate_driver(spec, &cases());
        assert!(script.contains("compile_error.txt"));
        assert!(script.contains("exit 1"));
    }

    #[test]
    fn harvest_replicates_compile_error_across_every_case() {
        let dir = std::env::temp_dir().join(format!("isobox-batch-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("testcases")).unwrap();
        std::fs::write(dir.join("compile_error.txt"), "undefined reference\n").unwrap();

        let runner = BatchRunner::new();
        let result = runner.harvest(&dir, &cases(), 0, 0);

        for case in cases() {
            let output = result.get(&case.id).unwrap();
            assert!(output.output.starts_with("Compilation error: undefined reference"));
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn harvest_reports_missing_output_files() {
        let dir = std::env::temp_dir().join(format!("isobox-batch-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("testcases")).unwrap();

        let runner = BatchRunner::new();
        let result = runner.harvest(&dir, &cases(), 10, 5);

        for case in cases() {
            let output = result.get(&case.id).unwrap();
            assert!(output.output.starts_with("Failed to read output"));
            assert_eq!(output.memory_used_kb, 10);
            assert_eq!(output.execution_time_ms, 5);
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn harvest_reads_per_case_outputs_when_present() {
        let dir = std::env::temp_dir().join(format!("isobox-batch-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("testcases")).unwrap();
        std::fs::write(dir.join("testcases").join("1.out"), "6\n").unwrap();
        std::fs::write(dir.join("testcases").join("2.out"), "20\n").unwrap();

        let runner = BatchRunner::new();
        let result = runner.harvest(&dir, &cases(), 100, 50);

        assert!(result.get("1").unwrap().output.starts_with("6\n"));
        assert!(result.get("2").unwrap().output.starts_with("20\n"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
