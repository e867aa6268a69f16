//! Dispatch Engine: bounded queue, worker pool, and a concurrency-slot gate
//! layered on top of it.
//!
//! The queue is a `tokio::sync::mpsc` channel shared by `W` worker tasks
//! behind an `Arc<Mutex<Receiver<_>>>` (mpsc only has one consuming end, so
//! sharing it across workers needs the mutex). The slot gate is a
//! `tokio::sync::Semaphore` bounding concurrent sandbox launches
//! independently of how many jobs are queued or how many workers exist.
//! Cancellation is modeled with `tokio_util::sync::CancellationToken`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{BatchError, BatchResult, BatchRunner, CaseOutput, TestInput};
use crate::language::LanguageRegistry;
use crate::metrics::MetricsProbe;
use crate::sandbox::{LaunchError, SandboxLauncher, TIMEOUT_SENTINEL};
use crate::stats::{ExecutionStats, StatsSink};
use crate::workspace::{WorkspaceGuard, WorkspaceManager};

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub language: String,
    pub code: String,
    pub input: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BatchExecuteRequest {
    pub language: String,
    pub code: String,
    pub cases: Vec<TestInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    SandboxUnavailable,
    WorkspaceCreateFailure,
    Timeout,
    RuntimeFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub output: String,
    pub error: Option<ExecutionErrorKind>,
    pub execution_time_ms: Option<u128>,
    pub memory_used_kb: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("queue is full")]
    QueueFull,
    #[error("submission was cancelled by the caller")]
    Cancelled,
}

enum JobKind {
    Single(ExecuteRequest),
    Batch(BatchExecuteRequest),
}

enum JobResult {
    Single(ExecutionResult),
    Batch(BatchResult),
}

impl JobResult {
    fn timeout_or_overload(kind: &JobKind) -> Self {
        match kind {
            JobKind::Single(_) => JobResult::Single(ExecutionResult {
                output: TIMEOUT_SENTINEL.to_string(),
                error: Some(ExecutionErrorKind::Timeout),
                execution_time_ms: None,
                memory_used_kb: None,
            }),
            JobKind::Batch(req) => {
                let mut result = BatchResult::new();
                for case in &req.cases {
                    result.insert(
                        case.id.clone(),
                        CaseOutput {
                            output: TIMEOUT_SENTINEL.to_string(),
                            memory_used_kb: 0,
                            execution_time_ms: 0,
                        },
                    );
                }
                JobResult::Batch(result)
            }
        }
    }
}

struct Job {
    job_id: String,
    kind: JobKind,
    timeout: Duration,
    completion: oneshot::Sender<JobResult>,
}

/// Worker-pool size, queue capacity, and slot-gate capacity. Queue/worker
/// size and slot count are deliberately independent knobs: the queue bounds
/// how much work can wait, the slots bound how much can run at once.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub concurrency_slots: usize,
    pub single_timeout: Duration,
    pub batch_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            worker_count: 10,
            concurrency_slots: 20,
            single_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(60),
        }
    }
}

/// Public handle to the dispatch engine. Cheaply cloned; every clone shares
/// the same queue, workers, and slot gate.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Builds the queue, spawns `config.worker_count` worker tasks, and
    /// returns the handle the HTTP adapter submits jobs through.
    pub fn start(
        config: DispatchConfig,
        registry: Arc<LanguageRegistry>,
        sandbox_root: PathBuf,
        stats: StatsSink,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let semaphore = Arc::new(Semaphore::new(config.concurrency_slots));
        let workspace = Arc::new(WorkspaceManager::new(sandbox_root));
        let launcher = Arc::new(SandboxLauncher::new());
        let batch_runner = Arc::new(BatchRunner::new());
        let metrics = Arc::new(MetricsProbe::new());

        for worker_id in 0..config.worker_count {
            let rx = rx.clone();
            let semaphore = semaphore.clone();
            let registry = registry.clone();
            let workspace = workspace.clone();
            let launcher = launcher.clone();
            let batch_runner = batch_runner.clone();
            let metrics = metrics.clone();
            let stats = stats.clone();

            tokio::spawn(async move {
                worker_loop(
                    worker_id,
                    rx,
                    semaphore,
                    registry,
                    workspace,
                    launcher,
                    batch_runner,
                    metrics,
                    stats,
                )
                .await;
            });
        }

        Self { tx, config }
    }

    pub async fn submit_execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, DispatchError> {
        match self
            .submit(JobKind::Single(request), self.config.single_timeout, cancel)
            .await?
        {
            JobResult::Single(result) => Ok(result),
            JobResult::Batch(_) => unreachable!("single submission always yields a single result"),
        }
    }

    pub async fn submit_batch(
        &self,
        request: BatchExecuteRequest,
        cancel: CancellationToken,
    ) -> Result<BatchResult, DispatchError> {
        match self
            .submit(JobKind::Batch(request), self.config.batch_timeout, cancel)
            .await?
        {
            JobResult::Batch(result) => Ok(result),
            JobResult::Single(_) => unreachable!("batch submission always yields a batch result"),
        }
    }

    async fn submit(
        &self,
        kind: JobKind,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<JobResult, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let job_id = Uuid::new_v4().to_string();
        let (completion_tx, completion_rx) = oneshot::channel();
        let job = Job {
            job_id,
            kind,
            timeout,
            completion: completion_tx,
        };

        self.tx.try_send(job).map_err(|_| DispatchError::QueueFull)?;

        tokio::select! {
            result = completion_rx => result.map_err(|_| DispatchError::Cancelled),
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    semaphore: Arc<Semaphore>,
    registry: Arc<LanguageRegistry>,
    workspace: Arc<WorkspaceManager>,
    launcher: Arc<SandboxLauncher>,
    batch_runner: Arc<BatchRunner>,
    metrics: Arc<MetricsProbe>,
    stats: StatsSink,
) {
    log::info!("worker {worker_id} started");
    loop {
        let job = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            log::info!("worker {worker_id} shutting down: queue closed");
            break;
        };

        let Job {
            job_id,
            kind,
            timeout,
            completion,
        } = job;

        let wait_start = Instant::now();
        let permit = tokio::time::timeout(timeout, semaphore.clone().acquire_owned()).await;

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => continue, // semaphore closed: shutting down
            Err(_) => {
                let _ = completion.send(JobResult::timeout_or_overload(&kind));
                continue;
            }
        };

        let remaining = timeout.saturating_sub(wait_start.elapsed());
        let start_time = Utc::now();
        let code_size = match &kind {
            JobKind::Single(req) => req.code.len(),
            JobKind::Batch(req) => req.code.len(),
        };
        let language = match &kind {
            JobKind::Single(req) => req.language.clone(),
            JobKind::Batch(req) => req.language.clone(),
        };

        let job_id_for_panic = job_id.clone();
        let outcome = std::panic::AssertUnwindSafe(execute_job(
            job_id.clone(),
            kind,
            remaining,
            &registry,
            &workspace,
            &launcher,
            &batch_runner,
            &metrics,
        ))
        .catch_unwind()
        .await;
        drop(permit);
        let end_time = Utc::now();

        let (job_result, success, error_message) = match outcome {
            Ok((result, success, error_message)) => (result, success, error_message),
            Err(_) => {
                log::error!("worker {worker_id} panicked handling job {job_id_for_panic}");
                (
                    JobResult::Single(ExecutionResult {
                        output: String::new(),
                        error: Some(ExecutionErrorKind::RuntimeFailure),
                        execution_time_ms: None,
                        memory_used_kb: None,
                    }),
                    false,
                    Some("worker panicked".to_string()),
                )
            }
        };

        stats.record(ExecutionStats {
            job_id,
            language,
            code_size,
            start_time,
            end_time,
            success,
            error_message,
        });

        let _ = completion.send(job_result);
    }
}

/// Executes a single job: workspace create -> code write -> launch, with
/// workspace destroy tied to a [`WorkspaceGuard`] so it runs on every exit
/// path, including a panic unwinding out of this call.
async fn execute_job(
    job_id: String,
    kind: JobKind,
    deadline: Duration,
    registry: &LanguageRegistry,
    workspace: &WorkspaceManager,
    launcher: &SandboxLauncher,
    batch_runner: &BatchRunner,
    metrics: &MetricsProbe,
) -> (JobResult, bool, Option<String>) {
    match kind {
        JobKind::Single(request) => {
            let (result, success, message) = execute_single(
                &job_id, request, deadline, registry, workspace, launcher, metrics,
            )
            .await;
            (JobResult::Single(result), success, message)
        }
        JobKind::Batch(request) => {
            let (result, success, message) = execute_batch(
                &job_id,
                request,
                deadline,
                registry,
                workspace,
                batch_runner,
                metrics,
            )
            .await;
            (JobResult::Batch(result), success, message)
        }
    }
}

async fn execute_single(
    job_id: &str,
    request: ExecuteRequest,
    deadline: Duration,
    registry: &LanguageRegistry,
    workspace: &WorkspaceManager,
    launcher: &SandboxLauncher,
    metrics: &MetricsProbe,
) -> (ExecutionResult, bool, Option<String>) {
    let spec = match registry.get(&request.language) {
        Ok(spec) => spec,
        Err(e) => {
            return (
                ExecutionResult {
                    output: String::new(),
                    error: Some(ExecutionErrorKind::RuntimeFailure),
                    execution_time_ms: None,
                    memory_used_kb: None,
                },
                false,
                Some(e.to_string()),
            )
        }
    };

    let dir = match workspace.create(job_id) {
        Ok(dir) => dir,
        Err(e) => {
            return (
                ExecutionResult {
                    output: String::new(),
                    error: Some(ExecutionErrorKind::WorkspaceCreateFailure),
                    execution_time_ms: None,
                    memory_used_kb: None,
                },
                false,
                Some(e.to_string()),
            )
        }
    };
    let workspace_guard = WorkspaceGuard::new(workspace, dir);

    if let Err(e) = workspace.write_file(workspace_guard.path(), spec.filename, &request.code) {
        return (
            ExecutionResult {
                output: String::new(),
                error: Some(ExecutionErrorKind::WorkspaceCreateFailure),
                execution_time_ms: None,
                memory_used_kb: None,
            },
            false,
            Some(e.to_string()),
        );
    }

    let container_name = format!("isobox-{job_id}");
    let stdin = request.input.unwrap_or_default();
    let start = Instant::now();
    let launch = launcher
        .run(workspace_guard.path(), spec, &stdin, &container_name, deadline)
        .await;
    let execution_time_ms = Some(start.elapsed().as_millis());

    // Racy by nature: with --rm the container may already be gone by the
    // time this samples. Treated as non-fatal; omit the metric rather than
    // fail the job.
    let memory_used_kb = metrics.sample(&container_name).await.ok().map(|m| m.0);

    match launch {
        Ok(output) => (
            ExecutionResult {
                output: output.output,
                error: None,
                execution_time_ms,
                memory_used_kb,
            },
            true,
            None,
        ),
        Err(LaunchError::Timeout) => (
            ExecutionResult {
                output: TIMEOUT_SENTINEL.to_string(),
                error: Some(ExecutionErrorKind::Timeout),
                execution_time_ms,
                memory_used_kb: None,
            },
            false,
            Some("execution timed out".to_string()),
        ),
        Err(LaunchError::RuntimeUnavailable(msg)) => (
            ExecutionResult {
                output: String::new(),
                error: Some(ExecutionErrorKind::SandboxUnavailable),
                execution_time_ms: None,
                memory_used_kb: None,
            },
            false,
            Some(msg),
        ),
        Err(LaunchError::RuntimeFailure(code)) => (
            ExecutionResult {
                output: String::new(),
                error: Some(ExecutionErrorKind::RuntimeFailure),
                execution_time_ms,
                memory_used_kb: None,
            },
            false,
            Some(format!("exit code {code}")),
        ),
        Err(LaunchError::Launch(msg)) => (
            ExecutionResult {
                output: String::new(),
                error: Some(ExecutionErrorKind::SandboxUnavailable),
                execution_time_ms: None,
                memory_used_kb: None,
            },
            false,
            Some(msg),
        ),
    }
}

async fn execute_batch(
    job_id: &str,
    request: BatchExecuteRequest,
    deadline: Duration,
    registry: &LanguageRegistry,
    workspace: &WorkspaceManager,
    batch_runner: &BatchRunner,
    metrics: &MetricsProbe,
) -> (BatchResult, bool, Option<String>) {
    let spec = match registry.get(&request.language) {
        Ok(spec) => spec,
        Err(e) => return (BatchResult::new(), false, Some(e.to_string())),
    };

    let dir = match workspace.create(job_id) {
        Ok(dir) => dir,
        Err(e) => return (BatchResult::new(), false, Some(e.to_string())),
    };
    let workspace_guard = WorkspaceGuard::new(workspace, dir);

    if let Err(e) =
        batch_runner.prepare_workspace(workspace_guard.path(), spec, &request.code, &request.cases)
    {
        return (BatchResult::new(), false, Some(e.to_string()));
    }

    let container_name = format!("isobox-batch-{job_id}");
    let run = batch_runner
        .run(
            workspace_guard.path(),
            &request.cases,
            &container_name,
            deadline,
            metrics,
        )
        .await;

    match run {
        Ok(result) => (result, true, None),
        Err(BatchError::Timeout) => {
            let mut result = BatchResult::new();
            for case in &request.cases {
                result.insert(
                    case.id.clone(),
                    CaseOutput {
                        output: TIMEOUT_SENTINEL.to_string(),
                        memory_used_kb: 0,
                        execution_time_ms: 0,
                    },
                );
            }
            (result, false, Some("batch execution timed out".to_string()))
        }
        Err(e) => (BatchResult::new(), false, Some(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_full_is_returned_synchronously() {
        let config = DispatchConfig {
            queue_capacity: 1,
            worker_count: 0, // no workers draining: the one slot fills and stays full
            concurrency_slots: 1,
            single_timeout: Duration::from_millis(50),
            batch_timeout: Duration::from_millis(50),
        };
        let registry = Arc::new(LanguageRegistry::new());
        let sandbox_root = std::env::temp_dir().join(format!("isobox-dispatch-{}", Uuid::new_v4()));
        let (stats, _handle) = StatsSink::spawn(8);
        let dispatcher = Dispatcher::start(config, registry, sandbox_root, stats);

        let request = ExecuteRequest {
            language: "python".to_string(),
            code: "print(1)".to_string(),
            input: None,
        };

        // Nothing drains the queue (worker_count: 0), so fire the first
        // submission in the background rather than awaiting it here.
        let first_dispatcher = dispatcher.clone();
        let first_request = request.clone();
        tokio::spawn(async move {
            let _ = first_dispatcher
                .submit_execute(first_request, CancellationToken::new())
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = dispatcher
            .submit_execute(request, CancellationToken::new())
            .await;
        assert_eq!(second, Err(DispatchError::QueueFull));
    }

    #[tokio::test]
    async fn cancelled_caller_gets_cancelled_not_a_hang() {
        let config = DispatchConfig {
            queue_capacity: 10,
            worker_count: 0, // nothing ever drains the queue
            concurrency_slots: 1,
            single_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(60),
        };
        let registry = Arc::new(LanguageRegistry::new());
        let sandbox_root = std::env::temp_dir().join(format!("isobox-dispatch-{}", Uuid::new_v4()));
        let (stats, _handle) = StatsSink::spawn(8);
        let dispatcher = Dispatcher::start(config, registry, sandbox_root, stats);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = ExecuteRequest {
            language: "python".to_string(),
            code: "print(1)".to_string(),
            input: None,
        };
        let result = dispatcher.submit_execute(request, cancel).await;
        assert_eq!(result, Err(DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn successful_submission_round_trips_through_a_real_worker() {
        if std::process::Command::new("docker")
            .arg("--version")
            .output()
            .is_err()
        {
            println!("Docker not available, skipping successful_submission_round_trips_through_a_real_worker");
            return;
        }

        let config = DispatchConfig {
            queue_capacity: 4,
            worker_count: 1,
            concurrency_slots: 1,
            single_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(60),
        };
        let registry = Arc::new(LanguageRegistry::new());
        let sandbox_root = std::env::temp_dir().join(format!("isobox-dispatch-{}", Uuid::new_v4()));
        let (stats, _handle) = StatsSink::spawn(8);
        let dispatcher = Dispatcher::start(config, registry, sandbox_root.clone(), stats);

        let request = ExecuteRequest {
            language: "python".to_string(),
            code: "print('hello')".to_string(),
            input: None,
        };
        let result = dispatcher
            .submit_execute(request, CancellationToken::new())
            .await
            .unwrap();

        assert!(result.output.contains("hello"));
        assert!(result.error.is_none());
        assert!(!sandbox_root.exists() || std::fs::read_dir(&sandbox_root).unwrap().next().is_none());

        std::fs::remove_dir_all(&sandbox_root).ok();
    }
}
