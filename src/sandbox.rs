//! Single-input sandbox launch: invokes the container runtime, enforces the
//! per-job deadline, and force-kills on timeout.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::language::LanguageSpec;

pub const TIMEOUT_SENTINEL: &str =
    "Execution timed out. Your code may contain an infinite loop or is taking too long to execute.";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("failed to launch sandbox: {0}")]
    Launch(String),
    #[error("execution timed out")]
    Timeout,
    #[error("runtime failure (exit {0})")]
    RuntimeFailure(i32),
}

/// A single sandboxed run result: combined stdout+stderr and the exit status.
#[derive(Debug, Clone)]
pub struct LaunchOutput {
    pub output: String,
    pub exit_code: i32,
}

/// Builds and executes `docker run` invocations.
#[derive(Debug, Clone)]
pub struct SandboxLauncher {
    runtime_binary: String,
    memory_limit: &'static str,
    cpu_limit: &'static str,
    pids_limit: u32,
    stop_timeout_secs: u32,
}

impl SandboxLauncher {
    pub fn new() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
            memory_limit: "512m",
            cpu_limit: "1",
            pids_limit: 100,
            stop_timeout_secs: 20,
        }
    }

    /// Validates that the container runtime is reachable before any
    /// workspace work is wasted.
    pub async fn check_runtime_available(&self) -> Result<(), LaunchError> {
        let output = Command::new(&self.runtime_binary)
            .arg("info")
            .output()
            .await
            .map_err(|e| LaunchError::RuntimeUnavailable(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(LaunchError::RuntimeUnavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ))
        }
    }

    fn base_args(&self, container_name: &str, workspace: &std::path::Path) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "--memory".to_string(),
            self.memory_limit.to_string(),
            "--cpus".to_string(),
            self.cpu_limit.to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--pids-limit".to_string(),
            self.pids_limit.to_string(),
            "--ulimit".to_string(),
            format!("nproc={}:{}", self.pids_limit, self.pids_limit),
            "--stop-timeout".to_string(),
            self.stop_timeout_secs.to_string(),
            "-v".to_string(),
            format!("{}:/code", workspace.display()),
        ]
    }

    /// Runs `spec.run_command` inside a fresh container named
    /// `container_name`, piping `stdin` in via `$INPUT`, under `deadline`.
    pub async fn run(
        &self,
        workspace: &std::path::Path,
        spec: &LanguageSpec,
        stdin: &str,
        container_name: &str,
        deadline: Duration,
    ) -> Result<LaunchOutput, LaunchError> {
        self.check_runtime_available().await?;

        let mut args = self.base_args(container_name, workspace);
        args.push("-e".to_string());
        args.push(format!("INPUT={}", stdin));
        args.push("-w".to_string());
        args.push("/code".to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(spec.run_command.to_string());

        let run = async {
            let child = Command::new(&self.runtime_binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| LaunchError::Launch(e.to_string()))?;

            child
                .wait_with_output()
                .await
                .map_err(|e| LaunchError::Launch(e.to_string()))
        };

        match timeout(deadline, run).await {
            Ok(Ok(output)) => {
                let combined = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                let exit_code = output.status.code().unwrap_or(-1);
                if output.status.success() {
                    Ok(LaunchOutput {
                        output: combined,
                        exit_code,
                    })
                } else {
                    Err(LaunchError::RuntimeFailure(exit_code))
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.force_kill(container_name).await;
                Err(LaunchError::Timeout)
            }
        }
    }

    /// Force-terminates a named container out-of-band. Must be called
    /// explicitly on deadline expiry since dropping the `Command` future does
    /// not itself kill the process inside the container runtime.
    async fn force_kill(&self, container_name: &str) {
        log::warn!("force-killing container {container_name} after timeout");
        let killed = Command::new(&self.runtime_binary)
            .args(["kill", container_name])
            .stdin(Stdio::null())
            .output()
            .await;
        if let Err(e) = killed {
            log::warn!("failed to kill container {container_name}: {e}");
        }
    }
}

impl Default for SandboxLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_args_carry_the_required_flags() {
        let launcher = SandboxLauncher::new();
        let args = launcher.base_args("job-1", std::path::Path::new("/tmp/ws"));
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--network".to_string()));
        assert!(args.contains(&"none".to_string()));
        assert!(args.contains(&"--memory".to_string()));
        assert!(args.contains(&"512m".to_string()));
        assert!(args.contains(&"--pids-limit".to_string()));
    }

    #[tokio::test]
    async fn runtime_unavailable_surfaces_when_binary_is_missing() {
        let mut launcher = SandboxLauncher::new();
        launcher.runtime_binary = "definitely-not-a-real-binary".to_string();
        let result = launcher.check_runtime_available().await;
        assert!(matches!(result, Err(LaunchError::RuntimeUnavailable(_))));
    }
}
