//! Best-effort container memory sampling, in the same
//! `tokio::process::Command` style as [`crate::sandbox::SandboxLauncher`].

use tokio::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsageKb(pub u64);

#[derive(Debug, Clone)]
pub struct MetricsProbe {
    runtime_binary: String,
}

impl MetricsProbe {
    pub fn new() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
        }
    }

    /// Samples `docker stats <name> --no-stream --format '{{.MemUsage}}'`
    /// once and parses the `"used / limit"` form into kilobytes.
    ///
    /// Non-streaming and single-shot by design: the container may already
    /// have exited (it runs with `--rm`), so any error here is treated by
    /// the caller as non-fatal rather than a job failure.
    pub async fn sample(&self, container_name: &str) -> Result<MemoryUsageKb, MetricsError> {
        let output = Command::new(&self.runtime_binary)
            .args([
                "stats",
                container_name,
                "--no-stream",
                "--format",
                "{{.MemUsage}}",
            ])
            .output()
            .await
            .map_err(|e| MetricsError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(MetricsError::Unavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        parse_mem_usage(text.trim())
    }
}

impl Default for MetricsProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the `"123.45MiB / 512MiB"` form docker stats emits into KB.
fn parse_mem_usage(text: &str) -> Result<MemoryUsageKb, MetricsError> {
    let used = text
        .split('/')
        .next()
        .ok_or_else(|| MetricsError::Unavailable(format!("unparseable mem usage: {text}")))?
        .trim();

    let kb = parse_size_to_kb(used)
        .ok_or_else(|| MetricsError::Unavailable(format!("unparseable mem usage: {text}")))?;
    Ok(MemoryUsageKb(kb))
}

fn parse_size_to_kb(value: &str) -> Option<u64> {
    let (number_part, unit) = value.split_at(
        value
            .find(|c: char| c.is_alphabetic())
            .unwrap_or(value.len()),
    );
    let number: f64 = number_part.trim().parse().ok()?;

    let kb = match unit.trim().to_ascii_lowercase().as_str() {
        "b" => number / 1024.0,
        "kib" | "kb" => number,
        "mib" | "mb" => number * 1024.0,
        "gib" | "gb" => number * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(kb.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mebibyte_usage() {
        let MemoryUsageKb(kb) = parse_mem_usage("123.45MiB / 512MiB").unwrap();
        assert_eq!(kb, (123.45_f64 * 1024.0).round() as u64);
    }

    #[test]
    fn parses_kibibyte_usage() {
        let MemoryUsageKb(kb) = parse_mem_usage("512KiB / 512MiB").unwrap();
        assert_eq!(kb, 512);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_mem_usage("not a memory line").is_err());
    }
}
