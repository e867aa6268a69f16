//! Environment-driven configuration, loaded once at startup.

use std::time::Duration;

use crate::dispatch::DispatchConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub dispatch: DispatchConfig,
    pub sandbox_root: std::path::PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let dispatch = DispatchConfig {
            queue_capacity: env_usize("MAX_QUEUE_SIZE", 100),
            worker_count: env_usize("MAX_WORKERS", 10),
            concurrency_slots: env_usize("MAX_CONCURRENCY", DispatchConfig::default().concurrency_slots),
            ..DispatchConfig::default()
        };

        Self {
            port: env_u16("PORT", 8001),
            read_timeout: Duration::from_secs(env_u64("READ_TIMEOUT", 30)),
            write_timeout: Duration::from_secs(env_u64("WRITE_TIMEOUT", 30)),
            idle_timeout: Duration::from_secs(env_u64("IDLE_TIMEOUT", 60)),
            rate_limit: env_u32("RATE_LIMIT", 100),
            rate_window: Duration::from_secs(env_u64("RATE_WINDOW", 60)),
            dispatch,
            sandbox_root: std::env::temp_dir().join("isobox-sandbox"),
        }
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim_start_matches(':').parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_parses_with_or_without_leading_colon() {
        std::env::set_var("ISOBOX_TEST_PORT", ":9000");
        assert_eq!(env_u16("ISOBOX_TEST_PORT", 8001), 9000);
        std::env::set_var("ISOBOX_TEST_PORT", "9001");
        assert_eq!(env_u16("ISOBOX_TEST_PORT", 8001), 9001);
        std::env::remove_var("ISOBOX_TEST_PORT");
    }

    #[test]
    fn missing_var_falls_back_to_default() {
        std::env::remove_var("ISOBOX_TEST_MISSING");
        assert_eq!(env_u16("ISOBOX_TEST_MISSING", 8001), 8001);
    }
}
