//! Server tunables, optionally loaded from a TOML file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{limits, MAX_FRAME_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Largest frame length a peer may announce.
    pub max_frame_size: usize,
    /// Command handlers allowed to run at once, across all connections.
    pub worker_threads: usize,
    pub sign_in_attempt_limit: u32,
    pub ban_window_secs: u64,
    /// 0 disables the per-command deadline.
    pub command_timeout_secs: u64,
    /// Clear an address's failed attempts after a successful sign-in.
    pub reset_attempts_on_success: bool,
    /// Share the attempt counter and ban between all ports of one host.
    pub throttle_by_ip: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            worker_threads: num_cpus::get().max(1),
            sign_in_attempt_limit: limits::SIGN_IN_ATTEMPTS,
            ban_window_secs: limits::BAN_WINDOW_SECS,
            command_timeout_secs: 0,
            reset_attempts_on_success: false,
            throttle_by_ip: false,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.worker_threads > 0, "worker_threads must be at least 1");
        anyhow::ensure!(self.max_frame_size > 0, "max_frame_size must be positive");
        anyhow::ensure!(
            self.max_frame_size <= u32::MAX as usize,
            "max_frame_size cannot exceed {} bytes",
            u32::MAX
        );
        Ok(())
    }

    pub fn ban_window(&self) -> Duration {
        Duration::from_secs(self.ban_window_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_protocol_limits() {
        let c = ServerConfig::default();
        assert_eq!(c.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(c.sign_in_attempt_limit, 3);
        assert_eq!(c.ban_window(), Duration::from_secs(300));
        assert_eq!(c.command_timeout(), None);
        assert!(!c.reset_attempts_on_success);
        assert!(!c.throttle_by_ip);
        assert!(c.worker_threads >= 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = ServerConfig::from_toml_str("worker_threads = 2\ncommand_timeout_secs = 30\n")
            .unwrap();
        assert_eq!(c.worker_threads, 2);
        assert_eq!(c.command_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(c.ban_window_secs, 300);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ServerConfig::from_toml_str("worker_threads = 0").is_err());
        assert!(ServerConfig::from_toml_str("no_such_key = 1").is_err());
        assert!(ServerConfig::from_toml_str("max_frame_size = \"big\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(
            &path,
            "sign_in_attempt_limit = 5\nreset_attempts_on_success = true\nthrottle_by_ip = true\n",
        )
        .unwrap();
        let c = ServerConfig::load(&path).unwrap();
        assert_eq!(c.sign_in_attempt_limit, 5);
        assert!(c.reset_attempts_on_success);
        assert!(c.throttle_by_ip);
        assert!(ServerConfig::load(&tmp.path().join("missing.toml")).is_err());
    }
}
