//! Process configuration — environment variables first, an optional TOML
//! file for overrides, and CLI flags on top (applied in `main`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::admission::AdmissionConfig;
use crate::consensus::ConsensusConfig;
use crate::coordinator::CoordinatorConfig;
use crate::round::RoundConfig;
use crate::sandbox::SandboxManager;

/// Full orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root for `threads/<task_id>/` artifact trees.
    pub artifact_root: PathBuf,
    pub sandbox_base: PathBuf,
    /// Concurrent running tasks.
    pub capacity: usize,
    pub provider_cooldown_secs: u64,
    pub defer_backoff_secs: u64,
    pub default_phase_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub strategy_shift_limit: u32,
    /// Loopback by default; widen deliberately.
    pub bind_addr: SocketAddr,
    /// Header carrying the auth token when token auth is enabled.
    pub auth_header: String,
    pub auth_token: Option<String>,
    /// Requests per client per path per minute; 0 disables limiting.
    pub rate_limit_per_minute: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from(".agents"),
            sandbox_base: SandboxManager::default_base(),
            capacity: 1,
            provider_cooldown_secs: 300,
            defer_backoff_secs: 5,
            default_phase_timeout_secs: 1800,
            command_timeout_secs: 300,
            strategy_shift_limit: 2,
            bind_addr: "127.0.0.1:8713".parse().expect("static bind addr"),
            auth_header: "x-conclave-token".to_string(),
            auth_token: None,
            rate_limit_per_minute: 120,
        }
    }
}

/// Optional config-file shape; every field overrides the default when set.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    artifact_root: Option<PathBuf>,
    sandbox_base: Option<PathBuf>,
    capacity: Option<usize>,
    provider_cooldown_secs: Option<u64>,
    defer_backoff_secs: Option<u64>,
    default_phase_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    strategy_shift_limit: Option<u32>,
    bind_addr: Option<SocketAddr>,
    auth_header: Option<String>,
    auth_token: Option<String>,
    rate_limit_per_minute: Option<u32>,
}

impl OrchestratorConfig {
    /// Environment variables over built-in defaults. Unparseable values are
    /// ignored rather than fatal.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("CONCLAVE_ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONCLAVE_SANDBOX_BASE") {
            config.sandbox_base = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONCLAVE_CAPACITY") {
            if let Ok(n) = v.parse() {
                config.capacity = n;
            }
        }
        if let Ok(v) = std::env::var("CONCLAVE_PROVIDER_COOLDOWN_SECS") {
            if let Ok(n) = v.parse() {
                config.provider_cooldown_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CONCLAVE_BIND_ADDR") {
            if let Ok(addr) = v.parse() {
                config.bind_addr = addr;
            }
        }
        if let Ok(v) = std::env::var("CONCLAVE_AUTH_TOKEN") {
            if !v.is_empty() {
                config.auth_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("CONCLAVE_RATE_LIMIT_PER_MINUTE") {
            if let Ok(n) = v.parse() {
                config.rate_limit_per_minute = n;
            }
        }
        if let Ok(v) = std::env::var("CONCLAVE_STRATEGY_SHIFT_LIMIT") {
            if let Ok(n) = v.parse() {
                config.strategy_shift_limit = n;
            }
        }
        config
    }

    /// Apply a TOML config file over this configuration.
    pub fn apply_file(&mut self, contents: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(contents)?;
        if let Some(v) = file.artifact_root {
            self.artifact_root = v;
        }
        if let Some(v) = file.sandbox_base {
            self.sandbox_base = v;
        }
        if let Some(v) = file.capacity {
            self.capacity = v;
        }
        if let Some(v) = file.provider_cooldown_secs {
            self.provider_cooldown_secs = v;
        }
        if let Some(v) = file.defer_backoff_secs {
            self.defer_backoff_secs = v;
        }
        if let Some(v) = file.default_phase_timeout_secs {
            self.default_phase_timeout_secs = v;
        }
        if let Some(v) = file.command_timeout_secs {
            self.command_timeout_secs = v;
        }
        if let Some(v) = file.strategy_shift_limit {
            self.strategy_shift_limit = v;
        }
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        if let Some(v) = file.auth_header {
            self.auth_header = v;
        }
        if let Some(v) = file.auth_token {
            self.auth_token = Some(v);
        }
        if let Some(v) = file.rate_limit_per_minute {
            self.rate_limit_per_minute = v;
        }
        Ok(())
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            capacity: self.capacity,
            provider_cooldown: Duration::from_secs(self.provider_cooldown_secs),
            defer_backoff: Duration::from_secs(self.defer_backoff_secs),
        }
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            consensus: ConsensusConfig {
                default_phase_timeout: Duration::from_secs(self.default_phase_timeout_secs),
                ..ConsensusConfig::default()
            },
            round: RoundConfig {
                default_phase_timeout: Duration::from_secs(self.default_phase_timeout_secs),
            },
            strategy_shift_limit: self.strategy_shift_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_loopback_and_capacity_one() {
        let config = OrchestratorConfig::default();
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.capacity, 1);
        assert_eq!(config.rate_limit_per_minute, 120);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_apply_file_overrides() {
        let mut config = OrchestratorConfig::default();
        config
            .apply_file(
                r#"
capacity = 4
rate_limit_per_minute = 0
auth_token = "secret"
bind_addr = "127.0.0.1:9000"
"#,
            )
            .unwrap();
        assert_eq!(config.capacity, 4);
        assert_eq!(config.rate_limit_per_minute, 0);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.bind_addr.port(), 9000);
    }

    #[test]
    fn test_apply_file_rejects_malformed() {
        let mut config = OrchestratorConfig::default();
        assert!(config.apply_file("capacity = \"many\"").is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.admission().capacity, 1);
        assert_eq!(config.coordinator().strategy_shift_limit, 2);
    }
}
