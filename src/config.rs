//! Runtime tunables for the acquisition core.
//!
//! Settings come from an optional JSON file next to the extension's data,
//! with environment overrides on top so individual installs can be tuned
//! without editing files.

use std::time::Duration;
use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::guard::GuardPolicy;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    /// Where the extension backend listens, usually the editor itself.
    #[serde(default = "default_backend_base_url")]
    pub backend_base_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
    #[serde(default = "default_guard_cooldown_ms")]
    pub guard_cooldown_ms: u64,
    #[serde(default = "default_hook_retry_interval_ms")]
    pub hook_retry_interval_ms: u64,
    #[serde(default = "default_hook_max_attempts")]
    pub hook_max_attempts: u32,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_dialog_probe_timeout_ms")]
    pub dialog_probe_timeout_ms: u64,
    #[serde(default = "default_validation_probe_timeout_ms")]
    pub validation_probe_timeout_ms: u64,
    /// Upload chunking limit forwarded to backup submissions, in GiB.
    #[serde(default = "default_backup_size_limit_gb")]
    pub backup_size_limit_gb: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_base_url: default_backend_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            job_ttl_secs: default_job_ttl_secs(),
            guard_cooldown_ms: default_guard_cooldown_ms(),
            hook_retry_interval_ms: default_hook_retry_interval_ms(),
            hook_max_attempts: default_hook_max_attempts(),
            probe_interval_ms: default_probe_interval_ms(),
            dialog_probe_timeout_ms: default_dialog_probe_timeout_ms(),
            validation_probe_timeout_ms: default_validation_probe_timeout_ms(),
            backup_size_limit_gb: default_backup_size_limit_gb(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` when it exists, falling back to defaults,
    /// then applies any environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let data = fs::read(path)
                .with_context(|| format!("failed to read settings file {path:?}"))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse settings from {path:?}"))?
        } else {
            Self::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = parse_env_u64("COMFY_FETCH_POLL_INTERVAL_MS") {
            self.poll_interval_ms = value.max(100);
        }
        if let Some(value) = parse_env_u64("COMFY_FETCH_JOB_TTL_SECS") {
            self.job_ttl_secs = value;
        }
        if let Some(value) = parse_env_u64("COMFY_FETCH_GUARD_COOLDOWN_MS") {
            self.guard_cooldown_ms = value;
        }
        if let Ok(url) = std::env::var("COMFY_FETCH_BACKEND_URL") {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                self.backend_base_url = trimmed.to_string();
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn guard_policy(&self) -> GuardPolicy {
        GuardPolicy {
            cooldown: Duration::from_millis(self.guard_cooldown_ms),
            hook_retry_interval: Duration::from_millis(self.hook_retry_interval_ms),
            hook_max_attempts: self.hook_max_attempts,
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            dialog_timeout: Duration::from_millis(self.dialog_probe_timeout_ms),
            validation_timeout: Duration::from_millis(self.validation_probe_timeout_ms),
        }
    }
}

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|value| value.trim().parse().ok())
}

fn default_backend_base_url() -> String {
    "http://127.0.0.1:8188/".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_ttl_secs() -> u64 {
    crate::jobs::DEFAULT_JOB_TTL_SECS
}

fn default_guard_cooldown_ms() -> u64 {
    1800
}

fn default_hook_retry_interval_ms() -> u64 {
    500
}

fn default_hook_max_attempts() -> u32 {
    20
}

fn default_probe_interval_ms() -> u64 {
    150
}

fn default_dialog_probe_timeout_ms() -> u64 {
    1200
}

fn default_validation_probe_timeout_ms() -> u64 {
    2500
}

fn default_backup_size_limit_gb() -> f64 {
    5.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_windows() {
        let settings = Settings::default();
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.job_ttl_secs, 120);
        assert_eq!(settings.guard_policy().cooldown, Duration::from_millis(1800));
    }

    #[test]
    fn partial_settings_files_fill_in_defaults() {
        let parsed: Settings = serde_json::from_str(
            r#"{"backend_base_url": "http://localhost:9999/", "poll_interval_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(parsed.backend_base_url, "http://localhost:9999/");
        assert_eq!(parsed.poll_interval_ms, 250);
        assert_eq!(parsed.job_ttl_secs, 120);
    }
}
