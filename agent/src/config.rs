//! On-disk agent configuration: a single `AgentConfig` loaded once at
//! startup via `clap` + `toml`, no hot-reload. A plain `serde`-derived
//! struct with `Default` for every optional section, parsed once in `main`
//! and handed down by value.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use ingestd_core::dedup::DedupConfig;
use ingestd_core::dispatcher::DispatcherConfig;
use ingestd_core::sinks::local_file::LocalFileSinkConfig;
use ingestd_core::sinks::loki::LokiSinkConfig;
use ingestd_core::supervisor::SupervisorConfig;
use ingestd_core::timestamp::{ClampMode, TimestampLearnerConfig};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub state_dir: PathBuf,
    pub shutdown_deadline_secs: u64,
    pub files: Vec<FileTargetConfig>,
    pub containers: ContainerConfig,
    pub dedup: DedupSection,
    pub timestamp: TimestampSection,
    pub dispatcher: DispatcherSection,
    pub loki: Option<LokiSection>,
    pub local_file: Option<LocalFileSection>,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/ingestd"),
            shutdown_deadline_secs: 15,
            files: Vec::new(),
            containers: ContainerConfig::default(),
            dedup: DedupSection::default(),
            timestamp: TimestampSection::default(),
            dispatcher: DispatcherSection::default(),
            loki: Some(LokiSection::default()),
            local_file: Some(LocalFileSection::default()),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FileTargetConfig {
    pub path: PathBuf,
    pub labels: std::collections::BTreeMap<String, String>,
    /// Regex a physical line must match to start a new logical entry;
    /// absent means every line is its own entry.
    pub multiline_start_pattern: Option<String>,
}

impl Default for FileTargetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            labels: Default::default(),
            multiline_start_pattern: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ContainerConfig {
    pub enabled: bool,
    pub discovery_interval_secs: u64,
    pub stream_max_lifetime_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discovery_interval_secs: 15,
            stream_max_lifetime_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DedupSection {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for DedupSection {
    fn default() -> Self {
        let d = DedupConfig::default();
        Self {
            ttl_secs: d.ttl.as_secs(),
            max_entries: d.max_entries,
        }
    }
}

impl From<&DedupSection> for DedupConfig {
    fn from(s: &DedupSection) -> Self {
        Self {
            ttl: Duration::from_secs(s.ttl_secs),
            max_entries: s.max_entries,
            ..DedupConfig::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimestampSection {
    pub max_acceptable_age_hours: i64,
    pub max_acceptable_future_skew_mins: i64,
    /// `"adjust"` (default) clamps out-of-window entries to the boundary;
    /// `"reject"` dead-letters them instead of rewriting the timestamp.
    pub clamp_mode: String,
}

impl Default for TimestampSection {
    fn default() -> Self {
        Self {
            max_acceptable_age_hours: 24,
            max_acceptable_future_skew_mins: 10,
            clamp_mode: "adjust".to_string(),
        }
    }
}

impl From<&TimestampSection> for TimestampLearnerConfig {
    fn from(s: &TimestampSection) -> Self {
        let clamp_mode = match s.clamp_mode.to_ascii_lowercase().as_str() {
            "reject" => ClampMode::Reject,
            _ => ClampMode::Adjust,
        };
        Self {
            max_acceptable_age: chrono::Duration::hours(s.max_acceptable_age_hours),
            max_acceptable_future_skew: chrono::Duration::minutes(s.max_acceptable_future_skew_mins),
            clamp_mode,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatcherSection {
    pub ingress_capacity: usize,
    pub retry_capacity: usize,
    pub worker_count: usize,
    pub max_attempts: u32,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        let d = DispatcherConfig::default();
        Self {
            ingress_capacity: d.ingress_capacity,
            retry_capacity: d.retry_capacity,
            worker_count: d.worker_count,
            max_attempts: d.max_attempts,
        }
    }
}

impl From<&DispatcherSection> for DispatcherConfig {
    fn from(s: &DispatcherSection) -> Self {
        let mut config = DispatcherConfig::default();
        config.ingress_capacity = s.ingress_capacity;
        config.retry_capacity = s.retry_capacity;
        config.worker_count = s.worker_count;
        config.max_attempts = s.max_attempts;
        config
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LokiSection {
    pub push_url: String,
    pub tenant_id: Option<String>,
    /// Never populated from the TOML file itself — secrets are sourced from
    /// `INGESTD_LOKI_AUTH_TOKEN` by `AgentConfig::load` after parsing, so a
    /// config file checked into version control never carries a credential.
    #[serde(skip)]
    pub auth_token: Option<String>,
}

impl Default for LokiSection {
    fn default() -> Self {
        Self {
            push_url: LokiSinkConfig::default().push_url,
            tenant_id: None,
            auth_token: None,
        }
    }
}

impl From<&LokiSection> for LokiSinkConfig {
    fn from(s: &LokiSection) -> Self {
        let mut config = LokiSinkConfig::default();
        config.push_url = s.push_url.clone();
        config.tenant_id = s.tenant_id.clone();
        config.auth_token = s.auth_token.clone();
        config
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LocalFileSection {
    pub dir: PathBuf,
}

impl Default for LocalFileSection {
    fn default() -> Self {
        Self {
            dir: LocalFileSinkConfig::default().dir,
        }
    }
}

impl From<&LocalFileSection> for LocalFileSinkConfig {
    fn from(s: &LocalFileSection) -> Self {
        Self {
            dir: s.dir.clone(),
            ..Default::default()
        }
    }
}

impl AgentConfig {
    pub async fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let mut config: AgentConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Overlays secrets sourced from the environment rather than the config
    /// file, so a file safe to commit never needs to carry a bearer token.
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("INGESTD_LOKI_AUTH_TOKEN") {
            if let Some(loki) = self.loki.as_mut() {
                loki.auth_token = Some(token);
            }
        }
    }

    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            state_dir: self.state_dir.clone(),
            dedup: (&self.dedup).into(),
            timestamp: (&self.timestamp).into(),
            dispatcher: (&self.dispatcher).into(),
            loki: self.loki.as_ref().map(Into::into),
            local_file: self.local_file.as_ref().map(Into::into),
            shutdown_deadline: Duration::from_secs(self.shutdown_deadline_secs),
            ..Default::default()
        }
    }
}
