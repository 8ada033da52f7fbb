use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

use crate::error::{RelayError, Result};
use crate::queue::MAX_LEASE;

pub const CONFIG_FILE: &str = "relay.yaml";
pub const API_KEY_ENV: &str = "RELAY_STORE_API_KEY";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
    Durable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_schedule_queue")]
    pub schedule: String,
    #[serde(default = "default_recheck_queue")]
    pub recheck: String,
    #[serde(default = "default_apply_queue")]
    pub apply: String,
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
}

fn default_schedule_queue() -> String {
    "MoistureSensorScheduler".to_string()
}

fn default_recheck_queue() -> String {
    "MoistureSensorTimerExpired".to_string()
}

fn default_apply_queue() -> String {
    "MoistureSensorUpdateActuator".to_string()
}

fn default_lease_timeout() -> u64 {
    5
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("relay-queue.redb")
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule_queue(),
            recheck: default_recheck_queue(),
            apply: default_apply_queue(),
            lease_timeout_secs: default_lease_timeout(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval(),
            backend: QueueBackend::default(),
            path: default_queue_path(),
        }
    }
}

impl QueueConfig {
    /// Lease clamped to the transport's 12h ceiling.
    pub fn lease(&self) -> Duration {
        crate::queue::clamp_lease(Duration::from_secs(self.lease_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_buffer")]
    pub input_buffer: usize,
    #[serde(default = "default_overflow_timeout")]
    pub overflow_timeout_ms: u64,
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_buffer() -> usize {
    100
}

fn default_overflow_timeout() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            subscriber_buffer: default_buffer(),
            input_buffer: default_buffer(),
            overflow_timeout_ms: default_overflow_timeout(),
            tls: TlsConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub graphql_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub detector_url: String,
    #[serde(default = "default_detector_model")]
    pub detector_model: String,
    #[serde(default = "default_normal_state")]
    pub normal_state: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_detector_model() -> String {
    "MoistureSensorModel".to_string()
}

fn default_normal_state() -> String {
    "Normal".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            graphql_url: String::new(),
            api_key: None,
            detector_url: String::new(),
            detector_model: default_detector_model(),
            normal_state: default_normal_state(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    /// Configured key, else the `RELAY_STORE_API_KEY` environment variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// EdgeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_command")]
    pub command: PathBuf,
    /// Leading arguments placed before `<device-id> <1|0>`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_args: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_unavailable_threshold")]
    pub unavailable_threshold: u32,
    #[serde(default = "default_invert")]
    pub invert_on_receive_error: bool,
    #[serde(default)]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
}

fn default_server_url() -> String {
    "http://localhost:50051".to_string()
}

fn default_client_id() -> String {
    "myclientid".to_string()
}

fn default_command() -> PathBuf {
    PathBuf::from("./script.sh")
}

fn default_command_timeout() -> u64 {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_unavailable_threshold() -> u32 {
    2
}

fn default_invert() -> bool {
    true
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            client_id: default_client_id(),
            command: default_command(),
            command_args: Vec::new(),
            command_timeout_secs: default_command_timeout(),
            max_attempts: default_max_attempts(),
            unavailable_threshold: default_unavailable_threshold(),
            invert_on_receive_error: default_invert(),
            reconnect_delay_ms: 0,
            work_dir: default_work_dir(),
            ca_file: None,
        }
    }
}

impl EdgeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// RelayConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }

    /// Write via a sibling tempfile so a crash never leaves a half-written file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Fails only on `Error`-level findings; warnings are left to the caller.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RelayError::InvalidConfig(errors.join("; ")))
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        for (field, name) in [
            ("schedule", &self.queues.schedule),
            ("recheck", &self.queues.recheck),
            ("apply", &self.queues.apply),
        ] {
            if name.trim().is_empty() {
                push(WarnLevel::Error, format!("queues.{field} is empty"));
            }
        }
        let q = &self.queues;
        if q.schedule == q.recheck || q.schedule == q.apply || q.recheck == q.apply {
            push(
                WarnLevel::Error,
                "queues.schedule, queues.recheck and queues.apply must be distinct".to_string(),
            );
        }

        if Duration::from_secs(q.lease_timeout_secs) > MAX_LEASE {
            push(
                WarnLevel::Warning,
                format!(
                    "queues.lease_timeout_secs {} exceeds the 12h cap and will be clamped",
                    q.lease_timeout_secs
                ),
            );
        }
        if q.lease_timeout_secs == 0 {
            push(
                WarnLevel::Warning,
                "queues.lease_timeout_secs is 0; messages are redelivered immediately".to_string(),
            );
        }
        if q.batch_size == 0 {
            push(WarnLevel::Error, "queues.batch_size must be at least 1".to_string());
        }

        if self.server.subscriber_buffer == 0 || self.server.input_buffer == 0 {
            push(
                WarnLevel::Error,
                "server buffers must be at least 1".to_string(),
            );
        }
        let tls = &self.server.tls;
        if tls.enabled && (tls.cert_file.is_none() || tls.key_file.is_none()) {
            push(
                WarnLevel::Error,
                "server.tls.enabled requires cert_file and key_file".to_string(),
            );
        }

        if self.store.request_timeout_secs == 0 {
            push(
                WarnLevel::Warning,
                "store.request_timeout_secs is 0".to_string(),
            );
        }

        let edge = &self.edge;
        if edge.command_timeout_secs == 0 {
            push(
                WarnLevel::Warning,
                "edge.command_timeout_secs is 0; every command will time out".to_string(),
            );
        }
        if edge.max_attempts == 0 {
            push(
                WarnLevel::Error,
                "edge.max_attempts must be at least 1".to_string(),
            );
        }
        if !(edge.server_url.starts_with("http://") || edge.server_url.starts_with("https://")) {
            push(
                WarnLevel::Warning,
                format!("edge.server_url '{}' has no http(s) scheme", edge.server_url),
            );
        }

        warnings
    }
}

/// Walk upward from `start` looking for `relay.yaml`.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}
