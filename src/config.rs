// Location: src/config.rs

//! Model, sampling and session configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};

/// Options baked into a model at load time.
///
/// The session never interprets these; they are handed to the engine as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// RNG seed (`u32::MAX` asks the engine for a random seed)
    pub seed: u32,

    /// Maximum tokens (prompt plus output) per generation session
    pub context_size: usize,

    /// Prompt processing batch size
    pub batch_size: usize,

    /// Memory-map the model file
    pub use_memory_mapping: bool,

    /// Lock model weights in RAM
    pub use_memory_locking: bool,

    /// Layers to offload to the GPU
    pub gpu_layers: usize,

    /// Rotary embedding frequency base
    pub rope_frequency_base: f32,

    /// Rotary embedding frequency scale
    pub rope_frequency_scale: f32,

    /// Trade speed for lower GPU memory use
    pub low_vram: bool,
}

/// Mirostat sampling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mirostat {
    /// Plain top-k/top-p sampling
    Disabled,
    /// Mirostat 1.0
    V1,
    /// Mirostat 2.0
    V2,
}

/// Sampling options applied to every session created for a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    /// CPU threads used for generation
    pub thread_count: usize,
    /// Keep only the `top_k` most likely tokens
    pub top_k: usize,
    /// Nucleus sampling probability mass
    pub top_p: f32,
    /// Sampling temperature
    pub temperature: f32,
    /// Penalty applied to recently generated tokens
    pub repeat_penalty: f32,

    /// Number of trailing tokens the repeat penalty looks at
    pub last_token_count_penalty: usize,

    /// Apply the repeat penalty to newlines too
    pub penalize_newline: bool,

    /// Tail-free sampling z
    pub tfs_z: f32,

    /// Locally typical sampling p
    pub typical_p: f32,
    /// Penalty scaled by how often a token appeared
    pub frequency_penalty: f32,
    /// Penalty for any token that appeared at all
    pub presence_penalty: f32,
    /// Mirostat mode
    pub mirostat: Mirostat,

    /// Mirostat target entropy
    pub mirostat_tau: f32,

    /// Mirostat learning rate
    pub mirostat_eta: f32,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            seed: u32::MAX,
            context_size: 512,
            batch_size: 512,
            use_memory_mapping: true,
            use_memory_locking: false,
            gpu_layers: 24,
            rope_frequency_base: 10000.0,
            rope_frequency_scale: 1.0,
            low_vram: false,
        }
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            thread_count: 4,
            top_k: 40,
            top_p: 0.95,
            temperature: 0.8,
            repeat_penalty: 1.1,
            last_token_count_penalty: 64,
            penalize_newline: false,
            tfs_z: 1.0,
            typical_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            mirostat: Mirostat::V2,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
        }
    }
}

/// Settings of the session layer itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory that relative model paths are resolved against
    pub model_dir: Option<PathBuf>,

    /// Label shown before the response in rendered transcripts
    pub assistant_label: String,

    /// Snapshot delivery settings
    pub publish: PublishConfig,
    /// Logging and counter settings
    pub monitoring: MonitoringConfig,
}

/// How snapshots reach the presentation thread
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Capacity of the compute-to-presentation snapshot channel
    pub channel_capacity: usize,

    /// When set, the dispatcher delivers at most one snapshot per interval,
    /// always the newest one
    pub coalesce_interval_ms: Option<u64>,
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Collect per-session query counters
    pub enable_metrics: bool,

    /// Default log level for `setup_logging`
    pub log_level: LogLevel,
}

/// Serializable mirror of `tracing::Level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Errors only
    Error,
    /// Warnings and above
    Warn,
    /// Informational and above
    Info,
    /// Debug and above
    Debug,
    /// Everything, including per-token events
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            assistant_label: "Assistant".to_string(),
            publish: PublishConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            coalesce_interval_ms: None,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            log_level: LogLevel::Info,
        }
    }
}

impl PublishConfig {
    /// Coalescing window, if enabled
    pub fn coalesce_interval(&self) -> Option<Duration> {
        self.coalesce_interval_ms.map(Duration::from_millis)
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServiceError::Configuration {
                parameter: "session_config".to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ServiceError::Configuration {
            parameter: "session_config".to_string(),
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&json)
    }

    /// Resolve a model path against `model_dir` unless it is already absolute
    pub fn resolve_model_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        match &self.model_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Check the configuration for values the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.publish.channel_capacity == 0 {
            return Err(ServiceError::Configuration {
                parameter: "publish.channel_capacity".to_string(),
                message: "Channel capacity must be at least 1".to_string(),
            });
        }

        if self.publish.coalesce_interval_ms == Some(0) {
            return Err(ServiceError::Configuration {
                parameter: "publish.coalesce_interval_ms".to_string(),
                message: "Coalesce interval must be positive when set".to_string(),
            });
        }

        if self.assistant_label.trim().is_empty() {
            return Err(ServiceError::Configuration {
                parameter: "assistant_label".to_string(),
                message: "Assistant label cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}
