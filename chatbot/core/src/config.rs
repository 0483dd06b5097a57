//! Configuration
//!
//! Loads client settings from `~/.config/ubti-chatbot/chatbot.toml`, the
//! environment and command-line overrides.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! base_url = "https://api.example.com"
//! chat_path = "/chat"
//! ubti_question_path = "/ubti/question"
//! ubti_result_path = "/ubti/result"
//! connect_timeout_ms = 5000
//!
//! [chat]
//! tone = "muneoz"
//!
//! [throttle.ubti]
//! chars_per_tick = 1
//! tick_interval_ms = 60
//! flush_on_structured_event = true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::Endpoints;
use crate::protocol::Tone;
use crate::throttle::{ThrottleConfig, ThrottlePreset, ThrottlePresets};

/// Server used when nothing is configured
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Default connection timeout
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Server base URL
    pub base_url: Option<String>,
    /// General chat path
    pub chat_path: Option<String>,
    /// UBTI question path
    pub ubti_question_path: Option<String>,
    /// UBTI result path
    pub ubti_result_path: Option<String>,
    /// Likes recommendation path
    pub likes_recommendation_path: Option<String>,
    /// Usage recommendation path
    pub usage_recommendation_path: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Chat section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Default answer tone
    pub tone: Option<Tone>,
}

/// One pacing preset in the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleToml {
    /// Characters per released slice
    pub chars_per_tick: Option<usize>,
    /// Milliseconds between slices
    pub tick_interval_ms: Option<u64>,
    /// Release cards ahead of queued text
    pub flush_on_structured_event: Option<bool>,
}

/// Throttle section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlesToml {
    /// General chat pacing
    pub chat: ThrottleToml,
    /// UBTI pacing
    pub ubti: ThrottleToml,
    /// Recommendation pacing
    pub recommendation: ThrottleToml,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatbotToml {
    /// Server section
    pub server: ServerToml,
    /// Chat section
    pub chat: ChatToml,
    /// Throttle presets
    pub throttle: ThrottlesToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved client configuration
#[derive(Clone, Debug)]
pub struct ChatbotConfig {
    /// Server base URL
    pub base_url: String,
    /// Endpoint paths
    pub endpoints: Endpoints,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Default answer tone
    pub tone: Tone,
    /// Pacing presets
    pub throttle: ThrottlePresets,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ChatbotConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoints: Endpoints::default(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            tone: Tone::General,
            throttle: ThrottlePresets::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ChatbotConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check values that would break an exchange
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server base_url must not be empty".to_string(),
            ));
        }
        for preset in [
            ThrottlePreset::Chat,
            ThrottlePreset::Ubti,
            ThrottlePreset::Recommendation,
        ] {
            if self.throttle.resolve(preset).chars_per_tick == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "throttle.{} chars_per_tick must be at least 1",
                    preset.as_str()
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/ubti-chatbot/chatbot.toml` or
/// `~/.config/ubti-chatbot/chatbot.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ubti-chatbot").join("chatbot.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<ChatbotConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result fails
/// validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ChatbotConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ChatbotConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ChatbotConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ChatbotToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn apply_throttle_toml(config: &mut ThrottleConfig, toml: &ThrottleToml) {
    if let Some(chars) = toml.chars_per_tick {
        config.chars_per_tick = chars;
    }
    if let Some(ms) = toml.tick_interval_ms {
        config.tick_interval_ms = ms;
    }
    if let Some(flush) = toml.flush_on_structured_event {
        config.flush_on_structured_event = flush;
    }
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ChatbotConfig, toml: &ChatbotToml) {
    if let Some(ref url) = toml.server.base_url {
        config.base_url = url.clone();
    }
    if let Some(ref path) = toml.server.chat_path {
        config.endpoints.chat = path.clone();
    }
    if let Some(ref path) = toml.server.ubti_question_path {
        config.endpoints.ubti_question = path.clone();
    }
    if let Some(ref path) = toml.server.ubti_result_path {
        config.endpoints.ubti_result = path.clone();
    }
    if let Some(ref path) = toml.server.likes_recommendation_path {
        config.endpoints.likes_recommendation = path.clone();
    }
    if let Some(ref path) = toml.server.usage_recommendation_path {
        config.endpoints.usage_recommendation = path.clone();
    }
    if let Some(ms) = toml.server.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }

    if let Some(tone) = toml.chat.tone {
        config.tone = tone;
    }

    apply_throttle_toml(config.throttle.get_mut(ThrottlePreset::Chat), &toml.throttle.chat);
    apply_throttle_toml(config.throttle.get_mut(ThrottlePreset::Ubti), &toml.throttle.ubti);
    apply_throttle_toml(
        config.throttle.get_mut(ThrottlePreset::Recommendation),
        &toml.throttle.recommendation,
    );
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut ChatbotConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env("CHATBOT_BASE_URL") {
        config.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(tone) = env("CHATBOT_TONE") {
        match tone.parse::<Tone>() {
            Ok(tone) => {
                config.tone = tone;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(value = %tone, error = %e, "Ignoring CHATBOT_TONE"),
        }
    }
    if let Some(ms) = env("CHATBOT_CONNECT_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.connect_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }

    for (preset, chars_key, tick_key) in [
        (ThrottlePreset::Chat, "CHATBOT_CHAT_CHARS_PER_TICK", "CHATBOT_CHAT_TICK_MS"),
        (ThrottlePreset::Ubti, "CHATBOT_UBTI_CHARS_PER_TICK", "CHATBOT_UBTI_TICK_MS"),
    ] {
        if let Some(chars) = env(chars_key).and_then(|v| v.parse::<usize>().ok()) {
            config.throttle.get_mut(preset).chars_per_tick = chars;
            config.source = ConfigSource::Env;
        }
        if let Some(ms) = env(tick_key).and_then(|v| v.parse::<u64>().ok()) {
            config.throttle.get_mut(preset).tick_interval_ms = ms;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,
    /// Tone override
    pub tone: Option<Tone>,
    /// Connect timeout override (milliseconds)
    pub connect_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set tone override
    #[must_use]
    pub fn with_tone(mut self, tone: Tone) -> Self {
        self.tone = Some(tone);
        self
    }

    /// Set connect timeout override
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Apply overrides and re-validate
    pub fn apply(&self, config: &mut ChatbotConfig) -> Result<(), ConfigError> {
        if self.base_url.is_some() || self.tone.is_some() || self.connect_timeout_ms.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref url) = self.base_url {
            config.base_url = url.clone();
        }
        if let Some(tone) = self.tone {
            config.tone = tone;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
