//! # Configuration Management
//!
//! This module handles loading application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! Configuration is loaded once at startup and never changes afterwards; every
//! connection's pipeline sees the same values for the lifetime of the process.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (`HOST`, `PORT`, `OPENAI_API_KEY`)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_BACKEND__LLM_MODEL`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: converts between the structs below and TOML / environment values
//! - **`Option<T>`**: `max_pending = None` means "no limit"
//! - **Result<T, E>**: every loading step can fail and is propagated with `?`

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub conversation: ConversationConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Chat page served at `/`
    pub index_path: String,
    /// Largest inbound WebSocket frame accepted, in bytes
    pub max_frame_bytes: usize,
}

/// Text generation and speech synthesis backend settings.
///
/// Both backends speak the OpenAI HTTP API, so they share a base URL and credential.
///
/// ## Fields:
/// - `max_tokens` / `temperature`: fixed sampling parameters for every generation call
/// - `tts_model` / `tts_voice`: fixed voice selection for every synthesis call
/// - `request_timeout_secs`: upper bound for a single backend call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub api_key: String,
    pub base_url: String,
    pub llm_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub tts_model: String,
    pub tts_voice: String,
    pub request_timeout_secs: u64,
}

/// Per-connection conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Maximum number of messages waiting behind the in-flight one.
    /// `None` keeps the queue unbounded.
    pub max_pending: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                index_path: "index.html".to_string(),
                max_frame_bytes: 16 * 1024 * 1024,
            },
            backend: BackendConfig {
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                llm_model: "gpt-3.5-turbo".to_string(),
                max_tokens: 50,
                temperature: 0.7,
                tts_model: "tts-1".to_string(),
                tts_voice: "fable".to_string(),
                request_timeout_secs: 30,
            },
            conversation: ConversationConfig { max_pending: None },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_BACKEND__TTS_VOICE=nova`: Override synthesis voice
    /// - `APP_CONVERSATION__MAX_PENDING=8`: Bound the per-connection queue
    /// - `OPENAI_API_KEY=sk-...`: Backend credential
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = Self::layered(config::File::with_name("config").required(false))?
            .add_source(Self::environment());

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("backend.api_key", key)?;
        }

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// `APP_<SECTION>__<KEY>` variables. Double underscore separates sections because
    /// keys contain single underscores.
    fn environment() -> config::Environment {
        config::Environment::with_prefix("APP")
            .prefix_separator("_")
            .separator("__")
    }

    /// Defaults with one file-like source layered on top.
    fn layered<S>(source: S) -> Result<config::ConfigBuilder<config::builder::DefaultState>>
    where
        S: config::Source + Send + Sync + 'static,
    {
        Ok(config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(source))
    }

    /// Parse a TOML document layered over the defaults.
    #[cfg(test)]
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let source = config::File::from_str(toml, config::FileFormat::Toml);
        Ok(Self::layered(source)?.build()?.try_deserialize()?)
    }

    /// Defaults plus `APP_*` variables taken from `vars` instead of the process.
    #[cfg(test)]
    pub fn from_env_vars(vars: &[(&str, &str)]) -> Result<Self> {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        let source = Self::environment().source(Some(vars));
        Ok(Self::layered(source)?.build()?.try_deserialize()?)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("max_frame_bytes must be greater than 0"));
        }

        if self.backend.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Backend API key is missing (set OPENAI_API_KEY or backend.api_key)"
            ));
        }

        if self.backend.max_tokens == 0 {
            return Err(anyhow::anyhow!("max_tokens must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.backend.temperature) {
            return Err(anyhow::anyhow!(
                "temperature must be between 0.0 and 2.0, got {}",
                self.backend.temperature
            ));
        }

        if self.backend.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Backend request timeout must be greater than 0"));
        }

        if self.conversation.max_pending == Some(0) {
            return Err(anyhow::anyhow!(
                "max_pending must be greater than 0 (omit it for an unbounded queue)"
            ));
        }

        Ok(())
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }
}
