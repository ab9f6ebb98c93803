//! # Configuration Management
//!
//! Loads the bridge configuration from several sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with `APP_` prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (`HOST`, `PORT`, `DASHSCOPE_API_KEY`)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_AUDIO__OUTPUT_SAMPLE_RATE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: bind address
//! - **provider**: credentials and endpoints of the speech/chat provider
//! - **models**: which recognition, chat and realtime synthesis models to use
//! - **speech**: voice, recognition language hint and synthesis output formats
//! - **audio**: capture and playback PCM parameters
//! - **conversation**: per-device memory and reply generation knobs
//! - **flush**: thresholds deciding when partial reply text goes to synthesis
//! - **performance**: connection limits, queue bounds and timeouts

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    pub models: ModelsConfig,
    pub speech: SpeechConfig,
    pub audio: AudioConfig,
    pub conversation: ConversationConfig,
    pub flush: FlushConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote provider endpoints and credentials.
///
/// ## Fields:
/// - `api_key`: bearer token sent to every provider call (never logged or echoed)
/// - `compat_base_url`: OpenAI-compatible REST base (`/audio/transcriptions`, `/chat/completions`)
/// - `realtime_ws_url`: WebSocket endpoint of the realtime synthesis service
/// - `request_timeout_secs`: timeout applied to each REST call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub compat_base_url: String,
    pub realtime_ws_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub asr_model: String,
    pub llm_model: String,
    pub tts_realtime_model: String,
}

/// Speech recognition and synthesis settings.
///
/// `supported_output_rates` lists the PCM rates the synthesis provider can emit.
/// The bridge picks one of them and resamples to `audio.output_sample_rate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub voice: String,
    pub language: String,
    pub commit_mode: String,
    pub supported_output_rates: Vec<u32>,
}

/// PCM parameters for the capture and playback sides.
///
/// ## Fields:
/// - `default_input_sample_rate`: used until a client handshake declares its own rate
/// - `output_sample_rate`: rate of every PCM frame sent back to clients
/// - `min_capture_ms`: captures shorter than this are ignored without calling any provider
/// - `max_capture_seconds`: capture buffer bound; later frames are dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub default_input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub min_capture_ms: u32,
    pub max_capture_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub system_prompt: String,
    pub max_turns: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub fallback_reply: String,
}

/// Flush thresholds, counted in Unicode code points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    pub first_flush_chars: usize,
    pub max_pending_chars: usize,
    pub terminators: String,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: WebSocket connections served at once
/// - `channel_capacity`: bounded audio queue between a synthesis worker and its consumer
/// - `session_timeout_secs`: outer safety bound for one synthesis session
/// - `poll_interval_ms`: how often a streaming loop wakes up to look at abort flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub channel_capacity: usize,
    pub session_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            provider: ProviderConfig {
                api_key: String::new(),
                compat_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
                realtime_ws_url: "wss://dashscope.aliyuncs.com/api-ws/v1/realtime".to_string(),
                request_timeout_secs: 90,
            },
            models: ModelsConfig {
                asr_model: "qwen3-asr-flash".to_string(),
                llm_model: "qwen-plus".to_string(),
                tts_realtime_model: "qwen3-tts-flash-realtime".to_string(),
            },
            speech: SpeechConfig {
                voice: "Cherry".to_string(),
                language: "zh".to_string(),
                commit_mode: "server_commit".to_string(),
                supported_output_rates: vec![24000],
            },
            audio: AudioConfig {
                default_input_sample_rate: 16000,
                output_sample_rate: 16000,
                min_capture_ms: 100,
                max_capture_seconds: 60,
            },
            conversation: ConversationConfig {
                system_prompt: "You are a concise, friendly voice assistant. Answer conversationally \
                    in the user's language, in one or two short sentences that read well aloud."
                    .to_string(),
                max_turns: 12,
                max_tokens: 160,
                temperature: 0.3,
                fallback_reply: "I thought about it, but I'm not sure how to answer.".to_string(),
            },
            flush: FlushConfig {
                first_flush_chars: 8,
                max_pending_chars: 24,
                terminators: "。！？!?\n".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 64,
                channel_capacity: 256,
                session_timeout_secs: 120,
                poll_interval_ms: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_SPEECH__VOICE=Ethan`: Override the synthesis voice
    /// - `DASHSCOPE_API_KEY=sk-...`: Provider credentials
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("speech.supported_output_rates"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("DASHSCOPE_API_KEY") {
            settings = settings.set_override("provider.api_key", key.trim().to_string())?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing API key is not an error here: the server still starts and
    /// provider calls fail individually with a clear message.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.default_input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.speech.supported_output_rates.is_empty()
            || self.speech.supported_output_rates.contains(&0)
        {
            return Err(anyhow::anyhow!("At least one non-zero synthesis output rate is required"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.channel_capacity == 0 {
            return Err(anyhow::anyhow!("Audio channel capacity must be greater than 0"));
        }

        if self.performance.poll_interval_ms == 0 || self.performance.session_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Poll interval and session timeout must be greater than 0"));
        }

        if self.flush.first_flush_chars == 0
            || self.flush.first_flush_chars > self.flush.max_pending_chars
        {
            return Err(anyhow::anyhow!(
                "Flush thresholds must satisfy 0 < first_flush_chars <= max_pending_chars"
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.performance.poll_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.session_timeout_secs)
    }

    /// Configuration as JSON with the provider credentials masked.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(key) = value.pointer_mut("/provider/api_key") {
            let masked = if self.provider.api_key.is_empty() { "" } else { "***" };
            *key = serde_json::Value::String(masked.to_string());
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.performance.channel_capacity, 256);
        assert_eq!(config.flush.first_flush_chars, 8);
        assert_eq!(config.flush.max_pending_chars, 24);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.speech.supported_output_rates.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.flush.first_flush_chars = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.provider.api_key = "sk-secret".to_string();

        let value = config.redacted();
        assert_eq!(value["provider"]["api_key"], "***");
        assert!(!value.to_string().contains("sk-secret"));
        assert_eq!(value["server"]["port"], 8080);
    }
}
