use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// The API key is deliberately optional here: its absence is reported as a
/// typed error when a session starts, never as a silent failure somewhere in
/// the audio path.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub gemini_api_key: Option<String>,
    pub live_model: String,
    pub voice_name: String,
    /// Force-close sessions with no activity for this long. `None` disables
    /// the watchdog.
    pub idle_timeout: Option<Duration>,
    /// How long `end` waits for the model to finish its final turn.
    pub final_turn_timeout: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let live_model = std::env::var("LIVE_MODEL")
            .unwrap_or_else(|_| "models/gemini-2.0-flash-live-001".to_string());
        let voice_name = std::env::var("VOICE_NAME").unwrap_or_else(|_| "Zephyr".to_string());

        let idle_timeout = parse_secs("SESSION_IDLE_TIMEOUT_SECS", 300)?;
        let idle_timeout = (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout));

        let final_turn_timeout = Duration::from_secs(parse_secs("FINAL_TURN_TIMEOUT_SECS", 10)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            gemini_api_key,
            live_model,
            voice_name,
            idle_timeout,
            final_turn_timeout,
            log_level,
        })
    }
}

fn parse_secs(var: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string())),
    }
}
