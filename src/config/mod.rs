//! Configuration management.
//!
//! Configuration is loaded from multiple sources in order: defaults, an
//! optional `config/courier` file, `COURIER__`-prefixed environment
//! variables, and finally a handful of well-known environment variables
//! (`GEMINI_API_KEY` and friends) that override everything else.

use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server bind configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Embedded database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Gemini LLM configuration.
    #[serde(default)]
    pub gemini: GeminiConfig,
    /// Route engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Server bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Embedded database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./courier.db".to_string(),
        }
    }
}

/// Gemini LLM configuration.
///
/// Structured so the file keys read `gemini.api.key`, `gemini.model.name`
/// and `gemini.model.temperature`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api: GeminiApiConfig,
    #[serde(default)]
    pub model: GeminiModelConfig,
}

/// Gemini API credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiApiConfig {
    /// API key. Unset means LLM steps will fail at call time.
    pub key: Option<String>,
}

/// Gemini model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiModelConfig {
    /// Model identifier.
    pub name: String,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for GeminiModelConfig {
    fn default() -> Self {
        Self {
            name: "gemini-2.0-flash".to_string(),
            temperature: 0.7,
        }
    }
}

/// Route engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum accepted payload length, in characters.
    pub max_payload_chars: usize,
    /// Default approval gate timeout, in minutes.
    pub approval_timeout_minutes: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_payload_chars: 50_000,
            approval_timeout_minutes: 60.0,
        }
    }
}

impl AppConfig {
    /// Load configuration from config files and the environment.
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.path", "./courier.db")?
            .set_default("gemini.model.name", "gemini-2.0-flash")?
            .set_default("gemini.model.temperature", 0.7)?
            .set_default("engine.max_payload_chars", 50_000)?
            .set_default("engine.approval_timeout_minutes", 60.0)?
            .add_source(config::File::with_name("config/courier").required(false))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize().unwrap_or_default();

        // Well-known environment overrides
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            app_config.gemini.api.key = Some(key);
        }
        if let Ok(name) = std::env::var("GEMINI_MODEL_NAME") {
            app_config.gemini.model.name = name;
        }
        if let Ok(temp) = std::env::var("GEMINI_MODEL_TEMPERATURE") {
            if let Ok(parsed) = temp.parse() {
                app_config.gemini.model.temperature = parsed;
            }
        }

        Ok(app_config)
    }
}
