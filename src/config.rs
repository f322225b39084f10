use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_VERIFICATION_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CART_SESSION_TTL_SECS: u64 = 60 * 60 * 24 * 30;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Payment gateway configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Gateway REST base URL
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,

    /// Secret API key sent as a bearer token on every gateway call
    pub secret_key: String,

    /// Shared secret for webhook signature verification. Falls back to
    /// `secret_key` when unset, matching common gateway setups.
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// URL the gateway redirects customers to after checkout
    #[serde(default = "default_callback_url")]
    pub callback_url: String,

    /// Per-request timeout for gateway HTTP calls, in seconds
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,

    /// How long verification results stay fresh in the local cache
    #[serde(default = "default_verification_cache_ttl")]
    pub verification_cache_ttl_secs: u64,
}

impl GatewayConfig {
    pub fn webhook_secret(&self) -> &str {
        self.webhook_secret.as_deref().unwrap_or(&self.secret_key)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Guest cart session cookie lifetime in seconds
    #[serde(default = "default_cart_session_ttl")]
    pub cart_session_ttl_secs: u64,

    /// Bounded capacity of the in-process event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Payment gateway settings
    #[validate]
    pub gateway: GatewayConfig,
}

impl AppConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development" || self.environment == "dev"
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_gateway_base_url() -> String {
    "https://api.paystack.co".to_string()
}

fn default_callback_url() -> String {
    "http://localhost:8080/payments/callback".to_string()
}

fn default_verify_timeout() -> u64 {
    DEFAULT_VERIFY_TIMEOUT_SECS
}

fn default_verification_cache_ttl() -> u64 {
    DEFAULT_VERIFICATION_CACHE_TTL_SECS
}

fn default_cart_session_ttl() -> u64 {
    DEFAULT_CART_SESSION_TTL_SECS
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading error: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // NOTE: gateway.secret_key has no default - it MUST come from a config
    // file or environment variable so an insecure placeholder never ships.
    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("auto_migrate", true)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("gateway.secret_key").is_err() {
        error!("Payment gateway secret is not configured. Set APP__GATEWAY__SECRET_KEY or add it to a config file.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "gateway.secret_key is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}
