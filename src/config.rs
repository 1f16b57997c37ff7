use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CURRENCY: &str = "KES";
const CONFIG_DIR: &str = "config";

/// Mobile-money gateway (Daraja STK push) configuration.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct MpesaConfig {
    /// Base URL of the gateway (sandbox or production)
    #[serde(default = "default_mpesa_base_url")]
    pub base_url: String,

    /// Long-lived service credentials exchanged for a short-lived token
    pub consumer_key: String,
    pub consumer_secret: String,

    /// Paybill / till number identifying the business
    #[validate(length(min = 5, max = 7))]
    pub short_code: String,

    /// Shared secret mixed into the request password
    pub passkey: String,

    /// Public URL the gateway posts the asynchronous result to
    pub callback_url: String,

    /// Dialling prefix used when canonicalizing payer numbers
    #[serde(default = "default_country_code")]
    pub country_code: String,

    /// Accepted whole-unit amount range for a single push request
    #[serde(default = "default_min_amount")]
    pub min_amount: u64,
    #[serde(default = "default_max_amount")]
    pub max_amount: u64,

    /// Timeout applied to each gateway hop
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Status-poll backup: interval between attempts and attempt cap
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_max_attempts")]
    pub poll_max_attempts: u32,

    /// Minutes after which a still-pending order is surfaced to an operator
    #[serde(default = "default_pending_timeout_minutes")]
    pub pending_timeout_minutes: i64,
}

fn default_mpesa_base_url() -> String {
    "https://sandbox.safaricom.co.ke".to_string()
}
fn default_country_code() -> String {
    "254".to_string()
}
fn default_min_amount() -> u64 {
    1
}
fn default_max_amount() -> u64 {
    250_000
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_poll_interval_secs() -> u64 {
    20
}
fn default_poll_max_attempts() -> u32 {
    6
}
fn default_pending_timeout_minutes() -> i64 {
    15
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            base_url: default_mpesa_base_url(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            short_code: "174379".to_string(),
            passkey: String::new(),
            callback_url: "http://localhost:8080/api/v1/payments/mpesa/callback".to_string(),
            country_code: default_country_code(),
            min_amount: default_min_amount(),
            max_amount: default_max_amount(),
            http_timeout_secs: default_http_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_max_attempts: default_poll_max_attempts(),
            pending_timeout_minutes: default_pending_timeout_minutes(),
        }
    }
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Secret used to verify bearer credentials (verification only;
    /// issuance lives elsewhere)
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[serde(default = "default_env")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to bootstrap the schema on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool sizing
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// Settlement currency for orders
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Mobile-money gateway settings
    #[serde(default)]
    pub mpesa: MpesaConfig,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_env() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}

impl AppConfig {
    /// Minimal constructor used by tests and tooling.
    pub fn new(database_url: String, jwt_secret: String, host: String, port: u16) -> Self {
        Self {
            database_url,
            jwt_secret,
            host,
            port,
            environment: default_env(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            currency: default_currency(),
            mpesa: MpesaConfig::default(),
        }
    }

    /// Loads configuration from `config/default`, an environment-specific
    /// overlay, and `APP_`-prefixed environment variables (highest
    /// precedence, `__` as the section separator).
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let cfg: AppConfig = Config::builder()
            .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
            .add_source(File::with_name(&format!("{CONFIG_DIR}/{environment}")).required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?
            .try_deserialize()?;

        cfg.validate()
            .map_err(|e| ConfigError::Message(format!("invalid configuration: {e}")))?;

        Ok(cfg)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
