use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:overlay-alerts.db?mode=rwc";
pub const DEFAULT_PUBLIC_BASE_URL: &str = "http://127.0.0.1:8080";
const DEV_ADMIN_TOKEN_SECRET: &str = "overlay-alerts-dev-admin-secret";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
        }
    }
}

/// Provider secrets and retry policy for webhook ingestion.
#[derive(Clone)]
pub struct WebhookConfig {
    pub stripe_secret: Option<String>,
    pub paypal_secret: Option<String>,
    pub custom_secret: Option<String>,
    pub timestamp_tolerance: Duration,
    pub processing_timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub sweep_interval: Duration,
    pub batch_size: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            stripe_secret: None,
            paypal_secret: None,
            custom_secret: None,
            timestamp_tolerance: Duration::from_secs(300),
            processing_timeout: Duration::from_millis(2_000),
            max_retries: 3,
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(3_600),
            sweep_interval: Duration::from_secs(15),
            batch_size: 50,
        }
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("stripe_secret", &self.stripe_secret.as_ref().map(|_| "***"))
            .field("paypal_secret", &self.paypal_secret.as_ref().map(|_| "***"))
            .field("custom_secret", &self.custom_secret.as_ref().map(|_| "***"))
            .field("timestamp_tolerance", &self.timestamp_tolerance)
            .field("processing_timeout", &self.processing_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_base", &self.retry_base)
            .field("retry_max", &self.retry_max)
            .field("sweep_interval", &self.sweep_interval)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Per-streamer alert queue tuning.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub queue_capacity: usize,
    pub cooldown: Duration,
    pub max_age: Duration,
    pub grace: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            cooldown: Duration::from_millis(1_000),
            max_age: Duration::from_secs(600),
            grace: Duration::from_millis(2_000),
        }
    }
}

#[derive(Clone)]
pub struct SecurityConfig {
    pub rate_limit_per_minute: u32,
    pub request_signature_tolerance: Duration,
    pub violation_log_max: u32,
    pub nonce_cache_max: usize,
    pub trust_forwarded_for: bool,
    pub admin_token_secret: Vec<u8>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 10,
            request_signature_tolerance: Duration::from_secs(300),
            violation_log_max: 100,
            nonce_cache_max: 1_024,
            trust_forwarded_for: false,
            admin_token_secret: DEV_ADMIN_TOKEN_SECRET.as_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field(
                "request_signature_tolerance",
                &self.request_signature_tolerance,
            )
            .field("violation_log_max", &self.violation_log_max)
            .field("nonce_cache_max", &self.nonce_cache_max)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("admin_token_secret", &"***")
            .finish()
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub public_base_url: String,
    pub database: DatabaseConfig,
    pub webhooks: WebhookConfig,
    pub alerts: AlertConfig,
    pub security: SecurityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            environment: Environment::Test,
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
            database: DatabaseConfig::default(),
            webhooks: WebhookConfig::default(),
            alerts: AlertConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let public_base_url = optional_var("PUBLIC_BASE_URL")
            .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let database = DatabaseConfig {
            url: optional_var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5)?,
        };

        let webhooks = WebhookConfig {
            stripe_secret: optional_var("STRIPE_WEBHOOK_SECRET"),
            paypal_secret: optional_var("PAYPAL_WEBHOOK_SECRET"),
            custom_secret: optional_var("CUSTOM_WEBHOOK_SECRET"),
            timestamp_tolerance: Duration::from_secs(parse_var(
                "WEBHOOK_TIMESTAMP_TOLERANCE_SECS",
                300,
            )?),
            processing_timeout: Duration::from_millis(parse_var(
                "WEBHOOK_PROCESSING_TIMEOUT_MS",
                2_000,
            )?),
            max_retries: parse_var("WEBHOOK_MAX_RETRIES", 3)?,
            retry_base: Duration::from_secs(parse_var("RETRY_BASE_SECS", 30)?),
            retry_max: Duration::from_secs(parse_var("RETRY_MAX_SECS", 3_600)?),
            sweep_interval: Duration::from_secs(parse_var("RETRY_SWEEP_INTERVAL_SECS", 15)?.max(1)),
            batch_size: parse_var("RETRY_BATCH_SIZE", 50)?,
        };

        let alerts = AlertConfig {
            queue_capacity: parse_var("ALERT_QUEUE_CAPACITY", 100)?,
            cooldown: Duration::from_millis(parse_var("ALERT_COOLDOWN_MS", 1_000)?),
            max_age: Duration::from_secs(parse_var("ALERT_MAX_AGE_SECS", 600)?),
            grace: Duration::from_millis(parse_var("ALERT_GRACE_MS", 2_000)?),
        };

        let admin_token_secret = match optional_var("ADMIN_TOKEN_SECRET") {
            Some(secret) => secret.into_bytes(),
            None if environment.is_production() => {
                return Err(ConfigError::MissingVar("ADMIN_TOKEN_SECRET"))
            }
            None => DEV_ADMIN_TOKEN_SECRET.as_bytes().to_vec(),
        };

        let security = SecurityConfig {
            rate_limit_per_minute: parse_var("RATE_LIMIT_PER_MINUTE", 10)?,
            request_signature_tolerance: Duration::from_secs(parse_var(
                "REQUEST_SIGNATURE_TOLERANCE_SECS",
                300,
            )?),
            violation_log_max: parse_var("VIOLATION_LOG_MAX", 100)?,
            nonce_cache_max: parse_var("NONCE_CACHE_MAX", 1_024)?,
            trust_forwarded_for: parse_bool("TRUST_FORWARDED_FOR", false)?,
            admin_token_secret,
        };

        Ok(Self {
            bind_addr,
            environment,
            public_base_url,
            database,
            webhooks,
            alerts,
            security,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional_var(name) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value }),
        },
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidValue { name: &'static str, value: String },
    MissingVar(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
            Self::MissingVar(name) => write!(f, "{name} must be set in production"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DEFAULT_BIND_ADDR, ENV_GUARD};

    const MANAGED_VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "PUBLIC_BASE_URL",
        "DATABASE_URL",
        "WEBHOOK_MAX_RETRIES",
        "ALERT_COOLDOWN_MS",
        "RATE_LIMIT_PER_MINUTE",
        "TRUST_FORWARDED_FOR",
        "ADMIN_TOKEN_SECRET",
        "STRIPE_WEBHOOK_SECRET",
    ];

    fn clear_env() {
        for name in MANAGED_VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
        assert_eq!(config.webhooks.max_retries, 3);
        assert!(config.webhooks.stripe_secret.is_none());
        assert_eq!(config.alerts.cooldown, Duration::from_millis(1_000));
        assert_eq!(config.security.rate_limit_per_minute, 10);
        assert!(!config.security.trust_forwarded_for);
        assert!(!config.security.admin_token_secret.is_empty());
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn production_requires_admin_secret() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(err, ConfigError::MissingVar("ADMIN_TOKEN_SECRET")));

        env::set_var("ADMIN_TOKEN_SECRET", "prod-secret");
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.security.admin_token_secret, b"prod-secret".to_vec());

        clear_env();
    }

    #[test]
    fn parses_overrides_and_names_bad_variables() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("WEBHOOK_MAX_RETRIES", "5");
        env::set_var("TRUST_FORWARDED_FOR", "true");
        env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_1");
        env::set_var("PUBLIC_BASE_URL", "https://alerts.example/");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.webhooks.max_retries, 5);
        assert!(config.security.trust_forwarded_for);
        assert_eq!(config.webhooks.stripe_secret.as_deref(), Some("whsec_1"));
        assert_eq!(config.public_base_url, "https://alerts.example");

        env::set_var("RATE_LIMIT_PER_MINUTE", "ten");
        let err = AppConfig::from_env().expect_err("bad number");
        assert!(
            matches!(err, ConfigError::InvalidValue { name: "RATE_LIMIT_PER_MINUTE", .. }),
            "{err}"
        );

        clear_env();
    }

    #[test]
    fn debug_output_masks_secrets() {
        let config = AppConfig {
            webhooks: WebhookConfig {
                stripe_secret: Some("whsec_visible".into()),
                ..WebhookConfig::default()
            },
            ..AppConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("whsec_visible"));
        assert!(!rendered.contains("overlay-alerts-dev-admin-secret"));
    }
}
