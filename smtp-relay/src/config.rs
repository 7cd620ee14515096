//! Layered configuration: compiled-in defaults, overridden by an optional
//! TOML file, overridden by environment variables (`SMTP__*`, `TARGET_SMTP__*`,
//! `QUEUE__*`, `RATE_LIMIT__*`, `LOG__*`).

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub local_host: String,
    pub local_port: u16,
    pub auth_required: bool,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub require_starttls: bool,
    pub max_message_size: usize,
    pub tls_cert_file: String,
    pub tls_key_file: String,
}

impl Default for SmtpConfig {
    fn default() -> SmtpConfig {
        SmtpConfig {
            local_host: "0.0.0.0".to_owned(),
            local_port: 2525,
            auth_required: false,
            auth_username: None,
            auth_password: None,
            require_starttls: false,
            max_message_size: 50 * 1024 * 1024,
            tls_cert_file: "smtp-relay-cert.pem".to_owned(),
            tls_key_file: "smtp-relay-key.pem".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TargetSmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl Default for TargetSmtpConfig {
    fn default() -> TargetSmtpConfig {
        TargetSmtpConfig {
            host: "localhost".to_owned(),
            port: 587,
            username: None,
            password: None,
            use_tls: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    Kvstore,
    Sql,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QueueConfigSection {
    pub backend: QueueBackend,
    pub kvstore_url: String,
    pub sql_path: String,
}

impl Default for QueueConfigSection {
    fn default() -> QueueConfigSection {
        QueueConfigSection {
            backend: QueueBackend::Sql,
            kvstore_url: "redis://127.0.0.1/".to_owned(),
            sql_path: "smtp-relay-queue.sqlite3".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    TokenBucket,
    FixedWindow,
    LeakyBucket,
    Composite,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub strategy: RateLimitStrategy,
    pub capacity: f64,
    pub refill_rate: f64,
    pub window_seconds: u64,
    pub limit: u32,
    pub bucket_capacity: f64,
    pub leak_rate: f64,
    pub enable_token_bucket: bool,
    pub enable_fixed_window: bool,
    pub enable_leaky_bucket: bool,
    pub max_retries: u32,
    pub retry_delay_base_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> RateLimitConfig {
        RateLimitConfig {
            strategy: RateLimitStrategy::TokenBucket,
            capacity: 10.0,
            refill_rate: 1.0,
            window_seconds: 60,
            limit: 60,
            bucket_capacity: 10.0,
            leak_rate: 1.0,
            enable_token_bucket: true,
            enable_fixed_window: false,
            enable_leaky_bucket: false,
            max_retries: 5,
            retry_delay_base_seconds: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: "info".to_owned(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub smtp: SmtpConfig,
    pub target_smtp: TargetSmtpConfig,
    pub queue: QueueConfigSection,
    pub rate_limit: RateLimitConfig,
    pub log: LogConfig,
}

impl Settings {
    /// Loads defaults, then an optional TOML file at `path` (if it exists),
    /// then environment variables (`SMTP__LOCAL_PORT`, `RATE_LIMIT__STRATEGY`,
    /// etc; double underscore separates section from field).
    pub fn load(path: Option<&str>) -> Result<Settings, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::default()
                .separator("__")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }
}
