use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 15 * 60; // processing longer than this is unconfirmed
pub const DEFAULT_RETRY_BASE_SECS: u64 = 30;
pub const DEFAULT_RETRY_MAX_SECS: u64 = 60 * 60;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Absent means the daemon can manage the queue but not deliver.
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Poll loop tunables. None of these affect correctness, only latency and load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Maximum due jobs read per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Size of the send worker pool.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Requeue or fail jobs stuck in `processing` when the dispatcher starts.
    #[serde(default = "bool_true")]
    pub reconcile_on_start: bool,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            reconcile_on_start: true,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
        }
    }
}

/// Exponential backoff applied to transient send failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_base")]
    pub base_delay_secs: u64,
    #[serde(default = "default_retry_max")]
    pub max_delay_secs: u64,
    /// Used by the CLI when `--max-retries` is not given.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_secs: DEFAULT_RETRY_BASE_SECS,
            max_delay_secs: DEFAULT_RETRY_MAX_SECS,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Envelope and header sender, e.g. `"Reports <reports@example.com>"`.
    pub from: String,
    #[serde(default)]
    pub tls: SmtpTls,
    #[serde(default = "default_send_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SmtpTls {
    /// Implicit TLS, usually port 465.
    Wrapper,
    /// Plain connection upgraded with STARTTLS, usually port 587.
    #[default]
    Starttls,
    /// No encryption, for local relays and test servers only.
    None,
}

fn bool_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_send_timeout() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}
fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}
fn default_stale_after() -> u64 {
    DEFAULT_STALE_AFTER_SECS
}
fn default_retry_base() -> u64 {
    DEFAULT_RETRY_BASE_SECS
}
fn default_retry_max() -> u64 {
    DEFAULT_RETRY_MAX_SECS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_smtp_port() -> u16 {
    DEFAULT_SMTP_PORT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.db", home)
}

impl HeraldConfig {
    /// Load config from a TOML file with HERALD_* env var overrides.
    ///
    /// Nested keys use a double underscore so snake_case field names survive:
    /// `HERALD_DISPATCHER__POLL_INTERVAL_SECS=2`, `HERALD_SMTP__HOST=mail.local`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HeraldConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("__"))
            .extract()
            .map_err(|e| crate::error::HeraldError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let config = HeraldConfig::load(Some("does-not-exist.toml"))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.dispatcher.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
            assert_eq!(config.retry.default_max_retries, DEFAULT_MAX_RETRIES);
            assert!(config.dispatcher.reconcile_on_start);
            assert!(config.smtp.is_none());
            Ok(())
        });
    }

    #[test]
    fn toml_file_and_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "herald.toml",
                r#"
                [database]
                path = "/tmp/queue.db"

                [dispatcher]
                poll_interval_secs = 10
                max_concurrent = 8

                [smtp]
                host = "smtp.example.com"
                port = 465
                from = "noreply@example.com"
                tls = "wrapper"
                "#,
            )?;
            jail.set_env("HERALD_DISPATCHER__POLL_INTERVAL_SECS", "2");
            jail.set_env("HERALD_RETRY__BASE_DELAY_SECS", "1");

            let config = HeraldConfig::load(Some("herald.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.database.path, "/tmp/queue.db");
            assert_eq!(config.dispatcher.poll_interval_secs, 2);
            assert_eq!(config.dispatcher.max_concurrent, 8);
            assert_eq!(config.retry.base_delay_secs, 1);

            let smtp = config.smtp.expect("smtp section");
            assert_eq!(smtp.port, 465);
            assert_eq!(smtp.tls, SmtpTls::Wrapper);
            assert_eq!(smtp.timeout_secs, DEFAULT_SEND_TIMEOUT_SECS);
            Ok(())
        });
    }

    #[test]
    fn smtp_tls_defaults_to_starttls() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "herald.toml",
                r#"
                [smtp]
                host = "localhost"
                from = "a@b.example"
                "#,
            )?;
            let config = HeraldConfig::load(Some("herald.toml")).map_err(|e| e.to_string())?;
            let smtp = config.smtp.expect("smtp section");
            assert_eq!(smtp.tls, SmtpTls::Starttls);
            assert_eq!(smtp.port, DEFAULT_SMTP_PORT);
            Ok(())
        });
    }
}
