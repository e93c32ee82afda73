//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::documents::numbers::NumberLocale;
use crate::error::ConfigError;

/// Default tax rate applied to the net amount of every order.
pub const DEFAULT_TAX_RATE: Decimal = dec!(0.19);

/// IMAP connection settings for the monitored mailbox.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
}

impl MailboxConfig {
    /// Build config from environment variables. `INTAKE_IMAP_HOST` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap_host = std::env::var("INTAKE_IMAP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("INTAKE_IMAP_HOST".into()))?;

        let imap_port: u16 = std::env::var("INTAKE_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("INTAKE_IMAP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("INTAKE_IMAP_PASSWORD").unwrap_or_default());
        let folder = std::env::var("INTAKE_IMAP_FOLDER").unwrap_or_else(|_| "INBOX".to_string());

        Ok(Self {
            imap_host,
            imap_port,
            username,
            password,
            folder,
        })
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Sender address the order notifications come from.
    pub sender: String,
    /// Subject substring every order notification carries.
    pub subject_filter: String,
    /// Local database file for the reference store.
    pub db_path: PathBuf,
    /// Root directory of the document archive.
    pub archive_dir: PathBuf,
    /// Tax applied on top of the net amount.
    pub tax_rate: Decimal,
    /// Thousands/decimal separator convention used by the documents.
    pub number_locale: NumberLocale,
    /// Lifetime of a run-scoped lookup cache entry.
    pub cache_ttl: Duration,
    /// Cron expression for `watch` mode.
    pub schedule: Option<String>,
    /// Actor name recorded on audit entries.
    pub actor: String,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            sender: String::new(),
            subject_filter: String::new(),
            db_path: PathBuf::from("./data/order-intake.db"),
            archive_dir: PathBuf::from("./data/archive"),
            tax_rate: DEFAULT_TAX_RATE,
            number_locale: NumberLocale::default(),
            cache_ttl: Duration::from_secs(300),
            schedule: None,
            actor: "order-intake".to_string(),
        }
    }
}

impl IntakeConfig {
    /// Cron expression for `watch` mode; required there.
    pub fn watch_schedule(&self) -> Result<&str, ConfigError> {
        self.schedule
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("INTAKE_SCHEDULE".into()))
    }

    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let tax_rate = match std::env::var("INTAKE_TAX_RATE") {
            Ok(raw) => Decimal::from_str(raw.trim()).map_err(|e| ConfigError::InvalidValue {
                key: "INTAKE_TAX_RATE".into(),
                message: e.to_string(),
            })?,
            Err(_) => defaults.tax_rate,
        };
        if tax_rate.is_sign_negative() {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_TAX_RATE".into(),
                message: "must not be negative".into(),
            });
        }

        let number_locale = match std::env::var("INTAKE_NUMBER_LOCALE") {
            Ok(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "INTAKE_NUMBER_LOCALE".into(),
                message,
            })?,
            Err(_) => defaults.number_locale,
        };

        let cache_ttl = std::env::var("INTAKE_CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_ttl);

        Ok(Self {
            sender: std::env::var("INTAKE_SENDER").unwrap_or_default(),
            subject_filter: std::env::var("INTAKE_SUBJECT_FILTER").unwrap_or_default(),
            db_path: std::env::var("INTAKE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            archive_dir: std::env::var("INTAKE_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            tax_rate,
            number_locale,
            cache_ttl,
            schedule: std::env::var("INTAKE_SCHEDULE").ok().filter(|s| !s.trim().is_empty()),
            actor: std::env::var("INTAKE_ACTOR").unwrap_or(defaults.actor),
        })
    }
}
