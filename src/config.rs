//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::channels::email::{MailboxConfig, parse_term_list};
use crate::error::ConfigError;
use crate::pipeline::classifier::{ClassifierRules, DEFAULT_INVOICE_KEYWORDS};
use crate::pipeline::fetch::FetchConfig;
use crate::pipeline::processor::DEFAULT_CONCURRENCY;
use crate::pipeline::runner::DEFAULT_INTERVAL_MINUTES;

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` when `EMAIL_HOST` is unset (mailbox disabled).
    pub mailbox: Option<MailboxConfig>,
    pub fetch: FetchConfig,
    /// References resolved at once within a message.
    pub concurrency: usize,
    /// Anchor-text keywords that mark a link as an invoice page.
    pub invoice_keywords: Vec<String>,
    /// Spool directory for resolved documents.
    pub spool_dir: PathBuf,
    pub job_interval: Duration,
    pub api_host: String,
    pub api_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mailbox: None,
            fetch: FetchConfig::default(),
            concurrency: DEFAULT_CONCURRENCY,
            invoice_keywords: DEFAULT_INVOICE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            spool_dir: PathBuf::from("./data/temp_pdfs"),
            job_interval: Duration::from_secs(DEFAULT_INTERVAL_MINUTES * 60),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
        }
    }
}

impl AppConfig {
    /// Build from environment variables, using defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let concurrency = parse_var("RESOLVE_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RESOLVE_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }

        let interval_minutes = parse_var("JOB_INTERVAL_MINUTES", DEFAULT_INTERVAL_MINUTES)?;
        if interval_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JOB_INTERVAL_MINUTES".into(),
                message: "must be at least 1".into(),
            });
        }

        let invoice_keywords = match std::env::var("INVOICE_KEYWORDS") {
            Ok(raw) => parse_term_list(&raw),
            Err(_) => defaults.invoice_keywords,
        };

        Ok(Self {
            mailbox: MailboxConfig::from_env(),
            fetch: FetchConfig::from_env()?,
            concurrency,
            invoice_keywords,
            spool_dir: std::env::var("TEMP_PDF_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.spool_dir),
            job_interval: Duration::from_secs(interval_minutes * 60),
            api_host: std::env::var("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_var("API_PORT", defaults.api_port)?,
        })
    }

    /// Default portal and extension rules with the configured keywords.
    pub fn classifier_rules(&self) -> ClassifierRules {
        ClassifierRules::default_rules().with_invoice_keywords(&self.invoice_keywords)
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
