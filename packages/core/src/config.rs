use std::env;
use std::fmt;
use std::time::Duration;

use crate::cli::Cli;
use crate::db::SchemaLevel;
use crate::services::partner::PartnerSettings;
use crate::sync::SyncConfig;

#[derive(Clone)]
pub struct Config {
    pub partner_api_url: String,
    pub partner_username: String,
    pub partner_password: String,
    pub partner_account_id: String,
    pub partner_timeout_seconds: u64,
    pub database_url: String,
    pub schema_level: SchemaLevel,
    pub sync_interval_seconds: u64,
    pub retention_interval_seconds: u64,
    pub sync_page_size: u32,
    pub sync_max_pages: u32,
    pub sync_max_errors: usize,
    pub alert_retention_days: i64,
    pub api_port: u16,
}

// Keeps the partner password out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("partner_api_url", &self.partner_api_url)
            .field("partner_username", &self.partner_username)
            .field("partner_password", &"***")
            .field("partner_account_id", &self.partner_account_id)
            .field("partner_timeout_seconds", &self.partner_timeout_seconds)
            .field("database_url", &self.database_url)
            .field("schema_level", &self.schema_level)
            .field("sync_interval_seconds", &self.sync_interval_seconds)
            .field("retention_interval_seconds", &self.retention_interval_seconds)
            .field("sync_page_size", &self.sync_page_size)
            .field("sync_max_pages", &self.sync_max_pages)
            .field("sync_max_errors", &self.sync_max_errors)
            .field("alert_retention_days", &self.alert_retention_days)
            .field("api_port", &self.api_port)
            .finish()
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, String> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| format!("{} is required", key))
}

fn optional<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, String> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a valid value, got '{}'", key, raw)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let partner_api_url = required(&lookup, "PARTNER_API_URL")?;
        let partner_username = required(&lookup, "PARTNER_USERNAME")?;
        let partner_password = required(&lookup, "PARTNER_PASSWORD")?;
        let partner_account_id = required(&lookup, "PARTNER_ACCOUNT_ID")?;

        let schema_level = match lookup("SCHEMA_LEVEL") {
            Some(raw) => raw.trim().parse::<SchemaLevel>()?,
            None => SchemaLevel::Extended,
        };

        let config = Self {
            partner_api_url,
            partner_username,
            partner_password,
            partner_account_id,
            partner_timeout_seconds: optional(&lookup, "PARTNER_TIMEOUT_SECONDS", 15)?,
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://sleep_exams.db".to_string()),
            schema_level,
            sync_interval_seconds: optional(&lookup, "SYNC_INTERVAL_SECONDS", 900)?,
            retention_interval_seconds: optional(&lookup, "RETENTION_INTERVAL_SECONDS", 3600)?,
            sync_page_size: optional(&lookup, "SYNC_PAGE_SIZE", 50)?,
            sync_max_pages: optional(&lookup, "SYNC_MAX_PAGES", 40)?,
            sync_max_errors: optional(&lookup, "SYNC_MAX_ERRORS", 25)?,
            alert_retention_days: optional(&lookup, "ALERT_RETENTION_DAYS", 3)?,
            api_port: optional(&lookup, "API_PORT", 8080)?,
        };

        if config.sync_page_size == 0 {
            return Err("SYNC_PAGE_SIZE must be greater than zero".to_string());
        }
        if config.alert_retention_days < 0 {
            return Err("ALERT_RETENTION_DAYS must not be negative".to_string());
        }

        Ok(config)
    }

    /// Apply command-line overrides on top of the environment.
    pub fn apply_cli(&mut self, cli: &Cli) -> Result<(), String> {
        if let Some(url) = &cli.partner_url {
            self.partner_api_url = url.clone();
        }
        if let Some(interval) = cli.sync_interval {
            self.sync_interval_seconds = interval;
        }
        if let Some(port) = cli.port {
            self.api_port = port;
        }
        if let Some(level) = &cli.schema_level {
            self.schema_level = level.parse()?;
        }
        Ok(())
    }

    pub fn partner_settings(&self) -> PartnerSettings {
        PartnerSettings {
            base_url: self.partner_api_url.clone(),
            username: self.partner_username.clone(),
            password: self.partner_password.clone(),
            account_id: self.partner_account_id.clone(),
            timeout: Duration::from_secs(self.partner_timeout_seconds),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            page_size: self.sync_page_size,
            max_pages: self.sync_max_pages,
            max_errors: self.sync_max_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("PARTNER_API_URL", "https://partner.test"),
        ("PARTNER_USERNAME", "clinic"),
        ("PARTNER_PASSWORD", "s3cret"),
        ("PARTNER_ACCOUNT_ID", "acc-1"),
    ];

    #[test]
    fn defaults_apply_when_optional_vars_missing() {
        let config = Config::from_lookup(lookup_from(REQUIRED)).unwrap();

        assert_eq!(config.database_url, "sqlite://sleep_exams.db");
        assert_eq!(config.sync_interval_seconds, 900);
        assert_eq!(config.retention_interval_seconds, 3600);
        assert_eq!(config.sync_config(), SyncConfig { page_size: 50, max_pages: 40, max_errors: 25 });
        assert_eq!(config.alert_retention_days, 3);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.schema_level, SchemaLevel::Extended);
        assert_eq!(config.partner_settings().timeout, Duration::from_secs(15));
    }

    #[test]
    fn missing_required_var_is_reported_by_name() {
        let err = Config::from_lookup(lookup_from(&REQUIRED[..3])).unwrap_err();
        assert_eq!(err, "PARTNER_ACCOUNT_ID is required");
    }

    #[test]
    fn invalid_number_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SYNC_PAGE_SIZE", "lots"));
        assert!(Config::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SYNC_PAGE_SIZE", "0"));
        assert!(Config::from_lookup(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn debug_output_hides_password() {
        let config = Config::from_lookup(lookup_from(REQUIRED)).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn cli_overrides_environment() {
        let mut config = Config::from_lookup(lookup_from(REQUIRED)).unwrap();
        let cli = Cli {
            partner_url: Some("http://localhost:9000".into()),
            sync_interval: Some(60),
            port: None,
            schema_level: Some("basic".into()),
            run_once: false,
        };

        config.apply_cli(&cli).unwrap();

        assert_eq!(config.partner_api_url, "http://localhost:9000");
        assert_eq!(config.sync_interval_seconds, 60);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.schema_level, SchemaLevel::Basic);
    }
}
