use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use tourdesk_core::config::{
    parse_in_range, required_trimmed, value_or_default, ConfigError, EngineConfig, SheetsConfig,
};

/// Secrets shorter than this are rejected at startup
const MIN_SECRET_LEN: usize = 16;

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Shared bearer secret presented by the scheduler
    pub cron_secret: String,
    /// HS256 key that signs administrator session tokens
    pub session_secret: String,
    pub auth_clock_skew: Duration,
    pub engine: EngineConfig,
    pub sheets: SheetsConfig,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("cron_secret", &"[REDACTED]")
            .field("session_secret", &"[REDACTED]")
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("engine", &self.engine)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "TOURDESK_API_BIND_ADDR", "127.0.0.1:8080");

        let cron_secret = required_trimmed(&lookup, "CRON_SECRET")?;
        if cron_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "CRON_SECRET must be at least {MIN_SECRET_LEN} characters"
            )));
        }
        let session_secret = required_trimmed(&lookup, "SESSION_JWT_SECRET")?;
        if session_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "SESSION_JWT_SECRET must be at least {MIN_SECRET_LEN} characters"
            )));
        }

        let auth_clock_skew_secs: u64 =
            parse_in_range(&lookup, "AUTH_CLOCK_SKEW_SECS", "60", 0..=300)?;

        let engine = EngineConfig::from_lookup(&lookup)?;
        // The service exists to write back, so it refuses to start without a sheet
        let sheets = engine
            .sheets
            .clone()
            .ok_or(ConfigError::MissingVar("GOOGLE_SHEET_ID"))?;

        Ok(Self {
            bind_addr,
            cron_secret,
            session_secret,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            engine,
            sheets,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        let mut map = HashMap::new();
        map.insert("CRON_SECRET", "cron-secret-value-123");
        map.insert("SESSION_JWT_SECRET", "session-secret-value-456");
        map.insert("GOOGLE_SHEET_ID", "sheet-1");
        map.insert("GOOGLE_SERVICE_ACCOUNT_EMAIL", "bot@example.iam.gserviceaccount.com");
        map.insert("GOOGLE_PRIVATE_KEY", "sensitive-private-key");
        map
    }

    fn load(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_cron_secret() {
        let mut map = base_env();
        map.remove("CRON_SECRET");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("CRON_SECRET"));
    }

    #[test]
    fn config_requires_spreadsheet_credentials() {
        let mut map = base_env();
        map.remove("GOOGLE_SHEET_ID");
        map.remove("GOOGLE_SERVICE_ACCOUNT_EMAIL");
        map.remove("GOOGLE_PRIVATE_KEY");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("GOOGLE_SHEET_ID"));
    }

    #[test]
    fn config_rejects_short_secrets() {
        let mut map = base_env();
        map.insert("SESSION_JWT_SECRET", "short");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("SESSION_JWT_SECRET"));
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.sheets.spreadsheet_id, "sheet-1");

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("cron-secret-value-123"));
        assert!(!debug_output.contains("session-secret-value-456"));
        assert!(!debug_output.contains("sensitive-private-key"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
