//! Start-up configuration.
//!
//! Precedence: built-in defaults < TOML file (`VIGIL_CONFIG`, default `config/vigil.toml`)
//! < environment (`VIGIL__SECTION__KEY`, e.g. `VIGIL__ACTIVITY_CHECK__MAX_RETRIES=5`).
//! String values may reference environment variables as `${NAME}`; unset names are left
//! as written. A config that fails [`VigilConfig::validate`] must stop the process.
//!
//! ```toml
//! [app]
//! token = "${BOT_TOKEN}"
//! storage_path = "./data"
//! health_port = 8080
//!
//! [activity_check]
//! schedule = "0 */6 * * *"
//! response_timeout = 300
//! max_retries = 3
//! retry_interval = 600
//!
//! [activity_check.channels]
//! alerts = "-1001234567890"
//! warnings = "-1001234567891"
//!
//! [activity_check.rewards]
//! alive_score = 1
//! ```

use crate::error::{Result, VigilError};
use crate::model::ChatId;
use crate::notifier::AlertChannels;
use crate::scheduler::parse_schedule;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/vigil";

static ENV_REF: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").ok());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VigilConfig {
    pub app: AppConfig,
    pub activity_check: ActivityCheckConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Chat transport credential. Only the daemon needs it.
    #[serde(default)]
    pub token: String,
    /// Directory holding the sled database.
    pub storage_path: String,
    /// Port of the `/health` endpoint.
    pub health_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityCheckConfig {
    /// Cron expression for the recurring sweep (5 or 6 fields, UTC).
    pub schedule: String,
    /// Seconds a user has to answer a sweep challenge.
    pub response_timeout: u64,
    /// Timeouts tolerated before the user is marked inactive.
    pub max_retries: u32,
    /// Seconds a user has to answer a retry challenge.
    pub retry_interval: u64,
    pub channels: ChannelsConfig,
    pub rewards: RewardsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Chat id for terminal and celebratory alerts.
    #[serde(default)]
    pub alerts: String,
    /// Chat id for retry warnings.
    #[serde(default)]
    pub warnings: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    /// Points credited per confirmed response.
    pub alive_score: i64,
}

impl VigilConfig {
    /// Loads from `VIGIL_CONFIG` (or `config/vigil.toml`) plus environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Loads from an explicit file path (extension optional; a missing file means defaults).
    pub fn load_from(path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("app.token", "")?
            .set_default("app.storage_path", "./data")?
            .set_default("app.health_port", 8080_i64)?
            .set_default("activity_check.schedule", "0 0 */6 * * *")?
            .set_default("activity_check.response_timeout", 300_i64)?
            .set_default("activity_check.max_retries", 3_i64)?
            .set_default("activity_check.retry_interval", 600_i64)?
            .set_default("activity_check.channels.alerts", "")?
            .set_default("activity_check.channels.warnings", "")?
            .set_default("activity_check.rewards.alive_score", 1_i64)?;

        let file = if Path::new(path).extension().is_some() {
            config::File::from(Path::new(path)).required(false)
        } else {
            config::File::with_name(path).required(false)
        };

        let built = builder
            .add_source(file)
            .add_source(config::Environment::with_prefix("VIGIL").separator("__"))
            .build()?;

        let mut cfg: VigilConfig = built.try_deserialize()?;
        cfg.substitute_env_refs();
        Ok(cfg)
    }

    /// Resolves `${NAME}` references in every string field.
    pub fn substitute_env_refs(&mut self) {
        for field in [
            &mut self.app.token,
            &mut self.app.storage_path,
            &mut self.activity_check.schedule,
            &mut self.activity_check.channels.alerts,
            &mut self.activity_check.channels.warnings,
        ] {
            *field = substitute_env(field);
        }
    }

    /// Fatal start-up checks for the activity-check core.
    pub fn validate(&self) -> Result<()> {
        self.activity_check.validate()
    }
}

impl ActivityCheckConfig {
    pub fn validate(&self) -> Result<()> {
        parse_schedule(&self.schedule)?;
        if self.max_retries < 1 {
            return Err(VigilError::InvalidConfig(
                "activity_check.max_retries must be at least 1".into(),
            ));
        }
        if self.response_timeout == 0 {
            return Err(VigilError::InvalidConfig(
                "activity_check.response_timeout must be positive".into(),
            ));
        }
        if self.retry_interval == 0 {
            return Err(VigilError::InvalidConfig(
                "activity_check.retry_interval must be positive".into(),
            ));
        }
        self.alert_channels()?;
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    /// Parsed alert/warning destinations.
    pub fn alert_channels(&self) -> Result<AlertChannels> {
        Ok(AlertChannels {
            alerts: parse_chat_id("activity_check.channels.alerts", &self.channels.alerts)?,
            warnings: parse_chat_id("activity_check.channels.warnings", &self.channels.warnings)?,
        })
    }
}

fn parse_chat_id(key: &str, raw: &str) -> Result<ChatId> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(VigilError::InvalidConfig(format!("{key} is not set")));
    }
    raw.parse::<i64>()
        .map(ChatId)
        .map_err(|_| VigilError::InvalidConfig(format!("{key} is not a numeric chat id: {raw}")))
}

fn substitute_env(value: &str) -> String {
    let Some(env_ref) = ENV_REF.as_ref() else {
        return value.to_string();
    };
    env_ref
        .replace_all(value, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1])
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    #[test]
    fn file_values_override_defaults() {
        let (_dir, path) = write_config(
            r#"
[activity_check]
schedule = "*/10 * * * *"
response_timeout = 60
max_retries = 2
retry_interval = 30

[activity_check.channels]
alerts = "-100"
warnings = "-200"
"#,
        );
        let cfg = VigilConfig::load_from(&path).unwrap();
        assert_eq!(cfg.activity_check.max_retries, 2);
        assert_eq!(cfg.activity_check.response_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.activity_check.rewards.alive_score, 1);
        assert_eq!(cfg.app.health_port, 8080);
        cfg.validate().unwrap();

        let channels = cfg.activity_check.alert_channels().unwrap();
        assert_eq!(channels.alerts, ChatId(-100));
        assert_eq!(channels.warnings, ChatId(-200));
    }

    #[test]
    fn missing_channels_are_fatal() {
        let (_dir, path) = write_config("[app]\nstorage_path = \"./tmp\"\n");
        let cfg = VigilConfig::load_from(&path).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, VigilError::InvalidConfig(msg) if msg.contains("alerts")));
    }

    #[test]
    fn bad_schedule_and_zero_retries_are_fatal() {
        let (_dir, path) = write_config(
            r#"
[activity_check]
schedule = "whenever"
[activity_check.channels]
alerts = "1"
warnings = "2"
"#,
        );
        let mut cfg = VigilConfig::load_from(&path).unwrap();
        assert!(matches!(cfg.validate(), Err(VigilError::InvalidSchedule { .. })));

        cfg.activity_check.schedule = "0 * * * *".into();
        cfg.activity_check.max_retries = 0;
        assert!(matches!(cfg.validate(), Err(VigilError::InvalidConfig(_))));
    }

    #[test]
    fn prefixed_env_vars_override_the_file() {
        let (_dir, path) = write_config(
            r#"
[activity_check]
retry_interval = 30
[activity_check.channels]
alerts = "-100"
warnings = "-200"
"#,
        );
        std::env::set_var("VIGIL__ACTIVITY_CHECK__RETRY_INTERVAL", "45");
        let loaded = VigilConfig::load_from(&path);
        std::env::remove_var("VIGIL__ACTIVITY_CHECK__RETRY_INTERVAL");

        let cfg = loaded.unwrap();
        assert_eq!(cfg.activity_check.retry_interval(), Duration::from_secs(45));
        assert_eq!(cfg.activity_check.channels.alerts, "-100");
        cfg.validate().unwrap();
    }

    #[test]
    fn env_references_are_substituted() {
        std::env::set_var("VIGIL_TEST_ALERT_CHAT", "-4242");
        assert_eq!(substitute_env("${VIGIL_TEST_ALERT_CHAT}"), "-4242");
        assert_eq!(
            substitute_env("${VIGIL_TEST_SURELY_UNSET_VAR}"),
            "${VIGIL_TEST_SURELY_UNSET_VAR}"
        );
        assert_eq!(substitute_env("plain"), "plain");
    }
}
