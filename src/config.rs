use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use log::warn;
use serde_derive::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no people configured, add at least one entry to [people]")]
    NoPeople,
    #[error("person names must not be empty")]
    EmptyName,
    #[error("no address configured for {0}")]
    EmptyAddress(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    /// Person name -> hostname or IP address. Names are case-sensitive.
    #[serde(default)]
    pub people: BTreeMap<String, String>,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    pub pushbullet: Option<PushbulletConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PresenceConfig {
    pub poll_interval_seconds: Option<u64>,
    pub probe_timeout_seconds: Option<u64>,
    pub debounce_seconds: Option<u64>,
    pub staleness_seconds: Option<u64>,
    pub concurrent_probes: Option<bool>,
    pub state_file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NotifyConfig {
    #[serde(default = "default_true")]
    pub arrivals: bool,
    #[serde(default)]
    pub departures: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            arrivals: true,
            departures: false,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PushbulletConfig {
    pub api_key: Option<String>,
    pub api_key_file: Option<PathBuf>,
}

impl PushbulletConfig {
    /// Returns the API key if one is configured and readable. A missing key
    /// disables the channel, it is never a startup error.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }

        let path = self.api_key_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let key = contents.trim();
                if key.is_empty() {
                    warn!("Pushbullet key file {} is empty", path.display());
                    None
                } else {
                    Some(key.to_string())
                }
            }
            Err(err) => {
                warn!(
                    "Could not read Pushbullet key file {}: {}",
                    path.display(),
                    err
                );
                None
            }
        }
    }
}

/// Timing knobs for the poll loop and the presence state machine, with
/// defaults applied and validated.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub debounce: TimeDelta,
    pub staleness: TimeDelta,
    pub concurrent_probes: bool,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::de::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.people.is_empty() {
            return Err(ConfigError::NoPeople);
        }
        for (name, address) in &self.people {
            if name.is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if address.trim().is_empty() {
                return Err(ConfigError::EmptyAddress(name.clone()));
            }
        }
        self.poll_settings().map(|_| ())
    }

    pub fn poll_settings(&self) -> Result<PollSettings, ConfigError> {
        let p = &self.presence;
        let poll_interval = non_zero("poll_interval_seconds", p.poll_interval_seconds.unwrap_or(30))?;
        let probe_timeout = non_zero("probe_timeout_seconds", p.probe_timeout_seconds.unwrap_or(2))?;
        let debounce = non_zero("debounce_seconds", p.debounce_seconds.unwrap_or(60))?;
        let staleness = non_zero("staleness_seconds", p.staleness_seconds.unwrap_or(60 * 60))?;

        if staleness <= poll_interval {
            return Err(ConfigError::InvalidValue {
                field: "staleness_seconds",
                reason: format!(
                    "must be greater than poll_interval_seconds ({poll_interval})"
                ),
            });
        }

        Ok(PollSettings {
            poll_interval: Duration::from_secs(poll_interval),
            probe_timeout: Duration::from_secs(probe_timeout),
            debounce: to_delta("debounce_seconds", debounce)?,
            staleness: to_delta("staleness_seconds", staleness)?,
            concurrent_probes: p.concurrent_probes.unwrap_or(true),
        })
    }
}

fn non_zero(field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn to_delta(field: &'static str, seconds: u64) -> Result<TimeDelta, ConfigError> {
    i64::try_from(seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| ConfigError::InvalidValue {
            field,
            reason: format!("{seconds} seconds is out of range"),
        })
}
