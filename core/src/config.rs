//! Runtime configuration and the durable key-value store it is persisted in.
//!
//! A [`RuntimeConfig`] is immutable per transaction: the supervisor reads one
//! bundle under its transition lock, and changes only flow back through
//! [`crate::supervisor::Supervisor::apply_configuration`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::SupervisorError;

/// Lowest port an unprivileged process may bind.
pub const MIN_UNPRIVILEGED_PORT: u16 = 1024;

pub const DEFAULT_PORT: u16 = 9321;

const KEY_PORT: &str = "port";
const KEY_TOKEN: &str = "token";
const KEY_CHANNEL: &str = "channel";
const KEY_STRATEGY: &str = "strategy";
const KEY_LAST_STATE: &str = "last_state";
const KEY_LAST_STARTED_AT: &str = "last_started_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Unprivileged,
    Privileged,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Unprivileged => "unprivileged",
            StrategyKind::Privileged => "privileged",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "unprivileged" => Some(StrategyKind::Unprivileged),
            "privileged" => Some(StrategyKind::Privileged),
            _ => None,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseChannel {
    #[default]
    Stable,
    Beta,
}

impl ReleaseChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseChannel::Stable => "stable",
            ReleaseChannel::Beta => "beta",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "stable" => Some(ReleaseChannel::Stable),
            "beta" => Some(ReleaseChannel::Beta),
            _ => None,
        }
    }
}

impl fmt::Display for ReleaseChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable-per-transaction bundle of the fields a start needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub port: u16,
    /// Access token; may be empty.
    pub token: String,
    pub channel: ReleaseChannel,
    pub strategy: StrategyKind,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            token: String::new(),
            channel: ReleaseChannel::Stable,
            strategy: StrategyKind::Unprivileged,
        }
    }
}

impl RuntimeConfig {
    /// Synchronous validation; rejected configurations cause no state change.
    pub fn validate(&self) -> Result<()> {
        validate_port(self.port, self.strategy)
    }
}

pub fn validate_port(port: u16, strategy: StrategyKind) -> Result<()> {
    if port == 0 {
        return Err(SupervisorError::InvalidPort { port: 0 });
    }
    if strategy == StrategyKind::Unprivileged && port < MIN_UNPRIVILEGED_PORT {
        return Err(SupervisorError::PrivilegedPort { port, strategy });
    }
    Ok(())
}

/// Durable key-value persistence for runtime configuration and the
/// last-known lifecycle fields. Writes must be durable before `set` returns.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn load_runtime_config(&self) -> RuntimeConfig {
        let defaults = RuntimeConfig::default();
        let port = self
            .get(KEY_PORT)
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(defaults.port);
        let token = self.get(KEY_TOKEN).unwrap_or_default();
        let channel = self
            .get(KEY_CHANNEL)
            .and_then(|v| ReleaseChannel::parse(&v))
            .unwrap_or(defaults.channel);
        let strategy = self
            .get(KEY_STRATEGY)
            .and_then(|v| StrategyKind::parse(&v))
            .unwrap_or(defaults.strategy);
        RuntimeConfig {
            port,
            token,
            channel,
            strategy,
        }
    }

    fn save_runtime_config(&self, config: &RuntimeConfig) -> Result<()> {
        self.set(KEY_PORT, &config.port.to_string())?;
        self.set(KEY_TOKEN, &config.token)?;
        self.set(KEY_CHANNEL, config.channel.as_str())?;
        self.set(KEY_STRATEGY, config.strategy.as_str())?;
        Ok(())
    }

    fn save_last_state(&self, state: &str, started_at: Option<&str>) -> Result<()> {
        self.set(KEY_LAST_STATE, state)?;
        self.set(KEY_LAST_STARTED_AT, started_at.unwrap_or(""))?;
        Ok(())
    }

    fn last_started_at(&self) -> Option<String> {
        self.get(KEY_LAST_STARTED_AT).filter(|v| !v.is_empty())
    }
}

/// File-backed store. The whole map is rewritten atomically (tempfile in the
/// same directory, then rename) so a crash mid-write never loses the file.
pub struct TomlConfigStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl TomlConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<BTreeMap<String, String>>(&text)
                .map_err(|err| SupervisorError::ConfigStore(err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(SupervisorError::ReadFile { path, error: err }),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let text = toml::to_string(values)
            .map_err(|err| SupervisorError::ConfigStore(err.to_string()))?;
        let dir = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let tmp = self.path.with_extension("toml.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for TomlConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().ok()?;
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| SupervisorError::ConfigStore("store lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        self.persist(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn low_port_is_rejected_for_unprivileged_strategy() {
        let err = validate_port(443, StrategyKind::Unprivileged)
            .expect_err("low port must be rejected");
        assert!(matches!(
            err,
            SupervisorError::PrivilegedPort { port: 443, .. }
        ));
    }

    #[test]
    fn low_port_is_allowed_for_privileged_strategy() {
        validate_port(443, StrategyKind::Privileged).expect("privileged strategy may bind 443");
        validate_port(9321, StrategyKind::Unprivileged).expect("high port is always fine");
    }

    #[test]
    fn port_zero_is_always_invalid() {
        let err = validate_port(0, StrategyKind::Privileged).expect_err("port 0 is invalid");
        assert!(matches!(err, SupervisorError::InvalidPort { port: 0 }));
    }

    #[test]
    fn store_roundtrips_runtime_config() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("berth.toml");
        let store = TomlConfigStore::open(&path).expect("open store");

        let config = RuntimeConfig {
            port: 8080,
            token: "abc".to_string(),
            channel: ReleaseChannel::Beta,
            strategy: StrategyKind::Privileged,
        };
        store.save_runtime_config(&config).expect("save");

        let reopened = TomlConfigStore::open(&path).expect("reopen store");
        assert_eq!(reopened.load_runtime_config(), config);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let store = TomlConfigStore::open(dir.path().join("missing.toml")).expect("open store");
        assert_eq!(store.load_runtime_config(), RuntimeConfig::default());
    }
}
