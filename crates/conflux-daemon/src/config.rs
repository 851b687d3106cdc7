use std::{
    env,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::TimeDelta;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use conflux_core::model::Principal;
use conflux_rotation::RotationOptions;
use conflux_storage::versioned::StoreOptions;
use conflux_sync::CoordinatorOptions;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

use crate::service::ServiceOptions;

/// Environment variable naming the config file when `--config` is not given.
pub const CONFIG_ENV: &str = "CONFLUX_CONFIG";

/// Daemon configuration loaded from `~/.config/conflux/config.toml` (platform-specific).
///
/// Unknown fields are rejected so a misspelt setting cannot silently fall back to
/// its default.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Override for the data directory (entries, policies, subscriptions, audit log).
    pub data_dir: Option<PathBuf>,
    pub log_format: LogFormat,
    /// Principal granted full access when the policy set is empty at startup.
    pub bootstrap_admin: Option<String>,
    pub keys: KeysConfig,
    pub store: StoreConfig,
    pub distribution: DistributionConfig,
    pub rotation: RotationConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyProviderKind {
    /// OS keychain.
    #[default]
    Keyring,
    /// Process memory only; keys are lost on exit.
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct KeysConfig {
    pub provider: KeyProviderKind,
    pub service: String,
    pub account: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            provider: KeyProviderKind::Keyring,
            service: "confluxd".into(),
            account: "master-keys".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Keep at most this many versions per entry. Unbounded when absent.
    pub retain_versions: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DistributionConfig {
    pub poll_timeout_secs: u64,
    pub max_batch: usize,
    pub push_interval_secs: u64,
    pub push_timeout_secs: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 30,
            max_batch: 500,
            push_interval_secs: 5,
            push_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RotationConfig {
    pub check_interval_secs: u64,
    /// Rotate the master key automatically once it is this old.
    pub max_key_age_days: Option<i64>,
    /// How long a replaced master key stays decrypt-only before retirement.
    pub grace_period_secs: i64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            max_key_age_days: None,
            grace_period_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl Config {
    /// Read and validate the config at `path`. A missing or blank file means
    /// defaults; anything else must parse and produce valid service options.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).wrap_err_with(|| format!("reading config {}", path.display()))
            }
        };
        let config: Self = if contents.trim().is_empty() {
            Self::default()
        } else {
            toml::from_str(&contents)
                .wrap_err_with(|| format!("parsing config {}", path.display()))?
        };
        config
            .service_options()
            .wrap_err_with(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Translate into component options, validating values along the way.
    pub fn service_options(&self) -> Result<ServiceOptions> {
        if self.distribution.max_batch == 0 {
            return Err(eyre!("distribution.max_batch must be at least 1"));
        }
        if self.rotation.grace_period_secs < 0 {
            return Err(eyre!("rotation.grace_period_secs must not be negative"));
        }
        let bootstrap_admin = self
            .bootstrap_admin
            .as_deref()
            .map(Principal::new)
            .transpose()
            .map_err(|err| eyre!(err.to_string()))?;
        let max_key_age = self
            .rotation
            .max_key_age_days
            .map(|days| {
                TimeDelta::try_days(days)
                    .filter(|age| *age > TimeDelta::zero())
                    .ok_or_else(|| eyre!("rotation.max_key_age_days out of range: {days}"))
            })
            .transpose()?;
        let grace_period = TimeDelta::try_seconds(self.rotation.grace_period_secs)
            .ok_or_else(|| eyre!("rotation.grace_period_secs out of range"))?;

        Ok(ServiceOptions {
            store: StoreOptions {
                retain_versions: self.store.retain_versions,
            },
            coordinator: CoordinatorOptions {
                poll_timeout: Duration::from_secs(self.distribution.poll_timeout_secs),
                max_batch: self.distribution.max_batch,
            },
            rotation: RotationOptions {
                grace_period,
                max_key_age,
                check_interval: Duration::from_secs(self.rotation.check_interval_secs.max(1)),
            },
            bootstrap_admin,
        })
    }
}

/// Config file to use: `--config`, then `CONFLUX_CONFIG`, then the platform default.
pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    pick_path(explicit, env::var_os(CONFIG_ENV))
}

fn pick_path(explicit: Option<PathBuf>, from_env: Option<OsString>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = from_env.filter(|raw| !raw.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let base = config_dir().ok_or_else(|| {
        eyre!("no platform config dir; pass --config or set {CONFIG_ENV}")
    })?;
    Ok(base.join("conflux").join("config.toml"))
}

/// Write the config to `path` unless a file is already there, so user edits are
/// never clobbered. Returns the path either way.
pub fn write_default_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
