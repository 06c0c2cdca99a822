//! Settings from `~/.reposync/config.yaml`.
//!
//! Every field has a default, so a missing file is a valid configuration.
//! Secrets never live in this file: the GitHub token is read from the
//! environment variable named by `github.token_env_var`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::{default_store_path, reposync_root};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where clones live. `~` and `$VAR` are expanded at load time.
    pub repositories_root: Option<String>,
    /// Registry store location; defaults to `~/.reposync/repositories.json`.
    pub registry_path: Option<PathBuf>,
    pub scheduler: SchedulerSettings,
    pub network: NetworkSettings,
    pub github: GitHubSettings,
    pub reindex: ReindexSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub author_name: String,
    pub author_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Deadline for a single clone or fetch.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSettings {
    pub token_env_var: String,
    /// Basic-auth username sent alongside the token.
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReindexSettings {
    /// External indexer invocation; the repository (or root) path is appended.
    pub command: Option<Vec<String>>,
    /// The indexer can rebuild a single repository instead of the whole index.
    pub scoped: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 15,
            author_name: "reposync bot".to_string(),
            author_email: "bot@reposync.local".to_string(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

impl Default for GitHubSettings {
    fn default() -> Self {
        Self {
            token_env_var: "GITHUB_TOKEN".to_string(),
            username: "x-access-token".to_string(),
        }
    }
}

impl SchedulerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_minutes < 1 {
            return Err(ConfigError::InvalidInterval(self.interval_minutes));
        }
        if self.author_name.trim().is_empty() || self.author_email.trim().is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        Ok(())
    }
}

impl NetworkSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GitHubSettings {
    /// The token from the environment, if set and non-empty.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env_var)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()
    }

    pub fn repositories_root_at(&self, home: &Path) -> PathBuf {
        match &self.repositories_root {
            Some(raw) => PathBuf::from(expand_path(raw, home)),
            None => reposync_root(home).join("repos"),
        }
    }

    pub fn registry_path_at(&self, home: &Path) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| default_store_path(home))
    }
}

/// `<home>/.reposync/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    reposync_root(home).join("config.yaml")
}

/// Load and validate settings under `home`. A missing file yields defaults.
pub fn load_at(home: &Path) -> Result<Settings, ConfigError> {
    load_from(&config_path_at(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Settings, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    load_at(&home)
}

/// Load and validate settings from an explicit file.
pub fn load_from(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let settings: Settings = if contents.trim().is_empty() {
        Settings::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?
    };
    settings.validate()?;
    Ok(settings)
}

/// Expand a leading `~` and `$VAR`/`${VAR}` references. Unset variables are
/// left in place so a typo shows up in the resulting path.
fn expand_path(raw: &str, home: &Path) -> String {
    shellexpand::full_with_context_no_errors(raw, || home.to_str(), |var| std::env::var(var).ok())
        .into_owned()
}
