//! Daemon configuration handling.
//!
//! Configuration is read from `daemon.toml` in the platform config directory.
//! Secrets can be supplied through the environment instead, which takes
//! precedence over the file:
//!
//! - `CASTKEEPER_TOKEN_ENCRYPTION_KEY`
//! - `CASTKEEPER_<PLATFORM>_CLIENT_ID`
//! - `CASTKEEPER_<PLATFORM>_CLIENT_SECRET`
//! - `CASTKEEPER_<PLATFORM>_REDIRECT_URI`

use anyhow::{Context, Result};
use castkeeper_core::{ClientCredentials, LifecycleSettings, Platform, Secret};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "CASTKEEPER";

/// OAuth client settings for one platform.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Directory holding the credential store.
    pub data_dir: PathBuf,

    /// Logging level, used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Key all stored tokens are encrypted with.
    #[serde(default)]
    pub token_encryption_key: Option<String>,

    /// Notifications kept per user for `list_notifications`.
    #[serde(default = "default_notification_history")]
    pub notification_history: usize,

    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    /// OAuth clients keyed by platform identifier.
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_notification_history() -> usize {
    castkeeper_core::notify::DEFAULT_HISTORY
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let dirs = project_dirs();
        let data_dir = dirs
            .as_ref()
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".castkeeper"));

        let socket_path = dirs
            .as_ref()
            .map(|d| d.runtime_dir().unwrap_or(d.data_dir()).join("castkeeper.sock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/castkeeper.sock"));

        Self {
            socket_path,
            config_path: PathBuf::new(),
            data_dir,
            log_level: default_log_level(),
            token_encryption_key: None,
            notification_history: default_notification_history(),
            lifecycle: LifecycleSettings::default(),
            platforms: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("socket_path", &self.socket_path)
            .field("config_path", &self.config_path)
            .field("data_dir", &self.data_dir)
            .field("log_level", &self.log_level)
            .field(
                "token_encryption_key",
                &self.token_encryption_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("notification_history", &self.notification_history)
            .field("lifecycle", &self.lifecycle)
            .field("platforms", &self.platforms)
            .finish()
    }
}

impl DaemonConfig {
    /// Parse a configuration file's contents.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let defaults = Self::default();
        let mut value: toml::Table = toml::from_str(contents)?;

        // Paths are optional in the file.
        value
            .entry("socket_path")
            .or_insert_with(|| defaults.socket_path.to_string_lossy().into_owned().into());
        value
            .entry("data_dir")
            .or_insert_with(|| defaults.data_dir.to_string_lossy().into_owned().into());

        Ok(toml::Value::Table(value).try_into()?)
    }

    /// Apply environment overrides, looking variables up with `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(&format!("{}_TOKEN_ENCRYPTION_KEY", ENV_PREFIX)) {
            self.token_encryption_key = Some(key);
        }

        let mut names: Vec<String> = Platform::BUILTIN
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        for name in self.platforms.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        for name in names {
            let var = |field: &str| {
                lookup(&format!(
                    "{}_{}_{}",
                    ENV_PREFIX,
                    name.to_uppercase().replace('-', "_"),
                    field
                ))
            };
            let (client_id, client_secret, redirect_uri) =
                (var("CLIENT_ID"), var("CLIENT_SECRET"), var("REDIRECT_URI"));
            if client_id.is_none() && client_secret.is_none() && redirect_uri.is_none() {
                continue;
            }

            let entry = self.platforms.entry(name).or_default();
            if client_id.is_some() {
                entry.client_id = client_id;
            }
            if client_secret.is_some() {
                entry.client_secret = client_secret;
            }
            if redirect_uri.is_some() {
                entry.redirect_uri = redirect_uri;
            }
        }
    }

    /// The encryption key. A missing or blank key is fatal.
    pub fn encryption_key(&self) -> Result<&str> {
        match self.token_encryption_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => anyhow::bail!(
                "token_encryption_key is not configured; set it in {:?} or via {}_TOKEN_ENCRYPTION_KEY",
                self.config_path,
                ENV_PREFIX
            ),
        }
    }

    /// Path of the credential store file.
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    /// OAuth clients of every platform that has a client id.
    ///
    /// Platforms without a valid redirect URI are skipped with a warning.
    pub fn client_credentials(&self) -> HashMap<Platform, ClientCredentials> {
        let mut clients = HashMap::new();
        for (name, platform_config) in &self.platforms {
            let Some(client_id) = platform_config
                .client_id
                .as_deref()
                .filter(|id| !id.trim().is_empty())
            else {
                continue;
            };

            let redirect_uri = match platform_config.redirect_uri.as_deref() {
                Some(uri) => uri,
                None => {
                    tracing::warn!("Platform {} has no redirect_uri, not registering it", name);
                    continue;
                }
            };
            if let Err(e) = url::Url::parse(redirect_uri) {
                tracing::warn!("Platform {} has an invalid redirect_uri ({}), not registering it", name, e);
                continue;
            }

            clients.insert(
                Platform::new(name),
                ClientCredentials::new(
                    client_id,
                    platform_config.client_secret.clone().map(Secret::new),
                    redirect_uri,
                ),
            );
        }
        clients
    }
}

/// Load configuration from the default location, then apply the environment.
pub fn load_config() -> Result<DaemonConfig> {
    let dirs = project_dirs();
    let config_path = dirs
        .as_ref()
        .map(|d| d.config_dir().join("daemon.toml"))
        .unwrap_or_else(|| PathBuf::from("castkeeper-daemon.toml"));

    load_config_from(&config_path, |name| std::env::var(name).ok())
}

/// Load configuration from `config_path` (defaults if it does not exist).
pub fn load_config_from(
    config_path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<DaemonConfig> {
    let mut config = if config_path.exists() {
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        DaemonConfig::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", config_path))?
    } else {
        DaemonConfig::default()
    };

    config.config_path = config_path.to_path_buf();
    config.apply_env_overrides(lookup);
    config
        .lifecycle
        .validate()
        .context("Invalid [lifecycle] settings")?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "castkeeper", "castkeeper")
}
