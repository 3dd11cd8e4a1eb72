//! Orchestrator settings

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const CONFIG_FILE: &str = "workcopy.json";

fn default_max_credential_attempts() -> u32 {
    3
}

fn default_token_only_hosts() -> Vec<String> {
    vec!["github.com".to_string(), "gitlab.com".to_string()]
}

fn default_true() -> bool {
    true
}

/// Settings consumed by the orchestrator and its services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Prune remote-tracking refs when a fetch does not say otherwise
    #[serde(default)]
    pub prune_on_fetch: bool,

    #[serde(default)]
    pub update_submodules_after_pull: bool,

    /// Accept certificates that fail verification
    #[serde(default)]
    pub ignore_ssl_errors: bool,

    #[serde(default = "default_true")]
    pub use_ssh_agent: bool,

    /// Key file tried before the default `~/.ssh` keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,

    /// Keep the last accepted identity per host in memory
    #[serde(default = "default_true")]
    pub cache_credentials: bool,

    /// Persist accepted identities in the credential store
    #[serde(default)]
    pub store_credentials: bool,

    #[serde(default = "default_max_credential_attempts")]
    pub max_credential_attempts: u32,

    /// HTTPS hosts that reject account passwords
    #[serde(default = "default_token_only_hosts")]
    pub token_only_hosts: Vec<String>,

    /// Remote used when the branch has no upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_remote: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prune_on_fetch: false,
            update_submodules_after_pull: false,
            ignore_ssl_errors: false,
            use_ssh_agent: true,
            ssh_key_path: None,
            cache_credentials: true,
            store_credentials: false,
            max_credential_attempts: default_max_credential_attempts(),
            token_only_hosts: default_token_only_hosts(),
            default_remote: None,
        }
    }
}

impl Settings {
    /// `workcopy` under the platform config directory
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("workcopy"))
    }

    /// Load settings from `config_dir`; a missing file yields defaults
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir)?;
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(config_dir.join(CONFIG_FILE), contents)?;
        Ok(())
    }

    /// Settings from the default location, falling back to defaults
    pub fn load_default() -> Self {
        let Some(dir) = Self::default_dir() else {
            return Self::default();
        };
        match Self::load(&dir) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Ignoring unreadable settings in {:?}: {}", dir, e);
                Self::default()
            }
        }
    }

    pub fn is_token_only_host(&self, host: &str) -> bool {
        self.token_only_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings {
            prune_on_fetch: true,
            max_credential_attempts: 5,
            ..Settings::default()
        };

        settings.save(temp_dir.path()).unwrap();
        let loaded = Settings::load(temp_dir.path()).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load(temp_dir.path()).unwrap();
        assert_eq!(settings.max_credential_attempts, 3);
        assert!(settings.is_token_only_host("GitHub.com"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILE),
            r#"{"ignoreSslErrors": true}"#,
        )
        .unwrap();
        let settings = Settings::load(temp_dir.path()).unwrap();
        assert!(settings.ignore_ssl_errors);
        assert!(settings.use_ssh_agent);
        assert_eq!(settings.token_only_hosts.len(), 2);
    }
}
