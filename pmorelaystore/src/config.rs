//! Location of the SQLite database.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `store` subtree of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the database, relative to the config directory
    /// unless absolute.
    #[serde(default = "StoreConfig::default_directory")]
    pub directory: String,
    #[serde(default = "StoreConfig::default_file_name")]
    pub file_name: String,
}

impl StoreConfig {
    fn default_directory() -> String {
        "data".to_string()
    }

    fn default_file_name() -> String {
        "relay.db".to_string()
    }

    pub fn from_config(config: &pmoconfig::Config) -> Self {
        config.get_section(&["store"])
    }

    pub fn load_from_pmoconfig() -> anyhow::Result<Self> {
        let cfg = pmoconfig::get_config();
        Ok(Self::from_config(&cfg))
    }

    /// Resolve the database path, creating its directory if needed.
    pub fn database_path(&self, config: &pmoconfig::Config) -> anyhow::Result<PathBuf> {
        let directory = config.get_managed_dir(&["store", "directory"], &self.directory)?;
        Ok(PathBuf::from(directory).join(&self.file_name))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: Self::default_directory(),
            file_name: Self::default_file_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_missing_fields() {
        let config: StoreConfig = serde_yaml::from_str("file_name: bot.db").unwrap();
        assert_eq!(config.directory, "data");
        assert_eq!(config.file_name, "bot.db");
    }

    #[test]
    fn test_database_path_lives_under_config_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "store:\n  directory: state\n  file_name: channels.db\n",
        )
        .unwrap();

        let cfg = pmoconfig::Config::load_config(dir.path().to_str().unwrap()).unwrap();
        let store = StoreConfig::from_config(&cfg);
        let path = store.database_path(&cfg).unwrap();

        assert!(path.ends_with("state/channels.db"));
        assert!(path.parent().unwrap().is_dir());
    }
}
