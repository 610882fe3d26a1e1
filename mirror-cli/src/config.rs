use anyhow::{Context, Result};
use mirror_index::MaintainerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name checkpoints are stored under when none is configured
pub const DEFAULT_CONSUMER: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory being mirrored
    pub root: PathBuf,
    /// SQLite database holding the index and change log
    pub database: PathBuf,
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default = "default_consumer")]
    pub consumer: String,
}

fn default_consumer() -> String {
    DEFAULT_CONSUMER.to_string()
}

impl Config {
    /// Configuration for `root` with the default database location and filters
    pub fn new(root: PathBuf) -> Result<Self> {
        let defaults = MaintainerConfig::default();
        Ok(Self {
            root,
            database: default_database_path()?,
            includes: defaults.includes,
            excludes: defaults.excludes,
            consumer: default_consumer(),
        })
    }

    /// Filtering rules for the index maintainer
    pub fn maintainer_config(&self) -> MaintainerConfig {
        MaintainerConfig {
            includes: self.includes.clone(),
            excludes: self.excludes.clone(),
        }
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Load configuration from `path`
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".fsmirror"))
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.toml"))
}

/// Get the default database path
pub fn default_database_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("index.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(dir: &Path) -> Config {
        Config {
            root: dir.join("root"),
            database: dir.join("index.db"),
            includes: vec!["*.txt".to_string()],
            excludes: vec!["*.tmp".to_string()],
            consumer: "laptop".to_string(),
        }
    }

    #[test]
    fn test_config_serialization() {
        let config = sample(Path::new("/tmp/mirror"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("consumer = \"laptop\""));
        assert!(toml_str.contains("*.txt"));

        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.root, config.root);
        assert_eq!(deserialized.database, config.database);
        assert_eq!(deserialized.includes, config.includes);
        assert_eq!(deserialized.excludes, config.excludes);
    }

    #[test]
    fn test_optional_fields_default() {
        let config: Config = toml::from_str(
            r#"
            root = "/data"
            database = "/data/.index.db"
            "#,
        )
        .unwrap();

        assert!(config.includes.is_empty());
        assert!(config.excludes.is_empty());
        assert_eq!(config.consumer, DEFAULT_CONSUMER);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");
        let config = sample(temp_dir.path());

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.root, config.root);
        assert_eq!(loaded.consumer, config.consumer);
        assert_eq!(loaded.maintainer_config().includes, config.includes);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("missing.toml");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
