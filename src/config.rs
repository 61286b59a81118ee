use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// Defaults to ~/.pipulate when unset.
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            db_file: default_db_file(),
        }
    }
}

fn default_db_file() -> String {
    "pipulate.db".to_string()
}

#[derive(Debug, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            app_name: default_app_name(),
        }
    }
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_app_name() -> String {
    crate::store::ADHOC_APP_NAME.to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse pipulate.toml")?;
        Ok(config)
    }

    /// Defaults apply when the file is absent; a present-but-broken file is
    /// still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.store.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".pipulate")
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join(&self.store.db_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_empty_config_defaults() {
        let config = parse("");
        assert_eq!(config.store.db_file, "pipulate.db");
        assert_eq!(config.workflow.profile, "default");
        assert_eq!(config.workflow.app_name, "notebook");
        assert!(config.store.data_dir.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
            [store]
            data_dir = "/var/lib/pipulate"
            db_file = "jobs.db"

            [workflow]
            profile = "alice"
            app_name = "gap-analysis"
        "#,
        );
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/pipulate/jobs.db"));
        assert_eq!(config.workflow.profile, "alice");
        assert_eq!(config.workflow.app_name, "gap-analysis");
    }

    #[test]
    fn test_invalid_toml_fails() {
        let result: Result<Config, _> = toml::from_str("not valid toml {{{}}}");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/pipulate.toml")).unwrap();
        assert_eq!(config.workflow.profile, "default");
    }
}
