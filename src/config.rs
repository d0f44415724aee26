use crate::{Result, VmOpsError, logger::DEFAULT_FILTER};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmOpsConfig {
    #[serde(default)]
    pub resize: ResizeConfig,
    #[serde(default)]
    pub plugins: PluginConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeConfig {
    /// Power the VM off hard when a clean shutdown fails.
    #[serde(default = "default_true")]
    pub hard_shutdown_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_migration_plugin")]
    pub migration: String,
    #[serde(default = "default_config_file_plugin")]
    pub config_file: String,
    #[serde(default = "default_relax_xsm_sr_check_key")]
    pub relax_xsm_sr_check_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            hard_shutdown_fallback: true,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            migration: default_migration_plugin(),
            config_file: default_config_file_plugin(),
            relax_xsm_sr_check_key: default_relax_xsm_sr_check_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_migration_plugin() -> String {
    "migration".to_string()
}

fn default_config_file_plugin() -> String {
    "config_file".to_string()
}

fn default_relax_xsm_sr_check_key() -> String {
    "relax-xsm-sr-check".to_string()
}

fn default_log_filter() -> String {
    DEFAULT_FILTER.to_string()
}

impl VmOpsConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: VmOpsConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// `$XDG_CONFIG_HOME/nova/vmops.toml`, or a relative fallback.
    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(mut dir) => {
                dir.push("nova");
                dir.push("vmops.toml");
                dir
            }
            None => PathBuf::from("vmops.toml"),
        }
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("plugins.migration", &self.plugins.migration),
            ("plugins.config_file", &self.plugins.config_file),
            ("plugins.relax_xsm_sr_check_key", &self.plugins.relax_xsm_sr_check_key),
        ] {
            if value.trim().is_empty() {
                return Err(VmOpsError::Config(format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = VmOpsConfig::from_str("").unwrap();
        assert!(config.resize.hard_shutdown_fallback);
        assert_eq!(config.plugins.migration, "migration");
        assert_eq!(config.plugins.relax_xsm_sr_check_key, "relax-xsm-sr-check");
        assert_eq!(config.logging.filter, "nova_vmops=info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = VmOpsConfig::from_str(
            r#"
            [resize]
            hard_shutdown_fallback = false

            [plugins]
            migration = "migration_v2"
            "#,
        )
        .unwrap();

        assert!(!config.resize.hard_shutdown_fallback);
        assert_eq!(config.plugins.migration, "migration_v2");
        assert_eq!(config.plugins.config_file, "config_file");
    }

    #[test]
    fn blank_plugin_name_is_rejected() {
        let err = VmOpsConfig::from_str("[plugins]\nconfig_file = \" \"\n").unwrap_err();
        assert!(matches!(err, VmOpsError::Config(_)));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("vmops.toml");

        let mut config = VmOpsConfig::default();
        config.logging.filter = "nova_vmops=debug".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = VmOpsConfig::from_file(&path).unwrap();
        assert_eq!(loaded.logging.filter, "nova_vmops=debug");
        assert!(loaded.resize.hard_shutdown_fallback);
    }
}
