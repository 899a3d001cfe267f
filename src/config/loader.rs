use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::system::FileSystemInterface;

use super::types::Config;

/// Policy configuration loader over an injectable file system
pub struct ConfigLoader<F: FileSystemInterface> {
    file_system: F,
    config_path: PathBuf,
}

impl<F: FileSystemInterface> ConfigLoader<F> {
    pub fn new(file_system: F, config_path: PathBuf) -> Self {
        Self {
            file_system,
            config_path,
        }
    }

    /// Load configuration, writing a default file when none exists
    pub fn load_config(&self) -> Result<Config> {
        debug!("Loading configuration from: {}", self.config_path.display());

        if !self.file_system.config_file_exists(&self.config_path) {
            info!("Configuration file not found, creating default configuration");
            return Ok(self.create_default_config());
        }

        let content = self
            .file_system
            .read_config_file(&self.config_path)
            .with_context(|| {
                format!(
                    "Failed to read configuration file: {}",
                    self.config_path.display()
                )
            })?;

        let config: Config = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse configuration file: {}",
                self.config_path.display()
            )
        })?;

        for warning in config.validation_warnings() {
            warn!("Configuration: {}", warning);
        }

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    pub fn save_config(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            self.file_system
                .create_config_dir(parent)
                .with_context(|| {
                    format!("Failed to create config directory: {}", parent.display())
                })?;
        }

        let content =
            toml::to_string_pretty(config).context("Failed to serialize configuration")?;

        self.file_system
            .write_config_file(&self.config_path, &content)
            .with_context(|| {
                format!(
                    "Failed to write configuration file: {}",
                    self.config_path.display()
                )
            })?;

        info!("Configuration saved to: {}", self.config_path.display());
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    // Failing to persist the default is not fatal: the controller runs on
    // the in-memory default either way.
    fn create_default_config(&self) -> Config {
        let config = Config::default();

        if let Err(e) = self.save_config(&config) {
            warn!(
                "Could not save default config to {}: {:#}. Using default config.",
                self.config_path.display(),
                e
            );
            return config;
        }

        info!(
            "Created default configuration file: {}",
            self.config_path.display()
        );
        config
    }
}

impl ConfigLoader<crate::system::StandardFileSystem> {
    pub fn new_production(config_path: PathBuf) -> Self {
        Self::new(crate::system::StandardFileSystem, config_path)
    }

    pub fn new_with_default_path() -> Result<Self> {
        Ok(Self::new_production(Self::default_config_path()?))
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home_dir.join(".config/audio-topology-controller/config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioMode;
    use crate::system::MockFileSystem;

    #[test]
    fn test_load_nonexistent_config_creates_default() {
        let mock_fs = MockFileSystem::new();
        let config_path = PathBuf::from("/test/config.toml");
        let loader = ConfigLoader::new(mock_fs.clone(), config_path.clone());

        let config = loader.load_config().unwrap();

        assert_eq!(config.policy.mode, AudioMode::Automatic);
        assert!(mock_fs.file_exists(&config_path));
        assert_eq!(
            mock_fs.get_directory_creation_calls(),
            vec![PathBuf::from("/test")]
        );
    }

    #[test]
    fn test_default_config_survives_write_failure() {
        let mock_fs = MockFileSystem::new();
        mock_fs.set_write_failure(true);
        let loader = ConfigLoader::new(mock_fs, PathBuf::from("/test/config.toml"));

        let config = loader.load_config().unwrap();
        assert!(config.policy.allow_multiple_sinks);
    }

    #[test]
    fn test_load_manual_config() {
        let mock_fs = MockFileSystem::new();
        let config_path = PathBuf::from("/test/config.toml");
        mock_fs.add_file(
            &config_path,
            r#"
[policy]
mode = "manual"
allow_multiple_sources = false

[[manual.cards]]
name = "alsa_card.usb-Focusrite"
profile = "output:analog-stereo+input:analog-stereo"

[[manual.sinks]]
name = "alsa_output.usb-Focusrite.analog-stereo"
type = "external"
volume = 0.7

[[manual.sources]]
name = "alsa_input.usb-Focusrite.analog-stereo"
type = "aux"
"#
            .to_string(),
        );

        let loader = ConfigLoader::new(mock_fs, config_path);
        let config = loader.load_config().unwrap();

        assert_eq!(config.policy.mode, AudioMode::Manual);
        assert!(!config.policy.allow_multiple_sources);
        assert_eq!(config.manual.cards.len(), 1);
        assert_eq!(
            config.manual.sinks[0].class,
            Some(crate::audio::OutputClass::External)
        );
        assert_eq!(
            config.manual.sinks[0].volume,
            Some(toml::Value::Float(0.7))
        );
        assert_eq!(config.manual.sources[0].volume, None);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let mock_fs = MockFileSystem::new();
        let config_path = PathBuf::from("/test/config.toml");
        mock_fs.add_file(&config_path, "[policy\nmode = ".to_string());

        let loader = ConfigLoader::new(mock_fs, config_path);
        assert!(loader.load_config().is_err());
    }

    #[test]
    fn test_read_failure_is_reported() {
        let mock_fs = MockFileSystem::new();
        let config_path = PathBuf::from("/test/config.toml");
        mock_fs.add_file(&config_path, String::new());
        mock_fs.set_read_failure(true);

        let loader = ConfigLoader::new(mock_fs, config_path);
        let err = loader.load_config().unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read configuration file"));
    }
}
