//! Configuration file support for Pulse.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/pulse/config.toml`.

use crate::{ActivityType, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub exercise: ExerciseSection,

    #[serde(default)]
    pub sync: SyncConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl DataConfig {
    /// Companion-side summary journal
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("companion").join("summaries.jsonl")
    }

    pub fn rollup_csv_path(&self) -> PathBuf {
        self.data_dir.join("companion").join("summaries.csv")
    }

    /// Host-side theme key-value file
    pub fn theme_path(&self) -> PathBuf {
        self.data_dir.join("host").join("theme.json")
    }
}

/// Session defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExerciseSection {
    #[serde(default)]
    pub activity: ActivityType,

    /// Zero disables the distance goal
    #[serde(default)]
    pub distance_goal_meters: f64,

    /// Zero disables the duration goal
    #[serde(default)]
    pub duration_goal_secs: u64,

    #[serde(default = "default_auto_pause")]
    pub auto_pause: bool,
}

impl Default for ExerciseSection {
    fn default() -> Self {
        Self {
            activity: ActivityType::default(),
            distance_goal_meters: 0.0,
            duration_goal_secs: 0,
            auto_pause: default_auto_pause(),
        }
    }
}

/// Buffer sizes for the in-process streams
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_update_buffer")]
    pub update_buffer: usize,

    #[serde(default = "default_host_event_buffer")]
    pub host_event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_buffer: default_update_buffer(),
            host_event_buffer: default_host_event_buffer(),
        }
    }
}

// Default value functions
fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| home_dir().join(".local/share"));
    base.join("pulse")
}

fn default_auto_pause() -> bool {
    true
}

fn default_update_buffer() -> usize {
    64
}

fn default_host_event_buffer() -> usize {
    32
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject values the controller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.exercise.distance_goal_meters < 0.0 || !self.exercise.distance_goal_meters.is_finite() {
            return Err(Error::Config(format!(
                "distance_goal_meters must be a non-negative number, got {}",
                self.exercise.distance_goal_meters
            )));
        }
        if self.sync.update_buffer == 0 || self.sync.host_event_buffer == 0 {
            return Err(Error::Config("sync buffers must hold at least one item".into()));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| home_dir().join(".config"));
        base.join("pulse").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}
