//! Configuration management for dterm.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.dterm/config.toml`
//! - The `Preferences` snapshot handed to every run at construction time
//! - `ConfigWatcher`, which reloads the file when it changes on disk
//!
//! # Configuration File
//!
//! ```toml
//! # Shell override (must be an absolute path, otherwise $SHELL is used)
//! shell = "/bin/zsh"
//!
//! # Number of finished runs kept around
//! results_to_keep = 5
//!
//! # Raise a notification when a run finishes out of view
//! notify_on_completion = true
//!
//! [font]
//! family = "Monaco"
//! size = 10.0
//!
//! [text_color]
//! r = 1.0
//! g = 1.0
//! b = 1.0
//! a = 0.9
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine home directory")]
    NoHome,

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell override
    pub shell: Option<String>,
    /// Output font
    pub font: FontConfig,
    /// Default text color, its alpha is shared by every SGR color
    pub text_color: Rgba,
    /// Finished runs retained in the history
    pub results_to_keep: usize,
    /// Notify when a run finishes while not in view
    pub notify_on_completion: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            font: FontConfig::default(),
            text_color: Rgba::new(1.0, 1.0, 1.0, 0.9),
            results_to_keep: 5,
            notify_on_completion: true,
        }
    }
}

/// Font configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FontConfig {
    pub family: String,
    pub size: f32,
}

impl Default for FontConfig {
    fn default() -> Self {
        Self {
            family: "Monaco".to_string(),
            size: 10.0,
        }
    }
}

impl Config {
    /// Load configuration from `~/.dterm/config.toml`, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}; using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to `~/.dterm/config.toml`
    #[allow(dead_code)]
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path().ok_or(ConfigError::NoHome)?;
        self.save_to(&path)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.dterm/config.toml`
    pub fn path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Snapshot of the values a run needs
    pub fn preferences(&self) -> Preferences {
        Preferences {
            shell: self.shell.clone(),
            font_family: self.font.family.clone(),
            font_size: self.font.size,
            text_color: self.text_color,
            results_to_keep: self.results_to_keep,
            notify_on_completion: self.notify_on_completion,
        }
    }
}

/// Preferences passed explicitly into runs; pushed again on change
#[derive(Debug, Clone, PartialEq)]
pub struct Preferences {
    pub shell: Option<String>,
    pub font_family: String,
    pub font_size: f32,
    pub text_color: Rgba,
    pub results_to_keep: usize,
    pub notify_on_completion: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Config::default().preferences()
    }
}

/// Color with alpha, components in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub const fn opaque(r: f32, g: f32, b: f32) -> Self {
        Self::new(r, g, b, 1.0)
    }

    pub fn with_alpha(self, a: f32) -> Self {
        Self { a, ..self }
    }

    /// Convert to crossterm Color (alpha is dropped)
    pub fn to_crossterm(&self) -> crossterm::style::Color {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        crossterm::style::Color::Rgb {
            r: channel(self.r),
            g: channel(self.g),
            b: channel(self.b),
        }
    }
}

/// Reloads the configuration when its file changes on disk
pub struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Self {
        let modified = modified_time(&path);
        Self { path, modified }
    }

    /// The new configuration if the file was touched since the last call
    pub fn poll(&mut self) -> Option<Config> {
        let modified = modified_time(&self.path);
        if modified == self.modified {
            return None;
        }
        self.modified = modified;

        if modified.is_none() {
            info!("{} removed; using defaults", self.path.display());
            return Some(Config::default());
        }
        match Config::load_from(&self.path) {
            Ok(config) => {
                info!("Reloaded {}", self.path.display());
                Some(config)
            }
            Err(e) => {
                warn!("{}; keeping current settings", e);
                None
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// `~/.dterm`, created on first use
pub fn config_dir() -> Option<PathBuf> {
    let home = home_dir()?;
    let dir = home.join(".dterm");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str("results_to_keep = 12\n[font]\nsize = 14.0\n").unwrap();
        assert_eq!(config.results_to_keep, 12);
        assert_eq!(config.font.size, 14.0);
        assert_eq!(config.font.family, "Monaco");
        assert_eq!(config.text_color, Rgba::new(1.0, 1.0, 1.0, 0.9));
        assert!(config.notify_on_completion);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.shell = Some("/bin/zsh".to_string());
        config.text_color = Rgba::new(0.5, 0.25, 1.0, 0.75);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "results_to_keep = \"many\"").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_preferences_snapshot() {
        let prefs = Config::default().preferences();
        assert_eq!(prefs.font_family, "Monaco");
        assert_eq!(prefs.font_size, 10.0);
        assert_eq!(prefs.text_color.a, 0.9);
        assert_eq!(prefs.results_to_keep, 5);
    }

    #[test]
    fn test_watcher_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "results_to_keep = 3\n").unwrap();

        let mut watcher = ConfigWatcher::new(path.clone());
        assert_eq!(watcher.poll(), None);

        // Make sure the timestamp moves even on coarse filesystems
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        fs::write(&path, "[font]\nsize = 16.0\n").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let reloaded = watcher.poll().unwrap();
        assert_eq!(reloaded.font.size, 16.0);
        assert_eq!(reloaded.results_to_keep, 5);
        assert_eq!(watcher.poll(), None);

        fs::remove_file(&path).unwrap();
        assert_eq!(watcher.poll(), Some(Config::default()));
    }

    #[test]
    fn test_to_crossterm() {
        let color = Rgba::new(1.0, 0.0, 0.5, 0.2).to_crossterm();
        assert_eq!(color, crossterm::style::Color::Rgb { r: 255, g: 0, b: 128 });
    }
}
