//! Configuration management for Replay Companion

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::capture::{
    ensure_dir, game_folder_for_executable, AudioProfile, CaptureProfile, EncodingProfile,
    MicrophoneProfile, DEFAULT_BUFFER_DURATION_SECS,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Capture geometry, applied at engine startup
    #[serde(default)]
    pub capture: CaptureProfile,

    #[serde(default)]
    pub encoding: EncodingProfile,

    /// Desktop audio
    #[serde(default)]
    pub audio: AudioProfile,

    #[serde(default)]
    pub microphone: MicrophoneProfile,

    #[serde(default)]
    pub clipping: ClippingConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClippingConfig {
    /// Seconds of footage the replay buffer holds
    #[serde(default = "default_buffer_duration")]
    pub buffer_duration_secs: u32,

    /// Duration label used in generated clip names
    #[serde(default = "default_clip_length")]
    pub clip_length_secs: u32,

    /// Root folder for clips; each game gets a subfolder
    #[serde(default = "default_output_folder")]
    pub output_folder: PathBuf,

    /// Executable file names that switch clipping on when they start
    #[serde(default)]
    pub games: Vec<String>,

    /// Enable clipping mode on launch
    #[serde(default)]
    pub autostart: bool,

    /// Process list polling interval (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_buffer_duration() -> u32 {
    DEFAULT_BUFFER_DURATION_SECS
}

fn default_clip_length() -> u32 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_output_folder() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.video_dir().map(|dir| dir.join("Clips")))
        .unwrap_or_else(|| std::env::temp_dir().join("Clips"))
}

impl Default for ClippingConfig {
    fn default() -> Self {
        Self {
            buffer_duration_secs: default_buffer_duration(),
            clip_length_secs: default_clip_length(),
            output_folder: default_output_folder(),
            games: Vec::new(),
            autostart: false,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_config_path()?)
    }

    /// Load from `config_path`, writing defaults there if the file is missing
    pub fn load_from(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(config_path),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "replay-companion", "companion")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    pub fn output_folder(&self) -> &Path {
        &self.clipping.output_folder
    }

    /// Check if `executable` is one of the monitored games
    pub fn is_monitored(&self, executable: &str) -> bool {
        self.clipping
            .games
            .iter()
            .any(|game| game.eq_ignore_ascii_case(executable))
    }

    /// Add a game to the monitored list and create its clip folder.
    /// Returns false if it was already listed.
    pub fn add_game(&mut self, executable: &str) -> Result<bool> {
        let executable = executable.trim();
        if executable.is_empty() || self.is_monitored(executable) {
            return Ok(false);
        }
        ensure_dir(&game_folder_for_executable(
            &self.clipping.output_folder,
            executable,
        ))?;
        self.clipping.games.push(executable.to_string());
        Ok(true)
    }

    /// Remove a game from the monitored list
    pub fn remove_game(&mut self, executable: &str) -> bool {
        let before = self.clipping.games.len();
        self.clipping
            .games
            .retain(|game| !game.eq_ignore_ascii_case(executable));
        self.clipping.games.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::EncoderKind;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(config.clipping.buffer_duration_secs, 60);
        assert_eq!(config.clipping.clip_length_secs, 30);
        assert_eq!(config.clipping.poll_interval_ms, 1000);
        assert!(!config.clipping.autostart);
        assert_eq!(config.config_path().unwrap(), path);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[encoding]
encoder = "nvenc_h264"
bitrate = 12000

[clipping]
games = ["eldenring.exe"]
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.encoding.encoder, EncoderKind::NvencH264);
        assert_eq!(config.encoding.bitrate, 12000);
        assert_eq!(config.encoding.quality, 22);
        assert_eq!(config.audio.bitrate, 192);
        assert_eq!(config.clipping.games, vec!["eldenring.exe"]);
        assert_eq!(config.clipping.buffer_duration_secs, 60);
    }

    #[test]
    fn save_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::load_from(&path).unwrap();
        config.clipping.buffer_duration_secs = 90;
        config.microphone.enabled = true;
        config.save().unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.clipping.buffer_duration_secs, 90);
        assert!(reloaded.microphone.enabled);
    }

    #[test]
    fn games_are_deduplicated_case_insensitively() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.clipping.output_folder = dir.path().join("Clips");

        assert!(config.add_game("Valorant.exe").unwrap());
        assert!(!config.add_game("valorant.EXE").unwrap());
        assert!(!config.add_game("  ").unwrap());
        assert_eq!(config.clipping.games, vec!["Valorant.exe"]);
        assert!(dir.path().join("Clips").join("Valorant").is_dir());
        assert!(config.is_monitored("VALORANT.exe"));

        assert!(config.remove_game("valorant.exe"));
        assert!(!config.remove_game("valorant.exe"));
        assert!(config.clipping.games.is_empty());
    }
}
