use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Policy switches for the smart download service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Try the lossless chain before the video-hosting fallback.
    #[serde(default = "default_prefer_lossless")]
    pub prefer_lossless: bool,
    /// Target format for fallback extraction ("m4a", "mp3", "opus", ...).
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    /// Override for the yt-dlp binary location.
    #[serde(default)]
    pub yt_dlp_path: Option<PathBuf>,
}

/// Provider API endpoints. Overridable so tests and regional mirrors can
/// point elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Link-resolution API (canonical URL -> per-provider URLs).
    #[serde(default = "default_link_api")]
    pub link_api: String,
    /// Track-lookup API base (Deezer-shaped).
    #[serde(default = "default_track_api")]
    pub track_api: String,
    /// Direct lossless download lookup base.
    #[serde(default = "default_download_api")]
    pub download_api: String,
    /// Segment/track API base (Tidal-shaped, three quality tiers).
    #[serde(default = "default_segment_api")]
    pub segment_api: String,
}

/// User-configurable directories.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    /// Custom downloads directory; defaults to the platform
    /// `SimpleMusicDownloads` folder when unset.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            prefer_lossless: default_prefer_lossless(),
            audio_format: default_audio_format(),
            yt_dlp_path: None,
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            link_api: default_link_api(),
            track_api: default_track_api(),
            download_api: default_download_api(),
            segment_api: default_segment_api(),
        }
    }
}

fn default_prefer_lossless() -> bool {
    false
}

fn default_audio_format() -> String {
    "m4a".to_string()
}

fn default_link_api() -> String {
    "https://api.song.link/v1-alpha.1/links".to_string()
}

fn default_track_api() -> String {
    "https://api.deezer.com".to_string()
}

fn default_download_api() -> String {
    "https://flacdl.simplemusic.app/api".to_string()
}

fn default_segment_api() -> String {
    "https://hifi.simplemusic.app/api".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Effective downloads directory: custom dir when configured, platform
    /// default otherwise.
    pub fn download_dir(&self) -> PathBuf {
        self.paths
            .download_dir
            .clone()
            .unwrap_or_else(platform::downloads_dir)
    }
}
