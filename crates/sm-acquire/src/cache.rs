//! Deterministic cache and download paths.
//!
//! Paths derive from the track's `"{artist} - {title}"` display name,
//! sanitized and length-bounded, segregated by quality (the lossless cache
//! is distinct from the lossy one) and by purpose (ephemeral stream cache vs
//! the permanent user download directory). The filesystem is the source of
//! truth for "is this cached" — paths are computed on demand, never stored.

use sm_core::config::Config;
use sm_core::platform;
use std::path::PathBuf;
use tracing::debug;

/// Characters replaced with `_` in file names.
const ILLEGAL: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Display-name length bound, in characters.
const MAX_NAME_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheQuality {
    Lossless,
    Lossy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Ephemeral stream cache, cleared on demand.
    StreamCache,
    /// Permanent, user-visible download.
    Download,
}

/// Resolves cache/download paths for one configuration.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    download_dir: PathBuf,
    lossy_ext: String,
}

impl CacheLayout {
    pub fn new(config: &Config) -> Self {
        Self {
            download_dir: config.download_dir(),
            lossy_ext: config.acquisition.audio_format.clone(),
        }
    }

    /// Deterministic path for a display name at a quality and purpose.
    pub fn path(&self, display_name: &str, quality: CacheQuality, purpose: Purpose) -> PathBuf {
        let ext = match quality {
            CacheQuality::Lossless => "flac",
            CacheQuality::Lossy => self.lossy_ext.as_str(),
        };
        let dir = match (purpose, quality) {
            (Purpose::Download, _) => self.download_dir.clone(),
            (Purpose::StreamCache, CacheQuality::Lossless) => platform::lossless_cache_dir(),
            (Purpose::StreamCache, CacheQuality::Lossy) => platform::stream_cache_dir(),
        };
        dir.join(format!("{}.{}", sanitize_name(display_name), ext))
    }

    /// First existing cached file for a display name, lossless preferred.
    pub fn find_cached(&self, display_name: &str) -> Option<PathBuf> {
        for (quality, purpose) in [
            (CacheQuality::Lossless, Purpose::Download),
            (CacheQuality::Lossless, Purpose::StreamCache),
            (CacheQuality::Lossy, Purpose::Download),
            (CacheQuality::Lossy, Purpose::StreamCache),
        ] {
            let p = self.path(display_name, quality, purpose);
            if p.exists() {
                return Some(p);
            }
        }
        None
    }
}

/// Replace filesystem-illegal characters with `_` and bound the length.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if ILLEGAL.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    cleaned.chars().take(MAX_NAME_CHARS).collect()
}

/// Remove everything in the ephemeral stream cache. Returns how many files
/// went away.
pub async fn clear_stream_cache() -> anyhow::Result<usize> {
    let dir = platform::stream_cache_dir();
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().is_file() && tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    debug!("cleared {} files from stream cache", removed);
    Ok(removed)
}
