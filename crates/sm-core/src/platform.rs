//! Platform directory layout and external binary discovery.
//!
//! Downloads live in a `SimpleMusicDownloads` folder under the platform
//! download root; the ephemeral stream cache lives in `SimpleMusicCache`
//! inside the temp dir; the lossless cache is a parallel `SimpleMusicCache`
//! under the platform cache dir so it survives temp cleaning.

use std::path::PathBuf;

pub const DOWNLOADS_DIR_NAME: &str = "SimpleMusicDownloads";
pub const CACHE_DIR_NAME: &str = "SimpleMusicCache";

/// Persistent, user-visible downloads root.
pub fn downloads_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DOWNLOADS_DIR_NAME)
}

/// Ephemeral stream cache, cleared on demand.
pub fn stream_cache_dir() -> PathBuf {
    std::env::temp_dir().join(CACHE_DIR_NAME)
}

/// Lossless stream cache, parallel to the ephemeral one.
pub fn lossless_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(CACHE_DIR_NAME)
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("simplemusic")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("simplemusic")
    }
}

#[cfg(unix)]
fn yt_dlp_binary_names() -> &'static [&'static str] {
    &["yt-dlp", "yt-dlp_linux", "yt-dlp_macos"]
}

#[cfg(windows)]
fn yt_dlp_binary_names() -> &'static [&'static str] {
    &["yt-dlp.exe", "yt-dlp"]
}

#[cfg(unix)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg"]
}

#[cfg(windows)]
fn ffmpeg_binary_names() -> &'static [&'static str] {
    &["ffmpeg.exe", "ffmpeg"]
}

fn find_beside_exe(names: &[&str]) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    for name in names {
        let p = dir.join(name);
        if p.exists() {
            return Some(p);
        }
        let p = dir.join("external").join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    for dir in path.split(sep) {
        for name in names {
            let p = PathBuf::from(dir).join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}

/// Find the yt-dlp binary used for fallback extraction and search.
///
/// Searches in order:
/// 1. YT_DLP_PATH environment variable
/// 2. Beside the current executable (plus an `external/` subfolder)
/// 3. PATH
pub fn find_yt_dlp_binary() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("YT_DLP_PATH") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }
    if let Some(p) = find_beside_exe(yt_dlp_binary_names()) {
        return Some(p);
    }
    find_on_path(yt_dlp_binary_names())
}

/// Find ffmpeg for container conversion. FFMPEG_PATH overrides.
pub fn find_ffmpeg_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("FFMPEG_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }
    if let Some(p) = find_beside_exe(ffmpeg_binary_names()) {
        return Some(p);
    }
    find_on_path(ffmpeg_binary_names())
}
