//! Track model shared by the whole acquisition pipeline.
//!
//! `TrackMetadata` is an immutable value: it is produced once (by the local
//! tag reader or a catalog search) and threaded through the pipeline
//! unchanged. Enrichment (resolving a catalog id, rebinding a local path)
//! always produces a new value via the `with_*` constructors.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One track's metadata as known to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    /// Expected duration in seconds. 0 when unknown.
    #[serde(default)]
    pub duration_secs: u32,
    /// International Standard Recording Code, when known.
    #[serde(default)]
    pub isrc: Option<String>,
    /// Cross-platform catalog track id (Spotify id), used for link resolution.
    #[serde(default)]
    pub catalog_id: Option<String>,
    /// Remote cover-art URL, when known.
    #[serde(default)]
    pub art_url: Option<String>,
    #[serde(default)]
    pub year: Option<u32>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub track_number: Option<u32>,
    #[serde(default)]
    pub disc_number: Option<u32>,
    /// Local backing file, when one is known to exist (or has existed).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl TrackMetadata {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: String::new(),
            duration_secs: 0,
            isrc: None,
            catalog_id: None,
            art_url: None,
            year: None,
            genre: None,
            track_number: None,
            disc_number: None,
            path: None,
        }
    }

    /// `"{artist} - {title}"`, the display name cache paths derive from.
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }

    /// New value with a resolved catalog id.
    pub fn with_catalog_id(&self, id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.catalog_id = Some(id.into());
        next
    }

    /// New value rebound to a local file.
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        let mut next = self.clone();
        next.path = Some(path.into());
        next
    }

    /// Identity for queue lookups: the backing path when present, else the
    /// display name. Used to re-find a track after unshuffling.
    pub fn identity(&self) -> String {
        match &self.path {
            Some(p) => p.to_string_lossy().into_owned(),
            None => self.display_name(),
        }
    }
}

/// Local metadata store boundary. The pipeline treats the library database
/// as a black box supplying and accepting `TrackMetadata`-shaped records.
pub trait SongStore: Send + Sync {
    fn song_by_path(&self, path: &Path) -> Option<TrackMetadata>;
    fn save_songs(&self, songs: &[TrackMetadata]) -> anyhow::Result<()>;
    fn update_play_count(&self, path: &Path) -> anyhow::Result<()>;
}
