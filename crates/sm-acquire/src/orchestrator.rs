//! The smart download service.
//!
//! Composes resolver, lossless engine, fallback engine and the cache/tag
//! layer into one policy: try lossless if configured, else go straight to
//! the fallback. Exposes stream-and-play, background preload, library
//! download and batch operations. Lower layers never panic across this
//! boundary; everything surfaces as `Result<Acquired, AcquireError>`.

use reqwest::Client;
use sm_core::config::Config;
use sm_core::song::{SongStore, TrackMetadata};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayout, CacheQuality, Purpose};
use crate::error::AcquireError;
use crate::fallback::{self, DownloadProgress, FallbackDownloader};
use crate::lossless::LosslessEngine;
use crate::ratelimit;
use crate::resolver::TrackResolver;
use crate::tag::{self, ArtInvalidation};

/// Which backend satisfied an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// A file already present in a cache or the download directory.
    Cached,
    Tidal,
    Deezer,
    YouTube,
}

/// Quality tier the file was obtained at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Lossless,
    High,
    Low,
    Lossy,
}

/// Terminal result of one acquisition; never partially populated.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub path: PathBuf,
    pub provider: Provider,
    pub quality: Quality,
    /// Metadata, possibly enriched along the way (new value, input is
    /// never mutated).
    pub meta: TrackMetadata,
}

impl Acquired {
    pub fn is_lossless(&self) -> bool {
        self.quality == Quality::Lossless
    }
}

/// Download status for the UI surfaces that report one.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadStatus {
    NotDownloaded,
    /// Fractional progress, 0.0–1.0.
    Downloading(f32),
    Downloaded(PathBuf),
    Failed(String),
}

/// Acquisition seam the playback queue depends on; mockable in tests.
#[async_trait::async_trait]
pub trait TrackSource: Send + Sync {
    async fn acquire_for_playback(&self, meta: &TrackMetadata)
        -> Result<Acquired, AcquireError>;
    fn cached_path(&self, meta: &TrackMetadata) -> Option<PathBuf>;
}

pub struct SmartDownloader {
    prefer_lossless: bool,
    client: Client,
    layout: CacheLayout,
    resolver: TrackResolver,
    lossless: LosslessEngine,
    fallback: Box<dyn FallbackDownloader>,
    store: Option<Arc<dyn SongStore>>,
    statuses: Mutex<HashMap<String, DownloadStatus>>,
    art_invalidation: ArtInvalidation,
}

impl SmartDownloader {
    pub fn new(config: &Config, store: Option<Arc<dyn SongStore>>) -> Self {
        let client = Client::new();
        let layout = CacheLayout::new(config);
        let limiter = Arc::new(ratelimit::link_api_limiter());
        let yt_dlp = config
            .acquisition
            .yt_dlp_path
            .clone()
            .or_else(sm_core::platform::find_yt_dlp_binary);

        Self {
            prefer_lossless: config.acquisition.prefer_lossless,
            resolver: TrackResolver::new(yt_dlp.clone()),
            lossless: LosslessEngine::new(
                client.clone(),
                limiter,
                &config.providers,
                layout.clone(),
            ),
            fallback: fallback::select_downloader(
                yt_dlp,
                &config.acquisition.audio_format,
                &client,
            ),
            layout,
            client,
            store,
            statuses: Mutex::new(HashMap::new()),
            art_invalidation: tag::art_invalidation_channel(),
        }
    }

    /// UI-facing art caches subscribe here and drop entries for paths that
    /// get re-tagged.
    pub fn subscribe_art_invalidation(&self) -> tokio::sync::broadcast::Receiver<PathBuf> {
        self.art_invalidation.subscribe()
    }

    /// Acquire a playable file into the stream cache, or reuse a cached
    /// one. Used for both playback and JIT re-acquisition.
    pub async fn stream_for_playback(
        &self,
        meta: &TrackMetadata,
    ) -> Result<Acquired, AcquireError> {
        self.acquire(meta, Purpose::StreamCache, None).await
    }

    /// Fire-and-forget background acquisition. Every error is caught and
    /// logged inside the spawned task, never propagated to the caller.
    pub fn preload(self: &Arc<Self>, meta: TrackMetadata) {
        if self.cached_path(&meta).is_some() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            debug!("preloading {}", meta.display_name());
            if let Err(e) = this.stream_for_playback(&meta).await {
                warn!("preload failed for {}: {}", meta.display_name(), e);
            }
        });
    }

    /// Download into the permanent library directory and persist the song
    /// record. Progress is observable through [`Self::status`].
    pub async fn download_to_library(
        &self,
        meta: &TrackMetadata,
    ) -> Result<Acquired, AcquireError> {
        let key = meta.display_name();
        self.set_status(&key, DownloadStatus::Downloading(0.0));

        let result = self.acquire(meta, Purpose::Download, Some(&key)).await;
        match &result {
            Ok(acquired) => {
                self.set_status(&key, DownloadStatus::Downloaded(acquired.path.clone()));
                if let Some(store) = &self.store {
                    let record = acquired.meta.with_path(&acquired.path);
                    if let Err(e) = store.save_songs(&[record]) {
                        warn!("failed to persist song record: {}", e);
                    }
                }
            }
            Err(e) => self.set_status(&key, DownloadStatus::Failed(e.to_string())),
        }
        result
    }

    /// Sequential batch download; one failed track never aborts the rest.
    pub async fn download_batch(
        &self,
        metas: &[TrackMetadata],
    ) -> Vec<Result<Acquired, AcquireError>> {
        let mut results = Vec::with_capacity(metas.len());
        for meta in metas {
            results.push(self.download_to_library(meta).await);
        }
        results
    }

    pub fn status(&self, key: &str) -> DownloadStatus {
        self.lock_statuses()
            .get(key)
            .cloned()
            .unwrap_or(DownloadStatus::NotDownloaded)
    }

    /// One policy for every entry point: cache hit, then lossless when
    /// configured, then the video-hosting fallback.
    async fn acquire(
        &self,
        meta: &TrackMetadata,
        purpose: Purpose,
        status_key: Option<&str>,
    ) -> Result<Acquired, AcquireError> {
        if purpose == Purpose::StreamCache {
            if let Some(path) = self.layout.find_cached(&meta.display_name()) {
                debug!("cache hit for {}", meta.display_name());
                let quality = if path.extension().is_some_and(|e| e == "flac") {
                    Quality::Lossless
                } else {
                    Quality::Lossy
                };
                return Ok(Acquired {
                    path,
                    provider: Provider::Cached,
                    quality,
                    meta: meta.clone(),
                });
            }
        }

        if self.prefer_lossless {
            match self.lossless.acquire(meta, purpose).await {
                Ok(acquired) => {
                    tag::tag_file(
                        &self.client,
                        &acquired.path,
                        &acquired.meta,
                        &self.art_invalidation,
                    )
                    .await;
                    return Ok(acquired);
                }
                Err(e) => info!(
                    "lossless chain failed for {}, falling back: {}",
                    meta.display_name(),
                    e
                ),
            }
        }

        self.acquire_fallback(meta, purpose, status_key).await
    }

    async fn acquire_fallback(
        &self,
        meta: &TrackMetadata,
        purpose: Purpose,
        status_key: Option<&str>,
    ) -> Result<Acquired, AcquireError> {
        let candidates = self.resolver.find_best_matches(meta).await;
        let Some(best) = candidates.first() else {
            return Err(AcquireError::Exhausted);
        };
        debug!(
            "best match for {}: {} ({})",
            meta.display_name(),
            best.title,
            best.duration_display()
        );

        let dest = self
            .layout
            .path(&meta.display_name(), CacheQuality::Lossy, purpose);

        // Drive the download while draining progress into the status map.
        // The pinned future borrows `dest`; keep it scoped so the path can
        // be moved into the result afterwards.
        let ok = {
            let (tx, mut rx) = mpsc::channel(32);
            let download = self.fallback.download(&best.url, &dest, tx);
            tokio::pin!(download);
            loop {
                tokio::select! {
                    done = &mut download => break done,
                    event = rx.recv() => {
                        if let (Some(DownloadProgress::Downloading(frac)), Some(key)) =
                            (event, status_key)
                        {
                            self.set_status(key, DownloadStatus::Downloading(frac));
                        }
                    }
                }
            }
        };

        if !ok {
            return Err(AcquireError::Download(format!(
                "fallback extraction failed for {}",
                best.url
            )));
        }

        tag::tag_file(&self.client, &dest, meta, &self.art_invalidation).await;
        Ok(Acquired {
            path: dest,
            provider: Provider::YouTube,
            quality: Quality::Lossy,
            meta: meta.clone(),
        })
    }

    fn set_status(&self, key: &str, status: DownloadStatus) {
        self.lock_statuses().insert(key.to_string(), status);
    }

    fn lock_statuses(&self) -> MutexGuard<'_, HashMap<String, DownloadStatus>> {
        match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait::async_trait]
impl TrackSource for SmartDownloader {
    async fn acquire_for_playback(
        &self,
        meta: &TrackMetadata,
    ) -> Result<Acquired, AcquireError> {
        self.stream_for_playback(meta).await
    }

    fn cached_path(&self, meta: &TrackMetadata) -> Option<PathBuf> {
        self.layout.find_cached(&meta.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.paths.download_dir = Some(dir.to_path_buf());
        config.providers.link_api = "http://127.0.0.1:9/links".into();
        config.providers.track_api = "http://127.0.0.1:9".into();
        config.providers.download_api = "http://127.0.0.1:9".into();
        config.providers.segment_api = "http://127.0.0.1:9".into();
        config.acquisition.yt_dlp_path = Some(PathBuf::from("/nonexistent/yt-dlp"));
        config
    }

    #[tokio::test]
    async fn no_candidates_means_exhausted() {
        let dir = tempfile::TempDir::new().unwrap();
        let downloader = SmartDownloader::new(&offline_config(dir.path()), None);

        let meta = TrackMetadata::new("Test Song", "Test Artist");
        let err = downloader.stream_for_playback(&meta).await.unwrap_err();
        assert_eq!(err.to_string(), "Could not find track on any platform");
    }

    #[tokio::test]
    async fn library_failure_is_recorded_in_status_map() {
        let dir = tempfile::TempDir::new().unwrap();
        let downloader = SmartDownloader::new(&offline_config(dir.path()), None);

        let meta = TrackMetadata::new("Test Song", "Test Artist");
        assert_eq!(downloader.status(&meta.display_name()), DownloadStatus::NotDownloaded);
        let _ = downloader.download_to_library(&meta).await;
        assert!(matches!(
            downloader.status(&meta.display_name()),
            DownloadStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let downloader = SmartDownloader::new(&offline_config(dir.path()), None);

        let metas = vec![
            TrackMetadata::new("One", "A"),
            TrackMetadata::new("Two", "B"),
        ];
        let results = downloader.download_batch(&metas).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_err()));
    }
}
