//! Lossless acquisition across the high-fidelity providers.
//!
//! Given a track with (or resolvable to) a cross-platform catalog id, the
//! engine resolves per-provider URLs through the rate-limited
//! link-resolution API, then walks an ordered list of attempts until one
//! produces a file: Tidal at the top quality tier, Deezer direct, Tidal at
//! the lower tier. Qobuz is probed for availability only — it has no
//! download path and never fails the operation. Attempts are strictly
//! sequential; providers are never raced.

use reqwest::Client;
use sm_core::song::TrackMetadata;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::api::{self, StreamingLinks};
use crate::cache::{CacheLayout, CacheQuality, Purpose};
use crate::error::AcquireError;
use crate::manifest::{self, TrackBody};
use crate::orchestrator::{Acquired, Provider, Quality};
use crate::ratelimit::RateLimiter;

/// Ordered attempt plan. Adding or removing a provider is a data change.
const ATTEMPTS: [Step; 3] = [Step::Tidal("LOSSLESS"), Step::Deezer, Step::Tidal("HIGH")];

#[derive(Debug, Clone, Copy)]
enum Step {
    Tidal(&'static str),
    Deezer,
}

pub struct LosslessEngine {
    client: Client,
    limiter: Arc<RateLimiter>,
    link_api: String,
    track_api: String,
    download_api: String,
    segment_api: String,
    layout: CacheLayout,
}

impl LosslessEngine {
    pub fn new(
        client: Client,
        limiter: Arc<RateLimiter>,
        providers: &sm_core::config::ProvidersConfig,
        layout: CacheLayout,
    ) -> Self {
        Self {
            client,
            limiter,
            link_api: providers.link_api.clone(),
            track_api: providers.track_api.clone(),
            download_api: providers.download_api.clone(),
            segment_api: providers.segment_api.clone(),
            layout,
        }
    }

    /// Acquire a lossless file for `meta` into the given purpose's cache.
    /// Returns the enriched metadata alongside the file for tagging.
    pub async fn acquire(
        &self,
        meta: &TrackMetadata,
        purpose: Purpose,
    ) -> Result<Acquired, AcquireError> {
        let canonical = match self.canonical_url(meta).await {
            Some(url) => url,
            None => {
                debug!("no catalog identity resolvable for {}", meta.display_name());
                return Err(AcquireError::Exhausted);
            }
        };

        let links =
            match api::resolve_links(&self.client, &self.link_api, &self.limiter, &canonical).await
            {
                Ok(links) => links,
                Err(e) => {
                    warn!("link resolution failed for {}: {}", meta.display_name(), e);
                    return Err(AcquireError::Exhausted);
                }
            };

        let dest = self
            .layout
            .path(&meta.display_name(), CacheQuality::Lossless, purpose);

        for step in ATTEMPTS {
            let outcome = match step {
                Step::Tidal(tier) => self.try_tidal(&links, tier, &dest, meta).await,
                Step::Deezer => self.try_deezer(&links, &dest, meta).await,
            };
            match outcome {
                Ok(acquired) => {
                    info!(
                        "lossless acquisition succeeded via {:?} for {}",
                        acquired.provider,
                        meta.display_name()
                    );
                    return Ok(acquired);
                }
                Err(e) => debug!("attempt {:?} failed: {}", step, e),
            }
        }

        // Diagnostic probe only; a request here must not fail the operation.
        if let (Some(isrc), Some(qobuz)) = (meta.isrc.as_deref(), links.qobuz.as_deref()) {
            api::probe_qobuz(&self.client, qobuz, isrc).await;
        }

        Err(AcquireError::Exhausted)
    }

    /// Canonical track URL for link resolution: the known catalog id when
    /// present, otherwise a catalog search by ISRC or artist/title.
    async fn canonical_url(&self, meta: &TrackMetadata) -> Option<String> {
        if let Some(id) = meta.catalog_id.as_deref().filter(|s| !s.is_empty()) {
            return Some(format!("https://open.spotify.com/track/{}", id));
        }
        api::catalog_url_for(&self.client, &self.track_api, meta).await
    }

    async fn try_tidal(
        &self,
        links: &StreamingLinks,
        tier: &'static str,
        dest: &Path,
        meta: &TrackMetadata,
    ) -> Result<Acquired, AcquireError> {
        let url = links
            .tidal
            .as_deref()
            .ok_or_else(|| AcquireError::no_source("tidal", "no link resolved"))?;
        let id = api::track_id_from_url(url)
            .ok_or_else(|| AcquireError::no_source("tidal", format!("no track id in {}", url)))?;

        let body = api::fetch_track_body(&self.client, &self.segment_api, id, tier)
            .await
            .map_err(|e| AcquireError::no_source("tidal", e.to_string()))?;

        match manifest::sniff_track_body(&body) {
            TrackBody::DirectUrl(direct) => {
                api::download_url_to(&self.client, &direct, dest)
                    .await
                    .map_err(|e| AcquireError::Download(e.to_string()))?;
            }
            TrackBody::Manifest(doc) => {
                let segments =
                    manifest::decode(&doc).map_err(|e| AcquireError::Download(e.to_string()))?;
                self.assemble_segments(&segments, dest).await?;
            }
            TrackBody::Unrecognized => {
                return Err(AcquireError::no_source("tidal", "unrecognized response body"));
            }
        }

        let quality = match tier {
            "LOSSLESS" => Quality::Lossless,
            "HIGH" => Quality::High,
            _ => Quality::Low,
        };
        Ok(Acquired {
            path: dest.to_path_buf(),
            provider: Provider::Tidal,
            quality,
            meta: meta.clone(),
        })
    }

    async fn try_deezer(
        &self,
        links: &StreamingLinks,
        dest: &Path,
        meta: &TrackMetadata,
    ) -> Result<Acquired, AcquireError> {
        let url = links
            .deezer
            .as_deref()
            .ok_or_else(|| AcquireError::no_source("deezer", "no link resolved"))?;
        let id = api::track_id_from_url(url)
            .ok_or_else(|| AcquireError::no_source("deezer", format!("no track id in {}", url)))?;

        let catalog = api::fetch_catalog_track(&self.client, &self.track_api, id)
            .await
            .map_err(|e| AcquireError::no_source("deezer", e.to_string()))?;
        let enriched = catalog.enrich(meta);

        let flac_url = api::fetch_flac_url(&self.client, &self.download_api, id)
            .await
            .map_err(|e| AcquireError::no_source("deezer", e.to_string()))?
            .ok_or_else(|| AcquireError::no_source("deezer", "no lossless link for track"))?;

        api::download_url_to(&self.client, &flac_url, dest)
            .await
            .map_err(|e| AcquireError::Download(e.to_string()))?;

        Ok(Acquired {
            path: dest.to_path_buf(),
            provider: Provider::Deezer,
            quality: Quality::Lossless,
            meta: enriched,
        })
    }

    /// Fetch every segment in list order and concatenate byte-for-byte into
    /// a temporary container, then convert (codec copy) into the target.
    /// Out-of-order or partial segment sets would produce a corrupt file;
    /// there is no checksum verification here.
    async fn assemble_segments(&self, segments: &[String], dest: &Path) -> Result<(), AcquireError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = dest.with_extension("raw.mp4");

        let mut file = tokio::fs::File::create(&raw).await?;
        for (i, url) in segments.iter().enumerate() {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| AcquireError::Download(format!("segment {} failed: {}", i, e)))?;
            if !response.status().is_success() {
                return Err(AcquireError::Download(format!(
                    "segment {} returned {}",
                    i,
                    response.status()
                )));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| AcquireError::Download(format!("segment {} truncated: {}", i, e)))?;
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        drop(file);

        convert_copy(&raw, dest).await?;
        Ok(())
    }
}

/// Repackage the raw concatenation into the target container without
/// re-encoding. When no conversion tooling is available, fall back to
/// renaming the raw file — always produce something playable-or-renamable
/// rather than fail outright.
async fn convert_copy(input: &Path, output: &Path) -> Result<(), AcquireError> {
    let Some(ffmpeg) = sm_core::platform::find_ffmpeg_binary() else {
        warn!("ffmpeg unavailable, keeping raw container as {}", output.display());
        tokio::fs::rename(input, output).await?;
        return Ok(());
    };

    let status = tokio::process::Command::new(ffmpeg)
        .arg("-i")
        .arg(input)
        .arg("-c:a")
        .arg("copy")
        .arg("-y")
        .arg(output)
        .status()
        .await
        .map_err(|e| AcquireError::Download(format!("failed to spawn ffmpeg: {}", e)))?;

    if !status.success() {
        // Keep the raw bytes rather than failing the whole acquisition.
        warn!("ffmpeg copy-codec conversion failed, renaming raw container");
        tokio::fs::rename(input, output).await?;
        return Ok(());
    }

    tokio::fs::remove_file(input).await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit;
    use sm_core::config::ProvidersConfig;

    fn offline_engine(dir: &Path) -> LosslessEngine {
        let mut config = sm_core::config::Config::default();
        config.paths.download_dir = Some(dir.to_path_buf());
        // Unroutable bases: every network step fails fast.
        let providers = ProvidersConfig {
            link_api: "http://127.0.0.1:9/links".into(),
            track_api: "http://127.0.0.1:9".into(),
            download_api: "http://127.0.0.1:9".into(),
            segment_api: "http://127.0.0.1:9".into(),
        };
        LosslessEngine::new(
            Client::new(),
            Arc::new(ratelimit::RateLimiter::new(
                100,
                std::time::Duration::from_secs(60),
                std::time::Duration::ZERO,
            )),
            &providers,
            CacheLayout::new(&config),
        )
    }

    #[tokio::test]
    async fn unreachable_providers_exhaust_with_canonical_message() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = offline_engine(dir.path());

        let meta = TrackMetadata::new("Test Song", "Test Artist");
        let err = engine.acquire(&meta, Purpose::StreamCache).await.unwrap_err();
        assert_eq!(err.to_string(), "Could not find track on any platform");
    }

    #[tokio::test]
    async fn known_catalog_id_still_exhausts_when_links_unreachable() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = offline_engine(dir.path());

        let meta = TrackMetadata::new("Test Song", "Test Artist")
            .with_catalog_id("4uLU6hMCjMI75M1A2tKUQC");
        let err = engine.acquire(&meta, Purpose::StreamCache).await.unwrap_err();
        assert_eq!(err.to_string(), "Could not find track on any platform");
    }
}
