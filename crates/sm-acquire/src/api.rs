//! Provider HTTP clients for the lossless chain.
//!
//! Four distinct services, all JSON over GET:
//! - link-resolution API: canonical track URL -> per-provider URLs
//! - catalog (Deezer-shaped): track lookup by id, search by ISRC or text
//! - direct-download lookup: numeric id -> `{success, links: {flac}}`
//! - segment/track API (Tidal-shaped): id + quality tier -> sniffable body
//!
//! Non-200s and malformed JSON are soft failures here: the functions bail
//! with context and the lossless engine treats that as "move on".

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use sm_core::song::TrackMetadata;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::ratelimit::{RateLimiter, BACKOFF_429};

/// Per-provider URLs resolved from one cross-platform identifier.
/// Lifetime: a single acquisition attempt.
#[derive(Debug, Clone, Default)]
pub struct StreamingLinks {
    /// High-fidelity segmented provider (quality tiers + manifests).
    pub tidal: Option<String>,
    /// High-fidelity direct provider (track lookup + flac link).
    pub deezer: Option<String>,
    /// Informational only; no download path.
    pub qobuz: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinkResponse {
    #[serde(rename = "linksByPlatform", default)]
    links_by_platform: std::collections::HashMap<String, PlatformLink>,
}

#[derive(Debug, Deserialize)]
struct PlatformLink {
    url: String,
}

/// Resolve per-provider URLs for a canonical track URL through the
/// rate-limited link-resolution API. Re-acquires a slot and retries once
/// after the fixed 429 backoff; the limiter itself never sees HTTP status.
pub async fn resolve_links(
    client: &Client,
    api_base: &str,
    limiter: &RateLimiter,
    canonical_url: &str,
) -> Result<StreamingLinks> {
    limiter.acquire().await;
    let mut response = client
        .get(api_base)
        .query(&[("url", canonical_url)])
        .send()
        .await
        .context("link-resolution request failed")?;

    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        warn!("link-resolution API rate limited us, backing off {:?}", BACKOFF_429);
        tokio::time::sleep(BACKOFF_429).await;
        limiter.acquire().await;
        response = client
            .get(api_base)
            .query(&[("url", canonical_url)])
            .send()
            .await
            .context("link-resolution retry failed")?;
    }

    if !response.status().is_success() {
        bail!("link-resolution API returned {}", response.status());
    }

    let body: LinkResponse = response
        .json()
        .await
        .context("link-resolution response was not valid JSON")?;

    let url_for = |key: &str| body.links_by_platform.get(key).map(|l| l.url.clone());
    let links = StreamingLinks {
        tidal: url_for("tidal"),
        deezer: url_for("deezer"),
        qobuz: url_for("qobuz"),
    };
    debug!(
        "resolved links: tidal={} deezer={} qobuz={}",
        links.tidal.is_some(),
        links.deezer.is_some(),
        links.qobuz.is_some()
    );
    Ok(links)
}

// ── Catalog (Deezer-shaped) ──────────────────────────────────────────────────

/// Track record from the catalog lookup API.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogTrack {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub duration: u32,
    #[serde(default)]
    pub track_position: Option<u32>,
    pub artist: CatalogArtist,
    pub album: CatalogAlbum,
    #[serde(default)]
    pub release_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogArtist {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogAlbum {
    pub title: String,
    #[serde(default)]
    pub cover_xl: Option<String>,
}

impl CatalogTrack {
    /// Enrich pipeline metadata with catalog fields, producing a new value.
    pub fn enrich(&self, meta: &TrackMetadata) -> TrackMetadata {
        let mut next = meta.clone();
        if next.album.is_empty() {
            next.album = self.album.title.clone();
        }
        if next.isrc.is_none() {
            next.isrc = self.isrc.clone();
        }
        if next.art_url.is_none() {
            next.art_url = self.album.cover_xl.clone();
        }
        if next.track_number.is_none() {
            next.track_number = self.track_position;
        }
        if next.year.is_none() {
            next.year = self
                .release_date
                .as_deref()
                .and_then(|d| d.split('-').next())
                .and_then(|y| y.parse().ok());
        }
        next
    }
}

pub async fn fetch_catalog_track(client: &Client, api_base: &str, id: u64) -> Result<CatalogTrack> {
    let url = format!("{}/track/{}", api_base.trim_end_matches('/'), id);
    let response = client.get(&url).send().await.context("track lookup failed")?;
    if !response.status().is_success() {
        bail!("track lookup returned {}", response.status());
    }
    response.json().await.context("track lookup response malformed")
}

#[derive(Debug, Deserialize)]
struct CatalogSearchPage {
    #[serde(default)]
    data: Vec<CatalogSearchHit>,
}

#[derive(Debug, Deserialize)]
struct CatalogSearchHit {
    link: String,
}

/// Find a canonical catalog URL for a track that has no cross-platform id:
/// exact ISRC lookup first, then an artist/title search.
pub async fn catalog_url_for(client: &Client, api_base: &str, meta: &TrackMetadata) -> Option<String> {
    let base = api_base.trim_end_matches('/');

    if let Some(isrc) = meta.isrc.as_deref().filter(|s| !s.is_empty()) {
        let url = format!("{}/track/isrc:{}", base, isrc);
        match client.get(&url).send().await {
            Ok(r) if r.status().is_success() => {
                if let Ok(track) = r.json::<CatalogTrack>().await {
                    return Some(format!("https://www.deezer.com/track/{}", track.id));
                }
            }
            Ok(r) => debug!("ISRC catalog lookup returned {}", r.status()),
            Err(e) => warn!("ISRC catalog lookup failed: {}", e),
        }
    }

    let query = format!("artist:\"{}\" track:\"{}\"", meta.artist, meta.title);
    let url = format!("{}/search", base);
    match client.get(&url).query(&[("q", query.as_str())]).send().await {
        Ok(r) if r.status().is_success() => r
            .json::<CatalogSearchPage>()
            .await
            .ok()
            .and_then(|page| page.data.into_iter().next())
            .map(|hit| hit.link),
        Ok(r) => {
            debug!("catalog search returned {}", r.status());
            None
        }
        Err(e) => {
            warn!("catalog search failed: {}", e);
            None
        }
    }
}

// ── Direct-download lookup ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DownloadLookup {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    links: DownloadLinks,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadLinks {
    #[serde(default)]
    flac: Option<String>,
}

/// Direct FLAC URL for a catalog track id, when the mirror has one.
pub async fn fetch_flac_url(client: &Client, api_base: &str, id: u64) -> Result<Option<String>> {
    let url = format!("{}/track/{}", api_base.trim_end_matches('/'), id);
    let response = client.get(&url).send().await.context("download lookup failed")?;
    if !response.status().is_success() {
        bail!("download lookup returned {}", response.status());
    }
    let body: DownloadLookup = response
        .json()
        .await
        .context("download lookup response malformed")?;
    Ok(body.success.then_some(body.links.flac).flatten())
}

// ── Segment/track API (Tidal-shaped) ─────────────────────────────────────────

/// Quality tiers the segment/track API understands.
pub const QUALITY_TIERS: [&str; 3] = ["LOSSLESS", "HIGH", "LOW"];

/// Raw response body for a track at a quality tier; run it through
/// [`crate::manifest::sniff_track_body`].
pub async fn fetch_track_body(
    client: &Client,
    api_base: &str,
    id: u64,
    quality: &str,
) -> Result<String> {
    let url = format!("{}/track/{}", api_base.trim_end_matches('/'), id);
    let response = client
        .get(&url)
        .query(&[("quality", quality)])
        .send()
        .await
        .context("segment API request failed")?;
    if !response.status().is_success() {
        bail!("segment API returned {}", response.status());
    }
    response.text().await.context("segment API body unreadable")
}

/// Availability probe against the informational provider. Logged only;
/// never treated as a failure of the surrounding operation.
pub async fn probe_qobuz(client: &Client, url: &str, isrc: &str) {
    match client.get(url).send().await {
        Ok(r) => info!("qobuz availability for isrc {}: {}", isrc, r.status()),
        Err(e) => info!("qobuz availability check failed for isrc {}: {}", isrc, e),
    }
}

// ── Shared download plumbing ─────────────────────────────────────────────────

/// Numeric track id embedded in a provider URL (`.../track/123456`).
pub fn track_id_from_url(url: &str) -> Option<u64> {
    let re = Regex::new(r"/track/(\d+)").ok()?;
    re.captures(url)?.get(1)?.as_str().parse().ok()
}

/// Stream a URL to a file, creating parent directories first.
pub async fn download_url_to(client: &Client, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let response = client.get(url).send().await.context("download request failed")?;
    if !response.status().is_success() {
        bail!("download returned {}", response.status());
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download stream interrupted")?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Fetch cover art bytes and their content type.
pub async fn fetch_image(client: &Client, url: &str) -> Result<(Vec<u8>, String)> {
    let response = client.get(url).send().await.context("failed to fetch image")?;
    if !response.status().is_success() {
        bail!("image fetch returned {}", response.status());
    }
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/jpeg")
        .to_string();
    let data = response.bytes().await.context("failed to read image data")?.to_vec();
    Ok((data, content_type))
}
