//! Post-download tag writing using lofty.
//!
//! Tagging is best-effort everywhere: failure to fetch art or to write tags
//! is logged and swallowed, and must never abort a playback or download
//! flow. Successful writes signal the UI-facing art cache to invalidate its
//! entry for that path.

use anyhow::{Context, Result};
use lofty::config::WriteOptions;
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag, TagType};
use reqwest::Client;
use sm_core::song::TrackMetadata;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Art-cache invalidation events; subscribers drop their cached art for the
/// path they receive.
pub type ArtInvalidation = broadcast::Sender<PathBuf>;

pub fn art_invalidation_channel() -> ArtInvalidation {
    broadcast::channel(64).0
}

/// Best-effort tagging entry point. Never returns an error.
pub async fn tag_file(
    client: &Client,
    path: &Path,
    meta: &TrackMetadata,
    invalidation: &ArtInvalidation,
) {
    let art = match meta.art_url.as_deref() {
        Some(url) => match crate::api::fetch_image(client, url).await {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!("cover art fetch failed for {}: {}", meta.display_name(), e);
                None
            }
        },
        None => None,
    };

    match write_tags(path, meta, art).await {
        Ok(()) => {
            debug!("tagged {}", path.display());
            // Nobody listening is fine.
            let _ = invalidation.send(path.to_path_buf());
        }
        Err(e) => warn!("tag write failed for {}: {}", path.display(), e),
    }
}

/// Write title/artist/album/year/genre/track/disc/art into the file's
/// metadata container.
pub async fn write_tags(
    path: &Path,
    meta: &TrackMetadata,
    art: Option<(Vec<u8>, String)>,
) -> Result<()> {
    let path = path.to_path_buf();
    let meta = meta.clone();
    tokio::task::spawn_blocking(move || write_tags_blocking(&path, &meta, art))
        .await
        .context("tag writing task failed")??;
    Ok(())
}

fn write_tags_blocking(
    path: &Path,
    meta: &TrackMetadata,
    art: Option<(Vec<u8>, String)>,
) -> Result<()> {
    let tagged_file = Probe::open(path)?.read().context("failed to read audio file")?;

    let tag_type = guess_tag_type(path)?;
    let mut tag = tagged_file
        .primary_tag()
        .cloned()
        .unwrap_or_else(|| Tag::new(tag_type));

    tag.insert_text(ItemKey::TrackTitle, meta.title.clone());
    tag.insert_text(ItemKey::TrackArtist, meta.artist.clone());
    if !meta.album.is_empty() {
        tag.insert_text(ItemKey::AlbumTitle, meta.album.clone());
    }
    if let Some(year) = meta.year {
        tag.insert_text(ItemKey::Year, year.to_string());
    }
    if let Some(genre) = &meta.genre {
        tag.insert_text(ItemKey::Genre, genre.clone());
    }
    if let Some(track) = meta.track_number {
        tag.insert_text(ItemKey::TrackNumber, track.to_string());
    }
    if let Some(disc) = meta.disc_number {
        tag.insert_text(ItemKey::DiscNumber, disc.to_string());
    }

    if let Some((data, content_type)) = art {
        let picture = Picture::new_unchecked(
            PictureType::CoverFront,
            Some(guess_mime_type(&content_type)),
            None,
            data,
        );
        tag.push_picture(picture);
    }

    tag.save_to_path(path, WriteOptions::default())
        .context("failed to save tags to file")?;
    Ok(())
}

fn guess_tag_type(path: &Path) -> Result<TagType> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "mp3" => Ok(TagType::Id3v2),
        "m4a" | "mp4" | "aac" => Ok(TagType::Mp4Ilst),
        "flac" | "ogg" | "opus" => Ok(TagType::VorbisComments),
        "wav" => Ok(TagType::RiffInfo),
        _ => anyhow::bail!("unsupported audio format: {}", ext),
    }
}

fn guess_mime_type(content_type: &str) -> MimeType {
    if content_type.contains("png") {
        MimeType::Png
    } else if content_type.contains("gif") {
        MimeType::Gif
    } else if content_type.contains("bmp") {
        MimeType::Bmp
    } else {
        MimeType::Jpeg
    }
}

/// Tags read back from a file (round-trip verification).
#[derive(Debug, Clone)]
pub struct ReadTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<String>,
    pub genre: Option<String>,
    pub has_picture: bool,
}

pub fn read_tags(path: &Path) -> Result<ReadTags> {
    let tagged_file = Probe::open(path)?.read().context("failed to read audio file")?;
    let tag = tagged_file.primary_tag().context("no metadata tag found")?;

    let get = |key: &ItemKey| tag.get_string(key).map(str::to_string);
    Ok(ReadTags {
        title: get(&ItemKey::TrackTitle),
        artist: get(&ItemKey::TrackArtist),
        album: get(&ItemKey::AlbumTitle),
        year: get(&ItemKey::Year),
        genre: get(&ItemKey::Genre),
        has_picture: !tag.pictures().is_empty(),
    })
}
