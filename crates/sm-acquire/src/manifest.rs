//! Segmented-media manifest decoding.
//!
//! The segment/track API answers in one of three shapes: a JSON object with
//! a direct URL field, a JSON object carrying a base64-encoded manifest
//! (itself JSON-with-urls or a DASH timeline), or a raw DASH document.
//! `sniff_track_body` disambiguates by the leading bytes; `decode` turns a
//! manifest document into the ordered list of segment URLs that, fetched in
//! order and concatenated byte-for-byte, reconstitute one playable
//! container. Both are pure functions.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use tracing::warn;

/// Segment count used when a manifest has duration attributes but no
/// timeline. Known-fragile heuristic; kept to match provider behavior.
const ESTIMATED_SEGMENT_CAP: usize = 200;

/// Decoded shape of a segment/track API response body.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackBody {
    /// Complete audio file at this URL.
    DirectUrl(String),
    /// A manifest document (JSON-with-urls or DASH XML) to run through
    /// [`decode`].
    Manifest(String),
    Unrecognized,
}

/// Sniff a track API response body.
///
/// XML first (leading `<`), then JSON branching on which known field is
/// present. Base64-embedded manifests are decoded here so callers only ever
/// see plain documents.
pub fn sniff_track_body(body: &str) -> TrackBody {
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        return TrackBody::Manifest(body.to_string());
    }

    let json: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => return TrackBody::Unrecognized,
    };

    for key in ["url", "OriginalTrackUrl"] {
        if let Some(url) = json.get(key).and_then(|v| v.as_str()) {
            return TrackBody::DirectUrl(url.to_string());
        }
    }

    if let Some(b64) = json.get("manifest").and_then(|v| v.as_str()) {
        if let Ok(bytes) = BASE64.decode(b64.trim()) {
            return TrackBody::Manifest(String::from_utf8_lossy(&bytes).into_owned());
        }
    }

    // Some responses nest the payload one level down.
    if let Some(inner) = json.get("data") {
        if let Some(url) = inner.get("url").and_then(|v| v.as_str()) {
            return TrackBody::DirectUrl(url.to_string());
        }
    }

    TrackBody::Unrecognized
}

/// Decode a manifest document into an ordered fetch list, initialization
/// segment first. Idempotent: re-decoding the same document yields the same
/// list.
pub fn decode(document: &str) -> Result<Vec<String>> {
    let trimmed = document.trim_start();

    // JSON-with-urls form: the manifest references complete file URLs.
    if trimmed.starts_with('{') {
        let json: serde_json::Value =
            serde_json::from_str(trimmed).context("manifest is neither XML nor valid JSON")?;
        if let Some(urls) = json.get("urls").and_then(|u| u.as_array()) {
            let list: Vec<String> = urls
                .iter()
                .filter_map(|u| u.as_str().map(str::to_string))
                .collect();
            if list.is_empty() {
                bail!("manifest has an empty urls array");
            }
            return Ok(list);
        }
        bail!("JSON manifest without a urls array");
    }

    if trimmed.starts_with('<') {
        if let Some(list) = decode_dash(document)? {
            return Ok(list);
        }
    }

    // Last resort: scan for bare audio-file URLs anywhere in the document.
    let urls = scan_audio_urls(document);
    if urls.is_empty() {
        bail!("no segment information extractable from manifest");
    }
    Ok(urls)
}

struct SegmentTemplate {
    initialization: String,
    media: String,
    start_number: u64,
    duration: Option<u64>,
    timescale: Option<u64>,
}

/// DASH timeline decode. Returns `Ok(None)` when the document parses but
/// carries no template, letting the caller fall through to the URL scan.
fn decode_dash(document: &str) -> Result<Option<Vec<String>>> {
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text(true);

    let mut template: Option<SegmentTemplate> = None;
    let mut timeline: Vec<(u64, u64)> = Vec::new(); // (duration, repeat)
    let mut base_url = String::new();
    let mut in_timeline = false;
    let mut in_base_url = false;
    let mut media_duration: Option<f64> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = e.name();
                let name = std::str::from_utf8(name.as_ref()).unwrap_or("");
                match name {
                    "MPD" => {
                        if let Some(v) = attr(e, "mediaPresentationDuration") {
                            media_duration = parse_iso_duration(&v);
                        }
                    }
                    "SegmentTemplate" => {
                        template = Some(SegmentTemplate {
                            initialization: attr(e, "initialization").unwrap_or_default(),
                            media: attr(e, "media").unwrap_or_default(),
                            start_number: attr(e, "startNumber")
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0),
                            duration: attr(e, "duration").and_then(|v| v.parse().ok()),
                            timescale: attr(e, "timescale").and_then(|v| v.parse().ok()),
                        });
                    }
                    "SegmentTimeline" => in_timeline = true,
                    "S" if in_timeline => {
                        let d = attr(e, "d").and_then(|v| v.parse().ok()).unwrap_or(0);
                        let r = attr(e, "r").and_then(|v| v.parse().ok()).unwrap_or(0);
                        timeline.push((d, r));
                    }
                    "BaseURL" => in_base_url = true,
                    _ => {}
                }
            }
            Ok(Event::Text(ref t)) if in_base_url => {
                base_url = t.unescape().unwrap_or_default().into_owned();
            }
            Ok(Event::End(ref e)) => {
                let name = e.name();
                match std::str::from_utf8(name.as_ref()).unwrap_or("") {
                    "SegmentTimeline" => in_timeline = false,
                    "BaseURL" => in_base_url = false,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("DASH parse error, falling back to URL scan: {}", e);
                return Ok(None);
            }
            _ => {}
        }
    }

    let Some(template) = template else {
        return Ok(None);
    };
    if template.media.is_empty() {
        return Ok(None);
    }

    if base_url.is_empty() {
        base_url = infer_base_url(document, &template.media).unwrap_or_default();
    }

    let mut urls = Vec::new();
    if !template.initialization.is_empty() {
        urls.push(join_url(&base_url, &unescape_attr(&template.initialization)));
    }

    let media = unescape_attr(&template.media);
    if !timeline.is_empty() {
        let mut index = template.start_number;
        let mut elapsed: u64 = 0;
        for (duration, repeat) in timeline {
            for _ in 0..=repeat {
                urls.push(join_url(&base_url, &substitute(&media, index, elapsed)));
                index += 1;
                elapsed += duration;
            }
        }
    } else if let (Some(duration), Some(timescale)) = (template.duration, template.timescale) {
        // No timeline: estimate the count from the presentation duration,
        // bounded. Silent-risk fallback; the output is not verified.
        let estimated = media_duration
            .map(|total| (total * timescale as f64 / duration as f64).ceil() as usize)
            .unwrap_or(ESTIMATED_SEGMENT_CAP)
            .clamp(1, ESTIMATED_SEGMENT_CAP);
        warn!(
            "manifest has no segment timeline; estimating {} segments",
            estimated
        );
        let mut elapsed: u64 = 0;
        for i in 0..estimated as u64 {
            urls.push(join_url(
                &base_url,
                &substitute(&media, template.start_number + i, elapsed),
            ));
            elapsed += duration;
        }
    } else {
        return Ok(None);
    }

    Ok(Some(urls))
}

fn attr(e: &quick_xml::events::BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == key.as_bytes() {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

fn unescape_attr(value: &str) -> String {
    value.replace("&amp;", "&")
}

fn substitute(media: &str, index: u64, elapsed: u64) -> String {
    media
        .replace("$Number$", &index.to_string())
        .replace("$Time$", &elapsed.to_string())
}

/// Infer a base from any absolute URL present in the document when the
/// template itself is relative.
fn infer_base_url(document: &str, media_template: &str) -> Option<String> {
    if media_template.starts_with("http://") || media_template.starts_with("https://") {
        return Some(String::new());
    }
    let re = Regex::new(r#"https?://[^"'\s<>]+/"#).ok()?;
    let m = re.find(document)?;
    let url = m.as_str();
    // Trim back to the last path separator.
    url.rfind('/').map(|i| url[..=i].to_string())
}

fn join_url(base: &str, rel: &str) -> String {
    if rel.starts_with("http://") || rel.starts_with("https://") || base.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
    }
}

/// `PT3M42.5S`-style duration, seconds.
fn parse_iso_duration(value: &str) -> Option<f64> {
    let re = Regex::new(r"PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?").ok()?;
    let caps = re.captures(value)?;
    let h: f64 = caps.get(1).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let m: f64 = caps.get(2).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let s: f64 = caps.get(3).map_or(0.0, |m| m.as_str().parse().unwrap_or(0.0));
    let total = h * 3600.0 + m * 60.0 + s;
    (total > 0.0).then_some(total)
}

fn scan_audio_urls(document: &str) -> Vec<String> {
    let re = match Regex::new(r#"https?://[^"'\s<>]+\.(?:flac|m4a|mp4|aac|mp3)[^"'\s<>]*"#) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.find_iter(document)
        .map(|m| unescape_attr(m.as_str()))
        .collect()
}
