//! Track resolution against the video-hosting search provider.
//!
//! Turns song metadata into ranked candidate matches. Search runs through
//! yt-dlp's `ytsearch` pseudo-URL with `--dump-json --flat-playlist`; any
//! provider error yields an empty list, never an error — resolution failure
//! is always a soft failure for the caller.

use serde::Deserialize;
use sm_core::song::TrackMetadata;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Candidates whose duration is within this window of the expected duration
/// are preferred.
const DURATION_TOLERANCE_SECS: u32 = 10;

/// How many ranked candidates to return.
const MAX_MATCHES: usize = 5;

/// How many raw results to request from the search provider.
const SEARCH_DEPTH: usize = 10;

/// One scored search result.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMatch {
    pub title: String,
    pub artist: String,
    pub duration_secs: Option<u32>,
    pub url: String,
    pub thumbnail_url: Option<String>,
}

impl CandidateMatch {
    /// Human-readable duration, "m:ss".
    pub fn duration_display(&self) -> String {
        match self.duration_secs {
            Some(d) => format!("{}:{:02}", d / 60, d % 60),
            None => "?:??".to_string(),
        }
    }
}

/// Flat-playlist entry as emitted by yt-dlp, one JSON object per line.
#[derive(Debug, Deserialize)]
struct SearchEntry {
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    channel: Option<String>,
    uploader: Option<String>,
    thumbnails: Option<Vec<Thumbnail>>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

pub struct TrackResolver {
    yt_dlp: Option<PathBuf>,
}

impl TrackResolver {
    pub fn new(yt_dlp: Option<PathBuf>) -> Self {
        Self { yt_dlp }
    }

    /// Ranked candidate matches for a track, best first. Empty on any
    /// search failure.
    pub async fn find_best_matches(&self, meta: &TrackMetadata) -> Vec<CandidateMatch> {
        // Exact-phrase ISRC search first; only trusted when non-empty.
        if let Some(isrc) = meta.isrc.as_deref().filter(|s| !s.is_empty()) {
            let results = self.search(&format!("\"{}\"", isrc)).await;
            if !results.is_empty() {
                return rank_candidates(results, meta.duration_secs);
            }
            debug!("ISRC search for {} empty, falling back to text search", isrc);
        }

        let query = format!("{} - {} Official Audio", meta.artist, meta.title);
        rank_candidates(self.search(&query).await, meta.duration_secs)
    }

    async fn search(&self, query: &str) -> Vec<CandidateMatch> {
        let Some(yt_dlp) = &self.yt_dlp else {
            warn!("no yt-dlp binary available, search yields nothing");
            return Vec::new();
        };

        let output = Command::new(yt_dlp)
            .arg(format!("ytsearch{}:{}", SEARCH_DEPTH, query))
            .arg("--dump-json")
            .arg("--flat-playlist")
            .arg("--no-warnings")
            .arg("--ignore-errors")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                warn!("search provider exited with {:?}", o.status.code());
                return Vec::new();
            }
            Err(e) => {
                warn!("failed to spawn search provider: {}", e);
                return Vec::new();
            }
        };

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| serde_json::from_str::<SearchEntry>(line).ok())
            .filter_map(|entry| {
                let url = entry.url.or(entry.webpage_url)?;
                Some(CandidateMatch {
                    title: entry.title.unwrap_or_default(),
                    artist: entry.channel.or(entry.uploader).unwrap_or_default(),
                    duration_secs: entry.duration.map(|d| d.round() as u32),
                    url,
                    thumbnail_url: entry
                        .thumbnails
                        .and_then(|t| t.into_iter().next_back().map(|t| t.url)),
                })
            })
            .collect()
    }
}

/// Score and order candidates by closeness to the expected duration.
///
/// Stable sort ascending by |candidate - expected| (when expected > 0),
/// prefer the set within the tolerance window, fall back to the full sorted
/// set when that filter empties everything, and cap the result.
pub fn rank_candidates(
    mut candidates: Vec<CandidateMatch>,
    expected_duration: u32,
) -> Vec<CandidateMatch> {
    if expected_duration > 0 {
        candidates.sort_by_key(|c| duration_distance(c, expected_duration));

        let within: Vec<CandidateMatch> = candidates
            .iter()
            .filter(|c| duration_distance(c, expected_duration) <= DURATION_TOLERANCE_SECS)
            .cloned()
            .collect();
        if !within.is_empty() {
            candidates = within;
        }
    }
    candidates.truncate(MAX_MATCHES);
    candidates
}

fn duration_distance(candidate: &CandidateMatch, expected: u32) -> u32 {
    match candidate.duration_secs {
        Some(d) => d.abs_diff(expected),
        // Unknown durations sort behind everything known.
        None => u32::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, duration: Option<u32>) -> CandidateMatch {
        CandidateMatch {
            title: title.to_string(),
            artist: "chan".to_string(),
            duration_secs: duration,
            url: format!("https://v.example/{}", title),
            thumbnail_url: None,
        }
    }

    #[test]
    fn ranks_by_duration_distance() {
        let ranked = rank_candidates(
            vec![
                candidate("far", Some(260)),
                candidate("close", Some(202)),
                candidate("exact", Some(200)),
            ],
            200,
        );
        let titles: Vec<&str> = ranked.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["exact", "close"]);
    }

    #[test]
    fn falls_back_to_full_sorted_set_when_tolerance_filters_all() {
        let ranked = rank_candidates(
            vec![candidate("a", Some(300)), candidate("b", Some(250))],
            200,
        );
        // Nothing within 10 s: full set, still sorted ascending by distance.
        let titles: Vec<&str> = ranked.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "a"]);
    }

    #[test]
    fn unknown_expected_duration_keeps_input_order() {
        let ranked = rank_candidates(
            vec![candidate("first", Some(500)), candidate("second", Some(100))],
            0,
        );
        let titles: Vec<&str> = ranked.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[test]
    fn caps_at_five() {
        let input: Vec<_> = (0..9).map(|i| candidate(&i.to_string(), Some(200 + i))).collect();
        assert_eq!(rank_candidates(input, 200).len(), 5);
    }

    #[test]
    fn stable_sort_preserves_order_of_ties() {
        let ranked = rank_candidates(
            vec![candidate("tie1", Some(205)), candidate("tie2", Some(195))],
            200,
        );
        let titles: Vec<&str> = ranked.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["tie1", "tie2"]);
    }

    #[tokio::test]
    async fn missing_binary_yields_empty() {
        let resolver = TrackResolver::new(Some(PathBuf::from("/nonexistent/yt-dlp")));
        let meta = TrackMetadata::new("Test Song", "Test Artist");
        assert!(resolver.find_best_matches(&meta).await.is_empty());

        let resolver = TrackResolver::new(None);
        assert!(resolver.find_best_matches(&meta).await.is_empty());
    }

    #[test]
    fn duration_display_formats() {
        assert_eq!(candidate("x", Some(200)).duration_display(), "3:20");
        assert_eq!(candidate("x", None).duration_display(), "?:??");
    }
}
