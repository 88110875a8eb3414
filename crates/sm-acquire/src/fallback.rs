//! Fallback acquisition from the video-hosting provider.
//!
//! Two implementations behind one completion contract: a subprocess-driven
//! extractor (yt-dlp + ffmpeg) for desktop-class environments, and an
//! in-process streaming client for environments without the binary. Either
//! way the completion signal fires exactly once, progress is reported as a
//! 0.0–1.0 fraction, and the destination file is verified to exist before
//! success is reported.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Progress events for one download.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadProgress {
    Starting,
    /// Fractional completion, 0.0–1.0.
    Downloading(f32),
    Converting,
    Complete(PathBuf),
    Failed(String),
}

/// One-shot completion over a progress channel. However many error paths
/// fire, only the first `complete`/`fail` call emits anything.
pub struct Completion {
    fired: AtomicBool,
    tx: mpsc::Sender<DownloadProgress>,
}

impl Completion {
    pub fn new(tx: mpsc::Sender<DownloadProgress>) -> Self {
        Self { fired: AtomicBool::new(false), tx }
    }

    /// Emit a terminal event unless one was already emitted. Returns
    /// whether this call won.
    pub async fn finish(&self, event: DownloadProgress) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("suppressed duplicate completion: {:?}", event);
            return false;
        }
        let _ = self.tx.send(event).await;
        true
    }

    async fn progress(&self, event: DownloadProgress) {
        if !self.fired.load(Ordering::SeqCst) {
            let _ = self.tx.send(event).await;
        }
    }
}

#[async_trait]
pub trait FallbackDownloader: Send + Sync {
    /// Download/extract audio from `url` into `dest`. Reports progress and
    /// exactly one terminal event on `progress`; the return value mirrors
    /// that terminal event.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: mpsc::Sender<DownloadProgress>,
    ) -> bool;
}

// ── Subprocess path ──────────────────────────────────────────────────────────

pub struct YtDlpDownloader {
    yt_dlp: PathBuf,
    ffmpeg_dir: Option<PathBuf>,
    audio_format: String,
}

impl YtDlpDownloader {
    pub fn new(yt_dlp: PathBuf, ffmpeg_dir: Option<PathBuf>, audio_format: String) -> Self {
        Self { yt_dlp, ffmpeg_dir, audio_format }
    }

    async fn run(&self, url: &str, dest: &Path, completion: &Completion) -> anyhow::Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut cmd = Command::new(&self.yt_dlp);
        cmd.arg("-x")
            .arg("--audio-format")
            .arg(&self.audio_format)
            .arg("--audio-quality")
            .arg("0")
            .arg("--output")
            .arg(dest)
            // Write the target directly; no ".part" intermediate, so an
            // existence check never sees a half-written artifact under a
            // different name.
            .arg("--no-part")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.ffmpeg_dir {
            cmd.arg("--ffmpeg-location").arg(dir);
        }

        let mut child = cmd.spawn()?;

        // Drain stderr concurrently from the start: a full stderr pipe
        // blocks the child, which would stall the stdout loop below.
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    if !is_expected_stderr(&line) {
                        warn!("yt-dlp stderr: {}", line);
                    }
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_progress_line(&line) {
                    Some(event) => completion.progress(event).await,
                    None => debug!("yt-dlp: {}", line),
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("extractor exited with status {:?}", status.code());
        }
        Ok(())
    }
}

#[async_trait]
impl FallbackDownloader for YtDlpDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: mpsc::Sender<DownloadProgress>,
    ) -> bool {
        let completion = Completion::new(progress);
        completion.progress(DownloadProgress::Starting).await;

        match self.run(url, dest, &completion).await {
            Ok(()) if dest.exists() => {
                info!("fallback download complete: {}", dest.display());
                completion.finish(DownloadProgress::Complete(dest.to_path_buf())).await;
                true
            }
            Ok(()) => {
                completion
                    .finish(DownloadProgress::Failed(format!(
                        "extractor succeeded but {} does not exist",
                        dest.display()
                    )))
                    .await;
                false
            }
            Err(e) => {
                completion.finish(DownloadProgress::Failed(e.to_string())).await;
                false
            }
        }
    }
}

/// `[download]  45.3% of ...` -> fractional progress.
fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    if line.contains("[ExtractAudio]") || line.contains("[ffmpeg]") {
        return Some(DownloadProgress::Converting);
    }
    let re = Regex::new(r"\[download\]\s+(\d+\.\d+)%").ok()?;
    let caps = re.captures(line)?;
    let percent: f32 = caps.get(1)?.as_str().parse().ok()?;
    Some(DownloadProgress::Downloading(percent / 100.0))
}

/// Informational stderr the extractor always prints; not worth a warning.
fn is_expected_stderr(line: &str) -> bool {
    line.is_empty()
        || line.starts_with("WARNING:")
        || line.starts_with("[download]")
        || line.starts_with("Deleting original file")
}

// ── In-process streaming path ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerResponse {
    streaming_data: Option<StreamingData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingData {
    #[serde(default)]
    adaptive_formats: Vec<AdaptiveFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdaptiveFormat {
    mime_type: String,
    #[serde(default)]
    bitrate: u64,
    url: Option<String>,
    content_length: Option<String>,
}

pub struct StreamDownloader {
    client: Client,
    player_endpoint: String,
}

const DEFAULT_PLAYER_ENDPOINT: &str = "https://www.youtube.com/youtubei/v1/player";

impl StreamDownloader {
    pub fn new(client: Client) -> Self {
        Self { client, player_endpoint: DEFAULT_PLAYER_ENDPOINT.to_string() }
    }

    async fn resolve_best_audio(&self, url: &str) -> anyhow::Result<AdaptiveFormat> {
        let video_id =
            extract_video_id(url).ok_or_else(|| anyhow::anyhow!("no video id in url: {}", url))?;

        // Android client: serves direct (non-ciphered) stream URLs.
        let body = serde_json::json!({
            "videoId": video_id,
            "context": {
                "client": {
                    "clientName": "ANDROID",
                    "clientVersion": "19.09.37",
                    "androidSdkVersion": 30
                }
            }
        });

        let response = self
            .client
            .post(&self.player_endpoint)
            .query(&[("prettyPrint", "false")])
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("player endpoint returned {}", response.status());
        }
        let player: PlayerResponse = response.json().await?;

        let formats = player
            .streaming_data
            .map(|s| s.adaptive_formats)
            .unwrap_or_default();
        pick_best_audio(&formats)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no audio-only stream available"))
    }

    async fn stream_to(
        &self,
        format: &AdaptiveFormat,
        dest: &Path,
        completion: &Completion,
    ) -> anyhow::Result<()> {
        let url = format
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("selected stream has no direct url"))?;
        let total: u64 = format
            .content_length
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("stream fetch returned {}", response.status());
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if total > 0 {
                completion
                    .progress(DownloadProgress::Downloading(received as f32 / total as f32))
                    .await;
            }
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl FallbackDownloader for StreamDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: mpsc::Sender<DownloadProgress>,
    ) -> bool {
        let completion = Completion::new(progress);
        completion.progress(DownloadProgress::Starting).await;

        let result = async {
            let format = self.resolve_best_audio(url).await?;
            self.stream_to(&format, dest, &completion).await
        }
        .await;

        match result {
            Ok(()) if dest.exists() => {
                info!("streamed download complete: {}", dest.display());
                completion.finish(DownloadProgress::Complete(dest.to_path_buf())).await;
                true
            }
            Ok(()) => {
                completion
                    .finish(DownloadProgress::Failed("destination file missing".into()))
                    .await;
                false
            }
            Err(e) => {
                completion.finish(DownloadProgress::Failed(e.to_string())).await;
                false
            }
        }
    }
}

/// Highest-bitrate audio-only stream.
fn pick_best_audio(formats: &[AdaptiveFormat]) -> Option<&AdaptiveFormat> {
    formats
        .iter()
        .filter(|f| f.mime_type.starts_with("audio/"))
        .max_by_key(|f| f.bitrate)
}

fn extract_video_id(url: &str) -> Option<String> {
    let re = Regex::new(r"(?:v=|youtu\.be/|/shorts/)([A-Za-z0-9_-]{11})").ok()?;
    re.captures(url).map(|c| c[1].to_string())
}

/// Pick the platform-appropriate implementation: subprocess extraction when
/// a yt-dlp binary is discoverable, in-process streaming otherwise.
pub fn select_downloader(
    yt_dlp: Option<PathBuf>,
    audio_format: &str,
    client: &Client,
) -> Box<dyn FallbackDownloader> {
    match yt_dlp {
        Some(bin) => {
            let ffmpeg_dir = sm_core::platform::find_ffmpeg_binary()
                .and_then(|p| p.parent().map(Path::to_path_buf));
            Box::new(YtDlpDownloader::new(bin, ffmpeg_dir, audio_format.to_string()))
        }
        None => {
            info!("no extractor binary found, using in-process streaming client");
            Box::new(StreamDownloader::new(client.clone()))
        }
    }
}
