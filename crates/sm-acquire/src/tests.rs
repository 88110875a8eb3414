//! Cross-module scenarios: the orchestrator, cache layer and playback
//! controller wired together the way the application wires them. Network
//! endpoints point at an unroutable local port so every provider fails
//! fast and deterministically.

use crate::orchestrator::{Provider, Quality, SmartDownloader};
use crate::queue::{PlayerCommand, PlayerState};
use sm_core::config::Config;
use sm_core::song::TrackMetadata;
use std::path::PathBuf;
use std::sync::Arc;

fn offline_config(download_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.paths.download_dir = Some(download_dir.to_path_buf());
    config.providers.link_api = "http://127.0.0.1:9/links".into();
    config.providers.track_api = "http://127.0.0.1:9".into();
    config.providers.download_api = "http://127.0.0.1:9".into();
    config.providers.segment_api = "http://127.0.0.1:9".into();
    config.acquisition.yt_dlp_path = Some(PathBuf::from("/nonexistent/yt-dlp"));
    config
}

fn place_download(dir: &std::path::Path, display_name: &str, ext: &str) -> PathBuf {
    let path = dir.join(format!("{}.{}", display_name, ext));
    std::fs::write(&path, b"audio").unwrap();
    path
}

#[tokio::test]
async fn offline_acquisition_reports_the_canonical_failure() {
    let dir = tempfile::TempDir::new().unwrap();
    let downloader = SmartDownloader::new(&offline_config(dir.path()), None);

    let meta = TrackMetadata::new("Test Song", "Test Artist");
    let err = downloader.stream_for_playback(&meta).await.unwrap_err();
    assert_eq!(err.to_string(), "Could not find track on any platform");
}

#[tokio::test]
async fn cached_download_short_circuits_all_providers() {
    let dir = tempfile::TempDir::new().unwrap();
    let downloader = SmartDownloader::new(&offline_config(dir.path()), None);

    let meta = TrackMetadata::new("Test Song", "Test Artist");
    let cached = place_download(dir.path(), &meta.display_name(), "flac");

    let acquired = downloader.stream_for_playback(&meta).await.unwrap();
    assert_eq!(acquired.path, cached);
    assert_eq!(acquired.provider, Provider::Cached);
    assert_eq!(acquired.quality, Quality::Lossless);
}

#[cfg(unix)]
#[tokio::test]
async fn mocked_extractor_lands_in_the_stream_cache() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new().unwrap();
    let script = dir.path().join("fake-yt-dlp");
    // Answers the flat-playlist search with one matching entry; on the
    // extraction call it creates the --output target and exits cleanly.
    std::fs::write(
        &script,
        concat!(
            "#!/bin/sh\n",
            "case \"$1\" in\n",
            "ytsearch*)\n",
            "  echo '{\"title\":\"Fallback Song\",\"url\":\"https://www.youtube.com/watch?v=dQw4w9WgXcQ\",\"duration\":200.0,\"channel\":\"Fallback Artist\"}'\n",
            "  ;;\n",
            "*)\n",
            "  dest=\"\"; prev=\"\"\n",
            "  for a in \"$@\"; do [ \"$prev\" = \"--output\" ] && dest=\"$a\"; prev=\"$a\"; done\n",
            "  echo '[download] 100.0% of 3.21MiB'\n",
            "  printf audio > \"$dest\"\n",
            "  ;;\n",
            "esac\n",
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = offline_config(dir.path());
    config.acquisition.yt_dlp_path = Some(script);
    let downloader = SmartDownloader::new(&config, None);

    let mut meta = TrackMetadata::new("Fallback Song", "Fallback Artist");
    meta.duration_secs = 200;

    let expected = sm_core::platform::stream_cache_dir()
        .join("Fallback Artist - Fallback Song.m4a");
    std::fs::remove_file(&expected).ok();

    let acquired = downloader.stream_for_playback(&meta).await.unwrap();
    assert_eq!(acquired.path, expected);
    assert_eq!(acquired.provider, Provider::YouTube);
    assert_eq!(acquired.quality, Quality::Lossy);
    assert!(expected.exists());

    std::fs::remove_file(&expected).ok();
}

#[tokio::test]
async fn controller_plays_cached_tracks_and_skips_unacquirable_ones() {
    let dir = tempfile::TempDir::new().unwrap();
    let downloader = Arc::new(SmartDownloader::new(&offline_config(dir.path()), None));

    let missing = TrackMetadata::new("Nowhere", "Nobody");
    let cached = TrackMetadata::new("Here", "Somebody");
    let file = place_download(dir.path(), &cached.display_name(), "m4a");

    let (mut controller, mut rx) =
        crate::queue::PlaybackController::new(downloader, None);
    controller.queue.set_context(vec![missing, cached], 0);
    controller.play_current().await;

    // The first track exhausts offline; the second plays from cache.
    assert_eq!(controller.state(), PlayerState::Playing);
    assert_eq!(rx.recv().await, Some(PlayerCommand::PlayFile(file)));
}

#[tokio::test]
async fn controller_goes_idle_when_nothing_is_acquirable() {
    let dir = tempfile::TempDir::new().unwrap();
    let downloader = Arc::new(SmartDownloader::new(&offline_config(dir.path()), None));

    let (mut controller, mut rx) =
        crate::queue::PlaybackController::new(downloader, None);
    controller.queue.set_context(vec![TrackMetadata::new("Nowhere", "Nobody")], 0);
    controller.play_current().await;

    assert_eq!(controller.state(), PlayerState::Idle);
    assert_eq!(rx.recv().await, Some(PlayerCommand::Stop));
}
