//! Playback queue and just-in-time acquisition control.
//!
//! The queue holds two lanes: a priority lane ("play next" / "add to
//! queue") that is always drained before the browsing context resumes, and
//! the context itself (an album, playlist or search result list) with a
//! cursor. The controller sits between the queue and the audio backend:
//! when the cursor lands on a track whose file is missing, it performs
//! exactly one acquisition attempt, rebinds the queue entry to the new file
//! on success, and advances past the track on failure.

use sm_core::song::{SongStore, TrackMetadata};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::orchestrator::TrackSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Loading,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Off,
    One,
    All,
}

/// Commands sent to the audio backend.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    PlayFile(PathBuf),
    Pause,
    Resume,
    SeekToStart,
    Stop,
}

/// Share of a track's duration that must actually be heard before the play
/// counts.
const PLAY_COUNT_THRESHOLD: f64 = 0.6;
/// Position deltas at or above this are seeks, not listening.
const MAX_LISTEN_DELTA_SECS: f64 = 5.0;
/// Window before the end of a track that counts as "the end" for loop-one.
const TRACK_END_WINDOW_SECS: f64 = 0.5;
/// Minimum spacing between loop-one restarts.
const LOOP_RESTART_GUARD: Duration = Duration::from_secs(1);

// ── Queue ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PlaybackQueue {
    priority: VecDeque<TrackMetadata>,
    context: Vec<TrackMetadata>,
    /// Pre-shuffle ordering, kept while shuffle is on.
    unshuffled: Option<Vec<TrackMetadata>>,
    /// Cursor into `context`. None exactly when `context` is empty.
    index: Option<usize>,
    shuffle: bool,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the browsing context and position the cursor. A shuffle that
    /// was on stays on and is re-applied to the new context.
    pub fn set_context(&mut self, tracks: Vec<TrackMetadata>, start: usize) {
        self.unshuffled = None;
        self.context = tracks;
        self.index = if self.context.is_empty() {
            None
        } else {
            Some(start.min(self.context.len() - 1))
        };
        if self.shuffle {
            self.apply_shuffle();
        }
    }

    pub fn current(&self) -> Option<&TrackMetadata> {
        self.index.and_then(|i| self.context.get(i))
    }

    /// Swap the current entry for an enriched/rebound copy of itself.
    pub fn rebind_current(&mut self, track: TrackMetadata) {
        if let Some(i) = self.index {
            if let Some(slot) = self.context.get_mut(i) {
                *slot = track;
            }
        }
    }

    /// "Play next": front of the priority lane.
    pub fn queue_next(&mut self, track: TrackMetadata) {
        self.priority.push_front(track);
    }

    /// "Add to queue": back of the priority lane.
    pub fn queue_last(&mut self, track: TrackMetadata) {
        self.priority.push_back(track);
    }

    pub fn has_priority(&self) -> bool {
        !self.priority.is_empty()
    }

    /// Move to the next track. The priority lane always wins; a drained
    /// priority track is spliced into the context after the cursor so that
    /// history ("previous") still works. Returns the new current track, or
    /// None when the context is exhausted and looping is off.
    pub fn advance(&mut self, loop_mode: LoopMode) -> Option<&TrackMetadata> {
        if let Some(track) = self.priority.pop_front() {
            let at = self.index.map(|i| i + 1).unwrap_or(0);
            self.context.insert(at, track);
            self.index = Some(at);
            return self.current();
        }

        let i = self.index?;
        if i + 1 < self.context.len() {
            self.index = Some(i + 1);
        } else if loop_mode == LoopMode::All {
            self.index = Some(0);
        } else {
            return None;
        }
        self.current()
    }

    /// Move the cursor back one context entry; at the front it stays put
    /// (the caller restarts the current track instead).
    pub fn previous(&mut self) -> Option<&TrackMetadata> {
        let i = self.index?;
        self.index = Some(i.saturating_sub(1));
        self.current()
    }

    /// The track `advance` would land on, without moving.
    pub fn peek_next(&self, loop_mode: LoopMode) -> Option<&TrackMetadata> {
        if let Some(track) = self.priority.front() {
            return Some(track);
        }
        let i = self.index?;
        if i + 1 < self.context.len() {
            self.context.get(i + 1)
        } else if loop_mode == LoopMode::All {
            self.context.first()
        } else {
            None
        }
    }

    pub fn peek_previous(&self) -> Option<&TrackMetadata> {
        let i = self.index?;
        i.checked_sub(1).and_then(|p| self.context.get(p))
    }

    pub fn shuffle_enabled(&self) -> bool {
        self.shuffle
    }

    /// Toggle shuffle. Enabling snapshots the current order, shuffles the
    /// rest and pins the current track at position 0. Disabling restores
    /// the snapshot and re-finds the current track by identity.
    pub fn set_shuffle(&mut self, on: bool) {
        if on == self.shuffle {
            return;
        }
        self.shuffle = on;
        if on {
            self.apply_shuffle();
        } else {
            self.restore_order();
        }
    }

    fn apply_shuffle(&mut self) {
        use rand::seq::SliceRandom;

        let Some(i) = self.index else { return };
        self.unshuffled = Some(self.context.clone());
        let current = self.context.remove(i);
        self.context.shuffle(&mut rand::thread_rng());
        self.context.insert(0, current);
        self.index = Some(0);
    }

    fn restore_order(&mut self) {
        let Some(original) = self.unshuffled.take() else { return };
        let current = self.current().cloned();
        self.context = original;
        self.index = match current {
            None => None,
            Some(track) => {
                match self
                    .context
                    .iter()
                    .position(|t| t.identity() == track.identity())
                {
                    Some(i) => Some(i),
                    None => {
                        // Priority tracks spliced in during shuffle are not
                        // in the snapshot; keep the playing track current by
                        // inserting it at the front of the restored context.
                        self.context.insert(0, track);
                        Some(0)
                    }
                }
            }
        };
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_empty() && self.priority.is_empty()
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ListenSession {
    listened_secs: f64,
    last_position: f64,
    counted: bool,
}

pub struct PlaybackController {
    pub queue: PlaybackQueue,
    source: Arc<dyn TrackSource>,
    store: Option<Arc<dyn SongStore>>,
    commands: mpsc::Sender<PlayerCommand>,
    state: PlayerState,
    loop_mode: LoopMode,
    session: ListenSession,
    last_loop_restart: Option<Instant>,
}

impl PlaybackController {
    /// Returns the controller and the command stream the audio backend
    /// consumes.
    pub fn new(
        source: Arc<dyn TrackSource>,
        store: Option<Arc<dyn SongStore>>,
    ) -> (Self, mpsc::Receiver<PlayerCommand>) {
        let (tx, rx) = mpsc::channel(32);
        let controller = Self {
            queue: PlaybackQueue::new(),
            source,
            store,
            commands: tx,
            state: PlayerState::Idle,
            loop_mode: LoopMode::Off,
            session: ListenSession::default(),
            last_loop_restart: None,
        };
        (controller, rx)
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    pub fn set_shuffle(&mut self, on: bool) {
        self.queue.set_shuffle(on);
    }

    /// Start (or restart) playback of whatever the cursor points at,
    /// acquiring the file just in time when it is missing. A track whose
    /// single acquisition attempt fails is skipped; the cursor keeps
    /// advancing until something plays or the queue runs out.
    pub async fn play_current(&mut self) {
        loop {
            let Some(meta) = self.queue.current().cloned() else {
                self.state = PlayerState::Idle;
                return;
            };
            self.state = PlayerState::Loading;

            if let Some(path) = self.playable_path(&meta) {
                self.start_file(path).await;
                return;
            }

            info!("file missing for {}, acquiring just in time", meta.display_name());
            match self.source.acquire_for_playback(&meta).await {
                Ok(acquired) => {
                    let rebound = acquired.meta.with_path(&acquired.path);
                    self.queue.rebind_current(rebound);
                    self.start_file(acquired.path).await;
                    return;
                }
                Err(e) => {
                    warn!("skipping {}: {}", meta.display_name(), e);
                    if self.queue.advance(self.loop_mode).is_none() {
                        self.state = PlayerState::Idle;
                        self.send(PlayerCommand::Stop).await;
                        return;
                    }
                }
            }
        }
    }

    pub async fn next(&mut self) {
        if self.queue.advance(self.loop_mode).is_none() {
            self.state = PlayerState::Idle;
            self.send(PlayerCommand::Stop).await;
            return;
        }
        self.play_current().await;
    }

    pub async fn previous(&mut self) {
        self.queue.previous();
        self.play_current().await;
    }

    pub async fn pause(&mut self) {
        if self.state == PlayerState::Playing {
            self.state = PlayerState::Paused;
            self.send(PlayerCommand::Pause).await;
        }
    }

    pub async fn resume(&mut self) {
        if self.state == PlayerState::Paused {
            self.state = PlayerState::Playing;
            self.send(PlayerCommand::Resume).await;
        }
    }

    /// Periodic position report from the audio backend. Drives listening
    /// accounting and the loop-one restart.
    pub async fn on_position(&mut self, position: f64, duration: f64) {
        let delta = position - self.session.last_position;
        self.session.last_position = position;

        // Only forward, playback-speed-sized movement counts as listening;
        // seeks and track changes produce out-of-range deltas.
        if delta > 0.0 && delta < MAX_LISTEN_DELTA_SECS {
            self.session.listened_secs += delta;
        }

        if !self.session.counted
            && duration > 0.0
            && self.session.listened_secs >= PLAY_COUNT_THRESHOLD * duration
        {
            self.session.counted = true;
            self.record_play_count();
        }

        if self.loop_mode == LoopMode::One
            && duration > TRACK_END_WINDOW_SECS
            && position >= duration - TRACK_END_WINDOW_SECS
        {
            let guard_open = self
                .last_loop_restart
                .map(|t| t.elapsed() >= LOOP_RESTART_GUARD)
                .unwrap_or(true);
            if guard_open {
                debug!("loop-one restart");
                self.last_loop_restart = Some(Instant::now());
                self.session.last_position = 0.0;
                self.send(PlayerCommand::SeekToStart).await;
                self.send(PlayerCommand::Resume).await;
            }
        }
    }

    /// The backend reports the stream ran out on its own.
    pub async fn on_track_ended(&mut self) {
        match self.loop_mode {
            LoopMode::One => self.play_current().await,
            _ => self.next().await,
        }
    }

    fn playable_path(&self, meta: &TrackMetadata) -> Option<PathBuf> {
        if let Some(path) = meta.path.as_ref().filter(|p| p.exists()) {
            return Some(path.clone());
        }
        self.source.cached_path(meta)
    }

    async fn start_file(&mut self, path: PathBuf) {
        self.session = ListenSession::default();
        self.last_loop_restart = None;
        self.state = PlayerState::Playing;
        self.send(PlayerCommand::PlayFile(path)).await;
        self.preload_neighbors();
    }

    /// Warm the caches for the tracks on either side of the cursor so the
    /// next transition does not wait on the network.
    fn preload_neighbors(&self) {
        let neighbors = [
            self.queue.peek_next(self.loop_mode).cloned(),
            self.queue.peek_previous().cloned(),
        ];
        for meta in neighbors.into_iter().flatten() {
            if self.playable_path(&meta).is_some() {
                continue;
            }
            let source = Arc::clone(&self.source);
            tokio::spawn(async move {
                if let Err(e) = source.acquire_for_playback(&meta).await {
                    debug!("neighbor preload failed for {}: {}", meta.display_name(), e);
                }
            });
        }
    }

    fn record_play_count(&self) {
        let Some(store) = &self.store else { return };
        let Some(path) = self.queue.current().and_then(|t| t.path.clone()) else {
            return;
        };
        if let Err(e) = store.update_play_count(&path) {
            warn!("play count update failed for {}: {}", path.display(), e);
        }
    }

    async fn send(&self, command: PlayerCommand) {
        if self.commands.send(command).await.is_err() {
            warn!("audio backend command channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AcquireError;
    use crate::orchestrator::{Acquired, Provider, Quality};
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn track(n: u32) -> TrackMetadata {
        TrackMetadata::new(format!("Track {}", n), "Artist")
    }

    // ── Queue ────────────────────────────────────────────────────────────

    #[test]
    fn empty_queue_has_no_cursor() {
        let mut q = PlaybackQueue::new();
        assert!(q.current().is_none());
        assert!(q.advance(LoopMode::Off).is_none());
        q.set_context(vec![], 0);
        assert!(q.current().is_none());
    }

    #[test]
    fn priority_lane_drains_before_context_resumes() {
        let mut q = PlaybackQueue::new();
        q.set_context(vec![track(1), track(2), track(3)], 0);
        q.queue_last(track(10));
        q.queue_last(track(11));
        q.queue_next(track(9));

        assert_eq!(q.advance(LoopMode::Off).unwrap().title, "Track 9");
        assert_eq!(q.advance(LoopMode::Off).unwrap().title, "Track 10");
        assert_eq!(q.advance(LoopMode::Off).unwrap().title, "Track 11");
        // Context resumes where it left off.
        assert_eq!(q.advance(LoopMode::Off).unwrap().title, "Track 2");
    }

    #[test]
    fn previous_walks_back_through_played_priority_tracks() {
        let mut q = PlaybackQueue::new();
        q.set_context(vec![track(1), track(2)], 0);
        q.queue_next(track(9));
        q.advance(LoopMode::Off);
        assert_eq!(q.current().unwrap().title, "Track 9");
        assert_eq!(q.previous().unwrap().title, "Track 1");
    }

    #[test]
    fn advance_honors_loop_all_and_stops_when_off() {
        let mut q = PlaybackQueue::new();
        q.set_context(vec![track(1), track(2)], 1);
        assert!(q.advance(LoopMode::Off).is_none());
        assert_eq!(q.current().unwrap().title, "Track 2");
        assert_eq!(q.advance(LoopMode::All).unwrap().title, "Track 1");
    }

    #[test]
    fn shuffle_pins_current_and_keeps_the_set() {
        let mut q = PlaybackQueue::new();
        let tracks: Vec<_> = (1..=20).map(track).collect();
        q.set_context(tracks.clone(), 7);
        q.set_shuffle(true);

        assert_eq!(q.current().unwrap().title, "Track 8");
        let shuffled: HashSet<_> = q.context.iter().map(|t| t.title.clone()).collect();
        let original: HashSet<_> = tracks.iter().map(|t| t.title.clone()).collect();
        assert_eq!(shuffled, original);
        assert_eq!(q.index, Some(0));
    }

    #[test]
    fn unshuffle_restores_order_and_refinds_current() {
        let mut q = PlaybackQueue::new();
        let tracks: Vec<_> = (1..=20).map(track).collect();
        q.set_context(tracks.clone(), 0);
        q.set_shuffle(true);
        q.advance(LoopMode::Off);
        let playing = q.current().unwrap().title.clone();

        q.set_shuffle(false);
        assert_eq!(q.current().unwrap().title, playing);
        let order: Vec<_> = q.context.iter().map(|t| t.title.clone()).collect();
        let expected: Vec<_> = tracks.iter().map(|t| t.title.clone()).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn unshuffle_keeps_a_playing_priority_track_current() {
        let mut q = PlaybackQueue::new();
        let tracks: Vec<_> = (1..=5).map(track).collect();
        q.set_context(tracks, 0);
        q.set_shuffle(true);
        // Queue a track that is not in the shuffled snapshot and play it.
        q.queue_next(track(99));
        q.advance(LoopMode::Off);
        assert_eq!(q.current().unwrap().title, "Track 99");

        q.set_shuffle(false);
        assert_eq!(q.current().unwrap().title, "Track 99");
        // The restored context still holds the full original run after it.
        assert_eq!(q.advance(LoopMode::Off).unwrap().title, "Track 1");
    }

    #[test]
    fn peek_next_sees_priority_first() {
        let mut q = PlaybackQueue::new();
        q.set_context(vec![track(1), track(2)], 0);
        assert_eq!(q.peek_next(LoopMode::Off).unwrap().title, "Track 2");
        q.queue_last(track(9));
        assert_eq!(q.peek_next(LoopMode::Off).unwrap().title, "Track 9");
        assert!(q.peek_previous().is_none());
    }

    // ── Controller ───────────────────────────────────────────────────────

    struct MockSource {
        /// Identity -> path handed out on acquisition.
        grants: Mutex<std::collections::HashMap<String, PathBuf>>,
        calls: AtomicUsize,
    }

    impl MockSource {
        fn new() -> Self {
            Self { grants: Mutex::new(Default::default()), calls: AtomicUsize::new(0) }
        }

        fn grant(&self, meta: &TrackMetadata, path: PathBuf) {
            self.grants.lock().unwrap().insert(meta.identity(), path);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TrackSource for MockSource {
        async fn acquire_for_playback(
            &self,
            meta: &TrackMetadata,
        ) -> Result<Acquired, AcquireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.grants.lock().unwrap().get(&meta.identity()) {
                Some(path) => Ok(Acquired {
                    path: path.clone(),
                    provider: Provider::YouTube,
                    quality: Quality::Lossy,
                    meta: meta.clone(),
                }),
                None => Err(AcquireError::Exhausted),
            }
        }

        fn cached_path(&self, _meta: &TrackMetadata) -> Option<PathBuf> {
            None
        }
    }

    struct CountingStore {
        plays: AtomicUsize,
    }

    impl SongStore for CountingStore {
        fn song_by_path(&self, _path: &Path) -> Option<TrackMetadata> {
            None
        }
        fn save_songs(&self, _songs: &[TrackMetadata]) -> anyhow::Result<()> {
            Ok(())
        }
        fn update_play_count(&self, _path: &Path) -> anyhow::Result<()> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn existing_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    #[tokio::test]
    async fn jit_acquires_once_and_rebinds_the_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = Arc::new(MockSource::new());
        let meta = track(1);
        let file = existing_file(&dir, "t1.m4a");
        source.grant(&meta, file.clone());

        let (mut ctl, mut rx) = PlaybackController::new(source.clone(), None);
        ctl.queue.set_context(vec![meta], 0);
        ctl.play_current().await;

        assert_eq!(source.calls(), 1);
        assert_eq!(ctl.state(), PlayerState::Playing);
        assert_eq!(rx.recv().await, Some(PlayerCommand::PlayFile(file.clone())));
        assert_eq!(ctl.queue.current().unwrap().path.as_deref(), Some(file.as_path()));

        // The rebound entry plays again without another acquisition.
        ctl.play_current().await;
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn failed_acquisition_skips_to_the_next_track() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = Arc::new(MockSource::new());
        let bad = track(1);
        let good = track(2);
        let file = existing_file(&dir, "t2.m4a");
        source.grant(&good, file.clone());

        let (mut ctl, mut rx) = PlaybackController::new(source.clone(), None);
        ctl.queue.set_context(vec![bad, good], 0);
        ctl.play_current().await;

        // One attempt per track, no retries of the failed one.
        assert_eq!(source.calls(), 2);
        assert_eq!(ctl.queue.current().unwrap().title, "Track 2");
        assert_eq!(rx.recv().await, Some(PlayerCommand::PlayFile(file)));
    }

    #[tokio::test]
    async fn exhausted_queue_goes_idle() {
        let source = Arc::new(MockSource::new());
        let (mut ctl, mut rx) = PlaybackController::new(source.clone(), None);
        ctl.queue.set_context(vec![track(1), track(2)], 0);
        ctl.play_current().await;

        assert_eq!(ctl.state(), PlayerState::Idle);
        assert_eq!(source.calls(), 2);
        assert_eq!(rx.recv().await, Some(PlayerCommand::Stop));
    }

    #[tokio::test]
    async fn listening_threshold_counts_the_play_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = Arc::new(MockSource::new());
        let store = Arc::new(CountingStore { plays: AtomicUsize::new(0) });
        let meta = track(1).with_path(existing_file(&dir, "t1.m4a"));

        let (mut ctl, _rx) = PlaybackController::new(source, Some(store.clone()));
        ctl.queue.set_context(vec![meta], 0);
        ctl.play_current().await;

        // 100s track: one-second ticks up to 59s of listening.
        for s in 1..=59 {
            ctl.on_position(s as f64, 100.0).await;
        }
        assert_eq!(store.plays.load(Ordering::SeqCst), 0);
        ctl.on_position(60.0, 100.0).await;
        assert_eq!(store.plays.load(Ordering::SeqCst), 1);

        // More listening does not double-count.
        for s in 61..=80 {
            ctl.on_position(s as f64, 100.0).await;
        }
        assert_eq!(store.plays.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn seeks_do_not_count_as_listening() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = Arc::new(MockSource::new());
        let store = Arc::new(CountingStore { plays: AtomicUsize::new(0) });
        let meta = track(1).with_path(existing_file(&dir, "t1.m4a"));

        let (mut ctl, _rx) = PlaybackController::new(source, Some(store.clone()));
        ctl.queue.set_context(vec![meta], 0);
        ctl.play_current().await;

        // Jump straight to 70s: a seek, not 70s of listening.
        ctl.on_position(70.0, 100.0).await;
        assert_eq!(store.plays.load(Ordering::SeqCst), 0);
        // A few real seconds after the seek still are not enough.
        for s in 71..=75 {
            ctl.on_position(s as f64, 100.0).await;
        }
        assert_eq!(store.plays.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loop_one_restarts_once_per_guard_window() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = Arc::new(MockSource::new());
        let meta = track(1).with_path(existing_file(&dir, "t1.m4a"));

        let (mut ctl, mut rx) = PlaybackController::new(source, None);
        ctl.set_loop_mode(LoopMode::One);
        ctl.queue.set_context(vec![meta], 0);
        ctl.play_current().await;
        assert!(matches!(rx.recv().await, Some(PlayerCommand::PlayFile(_))));

        // Two end-of-track reports in quick succession: one restart.
        ctl.on_position(99.8, 100.0).await;
        ctl.on_position(99.9, 100.0).await;
        assert_eq!(rx.try_recv().ok(), Some(PlayerCommand::SeekToStart));
        assert_eq!(rx.try_recv().ok(), Some(PlayerCommand::Resume));
        assert!(rx.try_recv().is_err());
    }
}
