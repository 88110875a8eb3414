//! Track acquisition and playback-cache pipeline.
//!
//! Given a song's metadata, locate a playable source among several content
//! providers, download it under provider-specific rate limits, assemble the
//! payload into a usable audio file, cache it, tag it, and hand a
//! ready-to-play path back to the playback queue. The queue itself performs
//! just-in-time re-acquisition when expected files go missing.
//!
//! Control flow:
//! queue -> orchestrator -> { lossless engine -> manifest decoder;
//! fallback engine } -> cache & tag -> back to the queue with a path.

pub mod api;
pub mod cache;
pub mod error;
pub mod fallback;
pub mod lossless;
pub mod manifest;
pub mod orchestrator;
pub mod queue;
pub mod ratelimit;
pub mod resolver;
pub mod tag;

#[cfg(test)]
mod tests;

pub use error::AcquireError;
pub use orchestrator::{Acquired, Provider, Quality, SmartDownloader, TrackSource};
pub use queue::{LoopMode, PlaybackController, PlaybackQueue, PlayerCommand, PlayerState};
