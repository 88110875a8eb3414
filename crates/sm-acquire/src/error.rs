//! Error taxonomy for the acquisition pipeline.
//!
//! Soft/expected failures (no match, tier unavailable, rate limit) surface
//! as `NoSource`-class values and let the orchestrator move to the next
//! fallback step. Nothing here is fatal: total acquisition failure degrades
//! to "skip to the next queue item".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcquireError {
    /// Every provider in the chain was tried and none produced a file.
    #[error("Could not find track on any platform")]
    Exhausted,

    /// A single provider had nothing for this track (soft, expected).
    #[error("No source at {provider}: {reason}")]
    NoSource { provider: &'static str, reason: String },

    /// Transient I/O: network, subprocess, filesystem. Fails this attempt only.
    #[error("Download failed: {0}")]
    Download(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AcquireError {
    pub fn no_source(provider: &'static str, reason: impl Into<String>) -> Self {
        Self::NoSource { provider, reason: reason.into() }
    }
}
