//! Typed errors for each component, composed into a crate-wide [`CoreError`].
//!
//! Recoverable conditions (a malformed frame, a failed feature closure, an
//! unparsable query filter) never appear here: the propagation policy
//! swallows them locally and counts them. Only conditions that are
//! unrecoverable *to the call that hit them* become a variant below.

use std::path::PathBuf;

/// Errors returned by [`crate::packet_reader::PacketReader`].
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("file not accessible: {path}")]
    Unreadable { path: PathBuf },

    #[error("seek failed on {path}")]
    SeekFailed { path: PathBuf },

    #[error("short read on {path}: expected {expected} bytes, got {actual}")]
    ShortRead {
        path: PathBuf,
        expected: u32,
        actual: usize,
    },

    #[error("read timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
}

/// Errors returned by [`crate::index_store::IndexStore`].
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("a session is already open")]
    SessionAlreadyOpen,

    #[error("no session is open")]
    NoSessionOpen,

    #[error("failed to write snapshot to {path}: {source}")]
    SnapshotWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by [`crate::feature_extractor::FeatureExtractor`].
///
/// Per-feature closure failures are omissions, not propagated errors; this
/// type is only for a frame that is structurally unusable for its claimed
/// format and dimensions (e.g. shorter than `width * height * bytes_per_pixel`).
#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("frame too small: need at least {needed} bytes for {width}x{height}, got {actual}")]
    FrameTooSmall {
        width: u16,
        height: u16,
        needed: usize,
        actual: usize,
    },
}

/// The crate-wide error type returned by [`crate::core::Core`]'s public API.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Feature(#[from] FeatureError),

    #[error("failed to initialise {component}: {source}")]
    InitFailed {
        component: &'static str,
        #[source]
        source: std::io::Error,
    },
}
