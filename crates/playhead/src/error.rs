//! Error types for the playback engine.

use thiserror::Error;

/// Errors surfaced to the control context. The render callback never
/// returns errors; it degrades to silence instead.
#[derive(Debug, Error)]
pub enum StreamError {
    /// File open / probe / codec setup failure. The stream stays unloaded.
    #[error("failed to load source: {0}")]
    Load(String),

    /// Output device or speed-stage setup failure. Partial initialization
    /// is unwound and the loaded source is kept.
    #[error("stream initialization failed: {0}")]
    Init(String),

    /// The output backend refused a start/stop/volume operation.
    #[error("output device error: {0}")]
    Device(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Decoder seek failure. Seek targets are derived from prior reads, so
    /// this indicates a logic error or a source that lost seekability.
    #[error("decoder seek failed: {0}")]
    Seek(String),

    /// Scratch buffer reservation failed while building the speed stage.
    #[error("out of memory sizing the resampler scratch buffer")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, StreamError>;
