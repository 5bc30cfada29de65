//! Frame ingestion.
//!
//! A session worker owns exactly one `FrameSource` at a time. Sources are
//! produced by a `SourceFactory`, which lets the daemon use RTSP while tests
//! inject scripted sources.
//!
//! Read failures are transient: the worker drops the source, backs off, and
//! asks the factory for a fresh one. A factory `open` failure on the first
//! connect is fatal to the session.

pub mod rtsp;
mod uri;

use anyhow::Result;

use crate::frame::Frame;

pub use rtsp::{RtspConfig, RtspSource, RtspSourceFactory};
pub use uri::{redact_uri, validate_source_uri};

/// A connected video source.
pub trait FrameSource: Send {
    /// Block until the next decoded frame is available.
    ///
    /// Implementations must bound the wait; an error means the stream
    /// should be reopened.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Short human-readable description for logs. Must not contain credentials.
    fn describe(&self) -> String;
}

/// Opens (connects) sources for a URI.
pub trait SourceFactory: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>>;
}
