//! livewatch: concurrent live-video detection sessions.
//!
//! Each session ingests a network video source on its own thread, runs an
//! object detector on sampled frames, persists notable detections at a
//! bounded rate, and publishes its newest frame and overlay for any number
//! of live viewers.
//!
//! # Module Structure
//!
//! - `frame`: `SharedFrameState`, the single-slot latest-frame cell
//! - `ingest`: frame sources (RTSP, synthetic) and source URI validation
//! - `detect`: detector backends and detection records
//! - `session`: registry, worker loop, scheduler, persister
//! - `annotate`: overlay drawing and JPEG encoding
//! - `storage`: read side of persisted artifacts
//! - `stream`: per-viewer MJPEG generation
//! - `api`: HTTP adapter
//! - Core types: `CaptureKey`

use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod session;
pub mod storage;
pub mod stream;

pub use config::LivewatchConfig;
pub use detect::{Detection, DetectionRecord, DetectorBackend, RawDetection};
pub use error::{SessionError, SessionResult};
pub use frame::{FrameSnapshot, SharedFrameState, StateSnapshot};
pub use ingest::{validate_source_uri, FrameSource, SourceFactory};
pub use session::{SessionRegistry, SessionStatus, SessionView};

// -------------------- Capture keys --------------------

const CAPTURE_KEY_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// UTC timestamp with microsecond resolution naming one capture event.
///
/// The JSON record and both images of a capture share one key, and the
/// formatted key sorts lexically in chronological order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CaptureKey(DateTime<Utc>);

impl CaptureKey {
    pub fn at(time: DateTime<Utc>) -> Self {
        CaptureKey(time.trunc_subsecs(6))
    }

    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    /// The smallest key strictly greater than `self`.
    pub fn next(self) -> Self {
        CaptureKey(self.0 + Duration::microseconds(1))
    }

    pub fn parse(key: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(key, CAPTURE_KEY_FORMAT)
            .ok()
            .map(|naive| CaptureKey(naive.and_utc()))
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for CaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(CAPTURE_KEY_FORMAT))
    }
}

/// First 8 characters of a session id, used in logs and overlays.
pub fn short_id(session_id: &str) -> &str {
    session_id.get(..8).unwrap_or(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn capture_key_formats_and_parses() {
        let time = Utc
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .single()
            .expect("valid time")
            + Duration::microseconds(42);
        let key = CaptureKey::at(time);
        assert_eq!(key.to_string(), "20240309_070501_000042");
        assert_eq!(CaptureKey::parse("20240309_070501_000042"), Some(key));
        assert_eq!(CaptureKey::parse("detection_20240309"), None);
    }

    #[test]
    fn capture_keys_sort_lexically() {
        let a = CaptureKey::now();
        let b = a.next();
        assert!(b > a);
        assert!(b.to_string() > a.to_string());
    }

    #[test]
    fn short_id_handles_short_strings() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
