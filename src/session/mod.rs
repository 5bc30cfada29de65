//! Detection sessions.
//!
//! - `SessionRegistry`: process-wide id -> session map, the only structure
//!   with writers on several threads.
//! - `SessionWorker`: the per-session capture loop.
//! - `DetectionScheduler`: frame sampling and detection.
//! - `ResultPersister`: rate-limited artifact writes.
//!
//! A session moves `Running -> Stopped` on request or `Running -> Error` on a
//! fatal failure. Both are terminal and the first transition wins.

mod persist;
mod registry;
mod scheduler;
mod worker;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

pub use persist::{PersistReport, ResultPersister};
pub use registry::SessionRegistry;
pub use scheduler::{DetectionOutcome, DetectionScheduler};
pub use worker::{SessionWorker, StepOutcome, WorkerContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Per-session output directories.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionPaths {
    /// JSON detection records.
    pub results_dir: PathBuf,
    /// Original and annotated JPEGs.
    pub images_dir: PathBuf,
}

/// Point-in-time view of a session, as returned to callers.
#[derive(Clone, Debug, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub source_uri: String,
    /// Seconds since the Unix epoch.
    pub start_time: f64,
    pub status: SessionStatus,
    /// Seconds since start.
    pub runtime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub frame_count: u64,
}

#[derive(Debug)]
struct Lifecycle {
    status: SessionStatus,
    error: Option<String>,
}

/// Stop flag plus terminal status, shared between the registry and a worker.
#[derive(Debug)]
pub struct SessionControl {
    stop: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                status: SessionStatus::Running,
                error: None,
            }),
        }
    }

    /// Raise the stop flag and move to `Stopped` unless already terminal.
    /// Returns the resulting status.
    pub fn request_stop(&self) -> SessionStatus {
        self.stop.store(true, Ordering::SeqCst);
        self.transition(SessionStatus::Stopped, None)
    }

    /// Move to `Error` unless already terminal.
    pub fn fail(&self, reason: impl Into<String>) -> SessionStatus {
        self.stop.store(true, Ordering::SeqCst);
        self.transition(SessionStatus::Error, Some(reason.into()))
    }

    /// Called by the worker on exit; a no-op after any earlier transition.
    pub fn mark_stopped(&self) -> SessionStatus {
        self.transition(SessionStatus::Stopped, None)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    fn transition(&self, to: SessionStatus, error: Option<String>) -> SessionStatus {
        let mut lifecycle = self.lock();
        if lifecycle.status == SessionStatus::Running {
            lifecycle.status = to;
            lifecycle.error = error;
        }
        lifecycle.status
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
