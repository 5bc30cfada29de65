use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::config::LivewatchConfig;
use crate::detect::BackendRegistry;
use crate::error::{SessionError, SessionResult};
use crate::frame::SharedFrameState;
use crate::ingest::{redact_uri, validate_source_uri, RtspSourceFactory, SourceFactory};
use crate::session::{SessionControl, SessionPaths, SessionView, SessionWorker, WorkerContext};
use crate::short_id;

struct SessionEntry {
    session_id: String,
    source_uri: String,
    started_at: DateTime<Utc>,
    started: Instant,
    paths: SessionPaths,
    control: Arc<SessionControl>,
    frame_state: Arc<SharedFrameState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionEntry {
    fn view(&self) -> SessionView {
        SessionView {
            session_id: self.session_id.clone(),
            source_uri: self.source_uri.clone(),
            start_time: self.started_at.timestamp_micros() as f64 / 1_000_000.0,
            status: self.control.status(),
            runtime: self.started.elapsed().as_secs_f64(),
            error: self.control.error(),
            frame_count: self.frame_state.frame_count(),
        }
    }
}

/// Process-wide session map.
///
/// Writers (create) take the write lock; lookups take the read lock and
/// release it before touching a session, so a slow session never blocks
/// the map. Per-session status lives in each session's `SessionControl`.
/// Sessions are never removed; stopped and failed ones stay queryable.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    config: LivewatchConfig,
    sources: Arc<dyn SourceFactory>,
    backends: Arc<BackendRegistry>,
}

impl SessionRegistry {
    pub fn new(
        config: LivewatchConfig,
        sources: Arc<dyn SourceFactory>,
        backends: Arc<BackendRegistry>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            sources,
            backends,
        }
    }

    /// Registry wired to RTSP sources and the built-in detector backends.
    pub fn from_config(config: LivewatchConfig) -> Result<Self> {
        let sources: Arc<dyn SourceFactory> =
            Arc::new(RtspSourceFactory::new(config.source.clone()));
        let backends = Arc::new(BackendRegistry::with_builtin(&config.detector)?);
        Ok(Self::new(config, sources, backends))
    }

    pub fn config(&self) -> &LivewatchConfig {
        &self.config
    }

    /// Validate the URI, allocate an id, create output directories, and
    /// spawn the worker. The session is in the map before this returns.
    ///
    /// The map lock is only held to pick the id and to insert; directory
    /// creation and the thread spawn happen outside it.
    pub fn create(&self, source_uri: &str) -> SessionResult<SessionView> {
        validate_source_uri(source_uri)?;
        let source_uri = source_uri.trim().to_string();

        let session_id = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            loop {
                let candidate = new_session_id();
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            }
        };

        let paths = SessionPaths {
            results_dir: self.config.storage.results_dir.join(&session_id),
            images_dir: self.config.storage.images_dir.join(&session_id),
        };
        for dir in [&paths.results_dir, &paths.images_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                SessionError::Internal(format!("create {}: {}", dir.display(), e))
            })?;
        }

        let entry = Arc::new(SessionEntry {
            session_id: session_id.clone(),
            source_uri: source_uri.clone(),
            started_at: Utc::now(),
            started: Instant::now(),
            paths: paths.clone(),
            control: Arc::new(SessionControl::new()),
            frame_state: Arc::new(SharedFrameState::new()),
            worker: Mutex::new(None),
        });

        let ctx = WorkerContext {
            session_id: session_id.clone(),
            source_uri: source_uri.clone(),
            paths,
            control: Arc::clone(&entry.control),
            frame_state: Arc::clone(&entry.frame_state),
            sources: Arc::clone(&self.sources),
            backends: Arc::clone(&self.backends),
            detector: self.config.detector.clone(),
            session: self.config.session.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("session-{}", short_id(&session_id)))
            .spawn(move || SessionWorker::spawn_body(ctx))
            .map_err(|e| SessionError::Internal(format!("spawn session worker: {}", e)))?;
        *entry.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            if sessions.contains_key(&session_id) {
                // Another create drew the same 128-bit id in between.
                entry.control.request_stop();
                return Err(SessionError::Internal(format!(
                    "session id collision for {}",
                    short_id(&session_id)
                )));
            }
            sessions.insert(session_id.clone(), Arc::clone(&entry));
        }

        log::info!(
            "[Session {}] created for {} (results: {}, images: {})",
            short_id(&session_id),
            redact_uri(&source_uri),
            entry.paths.results_dir.display(),
            entry.paths.images_dir.display()
        );
        Ok(entry.view())
    }

    /// Request a stop. Idempotent: a terminal session is left as is.
    pub fn stop(&self, session_id: &str) -> SessionResult<SessionView> {
        let entry = self.get(session_id)?;
        let status = entry.control.request_stop();
        log::info!("[Session {}] stop requested ({})", short_id(session_id), status);
        Ok(entry.view())
    }

    pub fn status(&self, session_id: &str) -> SessionResult<SessionView> {
        Ok(self.get(session_id)?.view())
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionView> {
        let entries: Vec<Arc<SessionEntry>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut views: Vec<SessionView> = entries.iter().map(|e| e.view()).collect();
        views.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        views
    }

    pub fn frame_state(&self, session_id: &str) -> SessionResult<Arc<SharedFrameState>> {
        Ok(Arc::clone(&self.get(session_id)?.frame_state))
    }

    pub fn paths(&self, session_id: &str) -> SessionResult<SessionPaths> {
        Ok(self.get(session_id)?.paths.clone())
    }

    /// Stop every session and wait for the workers to exit.
    pub fn shutdown(&self) {
        let entries: Vec<Arc<SessionEntry>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for entry in &entries {
            entry.control.request_stop();
        }
        for entry in &entries {
            let handle = entry
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log::error!("[Session {}] worker panicked", short_id(&entry.session_id));
                }
            }
        }
        log::info!("stopped {} session(s)", entries.len());
    }

    fn get(&self, session_id: &str) -> SessionResult<Arc<SessionEntry>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
