use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{DetectorSettings, SessionSettings};
use crate::detect::BackendRegistry;
use crate::frame::SharedFrameState;
use crate::ingest::{redact_uri, FrameSource, SourceFactory};
use crate::session::{DetectionScheduler, ResultPersister, SessionControl, SessionPaths};
use crate::short_id;

/// Longest single sleep; bounds how late a stop request is noticed while idle.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Outcome of one loop iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// Transient source trouble: back off, then reopen.
    RetryAfterDelay(String),
    /// The session cannot continue.
    Fail(String),
}

/// Everything a worker thread needs, moved into the thread at spawn.
pub struct WorkerContext {
    pub session_id: String,
    pub source_uri: String,
    pub paths: SessionPaths,
    pub control: Arc<SessionControl>,
    pub frame_state: Arc<SharedFrameState>,
    pub sources: Arc<dyn SourceFactory>,
    pub backends: Arc<BackendRegistry>,
    pub detector: DetectorSettings,
    pub session: SessionSettings,
}

/// One session's capture loop: read, publish, detect on cadence, persist on
/// interval, pace.
pub struct SessionWorker {
    session_id: String,
    source_uri: String,
    control: Arc<SessionControl>,
    frame_state: Arc<SharedFrameState>,
    sources: Arc<dyn SourceFactory>,
    source: Option<Box<dyn FrameSource>>,
    scheduler: DetectionScheduler,
    persister: ResultPersister,
    settings: SessionSettings,
}

impl SessionWorker {
    /// Thread entry point. Builds the detector on this thread, then runs the
    /// loop until stop or fatal error. A panic anywhere below (a detector
    /// backend, a source) ends the session in `Error` instead of killing the
    /// thread silently.
    pub fn spawn_body(ctx: WorkerContext) {
        let tag = short_id(&ctx.session_id).to_string();
        let control = Arc::clone(&ctx.control);

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| Self::run_session(ctx))) {
            let reason = format!("worker panicked: {}", panic_message(payload.as_ref()));
            log::error!("[Session {}] {}", tag, reason);
            control.fail(reason);
        }
    }

    fn run_session(ctx: WorkerContext) {
        let tag = short_id(&ctx.session_id).to_string();
        let control = Arc::clone(&ctx.control);

        let mut detector = match ctx.backends.create_default() {
            Ok(detector) => detector,
            Err(err) => {
                log::error!("[Session {}] failed to create detector: {:#}", tag, err);
                control.fail(format!("failed to create detector: {:#}", err));
                return;
            }
        };
        if let Err(err) = detector.warm_up() {
            log::error!("[Session {}] detector warm-up failed: {:#}", tag, err);
            control.fail(format!("detector warm-up failed: {:#}", err));
            return;
        }

        let scheduler = DetectionScheduler::new(detector, &ctx.detector, &ctx.session, &tag);
        let persister = ResultPersister::new(
            &ctx.session_id,
            ctx.paths.clone(),
            ctx.session.save_interval,
            ctx.session.jpeg_quality,
        );
        Self::new(&ctx, scheduler, persister).run();
    }

    pub fn new(
        ctx: &WorkerContext,
        scheduler: DetectionScheduler,
        persister: ResultPersister,
    ) -> Self {
        Self {
            session_id: ctx.session_id.clone(),
            source_uri: ctx.source_uri.clone(),
            control: Arc::clone(&ctx.control),
            frame_state: Arc::clone(&ctx.frame_state),
            sources: Arc::clone(&ctx.sources),
            source: None,
            scheduler,
            persister,
            settings: ctx.session.clone(),
        }
    }

    fn tag(&self) -> &str {
        short_id(&self.session_id)
    }

    /// Run until stopped or failed. The source is released on every exit path.
    pub fn run(mut self) {
        match self.sources.open(&self.source_uri) {
            Ok(source) => self.source = Some(source),
            Err(err) => {
                log::error!(
                    "[Session {}] could not open stream {}: {:#}",
                    self.tag(),
                    redact_uri(&self.source_uri),
                    err
                );
                self.control.fail(format!("could not open stream: {:#}", err));
                return;
            }
        }
        log::info!(
            "[Session {}] detection started on {} using {} detector",
            self.tag(),
            redact_uri(&self.source_uri),
            self.scheduler.detector_name()
        );

        while !self.control.stop_requested() {
            match self.step() {
                StepOutcome::Continue => self.pause(self.settings.loop_pacing),
                StepOutcome::RetryAfterDelay(reason) => {
                    log::warn!("[Session {}] {}; retrying", self.tag(), reason);
                    self.pause(self.settings.reconnect_backoff);
                }
                StepOutcome::Fail(reason) => {
                    log::error!("[Session {}] {}", self.tag(), reason);
                    self.control.fail(reason);
                    break;
                }
            }
        }

        self.source = None;
        let status = self.control.mark_stopped();
        log::info!("[Session {}] detection ended ({})", self.tag(), status);
    }

    /// One iteration: (re)open if needed, read, publish, detect, persist.
    pub fn step(&mut self) -> StepOutcome {
        if self.source.is_none() {
            match self.sources.open(&self.source_uri) {
                Ok(source) => {
                    log::info!("[Session {}] reconnected to {}", self.tag(), source.describe());
                    self.source = Some(source);
                }
                Err(err) => {
                    return StepOutcome::RetryAfterDelay(format!("reconnect failed: {:#}", err))
                }
            }
        }
        let Some(source) = self.source.as_mut() else {
            return StepOutcome::RetryAfterDelay("source unavailable".to_string());
        };
        if !source.is_healthy() {
            let description = source.describe();
            self.source = None;
            return StepOutcome::RetryAfterDelay(format!("source {} is unhealthy", description));
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.source = None;
                return StepOutcome::RetryAfterDelay(format!("failed to read frame: {:#}", err));
            }
        };

        let snapshot = self.frame_state.publish(frame);
        if !self.scheduler.should_process() {
            return StepOutcome::Continue;
        }

        let outcome = match self.scheduler.process(&snapshot) {
            Ok(outcome) => outcome,
            Err(err) => return StepOutcome::Fail(format!("error in detection: {:#}", err)),
        };
        self.frame_state.publish_overlay(outcome.full.clone());

        let now = Instant::now();
        if self.persister.due(now) {
            if let Err(err) = self.persister.persist(now, &snapshot, &outcome) {
                log::error!("[Session {}] failed to save results: {:#}", self.tag(), err);
            }
        }
        StepOutcome::Continue
    }

    /// Sleep in slices so a stop request is observed promptly.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.control.stop_requested() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{RawDetection, StubBackend};
    use crate::frame::Frame;
    use anyhow::{anyhow, Context, Result};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed sequence of reads; `None` is a read failure.
    struct ScriptedSource {
        reads: VecDeque<Option<Frame>>,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Frame> {
            match self.reads.pop_front() {
                Some(Some(frame)) => Ok(frame),
                Some(None) => Err(anyhow!("scripted read failure")),
                None => Ok(Frame::new(32, 24)),
            }
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    struct ScriptedFactory {
        opens: Mutex<usize>,
        reads: Vec<Option<Frame>>,
        fail_opens: usize,
    }

    impl SourceFactory for ScriptedFactory {
        fn open(&self, _uri: &str) -> Result<Box<dyn FrameSource>> {
            let mut opens = self.opens.lock().map_err(|_| anyhow!("poisoned"))?;
            *opens += 1;
            if *opens <= self.fail_opens {
                return Err(anyhow!("connection refused"));
            }
            Ok(Box::new(ScriptedSource {
                reads: self.reads.clone().into(),
            }))
        }
    }

    fn context(dir: &std::path::Path, factory: ScriptedFactory) -> Result<WorkerContext> {
        let paths = SessionPaths {
            results_dir: dir.join("results"),
            images_dir: dir.join("images"),
        };
        std::fs::create_dir_all(&paths.results_dir)?;
        std::fs::create_dir_all(&paths.images_dir)?;
        Ok(WorkerContext {
            session_id: "0123456789abcdef".to_string(),
            source_uri: "rtsp://cam/stream".to_string(),
            paths,
            control: Arc::new(SessionControl::new()),
            frame_state: Arc::new(SharedFrameState::new()),
            sources: Arc::new(factory),
            backends: Arc::new(BackendRegistry::new()),
            detector: DetectorSettings::default(),
            session: SessionSettings {
                save_interval: Duration::ZERO,
                ..SessionSettings::default()
            },
        })
    }

    fn worker(ctx: &WorkerContext, detector: StubBackend) -> SessionWorker {
        let scheduler =
            DetectionScheduler::new(Box::new(detector), &ctx.detector, &ctx.session, "01234567");
        let persister =
            ResultPersister::new(&ctx.session_id, ctx.paths.clone(), ctx.session.save_interval, 90);
        SessionWorker::new(ctx, scheduler, persister)
    }

    #[test]
    fn read_failure_requests_retry_and_reopens() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let factory = ScriptedFactory {
            opens: Mutex::new(0),
            reads: vec![Some(Frame::new(32, 24)), None],
            fail_opens: 0,
        };
        let ctx = context(dir.path(), factory)?;
        let mut worker = worker(&ctx, StubBackend::new());

        assert_eq!(worker.step(), StepOutcome::Continue);
        assert!(matches!(worker.step(), StepOutcome::RetryAfterDelay(_)));
        assert_eq!(worker.step(), StepOutcome::Continue);
        assert_eq!(ctx.frame_state.frame_count(), 2);
        assert_eq!(ctx.control.status(), crate::session::SessionStatus::Running);
        Ok(())
    }

    #[test]
    fn reconnect_failure_is_transient() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let factory = ScriptedFactory {
            opens: Mutex::new(0),
            reads: Vec::new(),
            fail_opens: 2,
        };
        let ctx = context(dir.path(), factory)?;
        let mut worker = worker(&ctx, StubBackend::new());

        assert!(matches!(worker.step(), StepOutcome::RetryAfterDelay(_)));
        assert!(matches!(worker.step(), StepOutcome::RetryAfterDelay(_)));
        assert_eq!(worker.step(), StepOutcome::Continue);
        Ok(())
    }

    #[test]
    fn detector_failure_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let factory = ScriptedFactory {
            opens: Mutex::new(0),
            reads: Vec::new(),
            fail_opens: 0,
        };
        let ctx = context(dir.path(), factory)?;
        let mut worker = worker(&ctx, StubBackend::new().failing_after(1));

        assert_eq!(worker.step(), StepOutcome::Continue);
        assert_eq!(worker.step(), StepOutcome::Continue);
        assert_eq!(worker.step(), StepOutcome::Continue);
        assert!(matches!(worker.step(), StepOutcome::Fail(_)));
        Ok(())
    }

    #[test]
    fn processed_frames_publish_overlay_and_persist() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let factory = ScriptedFactory {
            opens: Mutex::new(0),
            reads: Vec::new(),
            fail_opens: 0,
        };
        let ctx = context(dir.path(), factory)?;
        let detector = StubBackend::with_script(vec![vec![RawDetection::new(
            0,
            0.9,
            [2.0, 2.0, 12.0, 12.0],
        )]]);
        let mut worker = worker(&ctx, detector);

        assert_eq!(worker.step(), StepOutcome::Continue);
        let snap = ctx.frame_state.snapshot();
        let overlay = snap.overlay.context("overlay published")?;
        assert_eq!(overlay.frame_id, 1);
        assert_eq!(overlay.total_detections, 1);

        assert_eq!(std::fs::read_dir(&ctx.paths.results_dir)?.count(), 1);
        assert_eq!(std::fs::read_dir(&ctx.paths.images_dir)?.count(), 2);
        Ok(())
    }

    #[test]
    fn open_failure_marks_session_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let factory = ScriptedFactory {
            opens: Mutex::new(0),
            reads: Vec::new(),
            fail_opens: usize::MAX,
        };
        let ctx = context(dir.path(), factory)?;
        let control = Arc::clone(&ctx.control);
        worker(&ctx, StubBackend::new()).run();

        assert_eq!(control.status(), crate::session::SessionStatus::Error);
        assert!(control.error().unwrap_or_default().contains("could not open stream"));
        Ok(())
    }

    #[test]
    fn stop_request_ends_run_loop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let factory = ScriptedFactory {
            opens: Mutex::new(0),
            reads: Vec::new(),
            fail_opens: 0,
        };
        let ctx = context(dir.path(), factory)?;
        let control = Arc::clone(&ctx.control);
        let state = Arc::clone(&ctx.frame_state);
        let worker = worker(&ctx, StubBackend::new());
        let handle = thread::spawn(move || worker.run());

        let started = Instant::now();
        while state.frame_count() < 3 && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        control.request_stop();
        handle.join().map_err(|_| anyhow!("worker panicked"))?;
        assert_eq!(control.status(), crate::session::SessionStatus::Stopped);
        assert!(state.frame_count() >= 3);
        Ok(())
    }

    #[test]
    fn missing_detector_backend_fails_session() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let factory = ScriptedFactory {
            opens: Mutex::new(0),
            reads: Vec::new(),
            fail_opens: 0,
        };
        let ctx = context(dir.path(), factory)?;
        let control = Arc::clone(&ctx.control);
        SessionWorker::spawn_body(ctx);
        assert_eq!(control.status(), crate::session::SessionStatus::Error);
        Ok(())
    }
    /// Connected but reporting itself stalled.
    struct StalledSource;

    impl FrameSource for StalledSource {
        fn next_frame(&mut self) -> Result<Frame> {
            Ok(Frame::new(32, 24))
        }

        fn is_healthy(&self) -> bool {
            false
        }

        fn describe(&self) -> String {
            "stalled".to_string()
        }
    }

    struct StalledFactory {
        opens: Mutex<usize>,
    }

    impl SourceFactory for StalledFactory {
        fn open(&self, _uri: &str) -> Result<Box<dyn FrameSource>> {
            *self.opens.lock().map_err(|_| anyhow!("poisoned"))? += 1;
            Ok(Box::new(StalledSource))
        }
    }

    #[test]
    fn unhealthy_source_is_reopened_without_reading() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ctx = context(
            dir.path(),
            ScriptedFactory {
                opens: Mutex::new(0),
                reads: Vec::new(),
                fail_opens: 0,
            },
        )?;
        let factory = Arc::new(StalledFactory {
            opens: Mutex::new(0),
        });
        let ctx = WorkerContext {
            sources: Arc::clone(&factory) as Arc<dyn SourceFactory>,
            ..ctx
        };
        let mut worker = worker(&ctx, StubBackend::new());

        let outcome = worker.step();
        assert!(
            matches!(&outcome, StepOutcome::RetryAfterDelay(reason) if reason.contains("unhealthy")),
            "{outcome:?}"
        );
        assert!(matches!(worker.step(), StepOutcome::RetryAfterDelay(_)));
        assert_eq!(*factory.opens.lock().map_err(|_| anyhow!("poisoned"))?, 2);
        assert_eq!(ctx.frame_state.frame_count(), 0);
        assert_eq!(ctx.control.status(), crate::session::SessionStatus::Running);
        Ok(())
    }

    struct PanickingBackend;

    impl crate::detect::DetectorBackend for PanickingBackend {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn detect(
            &mut self,
            _frame: &image::RgbImage,
            _confidence_threshold: f32,
            _class_filter: &[u32],
        ) -> Result<Vec<RawDetection>> {
            panic!("detector exploded")
        }
    }

    #[test]
    fn detector_panic_marks_session_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let factory = ScriptedFactory {
            opens: Mutex::new(0),
            reads: Vec::new(),
            fail_opens: 0,
        };
        let mut backends = BackendRegistry::new();
        backends.register("panicking", || {
            Ok(Box::new(PanickingBackend) as Box<dyn crate::detect::DetectorBackend>)
        });
        let ctx = WorkerContext {
            backends: Arc::new(backends),
            ..context(dir.path(), factory)?
        };
        let control = Arc::clone(&ctx.control);

        SessionWorker::spawn_body(ctx);

        assert_eq!(control.status(), crate::session::SessionStatus::Error);
        let error = control.error().unwrap_or_default();
        assert!(error.contains("worker panicked"), "{error}");
        assert!(error.contains("detector exploded"), "{error}");
        Ok(())
    }

    #[test]
    fn panic_message_reads_common_payloads() {
        let static_str: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(static_str.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
