//! Live MJPEG view of a session.
//!
//! Every viewer gets its own `StreamBroadcaster`; nothing is shared between
//! viewers except the session's `SharedFrameState`, which is only read.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Result;

use crate::annotate;
use crate::config::StreamSettings;
use crate::error::SessionError;
use crate::session::{SessionRegistry, SessionStatus};
use crate::short_id;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub struct StreamBroadcaster {
    session_id: String,
    registry: Arc<SessionRegistry>,
    settings: StreamSettings,
}

impl StreamBroadcaster {
    pub fn new(session_id: &str, registry: Arc<SessionRegistry>, settings: StreamSettings) -> Self {
        Self {
            session_id: session_id.to_string(),
            registry,
            settings,
        }
    }

    /// One JPEG for the current state: the annotated latest frame, or an
    /// error frame if the session is gone, stopped, not yet producing, or
    /// the encode fails.
    pub fn render(&self) -> Result<Vec<u8>> {
        match self.render_live() {
            Ok(jpeg) => Ok(jpeg),
            Err(message) => annotate::encode_jpeg(
                &annotate::error_frame(&message),
                self.settings.jpeg_quality,
            ),
        }
    }

    fn render_live(&self) -> Result<Vec<u8>, String> {
        let view = self.registry.status(&self.session_id).map_err(|err| match err {
            SessionError::NotFound(_) => "Session not found".to_string(),
            other => other.to_string(),
        })?;
        if view.status != SessionStatus::Running {
            return Err(format!("Session not running ({})", view.status));
        }
        let state = self
            .registry
            .frame_state(&self.session_id)
            .map_err(|err| err.to_string())?;

        let snapshot = state.snapshot();
        let Some(frame) = snapshot.frame.as_ref() else {
            return Err("Waiting for video".to_string());
        };

        let mut image = frame.frame.clone();
        if let Some(overlay) = &snapshot.overlay {
            annotate::draw_detections(&mut image, &overlay.detections);
        }
        let stamp = format!("{} #{}", short_id(&self.session_id), frame.frame_id);
        annotate::draw_banner(&mut image, &stamp);

        annotate::encode_jpeg(&image, self.settings.jpeg_quality)
            .map_err(|err| format!("Encoding error: {}", err))
    }

    /// Write one multipart chunk.
    pub fn write_part<W: Write>(writer: &mut W, jpeg: &[u8]) -> io::Result<()> {
        let header = format!(
            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY,
            jpeg.len()
        );
        writer.write_all(header.as_bytes())?;
        writer.write_all(jpeg)?;
        writer.write_all(b"\r\n")?;
        writer.flush()
    }

    /// Emit parts at the configured cadence until the viewer goes away or
    /// `shutdown` is raised. Returns the number of parts written.
    pub fn run<W: Write>(&self, writer: &mut W, shutdown: &AtomicBool) -> u64 {
        let tag = short_id(&self.session_id).to_string();
        log::debug!("[Session {}] viewer connected", tag);
        let mut parts = 0;
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            let jpeg = match self.render() {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    log::error!("[Session {}] stream encode failed: {:#}", tag, err);
                    break;
                }
            };
            if Self::write_part(writer, &jpeg).is_err() {
                break;
            }
            parts += 1;
            if let Some(rest) = self.settings.cadence.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
        log::debug!("[Session {}] viewer disconnected after {} frames", tag, parts);
        parts
    }
}
