use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::annotate;
use crate::frame::FrameSnapshot;
use crate::session::{DetectionOutcome, SessionPaths};
use crate::{short_id, CaptureKey};

/// What one save wrote.
#[derive(Clone, Debug)]
pub struct PersistReport {
    pub key: CaptureKey,
    pub record_path: PathBuf,
    pub original_image: Option<PathBuf>,
    pub annotated_image: Option<PathBuf>,
}

/// Writes detection records and image artifacts no more often than
/// `interval`.
///
/// Layout, all sharing one capture key `<ts>`:
/// - `<results_dir>/detection_<ts>.json` on every save
/// - `<images_dir>/original_<ts>.jpg` and `annotated_<ts>.jpg` only when the
///   full view has detections
pub struct ResultPersister {
    session_id: String,
    paths: SessionPaths,
    interval: Duration,
    jpeg_quality: u8,
    last_save: Option<Instant>,
    last_key: Option<CaptureKey>,
}

impl ResultPersister {
    pub fn new(session_id: &str, paths: SessionPaths, interval: Duration, jpeg_quality: u8) -> Self {
        Self {
            session_id: session_id.to_string(),
            paths,
            interval,
            jpeg_quality,
            last_save: None,
            last_key: None,
        }
    }

    /// The first save is always due.
    pub fn due(&self, now: Instant) -> bool {
        self.last_save
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    /// Write the artifacts for one capture event.
    ///
    /// The interval clock restarts even if a write fails, so a broken disk
    /// is retried at the save rate rather than on every frame.
    pub fn persist(
        &mut self,
        now: Instant,
        snapshot: &FrameSnapshot,
        outcome: &DetectionOutcome,
    ) -> Result<PersistReport> {
        self.last_save = Some(now);
        let key = self.next_key();
        let mut report = PersistReport {
            key,
            record_path: self.paths.results_dir.join(format!("detection_{}.json", key)),
            original_image: None,
            annotated_image: None,
        };

        if !outcome.full.is_empty() {
            match self.write_images(key, snapshot, outcome) {
                Ok((original, annotated)) => {
                    report.original_image = Some(original);
                    report.annotated_image = Some(annotated);
                }
                Err(err) => log::error!(
                    "[Session {}] failed to save images for {}: {:#}",
                    short_id(&self.session_id),
                    key,
                    err
                ),
            }
        }

        let json = serde_json::to_vec_pretty(&outcome.persisted)
            .context("serialize detection record")?;
        write_atomically(&report.record_path, &json)?;

        log::debug!(
            "[Session {}] saved frame {} with {} persisted detections ({})",
            short_id(&self.session_id),
            snapshot.frame_id,
            outcome.persisted.total_detections,
            key
        );
        Ok(report)
    }

    fn next_key(&mut self) -> CaptureKey {
        let now = CaptureKey::now();
        let key = match self.last_key {
            Some(last) if now <= last => last.next(),
            _ => now,
        };
        self.last_key = Some(key);
        key
    }

    fn write_images(
        &self,
        key: CaptureKey,
        snapshot: &FrameSnapshot,
        outcome: &DetectionOutcome,
    ) -> Result<(PathBuf, PathBuf)> {
        let original_path = self.paths.images_dir.join(format!("original_{}.jpg", key));
        let original = annotate::encode_jpeg(&snapshot.frame, self.jpeg_quality)?;
        write_atomically(&original_path, &original)?;

        let mut annotated = snapshot.frame.clone();
        annotate::draw_detections(&mut annotated, &outcome.full.detections);
        let banner = format!(
            "SESSION {} | {}",
            short_id(&self.session_id),
            key.time().format("%Y-%m-%d %H:%M:%S")
        );
        annotate::draw_banner(&mut annotated, &banner);
        let annotated_path = self.paths.images_dir.join(format!("annotated_{}.jpg", key));
        let annotated = annotate::encode_jpeg(&annotated, self.jpeg_quality)?;
        write_atomically(&annotated_path, &annotated)?;

        Ok((original_path, annotated_path))
    }
}

/// Write to a hidden temp file next to `path`, then rename over it.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("artifact path has no file name")?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}
