use anyhow::{Context, Result};

use crate::config::{DetectorSettings, SessionSettings};
use crate::detect::{ClassCatalog, Detection, DetectionRecord, DetectorBackend};
use crate::frame::FrameSnapshot;

/// Result of one detection pass.
#[derive(Clone, Debug)]
pub struct DetectionOutcome {
    /// Every configured detect class; drives the live overlay.
    pub full: DetectionRecord,
    /// Save classes only; what gets written to disk.
    pub persisted: DetectionRecord,
}

/// Samples frames at a fixed ratio and runs the detector on the sampled ones.
///
/// With `frame_skip = 2` the pattern is process, skip, skip, process, ...
pub struct DetectionScheduler {
    detector: Box<dyn DetectorBackend>,
    catalog: ClassCatalog,
    confidence: f32,
    detect_classes: Vec<u32>,
    save_classes: Vec<u32>,
    frame_skip: u32,
    skip_remaining: u32,
    session_tag: String,
}

impl DetectionScheduler {
    pub fn new(
        detector: Box<dyn DetectorBackend>,
        detector_settings: &DetectorSettings,
        session_settings: &SessionSettings,
        session_tag: &str,
    ) -> Self {
        Self {
            detector,
            catalog: ClassCatalog::new(detector_settings.class_names.clone()),
            confidence: detector_settings.confidence,
            detect_classes: detector_settings.detect_classes.clone(),
            save_classes: detector_settings.save_classes.clone(),
            frame_skip: session_settings.frame_skip,
            skip_remaining: 0,
            session_tag: session_tag.to_string(),
        }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    /// Advance the skip counter; `true` means this frame should be processed.
    pub fn should_process(&mut self) -> bool {
        if self.skip_remaining == 0 {
            self.skip_remaining = self.frame_skip;
            true
        } else {
            self.skip_remaining -= 1;
            false
        }
    }

    /// Run the detector and split its output into the full and persisted views.
    ///
    /// A detector error is returned as-is; the worker treats it as fatal.
    pub fn process(&mut self, snapshot: &FrameSnapshot) -> Result<DetectionOutcome> {
        let raw = self
            .detector
            .detect(&snapshot.frame, self.confidence, &self.detect_classes)
            .with_context(|| format!("{} detector failed", self.detector.name()))?;

        let (width, height) = snapshot.frame.dimensions();
        let full: Vec<Detection> = raw
            .iter()
            .filter(|det| self.detect_classes.contains(&det.class_id))
            .enumerate()
            .map(|(id, det)| {
                Detection::from_raw(id, det, self.catalog.name(det.class_id), width, height)
            })
            .collect();
        let persisted: Vec<Detection> = full
            .iter()
            .filter(|det| self.save_classes.contains(&det.class_id))
            .cloned()
            .collect();

        let timestamp = snapshot.captured_at.to_rfc3339();
        let full = DetectionRecord::new(
            timestamp.clone(),
            snapshot.frame_id,
            full,
            self.catalog.names_for(&self.detect_classes),
        );
        let persisted = DetectionRecord::new(
            timestamp,
            snapshot.frame_id,
            persisted,
            self.catalog.names_for(&self.save_classes),
        );

        if !full.is_empty() {
            let summary = full
                .detection_counts
                .iter()
                .map(|(class, count)| format!("{} {}", count, class))
                .collect::<Vec<_>>()
                .join(", ");
            log::info!("[Session {}] Detected: {}", self.session_tag, summary);
        }

        Ok(DetectionOutcome { full, persisted })
    }
}
