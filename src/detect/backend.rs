use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;

/// Detector backend trait.
///
/// A backend is owned by exactly one session worker and is called
/// synchronously from that worker's thread. Any error returned from
/// `detect` is fatal to the session.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Only detections with `confidence >= confidence_threshold` whose class
    /// id appears in `class_filter` are returned. Boxes are absolute pixel
    /// coordinates in the frame's own resolution.
    fn detect(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        class_filter: &[u32],
    ) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Shared filter used by backends that produce unfiltered candidates.
pub(crate) fn retain_matching(
    detections: &mut Vec<RawDetection>,
    confidence_threshold: f32,
    class_filter: &[u32],
) {
    detections.retain(|det| {
        det.confidence >= confidence_threshold && class_filter.contains(&det.class_id)
    });
}
