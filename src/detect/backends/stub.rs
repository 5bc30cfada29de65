use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::{retain_matching, DetectorBackend};
use crate::detect::result::RawDetection;

/// Stub backend for testing.
///
/// Replays a script of per-call detections (cycling when exhausted) and can
/// be told to fail from a given call onward.
#[derive(Default)]
pub struct StubBackend {
    script: Vec<Vec<RawDetection>>,
    calls: usize,
    fail_from: Option<usize>,
}

impl StubBackend {
    /// A stub that never detects anything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<Vec<RawDetection>>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Fail every call after the first `calls` successful ones.
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.fail_from = Some(calls);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        _frame: &RgbImage,
        confidence_threshold: f32,
        class_filter: &[u32],
    ) -> Result<Vec<RawDetection>> {
        let call = self.calls;
        self.calls += 1;

        if self.fail_from.is_some_and(|from| call >= from) {
            return Err(anyhow!("stub detector failure on call {}", call + 1));
        }
        if self.script.is_empty() {
            return Ok(Vec::new());
        }

        let mut detections = self.script[call % self.script.len()].clone();
        retain_matching(&mut detections, confidence_threshold, class_filter);
        Ok(detections)
    }
}
