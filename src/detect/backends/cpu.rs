use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::{retain_matching, DetectorBackend};
use crate::detect::result::RawDetection;

const CELL: u32 = 16;
const LUMA_DELTA: u8 = 24;

/// CPU backend for motion detection.
///
/// Compares per-cell mean luma against the previous frame and reports the
/// bounding box of all changed cells as a single detection of `class_id`.
/// Confidence is the fraction of cells inside that box which changed,
/// mapped into [0.5, 1.0].
pub struct CpuBackend {
    class_id: u32,
    previous: Option<LumaGrid>,
}

struct LumaGrid {
    cols: u32,
    rows: u32,
    width: u32,
    height: u32,
    cells: Vec<u8>,
}

impl LumaGrid {
    fn from_frame(frame: &RgbImage) -> Self {
        let (width, height) = frame.dimensions();
        let cols = width.div_ceil(CELL);
        let rows = height.div_ceil(CELL);
        let mut sums = vec![0u64; (cols * rows) as usize];
        let mut counts = vec![0u64; (cols * rows) as usize];
        for (x, y, px) in frame.enumerate_pixels() {
            let idx = ((y / CELL) * cols + x / CELL) as usize;
            let [r, g, b] = px.0;
            sums[idx] += (299 * r as u64 + 587 * g as u64 + 114 * b as u64) / 1000;
            counts[idx] += 1;
        }
        let cells = sums
            .iter()
            .zip(&counts)
            .map(|(sum, count)| (sum / (*count).max(1)) as u8)
            .collect();
        Self {
            cols,
            rows,
            width,
            height,
            cells,
        }
    }
}

impl CpuBackend {
    pub fn new(class_id: u32) -> Self {
        Self {
            class_id,
            previous: None,
        }
    }

    fn diff(&self, prev: &LumaGrid, current: &LumaGrid) -> Option<RawDetection> {
        let mut changed = Vec::new();
        for row in 0..current.rows {
            for col in 0..current.cols {
                let idx = (row * current.cols + col) as usize;
                if prev.cells[idx].abs_diff(current.cells[idx]) > LUMA_DELTA {
                    changed.push((col, row));
                }
            }
        }
        if changed.is_empty() {
            return None;
        }

        let min_col = changed.iter().map(|c| c.0).min()?;
        let max_col = changed.iter().map(|c| c.0).max()?;
        let min_row = changed.iter().map(|c| c.1).min()?;
        let max_row = changed.iter().map(|c| c.1).max()?;
        let area = ((max_col - min_col + 1) * (max_row - min_row + 1)) as f32;
        let fill = changed.len() as f32 / area;

        let x1 = (min_col * CELL) as f32;
        let y1 = (min_row * CELL) as f32;
        let x2 = ((max_col + 1) * CELL).min(current.width) as f32;
        let y2 = ((max_row + 1) * CELL).min(current.height) as f32;

        Some(RawDetection::new(
            self.class_id,
            0.5 + 0.5 * fill.clamp(0.0, 1.0),
            [x1, y1, x2, y2],
        ))
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(
        &mut self,
        frame: &RgbImage,
        confidence_threshold: f32,
        class_filter: &[u32],
    ) -> Result<Vec<RawDetection>> {
        let current = LumaGrid::from_frame(frame);
        let detection = match &self.previous {
            Some(prev) if prev.width == current.width && prev.height == current.height => {
                self.diff(prev, &current)
            }
            _ => None,
        };
        self.previous = Some(current);

        let mut detections: Vec<RawDetection> = detection.into_iter().collect();
        retain_matching(&mut detections, confidence_threshold, class_filter);
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frame_with_block(x0: u32, y0: u32) -> RgbImage {
        let mut frame = RgbImage::from_pixel(128, 96, Rgb([20, 20, 20]));
        for y in y0..y0 + 32 {
            for x in x0..x0 + 32 {
                frame.put_pixel(x, y, Rgb([240, 240, 240]));
            }
        }
        frame
    }

    #[test]
    fn cpu_backend_detects_motion() -> Result<()> {
        let mut backend = CpuBackend::new(0);

        let first = backend.detect(&frame_with_block(0, 0), 0.5, &[0])?;
        assert!(first.is_empty());

        let moved = backend.detect(&frame_with_block(64, 32), 0.5, &[0])?;
        assert_eq!(moved.len(), 1);
        let det = &moved[0];
        assert_eq!(det.class_id, 0);
        assert!(det.confidence >= 0.5 && det.confidence <= 1.0);
        assert_eq!(det.bbox, [0.0, 0.0, 96.0, 64.0]);

        let still = backend.detect(&frame_with_block(64, 32), 0.5, &[0])?;
        assert!(still.is_empty());
        Ok(())
    }

    #[test]
    fn cpu_backend_honours_class_filter() -> Result<()> {
        let mut backend = CpuBackend::new(16);
        backend.detect(&frame_with_block(0, 0), 0.5, &[0])?;
        let moved = backend.detect(&frame_with_block(64, 32), 0.5, &[0])?;
        assert!(moved.is_empty());
        Ok(())
    }
}
