use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a detector backend reports for one object: class, score, and an
/// absolute pixel box `[x1, y1, x2, y2]`.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

impl RawDetection {
    pub fn new(class_id: u32, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
        }
    }
}

/// One detection as it appears in records and overlays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: usize,
    #[serde(rename = "class")]
    pub class_name: String,
    pub class_id: u32,
    pub confidence: f32,
    /// Absolute pixel box, clamped to the frame.
    pub bbox: [f32; 4],
    /// `bbox` divided by frame width/height; every component in [0, 1].
    pub rel_bbox: [f32; 4],
}

impl Detection {
    pub fn from_raw(id: usize, raw: &RawDetection, class_name: &str, width: u32, height: u32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        let bbox = [
            raw.bbox[0].clamp(0.0, w),
            raw.bbox[1].clamp(0.0, h),
            raw.bbox[2].clamp(0.0, w),
            raw.bbox[3].clamp(0.0, h),
        ];
        let rel_bbox = [bbox[0] / w, bbox[1] / h, bbox[2] / w, bbox[3] / h];
        Self {
            id,
            class_name: class_name.to_string(),
            class_id: raw.class_id,
            confidence: raw.confidence,
            bbox,
            rel_bbox,
        }
    }
}

/// A detection pass over one frame.
///
/// The same shape serves both the persisted view (save classes only) and
/// the in-memory full view used for overlays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// RFC 3339 capture time of the detection pass.
    pub timestamp: String,
    pub frame_id: u64,
    pub detections: Vec<Detection>,
    pub detection_counts: BTreeMap<String, usize>,
    pub total_detections: usize,
}

impl DetectionRecord {
    /// Builds a record, counting detections per class. Every name in
    /// `known_classes` gets an entry even when its count is zero.
    pub fn new<'a>(
        timestamp: String,
        frame_id: u64,
        detections: Vec<Detection>,
        known_classes: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut detection_counts: BTreeMap<String, usize> = known_classes
            .into_iter()
            .map(|name| (name.to_string(), 0))
            .collect();
        for det in &detections {
            *detection_counts.entry(det.class_name.clone()).or_insert(0) += 1;
        }
        Self {
            timestamp,
            frame_id,
            total_detections: detections.len(),
            detections,
            detection_counts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Class id to display name mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassCatalog {
    names: BTreeMap<u32, String>,
}

impl ClassCatalog {
    pub fn new(names: BTreeMap<u32, String>) -> Self {
        Self { names }
    }

    pub fn name(&self, class_id: u32) -> &str {
        self.names
            .get(&class_id)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    /// Names for the given ids, in id order, without duplicates.
    pub fn names_for(&self, ids: &[u32]) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for id in ids {
            let name = self.name(*id);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_box_is_absolute_over_frame_size() {
        let raw = RawDetection::new(0, 0.9, [64.0, 48.0, 320.0, 240.0]);
        let det = Detection::from_raw(0, &raw, "person", 640, 480);
        assert_eq!(det.bbox, [64.0, 48.0, 320.0, 240.0]);
        assert_eq!(det.rel_bbox, [0.1, 0.1, 0.5, 0.5]);
    }

    #[test]
    fn boxes_outside_the_frame_are_clamped() {
        let raw = RawDetection::new(2, 0.7, [-10.0, -5.0, 700.0, 500.0]);
        let det = Detection::from_raw(3, &raw, "car", 640, 480);
        assert_eq!(det.bbox, [0.0, 0.0, 640.0, 480.0]);
        for v in det.rel_bbox {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn record_counts_include_zero_classes() {
        let raw = RawDetection::new(0, 0.8, [1.0, 1.0, 2.0, 2.0]);
        let det = Detection::from_raw(0, &raw, "person", 10, 10);
        let record = DetectionRecord::new("t".into(), 4, vec![det], ["person", "car"]);
        assert_eq!(record.total_detections, 1);
        assert_eq!(record.detection_counts["person"], 1);
        assert_eq!(record.detection_counts["car"], 0);
    }

    #[test]
    fn record_serializes_with_class_field() {
        let raw = RawDetection::new(16, 0.6, [0.0, 0.0, 5.0, 5.0]);
        let det = Detection::from_raw(0, &raw, "animal", 10, 10);
        let record = DetectionRecord::new("t".into(), 1, vec![det], ["animal"]);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["detections"][0]["class"], "animal");
        assert_eq!(value["detections"][0]["class_id"], 16);
        assert!(value["detections"][0].get("rel_bbox").is_some());
        assert_eq!(value["total_detections"], 1);
    }

    #[test]
    fn catalog_falls_back_to_unknown() {
        let catalog = ClassCatalog::new(BTreeMap::from([(0, "person".to_string())]));
        assert_eq!(catalog.name(0), "person");
        assert_eq!(catalog.name(7), "unknown");
        assert_eq!(catalog.names_for(&[0, 7, 9]), vec!["person", "unknown"]);
    }
}
