//! Read side of persisted session artifacts.
//!
//! Records live at `<results_dir>/detection_<key>.json`, images at
//! `<images_dir>/{original,annotated}_<key>.jpg`. Keys sort lexically in
//! capture order, so "newest first" is a reverse name sort.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::DetectionRecord;
use crate::error::{SessionError, SessionResult};
use crate::CaptureKey;

pub const DEFAULT_RESULTS_LIMIT: usize = 10;

const RECORD_PREFIX: &str = "detection_";
const RECORD_SUFFIX: &str = ".json";
const IMAGE_SUFFIX: &str = ".jpg";

/// A persisted record plus the paths of its paired images, if they exist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredResult {
    #[serde(flatten)]
    pub record: DetectionRecord,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_image_path: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Annotated,
    Original,
}

impl ImageKind {
    fn prefix(self) -> &'static str {
        match self {
            ImageKind::Original => "original_",
            ImageKind::Annotated => "annotated_",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ImageKind,
    pub timestamp: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub total_records: usize,
    pub records_with_detections: usize,
    pub total_detections: usize,
    pub avg_detections_per_record: f64,
    pub detection_counts: BTreeMap<String, usize>,
}

/// Split `original_<key>.jpg` / `annotated_<key>.jpg` into kind and key.
pub fn parse_image_name(name: &str) -> Option<(ImageKind, CaptureKey)> {
    let stem = name.strip_suffix(IMAGE_SUFFIX)?;
    [ImageKind::Original, ImageKind::Annotated]
        .into_iter()
        .find_map(|kind| {
            let key = CaptureKey::parse(stem.strip_prefix(kind.prefix())?)?;
            Some((kind, key))
        })
}

fn parse_record_name(name: &str) -> Option<CaptureKey> {
    let key = name.strip_prefix(RECORD_PREFIX)?.strip_suffix(RECORD_SUFFIX)?;
    CaptureKey::parse(key)
}

/// File names in `dir`, or nothing if the directory does not exist yet.
fn file_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn record_keys(results_dir: &Path) -> Result<Vec<CaptureKey>> {
    let mut keys: Vec<CaptureKey> = file_names(results_dir)?
        .iter()
        .filter_map(|name| parse_record_name(name))
        .collect();
    keys.sort_unstable_by(|a, b| b.cmp(a));
    Ok(keys)
}

fn read_record(results_dir: &Path, key: CaptureKey) -> Result<DetectionRecord> {
    let path = results_dir.join(format!("{}{}{}", RECORD_PREFIX, key, RECORD_SUFFIX));
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

fn image_path(images_dir: &Path, kind: ImageKind, key: CaptureKey) -> Option<String> {
    let path: PathBuf = images_dir.join(format!("{}{}{}", kind.prefix(), key, IMAGE_SUFFIX));
    path.is_file().then(|| path.display().to_string())
}

/// Newest `limit` records, newest first. Unreadable records are skipped.
pub fn latest_results(
    results_dir: &Path,
    images_dir: &Path,
    limit: usize,
) -> Result<Vec<StoredResult>> {
    let mut results = Vec::new();
    for key in record_keys(results_dir)? {
        if results.len() >= limit {
            break;
        }
        match read_record(results_dir, key) {
            Ok(record) => results.push(StoredResult {
                record,
                key: key.to_string(),
                original_image_path: image_path(images_dir, ImageKind::Original, key),
                annotated_image_path: image_path(images_dir, ImageKind::Annotated, key),
            }),
            Err(err) => log::warn!("skipping detection record: {:#}", err),
        }
    }
    Ok(results)
}

/// Saved images, newest first; annotated before original within one key.
pub fn list_images(images_dir: &Path) -> Result<Vec<ImageEntry>> {
    let mut images: Vec<(CaptureKey, ImageEntry)> = Vec::new();
    for name in file_names(images_dir)? {
        let Some((kind, key)) = parse_image_name(&name) else {
            continue;
        };
        let size_bytes = fs::metadata(images_dir.join(&name))
            .map(|m| m.len())
            .unwrap_or(0);
        images.push((
            key,
            ImageEntry {
                name,
                kind,
                timestamp: key.to_string(),
                size_bytes,
            },
        ));
    }
    images.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.kind.cmp(&b.1.kind)));
    Ok(images.into_iter().map(|(_, entry)| entry).collect())
}

/// Bytes of one saved image. Only names produced by the persister are
/// accepted, which rules out path traversal.
pub fn read_image(images_dir: &Path, name: &str) -> SessionResult<Vec<u8>> {
    if parse_image_name(name).is_none() {
        return Err(SessionError::Validation(format!("invalid image name: {}", name)));
    }
    match fs::read(images_dir.join(name)) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(SessionError::NotFound(format!("image {}", name)))
        }
        Err(err) => Err(SessionError::Internal(format!("read image {}: {}", name, err))),
    }
}

/// Aggregate counts over every persisted record.
pub fn session_statistics(results_dir: &Path) -> Result<SessionStatistics> {
    let mut stats = SessionStatistics {
        total_records: 0,
        records_with_detections: 0,
        total_detections: 0,
        avg_detections_per_record: 0.0,
        detection_counts: BTreeMap::new(),
    };
    for key in record_keys(results_dir)? {
        let record = match read_record(results_dir, key) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("skipping detection record: {:#}", err);
                continue;
            }
        };
        stats.total_records += 1;
        if !record.is_empty() {
            stats.records_with_detections += 1;
        }
        stats.total_detections += record.total_detections;
        for (class, count) in record.detection_counts {
            *stats.detection_counts.entry(class).or_insert(0) += count;
        }
    }
    if stats.total_records > 0 {
        stats.avg_detections_per_record =
            stats.total_detections as f64 / stats.total_records as f64;
    }
    Ok(stats)
}
