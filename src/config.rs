use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_RESULTS_DIR: &str = "detection_results";
const DEFAULT_IMAGES_DIR: &str = "saved_images";
const DEFAULT_DETECTOR: &str = "cpu";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_FRAME_SKIP: u32 = 2;
const DEFAULT_SAVE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_LOOP_PACING_MS: u64 = 50;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1_000;
const DEFAULT_SAVE_JPEG_QUALITY: u8 = 90;
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_BUFFER: u32 = 1;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_STREAM_CADENCE_MS: u64 = 100;
const DEFAULT_STREAM_JPEG_QUALITY: u8 = 80;

#[derive(Debug, Deserialize, Default)]
struct LivewatchConfigFile {
    api: Option<ApiConfigFile>,
    storage: Option<StorageConfigFile>,
    detector: Option<DetectorConfigFile>,
    session: Option<SessionConfigFile>,
    source: Option<SourceConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    results_dir: Option<PathBuf>,
    images_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence: Option<f32>,
    iou: Option<f32>,
    input_size: Option<u32>,
    detect_classes: Option<Vec<u32>>,
    save_classes: Option<Vec<u32>>,
    class_names: Option<BTreeMap<u32, String>>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    frame_skip: Option<u32>,
    save_interval_ms: Option<u64>,
    loop_pacing_ms: Option<u64>,
    reconnect_backoff_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    backend: Option<String>,
    target_fps: Option<u32>,
    buffer_frames: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    cadence_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct LivewatchConfig {
    pub api_addr: String,
    pub storage: StorageSettings,
    pub detector: DetectorSettings,
    pub session: SessionSettings,
    pub source: SourceSettings,
    pub stream: StreamSettings,
}

/// Root directories; each session gets a subdirectory named by its id.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub results_dir: PathBuf,
    pub images_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub confidence: f32,
    pub iou: f32,
    pub input_size: u32,
    /// Classes kept in the full (overlay) view.
    pub detect_classes: Vec<u32>,
    /// Classes written to disk; always a subset of `detect_classes`.
    pub save_classes: Vec<u32>,
    pub class_names: BTreeMap<u32, String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Frames skipped after each processed frame.
    pub frame_skip: u32,
    pub save_interval: Duration,
    pub loop_pacing: Duration,
    pub reconnect_backoff: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceBackend {
    Synthetic,
    Gstreamer,
}

impl FromStr for SourceBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "stub" => Ok(SourceBackend::Synthetic),
            "gstreamer" => Ok(SourceBackend::Gstreamer),
            other => Err(anyhow!(
                "unknown source backend '{}'; expected synthetic or gstreamer",
                other
            )),
        }
    }
}

impl Default for SourceBackend {
    fn default() -> Self {
        if cfg!(feature = "rtsp-gstreamer") {
            SourceBackend::Gstreamer
        } else {
            SourceBackend::Synthetic
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub backend: SourceBackend,
    pub target_fps: u32,
    /// Frames the decoder may queue ahead of the reader.
    pub buffer_frames: u32,
    /// Frame size for synthetic sources.
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub cadence: Duration,
    pub jpeg_quality: u8,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            model_path: None,
            confidence: DEFAULT_CONFIDENCE,
            iou: DEFAULT_IOU,
            input_size: DEFAULT_INPUT_SIZE,
            detect_classes: vec![0, 2, 16],
            save_classes: vec![0],
            class_names: default_class_names(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            frame_skip: DEFAULT_FRAME_SKIP,
            save_interval: Duration::from_millis(DEFAULT_SAVE_INTERVAL_MS),
            loop_pacing: Duration::from_millis(DEFAULT_LOOP_PACING_MS),
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
            jpeg_quality: DEFAULT_SAVE_JPEG_QUALITY,
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            backend: SourceBackend::default(),
            target_fps: DEFAULT_SOURCE_FPS,
            buffer_frames: DEFAULT_SOURCE_BUFFER,
            width: DEFAULT_SOURCE_WIDTH,
            height: DEFAULT_SOURCE_HEIGHT,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            cadence: Duration::from_millis(DEFAULT_STREAM_CADENCE_MS),
            jpeg_quality: DEFAULT_STREAM_JPEG_QUALITY,
        }
    }
}

impl Default for LivewatchConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            storage: StorageSettings::default(),
            detector: DetectorSettings::default(),
            session: SessionSettings::default(),
            source: SourceSettings::default(),
            stream: StreamSettings::default(),
        }
    }
}

fn default_class_names() -> BTreeMap<u32, String> {
    BTreeMap::from([
        (0, "person".to_string()),
        (2, "car".to_string()),
        (16, "animal".to_string()),
    ])
}

impl LivewatchConfig {
    /// Load from the file named by `LIVEWATCH_CONFIG` (if any), then env.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVEWATCH_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => LivewatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LivewatchConfigFile) -> Self {
        let defaults = Self::default();

        let storage = file.storage.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let session = file.session.unwrap_or_default();
        let source = file.source.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();

        let source_backend = source
            .backend
            .as_deref()
            .and_then(|name| match name.parse() {
                Ok(backend) => Some(backend),
                Err(err) => {
                    log::warn!("{}; using default source backend", err);
                    None
                }
            })
            .unwrap_or(defaults.source.backend);

        Self {
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or(defaults.api_addr),
            storage: StorageSettings {
                results_dir: storage.results_dir.unwrap_or(defaults.storage.results_dir),
                images_dir: storage.images_dir.unwrap_or(defaults.storage.images_dir),
            },
            detector: DetectorSettings {
                backend: detector.backend.unwrap_or(defaults.detector.backend),
                model_path: detector.model_path,
                confidence: detector.confidence.unwrap_or(defaults.detector.confidence),
                iou: detector.iou.unwrap_or(defaults.detector.iou),
                input_size: detector.input_size.unwrap_or(defaults.detector.input_size),
                detect_classes: detector
                    .detect_classes
                    .unwrap_or(defaults.detector.detect_classes),
                save_classes: detector
                    .save_classes
                    .unwrap_or(defaults.detector.save_classes),
                class_names: detector
                    .class_names
                    .unwrap_or(defaults.detector.class_names),
            },
            session: SessionSettings {
                frame_skip: session.frame_skip.unwrap_or(defaults.session.frame_skip),
                save_interval: session
                    .save_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.session.save_interval),
                loop_pacing: session
                    .loop_pacing_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.session.loop_pacing),
                reconnect_backoff: session
                    .reconnect_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.session.reconnect_backoff),
                jpeg_quality: session.jpeg_quality.unwrap_or(defaults.session.jpeg_quality),
            },
            source: SourceSettings {
                backend: source_backend,
                target_fps: source.target_fps.unwrap_or(defaults.source.target_fps),
                buffer_frames: source.buffer_frames.unwrap_or(defaults.source.buffer_frames),
                width: source.width.unwrap_or(defaults.source.width),
                height: source.height.unwrap_or(defaults.source.height),
            },
            stream: StreamSettings {
                cadence: stream
                    .cadence_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stream.cadence),
                jpeg_quality: stream.jpeg_quality.unwrap_or(defaults.stream.jpeg_quality),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("LIVEWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(dir) = non_empty_env("RESULTS_DIR") {
            self.storage.results_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env("IMAGES_DIR") {
            self.storage.images_dir = PathBuf::from(dir);
        }
        if let Some(backend) = non_empty_env("LIVEWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = non_empty_env("LIVEWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(confidence) = non_empty_env("LIVEWATCH_CONFIDENCE") {
            self.detector.confidence = confidence
                .parse()
                .map_err(|_| anyhow!("LIVEWATCH_CONFIDENCE must be a number in (0, 1]"))?;
        }
        if let Some(interval) = non_empty_env("LIVEWATCH_SAVE_INTERVAL_MS") {
            let ms: u64 = interval.parse().map_err(|_| {
                anyhow!("LIVEWATCH_SAVE_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.session.save_interval = Duration::from_millis(ms);
        }
        if let Some(backend) = non_empty_env("LIVEWATCH_SOURCE_BACKEND") {
            self.source.backend = backend.parse()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let detector = &self.detector;
        if !(detector.confidence > 0.0 && detector.confidence <= 1.0) {
            return Err(anyhow!("detector.confidence must be in (0, 1]"));
        }
        if detector.detect_classes.is_empty() {
            return Err(anyhow!("detector.detect_classes must not be empty"));
        }
        if let Some(class) = detector
            .save_classes
            .iter()
            .find(|class| !detector.detect_classes.contains(class))
        {
            return Err(anyhow!(
                "save class {} is not in detector.detect_classes",
                class
            ));
        }
        for (name, quality) in [
            ("session.jpeg_quality", self.session.jpeg_quality),
            ("stream.jpeg_quality", self.stream.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("{} must be in 1..=100", name));
            }
        }
        if self.stream.cadence.is_zero() {
            return Err(anyhow!("stream.cadence_ms must be greater than zero"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("source.target_fps must be greater than zero"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source width and height must be greater than zero"));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<LivewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
