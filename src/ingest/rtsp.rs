//! RTSP frame source.
//!
//! `RtspSource` pulls decoded RGB frames from a network camera. Two backends:
//! - Synthetic: a moving block on a dark background, for tests and demos.
//! - GStreamer (feature `rtsp-gstreamer`): real RTSP decode through appsink.
//!
//! The backend is picked from configuration, not from the URI, so the URI
//! validator stays the only gate on what a caller may submit.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
use image::Rgb;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use crate::config::{SourceBackend, SourceSettings};
use crate::frame::Frame;
use crate::ingest::{redact_uri, FrameSource, SourceFactory};

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    pub url: String,
    /// Decimate the decoded stream to this rate.
    pub target_fps: u32,
    /// Frames appsink may queue; older ones are dropped.
    pub buffer_frames: u32,
    /// Frame width (synthetic backend only).
    pub width: u32,
    /// Frame height (synthetic backend only).
    pub height: u32,
}

impl RtspConfig {
    pub fn from_settings(url: &str, settings: &SourceSettings) -> Self {
        Self {
            url: url.to_string(),
            target_fps: settings.target_fps,
            buffer_frames: settings.buffer_frames.max(1),
            width: settings.width,
            height: settings.height,
        }
    }
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self::from_settings("rtsp://localhost:554/stream", &SourceSettings::default())
    }
}

pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig, backend: SourceBackend) -> Result<Self> {
        let backend = match backend {
            SourceBackend::Synthetic => RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            #[cfg(feature = "rtsp-gstreamer")]
            SourceBackend::Gstreamer => RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            SourceBackend::Gstreamer => {
                anyhow::bail!("gstreamer source backend requires the rtsp-gstreamer feature")
            }
        };
        Ok(Self { backend })
    }

    /// Connect to the stream. Fails if the camera cannot be reached.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    pub fn stats(&self) -> RtspStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
        }
    }
}

impl FrameSource for RtspSource {
    fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }

    fn describe(&self) -> String {
        let stats = self.stats();
        format!("{} ({} frames)", redact_uri(&stats.url), stats.frames_captured)
    }
}

#[derive(Clone, Debug)]
pub struct RtspStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Opens `RtspSource`s with the configured backend.
#[derive(Clone, Debug)]
pub struct RtspSourceFactory {
    settings: SourceSettings,
}

impl RtspSourceFactory {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }
}

impl SourceFactory for RtspSourceFactory {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        let config = RtspConfig::from_settings(uri, &self.settings);
        let mut source = RtspSource::new(config, self.settings.backend)?;
        source.connect()?;
        Ok(Box::new(source))
    }
}

// ----------------------------------------------------------------------------
// Synthetic source for tests
// ----------------------------------------------------------------------------

const SYNTHETIC_BACKGROUND: Rgb<u8> = Rgb([24, 24, 32]);
const SYNTHETIC_BLOCK: Rgb<u8> = Rgb([230, 230, 230]);
const SYNTHETIC_STEP: u32 = 8;

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        log::info!("RtspSource: connected to {} (synthetic)", redact_uri(&self.config.url));
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        Ok(self.render())
    }

    /// A square a quarter of the frame height wide, sliding left to right.
    fn render(&self) -> Frame {
        let (width, height) = (self.config.width.max(1), self.config.height.max(1));
        let side = (height / 4).max(1).min(width);
        let travel = (width - side).max(1) as u64;
        let x0 = ((self.frame_count * SYNTHETIC_STEP as u64) % travel) as u32;
        let y0 = (height - side.min(height)) / 2;

        Frame::from_fn(width, height, |x, y| {
            if (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y) {
                SYNTHETIC_BLOCK
            } else {
                SYNTHETIC_BACKGROUND
            }
        })
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Pipeline: rtspsrc ! decodebin ! videoconvert ! videorate ! RGB appsink.
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! videorate ! \
             video/x-raw,format=RGB,framerate={}/1 ! \
             appsink name=appsink sync=false max-buffers={} drop=true",
            config.url, config.target_fps, config.buffer_frames
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(config.buffer_frames);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;

        let timeout = gstreamer::ClockTime::from_mseconds(CONNECT_TIMEOUT.as_millis() as u64);
        let (result, _, _) = self.pipeline.state(timeout);
        result.context("RTSP pipeline failed to start")?;

        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            anyhow::bail!("could not open RTSP stream: {}", err);
        }

        self.connected_at = Some(Instant::now());
        log::info!("RtspSource: connected to {}", redact_uri(&self.config.url));
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            anyhow::bail!("RTSP stream failed: {}", err);
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout().as_millis() as u64);
        let sample = self
            .appsink
            .try_pull_sample(timeout)
            .ok_or_else(|| anyhow::anyhow!("RTSP stream stalled"))?;

        let frame = sample_to_frame(&sample)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= CONNECT_TIMEOUT;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }

    /// Upper bound on one blocking read; also bounds stop latency.
    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline: {}", err);
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_frame(sample: &gstreamer::Sample) -> Result<Frame> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("RTSP buffer is shorter than its caps")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("RTSP buffer row is out of bounds")?,
            );
        }
        pixels
    };

    Frame::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow::anyhow!("RTSP frame size does not match {}x{}", width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(width: u32, height: u32) -> Result<RtspSource> {
        let settings = SourceSettings {
            backend: SourceBackend::Synthetic,
            width,
            height,
            ..SourceSettings::default()
        };
        let mut source = RtspSource::new(
            RtspConfig::from_settings("rtsp://cam.local/stream", &settings),
            SourceBackend::Synthetic,
        )?;
        source.connect()?;
        Ok(source)
    }

    #[test]
    fn synthetic_source_produces_frames_of_configured_size() -> Result<()> {
        let mut source = synthetic(320, 240)?;
        let frame = source.next_frame()?;
        assert_eq!(frame.dimensions(), (320, 240));
        assert!(source.is_healthy());
        assert_eq!(source.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn synthetic_source_moves_between_frames() -> Result<()> {
        let mut source = synthetic(160, 120)?;
        let a = source.next_frame()?;
        let b = source.next_frame()?;
        assert_ne!(a.as_raw(), b.as_raw());
        Ok(())
    }

    #[test]
    fn factory_opens_connected_sources() -> Result<()> {
        let factory = RtspSourceFactory::new(SourceSettings {
            backend: SourceBackend::Synthetic,
            width: 64,
            height: 48,
            ..SourceSettings::default()
        });
        let mut source = factory.open("rtsp://user:pw@cam.local/stream")?;
        source.next_frame()?;
        let described = source.describe();
        assert!(described.contains("cam.local/stream"));
        assert!(!described.contains("pw"));
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn gstreamer_backend_requires_feature() {
        let result = RtspSource::new(RtspConfig::default(), SourceBackend::Gstreamer);
        assert!(result.is_err());
    }
}
