//! Built-in MJPEG capture plugin.
//!
//! Grabs the primary display with `scrap`, converts BGRA to RGB, and
//! JPEG-compresses each frame. Screen capturers are not `Send` on X11,
//! so frames are produced on a dedicated thread and handed over a
//! bounded channel (capacity 2); when the consumer falls behind, old
//! frames are dropped rather than queued. The capture handle receives
//! blockingly, which is safe because the session runs providers on
//! blocking threads. Registered at the lowest rank, this plugin is the
//! fallback when nothing hardware-backed is available.

use std::io::{self, Cursor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, RgbImage};
use scrap::{Capturer, Display};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::registry::{rank, ConfigOption, FrameCapture, FrameInfo, Plugin, PluginRegistry};
use crate::wire::VideoCodec;

const DEFAULT_FRAMERATE: u32 = 10;
const DEFAULT_QUALITY: u8 = 80;

// ── MjpegPlugin ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct MjpegSettings {
    framerate: u32,
    quality: u8,
}

/// The always-registered software MJPEG plugin.
pub struct MjpegPlugin {
    settings: MjpegSettings,
}

impl MjpegPlugin {
    pub fn new() -> Self {
        MjpegPlugin {
            settings: MjpegSettings {
                framerate: DEFAULT_FRAMERATE,
                quality: DEFAULT_QUALITY,
            },
        }
    }

    /// Register the built-in plugin.
    pub fn register(registry: &mut PluginRegistry) {
        registry.register(Box::new(MjpegPlugin::new()));
    }
}

impl Default for MjpegPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for MjpegPlugin {
    fn name(&self) -> &'static str {
        "mjpeg"
    }

    fn create_capture(&self) -> Option<Box<dyn FrameCapture>> {
        match MjpegCapture::start(self.settings) {
            Ok(capture) => Some(Box::new(capture)),
            Err(e) => {
                warn!("mjpeg capture unavailable: {e}");
                None
            }
        }
    }

    fn rank(&self) -> u32 {
        rank::FALLBACK
    }

    fn parse_options(&mut self, options: &[ConfigOption]) -> Result<(), AgentError> {
        for opt in options {
            match opt.name.as_str() {
                "framerate" => self.settings.framerate = parse_range(opt, 1, 100)?,
                "quality" => self.settings.quality = parse_range(opt, 1, 100)? as u8,
                _ => {} // not ours
            }
        }
        Ok(())
    }

    fn codec_type(&self) -> VideoCodec {
        VideoCodec::MJPEG
    }
}

fn parse_range(opt: &ConfigOption, min: u32, max: u32) -> Result<u32, AgentError> {
    match opt.value.parse::<u32>() {
        Ok(v) if (min..=max).contains(&v) => Ok(v),
        _ => Err(AgentError::InvalidOption {
            name: opt.name.clone(),
            value: opt.value.clone(),
        }),
    }
}

// ── MjpegCapture ─────────────────────────────────────────────────

struct CapturedFrame {
    width: u32,
    height: u32,
    jpeg: Vec<u8>,
}

/// Handle to the capture thread; blocks on the frame channel.
pub struct MjpegCapture {
    frames: mpsc::Receiver<CapturedFrame>,
    running: Arc<AtomicBool>,
    dimensions: Option<(u32, u32)>,
}

impl MjpegCapture {
    fn start(settings: MjpegSettings) -> Result<Self, AgentError> {
        // Probe for a display up front; the capturer itself must be
        // created inside the thread because it is not Send on X11.
        let display =
            Display::primary().map_err(|e| AgentError::Capture(format!("no display: {e}")))?;
        drop(display);

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(2);
        let thread_running = Arc::clone(&running);
        std::thread::spawn(move || capture_thread(settings, tx, thread_running));

        Ok(MjpegCapture {
            frames: rx,
            running,
            dimensions: None,
        })
    }
}

impl Drop for MjpegCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl FrameCapture for MjpegCapture {
    fn capture_frame(&mut self) -> Result<FrameInfo, AgentError> {
        // Runs on a blocking thread, never on an async worker, so the
        // blocking receive cannot stall the runtime.
        let frame = self
            .frames
            .blocking_recv()
            .ok_or_else(|| AgentError::Capture("mjpeg capture thread exited".into()))?;
        let stream_start = self.dimensions != Some((frame.width, frame.height));
        self.dimensions = Some((frame.width, frame.height));
        Ok(FrameInfo {
            buffer: frame.jpeg,
            width: frame.width,
            height: frame.height,
            stream_start,
        })
    }

    fn codec_type(&self) -> VideoCodec {
        VideoCodec::MJPEG
    }
}

// ── Capture thread ───────────────────────────────────────────────

fn capture_thread(
    settings: MjpegSettings,
    tx: mpsc::Sender<CapturedFrame>,
    running: Arc<AtomicBool>,
) {
    let display = match Display::primary() {
        Ok(display) => display,
        Err(e) => {
            warn!("mjpeg: no display: {e}");
            return;
        }
    };
    let (width, height) = (display.width(), display.height());
    let mut capturer = match Capturer::new(display) {
        Ok(capturer) => capturer,
        Err(e) => {
            warn!("mjpeg: failed to start capturer: {e}");
            return;
        }
    };

    let interval = Duration::from_millis(1000 / u64::from(settings.framerate.max(1)));

    while running.load(Ordering::Relaxed) {
        let frame_started = Instant::now();

        match capturer.frame() {
            Ok(frame) => {
                // scrap hands out BGRA rows whose stride may be padded.
                let stride = frame.len() / height;
                let rgb = bgra_to_rgb(&frame, width, height, stride);
                match encode_jpeg(rgb, width as u32, height as u32, settings.quality) {
                    Ok(jpeg) => {
                        match tx.try_send(CapturedFrame {
                            width: width as u32,
                            height: height as u32,
                            jpeg,
                        }) {
                            Ok(()) => {}
                            // Consumer is behind; drop this frame.
                            Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                    Err(e) => debug!("mjpeg: encode failed, skipping frame: {e}"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                // No new frame from the compositor yet.
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(e) => {
                warn!("mjpeg: screen grab failed: {e}");
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        }

        // Hold the configured frame rate.
        let elapsed = frame_started.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
}

/// Convert a padded BGRA buffer to tightly-packed RGB.
fn bgra_to_rgb(bgra: &[u8], width: usize, height: usize, stride: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row = &bgra[y * stride..];
        for x in 0..width {
            let px = &row[x * 4..x * 4 + 4];
            rgb.push(px[2]);
            rgb.push(px[1]);
            rgb.push(px[0]);
        }
    }
    rgb
}

fn encode_jpeg(rgb: Vec<u8>, width: u32, height: u32, quality: u8) -> Result<Vec<u8>, AgentError> {
    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb)
        .ok_or_else(|| AgentError::Capture("invalid image dimensions".into()))?;
    img.write_with_encoder(encoder)
        .map_err(|e| AgentError::Capture(format!("jpeg encode failed: {e}")))?;
    Ok(out.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────
