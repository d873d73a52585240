//! The capture session: state tracking and the frame pipeline.
//!
//! The capture loop runs on the supervisor's task and alternates between
//! two states. Idle, it blocks on control events until the host requests
//! streaming. Capturing, it pulls frames from the selected capture
//! provider, emits Format+Data messages, and drains pending control
//! between frames without delaying output. Frame acquisition runs on
//! blocking threads so a slow provider never stalls the async workers.
//! A data-write failure drops the stream back to idle, since the control
//! channel may still deliver a new start; format-write failures, capture
//! errors, and everything else unwind to the supervisor.

use std::collections::HashSet;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::frame_log::FrameLog;
use crate::port::{FrameFormat, StreamPort};
use crate::registry::PluginRegistry;
use crate::wire::{StartStop, VideoCodec};

// ── SessionState ─────────────────────────────────────────────────

/// What the host has most recently asked of us.
#[derive(Debug, Default)]
pub struct SessionState {
    streaming_requested: bool,
    client_codecs: HashSet<VideoCodec>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a start/stop request: the codec set is replaced wholesale
    /// (duplicates coalesce) and the streaming flag follows the request.
    pub fn apply(&mut self, request: StartStop) {
        self.streaming_requested = request.streaming_requested();
        self.client_codecs = request.codecs.into_iter().collect();
    }

    pub fn streaming_requested(&self) -> bool {
        self.streaming_requested
    }

    pub fn client_codecs(&self) -> &HashSet<VideoCodec> {
        &self.client_codecs
    }
}

// ── Capture loop ─────────────────────────────────────────────────

/// Run the capture loop until the quit token fires or a fatal error.
///
/// Control events arrive over `events`; the channel closing means the
/// control reader has ended and will report its own failure, so the loop
/// simply returns.
pub async fn run_capture_loop<D: AsyncRead + AsyncWrite>(
    port: &StreamPort<D>,
    registry: &PluginRegistry,
    frame_log: &mut FrameLog,
    events: &mut mpsc::Receiver<StartStop>,
    quit: &CancellationToken,
) -> Result<(), AgentError> {
    let mut state = SessionState::new();
    let mut frame_count: u64 = 0;

    loop {
        // Idle: block on control until streaming is requested.
        while !quit.is_cancelled() && !state.streaming_requested() {
            tokio::select! {
                _ = quit.cancelled() => {}
                request = events.recv() => match request {
                    Some(request) => state.apply(request),
                    None => return Ok(()),
                },
            }
        }
        if quit.is_cancelled() {
            return Ok(());
        }

        info!("streaming starts now");
        let mut capture = registry.best_capture(state.client_codecs())?;
        let mut previous_frame: Option<Instant> = None;

        while !quit.is_cancelled() && state.streaming_requested() {
            frame_count += 1;
            if frame_count % 100 == 0 {
                debug!("sent {frame_count} frames");
            }

            frame_log.stat(format_args!("Capturing frame..."));
            let capture_started = Instant::now();
            // Providers may block for a whole frame interval or longer,
            // so they run off the async workers.
            let (returned, frame) = tokio::task::spawn_blocking(move || {
                let frame = capture.capture_frame();
                (capture, frame)
            })
            .await
            .map_err(|e| AgentError::Task(format!("capture worker: {e}")))?;
            capture = returned;
            let frame = frame?;
            frame_log.stat(format_args!("Captured frame"));
            debug!(
                "got a frame of {} bytes in {:?} ({:?} since last frame)",
                frame.buffer.len(),
                capture_started.elapsed(),
                previous_frame.map(|t| t.elapsed()).unwrap_or_default(),
            );
            previous_frame = Some(Instant::now());

            let format = frame.stream_start.then(|| {
                let format = FrameFormat {
                    width: frame.width,
                    height: frame.height,
                    codec: capture.codec_type(),
                };
                frame_log.stat(format_args!(
                    "Started new stream {}x{} codec={}",
                    format.width, format.height, format.codec
                ));
                format
            });

            frame_log.stat(format_args!("Frame of {} bytes", frame.buffer.len()));
            frame_log.frame(&frame.buffer);

            // One guard spans the format and its data message, so no
            // other producer can slot a message between them. A failed
            // format announcement is fatal; a failed data write only
            // drops the stream.
            let data_result = {
                let mut writer = port.frame_writer().await;
                if let Some(format) = format {
                    writer.send_format(format).await?;
                }
                writer.send_data(&frame.buffer).await
            };
            match data_result {
                Ok(()) => frame_log.stat(format_args!("Sent frame")),
                Err(e) if e.is_device_io() => {
                    warn!("dropping stream after data write failure: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }

            // Drain pending control without delaying the next frame.
            loop {
                match events.try_recv() {
                    Ok(request) => state.apply(request),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FrameCapture, FrameInfo, Plugin};
    use crate::wire;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Duration;

    // A device whose reads never complete and whose writes land in a
    // shared buffer. Writes succeed `ok_before_fail` times, then fail
    // `fail_count` times, then succeed again.
    struct ScriptedDevice {
        written: Arc<Mutex<Vec<u8>>>,
        ok_before_fail: Arc<AtomicU32>,
        fail_count: Arc<AtomicU32>,
    }

    fn scripted_device(ok_before_fail: u32, fail_count: u32) -> (ScriptedDevice, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let device = ScriptedDevice {
            written: Arc::clone(&written),
            ok_before_fail: Arc::new(AtomicU32::new(ok_before_fail)),
            fail_count: Arc::new(AtomicU32::new(fail_count)),
        };
        (device, written)
    }

    impl AsyncRead for ScriptedDevice {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for ScriptedDevice {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.ok_before_fail.load(Ordering::Relaxed) > 0 {
                self.ok_before_fail.fetch_sub(1, Ordering::Relaxed);
            } else if self.fail_count.load(Ordering::Relaxed) > 0 {
                self.fail_count.fetch_sub(1, Ordering::Relaxed);
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct CountingCapture {
        frames: Arc<AtomicU32>,
        first: bool,
    }

    impl FrameCapture for CountingCapture {
        fn capture_frame(&mut self) -> Result<FrameInfo, AgentError> {
            self.frames.fetch_add(1, Ordering::Relaxed);
            let stream_start = self.first;
            self.first = false;
            Ok(FrameInfo {
                buffer: vec![0xAB; 64],
                width: 320,
                height: 240,
                stream_start,
            })
        }

        fn codec_type(&self) -> VideoCodec {
            VideoCodec::MJPEG
        }
    }

    struct CountingPlugin {
        captures_created: Arc<AtomicU32>,
        frames: Arc<AtomicU32>,
    }

    impl Plugin for CountingPlugin {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn create_capture(&self) -> Option<Box<dyn FrameCapture>> {
            self.captures_created.fetch_add(1, Ordering::Relaxed);
            Some(Box::new(CountingCapture {
                frames: Arc::clone(&self.frames),
                first: true,
            }))
        }

        fn rank(&self) -> u32 {
            crate::registry::rank::FALLBACK
        }

        fn parse_options(
            &mut self,
            _options: &[crate::registry::ConfigOption],
        ) -> Result<(), AgentError> {
            Ok(())
        }

        fn codec_type(&self) -> VideoCodec {
            VideoCodec::MJPEG
        }
    }

    fn counting_registry() -> (PluginRegistry, Arc<AtomicU32>, Arc<AtomicU32>) {
        let captures_created = Arc::new(AtomicU32::new(0));
        let frames = Arc::new(AtomicU32::new(0));
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(CountingPlugin {
            captures_created: Arc::clone(&captures_created),
            frames: Arc::clone(&frames),
        }));
        (registry, captures_created, frames)
    }

    #[test]
    fn state_applies_start_and_stop() {
        let mut state = SessionState::new();
        state.apply(StartStop::parse(&[0x02, 0x01, 0x03]).unwrap());
        assert!(state.streaming_requested());
        assert_eq!(state.client_codecs().len(), 2);

        state.apply(StartStop::parse(&[0x00]).unwrap());
        assert!(!state.streaming_requested());
        assert!(state.client_codecs().is_empty());
    }

    #[test]
    fn duplicate_codecs_coalesce() {
        let mut state = SessionState::new();
        state.apply(StartStop::parse(&[0x03, 0x01, 0x01, 0x03]).unwrap());
        assert!(state.streaming_requested());
        assert_eq!(state.client_codecs().len(), 2);
    }

    #[tokio::test]
    async fn quit_while_idle_returns_promptly() {
        let (registry, ..) = counting_registry();
        let (device, _written) = scripted_device(0, 0);
        let (port, _read) = StreamPort::split(device);
        let mut frame_log = FrameLog::disabled();
        let (_tx, mut rx) = mpsc::channel(4);
        let quit = CancellationToken::new();

        quit.cancel();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            run_capture_loop(&port, &registry, &mut frame_log, &mut rx, &quit),
        )
        .await
        .expect("capture loop did not observe quit");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn data_write_failure_drops_to_idle_and_retries() {
        let (registry, captures_created, _frames) = counting_registry();
        // The format announcement goes through, then the data write
        // fails: the stream drops, and a still-true streaming request
        // retries with a fresh capture.
        let (device, written) = scripted_device(1, 1);
        let (port, _read) = StreamPort::split(device);
        let mut frame_log = FrameLog::disabled();
        let (tx, mut rx) = mpsc::channel(4);
        let quit = CancellationToken::new();

        tx.send(StartStop::parse(&[0x01, 0x01]).unwrap())
            .await
            .unwrap();

        // Stop the loop once a whole frame made it through on the retry:
        // first format (20 bytes), retry format, data header, payload.
        let stopper = {
            let written = Arc::clone(&written);
            let quit = quit.clone();
            tokio::spawn(async move {
                loop {
                    if written.lock().unwrap().len() >= 20 + 20 + 8 + 64 {
                        quit.cancel();
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_capture_loop(&port, &registry, &mut frame_log, &mut rx, &quit),
        )
        .await
        .expect("capture loop did not finish");
        assert!(result.is_ok());
        stopper.await.unwrap();

        // One capture for the failed attempt, one for the retry.
        assert!(captures_created.load(Ordering::Relaxed) >= 2);

        // The retry re-announces the format: the first attempt's Format
        // message is followed by a fresh Format, then the Data that
        // finally went through.
        let written = written.lock().unwrap();
        let first = wire::decode_header(&written[..8].try_into().unwrap()).unwrap();
        assert_eq!(first.ty, wire::MessageType::Format as u16);
        let second = wire::decode_header(&written[20..28].try_into().unwrap()).unwrap();
        assert_eq!(second.ty, wire::MessageType::Format as u16);
        let third = wire::decode_header(&written[40..48].try_into().unwrap()).unwrap();
        assert_eq!(third.ty, wire::MessageType::Data as u16);
        assert_eq!(third.size, 64);
    }

    #[tokio::test]
    async fn format_write_failure_is_fatal() {
        let (registry, captures_created, _frames) = counting_registry();
        // The very first write is the format announcement; losing it
        // must terminate the session rather than retry.
        let (device, _written) = scripted_device(0, 1);
        let (port, _read) = StreamPort::split(device);
        let mut frame_log = FrameLog::disabled();
        let (tx, mut rx) = mpsc::channel(4);
        let quit = CancellationToken::new();

        tx.send(StartStop::parse(&[0x01, 0x01]).unwrap())
            .await
            .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_capture_loop(&port, &registry, &mut frame_log, &mut rx, &quit),
        )
        .await
        .expect("capture loop did not finish");
        match result {
            Err(e) => assert!(e.is_device_io(), "expected an i/o error, got {e:?}"),
            Ok(()) => panic!("format write failure was swallowed"),
        }
        assert_eq!(captures_created.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn stop_request_between_frames_returns_to_idle() {
        let (registry, _captures, frames) = counting_registry();
        let (device, _written) = scripted_device(0, 0);
        let (port, _read) = StreamPort::split(device);
        let mut frame_log = FrameLog::disabled();
        let (tx, mut rx) = mpsc::channel(4);
        let quit = CancellationToken::new();

        tx.send(StartStop::parse(&[0x01, 0x01]).unwrap())
            .await
            .unwrap();

        let driver = {
            let frames = Arc::clone(&frames);
            let quit = quit.clone();
            tokio::spawn(async move {
                // Wait for streaming to produce something, then stop.
                while frames.load(Ordering::Relaxed) == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tx.send(StartStop::parse(&[0x00]).unwrap()).await.unwrap();
                // The loop drains the stop after the in-flight frame and
                // goes idle; quit then ends the test.
                tokio::time::sleep(Duration::from_millis(50)).await;
                let settled = frames.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(
                    frames.load(Ordering::Relaxed) <= settled + 1,
                    "capture kept running after stop"
                );
                quit.cancel();
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_capture_loop(&port, &registry, &mut frame_log, &mut rx, &quit),
        )
        .await
        .expect("capture loop did not finish");
        assert!(result.is_ok());
        driver.await.unwrap();
    }
}
