//! Background pixel polling.
//!
//! One thread asks the engine for its surface at a fixed interval, copies the
//! bytes into a scratch buffer and publishes them as an immutable [`Frame`].
//! Readers only ever see whole frames of the current resolution.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use enginewire_frame::DEFAULT_MAX_PAYLOAD;
use enginewire_protocol::Resolution;
use enginewire_rpc::{EngineClient, RpcError};
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::check_resolution;
use crate::error::Result;
use crate::readiness::Readiness;

/// Bytes copied between cancellation checks.
const COPY_CHUNK: usize = 256 * 1024;

/// Window the frame rate is averaged over.
const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Where pixels come from. [`EngineClient`] in production.
pub trait PixelSource: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
    fn get_pixels(&self) -> std::result::Result<Bytes, RpcError>;
    fn resize(&self, resolution: Resolution) -> std::result::Result<(), RpcError>;

    /// Largest reply payload the source can deliver.
    fn max_payload(&self) -> usize {
        DEFAULT_MAX_PAYLOAD
    }
}

impl PixelSource for EngineClient {
    fn is_connected(&self) -> bool {
        EngineClient::is_connected(self)
    }

    fn get_pixels(&self) -> std::result::Result<Bytes, RpcError> {
        EngineClient::get_pixels(self)
    }

    fn resize(&self, resolution: Resolution) -> std::result::Result<(), RpcError> {
        EngineClient::resize(self, resolution)
    }
}

/// One complete BGRA surface.
pub struct Frame {
    resolution: Resolution,
    pixels: Vec<u8>,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Row-major BGRA, `resolution.byte_len()` bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Increments with every published frame.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("resolution", &self.resolution)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Counters since the pipeline started.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub frames: u64,
    /// Frames dropped because their size did not match the resolution.
    pub discarded: u64,
    /// Polls that failed with something other than a disconnect.
    pub errors: u64,
    /// Frames published over the last second.
    pub fps: f64,
}

#[derive(Default)]
struct Counters {
    frames: u64,
    discarded: u64,
    errors: u64,
    recent: VecDeque<Instant>,
}

impl Counters {
    fn published(&mut self, at: Instant) {
        self.frames += 1;
        self.recent.push_back(at);
        self.expire(at);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) > FPS_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Surface state guarded by the resize lock.
struct Surface {
    resolution: Resolution,
    scratch: Vec<u8>,
}

struct Shared {
    source: Arc<dyn PixelSource>,
    surface: Mutex<Surface>,
    latest: Mutex<Option<Arc<Frame>>>,
    counters: Mutex<Counters>,
    readiness: Readiness,
    cancel: CancelToken,
    interval: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The polling thread and the frame it last published.
pub struct FramePipeline {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl FramePipeline {
    /// Start polling `source` every `interval` once `readiness` flips.
    ///
    /// Stops when `cancel` is set or on [`FramePipeline::stop`].
    pub fn start(
        source: Arc<dyn PixelSource>,
        resolution: Resolution,
        interval: Duration,
        readiness: Readiness,
        cancel: CancelToken,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            source,
            surface: Mutex::new(Surface {
                resolution,
                scratch: Vec::new(),
            }),
            latest: Mutex::new(None),
            counters: Mutex::new(Counters::default()),
            readiness,
            cancel,
            interval,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("enginewire-frames".into())
            .spawn(move || poll_loop(&thread_shared))
            .map_err(enginewire_transport::TransportError::Io)?;

        info!(%resolution, ?interval, "frame pipeline started");
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// The newest complete frame, if one has been published at the current
    /// resolution.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        lock(&self.shared.latest).clone()
    }

    pub fn resolution(&self) -> Resolution {
        lock(&self.shared.surface).resolution
    }

    /// Change the surface size.
    ///
    /// Polling is held off for the duration, so no frame of the old size is
    /// published once this returns. On failure the old resolution stays,
    /// including when frames at the new size would not fit one payload.
    pub fn resize(&self, resolution: Resolution) -> Result<()> {
        check_resolution(resolution, self.shared.source.max_payload())?;
        let mut surface = lock(&self.shared.surface);
        if surface.resolution == resolution {
            return Ok(());
        }
        self.shared.source.resize(resolution)?;
        let previous = surface.resolution;
        surface.resolution = resolution;
        surface.scratch = Vec::with_capacity(resolution.byte_len());
        lock(&self.shared.latest).take();
        info!(from = %previous, to = %resolution, "surface resized");
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        let mut counters = lock(&self.shared.counters);
        counters.expire(Instant::now());
        PipelineStats {
            frames: counters.frames,
            discarded: counters.discarded,
            errors: counters.errors,
            fps: counters.recent.len() as f64 / FPS_WINDOW.as_secs_f64(),
        }
    }

    /// Cancel polling and join the thread. Idempotent.
    ///
    /// Cancels the token passed to [`FramePipeline::start`].
    pub fn stop(&mut self) {
        self.shared.cancel.cancel();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("frame pipeline thread panicked");
            }
            debug!("frame pipeline stopped");
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for FramePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePipeline")
            .field("resolution", &self.resolution())
            .field("stats", &self.stats())
            .finish()
    }
}

fn poll_loop(shared: &Shared) {
    let mut sequence = 0u64;
    while !shared.cancel.wait_timeout(shared.interval) {
        if !shared.readiness.is_ready() || !shared.source.is_connected() {
            continue;
        }
        if poll_once(shared, sequence + 1) {
            sequence += 1;
        }
    }
}

/// One tick. Holds the resize lock from request to publication.
fn poll_once(shared: &Shared, sequence: u64) -> bool {
    let mut surface = lock(&shared.surface);
    let pixels = match shared.source.get_pixels() {
        Ok(pixels) => pixels,
        Err(err) if err.is_disconnect() => {
            debug!(error = %err, "pixel poll skipped");
            return false;
        }
        Err(err) => {
            lock(&shared.counters).errors += 1;
            warn!(error = %err, "pixel poll failed");
            return false;
        }
    };

    // Nothing painted yet.
    if pixels.is_empty() {
        return false;
    }
    let expected = surface.resolution.byte_len();
    if pixels.len() != expected {
        lock(&shared.counters).discarded += 1;
        debug!(
            got = pixels.len(),
            expected,
            resolution = %surface.resolution,
            "discarding frame of the wrong size"
        );
        return false;
    }

    let resolution = surface.resolution;
    let scratch = &mut surface.scratch;
    scratch.clear();
    scratch.reserve(expected);
    for chunk in pixels.chunks(COPY_CHUNK) {
        if shared.cancel.is_cancelled() {
            return false;
        }
        scratch.extend_from_slice(chunk);
    }

    let frame = Frame {
        resolution,
        pixels: std::mem::replace(scratch, Vec::with_capacity(expected)),
        sequence,
        captured_at: Instant::now(),
    };
    let now = frame.captured_at;
    let previous = lock(&shared.latest).replace(Arc::new(frame));
    drop(surface);
    lock(&shared.counters).published(now);
    drop(previous);
    trace!(sequence, "frame published");
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use enginewire_protocol::Color;

    use super::*;
    use crate::error::SessionError;

    /// Paints a solid surface; can be told to lie about its size.
    struct FakeSource {
        resolution: Mutex<Resolution>,
        polls: AtomicUsize,
        wrong_size: Mutex<bool>,
        connected: bool,
    }

    impl FakeSource {
        fn new(resolution: Resolution) -> Arc<Self> {
            Arc::new(Self {
                resolution: Mutex::new(resolution),
                polls: AtomicUsize::new(0),
                wrong_size: Mutex::new(false),
                connected: true,
            })
        }
    }

    impl PixelSource for FakeSource {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn get_pixels(&self) -> std::result::Result<Bytes, RpcError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut res = *self.resolution.lock().unwrap();
            if *self.wrong_size.lock().unwrap() {
                res.width += 1;
            }
            let px = Color::WHITE.to_bgra();
            Ok(Bytes::from(px.repeat(res.width as usize * res.height as usize)))
        }

        fn resize(&self, resolution: Resolution) -> std::result::Result<(), RpcError> {
            *self.resolution.lock().unwrap() = resolution;
            Ok(())
        }
    }

    fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn no_polling_before_ready() {
        let source = FakeSource::new(Resolution::new(8, 8));
        let readiness = Readiness::new();
        let mut pipeline = FramePipeline::start(
            source.clone(),
            Resolution::new(8, 8),
            Duration::from_millis(5),
            readiness.clone(),
            CancelToken::new(),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        assert_eq!(source.polls.load(Ordering::SeqCst), 0);
        assert!(pipeline.latest_frame().is_none());

        readiness.mark_ready();
        wait_for("first frame", || pipeline.latest_frame().is_some());
        let frame = pipeline.latest_frame().unwrap();
        assert_eq!(frame.pixels().len(), 8 * 8 * 4);
        assert_eq!(&frame.pixels()[..4], &[255, 255, 255, 255]);
        pipeline.stop();
    }

    #[test]
    fn resize_never_exposes_old_frames() {
        let start = Resolution::new(800, 600);
        let source = FakeSource::new(start);
        let readiness = Readiness::new();
        readiness.mark_ready();
        let pipeline = FramePipeline::start(
            source.clone(),
            start,
            Duration::from_millis(2),
            readiness,
            CancelToken::new(),
        )
        .unwrap();
        wait_for("frame at 800x600", || pipeline.latest_frame().is_some());

        let smaller = Resolution::new(400, 300);
        pipeline.resize(smaller).unwrap();
        assert_eq!(pipeline.resolution(), smaller);
        if let Some(frame) = pipeline.latest_frame() {
            assert_eq!(frame.resolution(), smaller);
        }
        wait_for("frame at 400x300", || pipeline.latest_frame().is_some());
        for _ in 0..20 {
            let frame = pipeline.latest_frame().unwrap();
            assert_eq!(frame.resolution(), smaller);
            assert_eq!(frame.pixels().len(), 400 * 300 * 4);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn oversized_or_empty_resize_is_refused() {
        let start = Resolution::new(64, 64);
        let source = FakeSource::new(start);
        let readiness = Readiness::new();
        readiness.mark_ready();
        let pipeline = FramePipeline::start(
            source.clone(),
            start,
            Duration::from_millis(2),
            readiness,
            CancelToken::new(),
        )
        .unwrap();
        wait_for("frame at 64x64", || pipeline.latest_frame().is_some());

        for bad in [Resolution::new(4200, 4200), Resolution::new(0, 300)] {
            assert!(matches!(
                pipeline.resize(bad),
                Err(SessionError::InvalidResolution { resolution, .. }) if resolution == bad
            ));
        }
        assert_eq!(pipeline.resolution(), start);
        assert_eq!(*source.resolution.lock().unwrap(), start);
        assert!(pipeline.latest_frame().is_some());
    }

    #[test]
    fn wrong_sized_frames_are_discarded_and_counted() {
        let res = Resolution::new(4, 4);
        let source = FakeSource::new(res);
        *source.wrong_size.lock().unwrap() = true;
        let readiness = Readiness::new();
        readiness.mark_ready();
        let pipeline = FramePipeline::start(
            source.clone(),
            res,
            Duration::from_millis(2),
            readiness,
            CancelToken::new(),
        )
        .unwrap();

        wait_for("discards", || pipeline.stats().discarded >= 3);
        assert!(pipeline.latest_frame().is_none());
        assert_eq!(pipeline.stats().frames, 0);
    }

    #[test]
    fn cancel_stops_the_thread() {
        let source = FakeSource::new(Resolution::new(2, 2));
        let cancel = CancelToken::new();
        let readiness = Readiness::new();
        readiness.mark_ready();
        let mut pipeline = FramePipeline::start(
            source.clone(),
            Resolution::new(2, 2),
            Duration::from_millis(2),
            readiness,
            cancel.clone(),
        )
        .unwrap();
        wait_for("frames", || pipeline.stats().frames > 0);
        cancel.cancel();
        pipeline.stop();
        let polls = source.polls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(source.polls.load(Ordering::SeqCst), polls);
    }

    #[test]
    fn disconnected_source_is_not_polled() {
        let source = Arc::new(FakeSource {
            resolution: Mutex::new(Resolution::new(2, 2)),
            polls: AtomicUsize::new(0),
            wrong_size: Mutex::new(false),
            connected: false,
        });
        let readiness = Readiness::new();
        readiness.mark_ready();
        let _pipeline = FramePipeline::start(
            source.clone(),
            Resolution::new(2, 2),
            Duration::from_millis(2),
            readiness,
            CancelToken::new(),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(source.polls.load(Ordering::SeqCst), 0);
    }
}
