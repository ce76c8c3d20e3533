//! Stream controller: transport state machine and acquisition loop.
//!
//! One dedicated worker thread per active session pulls frames, runs the
//! active detection engine, and forwards results to sinks. Control
//! operations (pause, resume, seek, stop) run on the caller's thread and
//! synchronize with the worker through three pieces of shared state:
//!
//! - the **capture lock**: a single mutex over the capture handle, the only
//!   resource both sides mutate. It is never held across a worker pacing
//!   sleep or the thread spawn at the end of seek.
//! - the **state word**: an atomic carrying the `StreamState`. Every
//!   transition is a compare-and-swap, so concurrent `stop()` calls (and the
//!   worker's own exit path) serialize through the state machine itself.
//! - the **cancel token**: one `AtomicBool` per worker generation, checked
//!   at the top of each iteration and inside the pause poll. A cancelled
//!   worker exits without delivering the in-flight frame downstream.
//!
//! Pause is a cooperative poll-sleep, which bounds pause-to-resume latency
//! to the poll interval.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::detect::ModelRegistry;
use crate::sink::{FrameSink, ProcessedFrame};
use crate::stream::source::{CaptureSource, SourceConfig};
use crate::VisionError;

/// Pause poll interval; bounds pause-to-resume latency.
const PAUSE_POLL: Duration = Duration::from_millis(20);
/// Inter-frame delay for file playback, approximating real-time speed.
const FRAME_INTERVAL: Duration = Duration::from_millis(33);
/// How long seek waits for the outgoing worker to observe cancellation.
const SEEK_GRACE: Duration = Duration::from_millis(250);

/// Transport state of a stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Idle = 0,
    Playing = 1,
    Paused = 2,
    Seeking = 3,
    /// Transient: held by whichever caller owns teardown. Settles at `Idle`.
    Stopped = 4,
}

impl StreamState {
    fn from_u8(value: u8) -> StreamState {
        match value {
            1 => StreamState::Playing,
            2 => StreamState::Paused,
            3 => StreamState::Seeking,
            4 => StreamState::Stopped,
            _ => StreamState::Idle,
        }
    }
}

/// Playback position snapshot.
#[derive(Clone, Debug)]
pub struct StreamPosition {
    pub state: StreamState,
    /// Index of the next frame to deliver (0-based).
    pub frame_index: u64,
    /// Total frames in the source, 0 when unknown (live).
    pub total_frames: u64,
    pub frames_per_second: f64,
    /// Source location; empty when no session is active.
    pub source: String,
}

/// Counters over the controller's lifetime.
#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    pub frames_delivered: u64,
    /// Capture handles opened (one per start, one per seek).
    pub captures_opened: u64,
}

#[derive(Clone, Debug, Default)]
struct SessionInfo {
    config: Option<SourceConfig>,
    total_frames: u64,
    frames_per_second: f64,
    live: bool,
}

struct Shared {
    capture: Mutex<Option<CaptureSource>>,
    state: AtomicU8,
    /// Index of the next frame to deliver.
    frame_index: AtomicU64,
    /// Set while `seek` owns the handle swap; the worker's exit path then
    /// leaves teardown to the seek caller.
    seeking: AtomicBool,
    /// Cancel token of the current worker generation.
    cancel: Mutex<Arc<AtomicBool>>,
    info: Mutex<SessionInfo>,
    frames_delivered: AtomicU64,
    captures_opened: AtomicU64,
}

/// Lock a mutex, recovering the guard if a panicking sink poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new() -> Self {
        Self {
            capture: Mutex::new(None),
            state: AtomicU8::new(StreamState::Idle as u8),
            frame_index: AtomicU64::new(0),
            seeking: AtomicBool::new(false),
            cancel: Mutex::new(Arc::new(AtomicBool::new(true))),
            info: Mutex::new(SessionInfo::default()),
            frames_delivered: AtomicU64::new(0),
            captures_opened: AtomicU64::new(0),
        }
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn try_transition(&self, from: StreamState, to: StreamState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claim teardown ownership: move any active state to `Stopped`.
    /// Returns false when the stream is already stopped or idle, i.e.
    /// another caller owns (or already finished) teardown.
    fn begin_stop(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current == StreamState::Stopped as u8 || current == StreamState::Idle as u8 {
                    None
                } else {
                    Some(StreamState::Stopped as u8)
                }
            })
            .is_ok()
    }

    /// Release the capture resource and settle at `Idle`. Only the caller
    /// whose `begin_stop` succeeded may run this.
    fn teardown(&self) {
        {
            let mut capture = lock(&self.capture);
            *capture = None;
        }
        self.frame_index.store(0, Ordering::SeqCst);
        *lock(&self.info) = SessionInfo::default();
        self.state.store(StreamState::Idle as u8, Ordering::SeqCst);
        log::info!("stream stopped");
    }

    fn cancel_worker(&self) {
        lock(&self.cancel).store(true, Ordering::SeqCst);
    }
}

/// Owns the capture resource and the acquisition worker; exposes transport
/// controls. All methods are safe to call from any thread.
pub struct StreamController {
    shared: Arc<Shared>,
    registry: Arc<Mutex<ModelRegistry>>,
    sinks: Arc<Vec<Box<dyn FrameSink>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serializes start/seek/stop against each other. Pause and resume stay
    /// lock-free; the worker never takes this lock.
    control: Mutex<()>,
}

impl StreamController {
    pub fn new(registry: Arc<Mutex<ModelRegistry>>, sinks: Vec<Box<dyn FrameSink>>) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            registry,
            sinks: Arc::new(sinks),
            worker: Mutex::new(None),
            control: Mutex::new(()),
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn position(&self) -> StreamPosition {
        let info = lock(&self.shared.info);
        StreamPosition {
            state: self.shared.state(),
            frame_index: self.shared.frame_index.load(Ordering::SeqCst),
            total_frames: info.total_frames,
            frames_per_second: info.frames_per_second,
            source: info
                .config
                .as_ref()
                .map(|c| c.location.clone())
                .unwrap_or_default(),
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            frames_delivered: self.shared.frames_delivered.load(Ordering::SeqCst),
            captures_opened: self.shared.captures_opened.load(Ordering::SeqCst),
        }
    }

    /// Open `config` and begin playing on a dedicated worker.
    ///
    /// Fails with `InvalidState` when a session is already active and with
    /// `SourceUnavailable` when the resource cannot be opened.
    pub fn start(&self, config: SourceConfig) -> Result<()> {
        let _control = lock(&self.control);
        if !self
            .shared
            .try_transition(StreamState::Idle, StreamState::Playing)
        {
            return Err(VisionError::InvalidState(format!(
                "cannot start while {:?}",
                self.shared.state()
            ))
            .into());
        }

        let capture = match CaptureSource::open(config.clone()) {
            Ok(capture) => capture,
            Err(e) => {
                self.shared
                    .state
                    .store(StreamState::Idle as u8, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.shared.frame_index.store(0, Ordering::SeqCst);
        {
            let mut info = lock(&self.shared.info);
            info.total_frames = capture.total_frames();
            info.frames_per_second = capture.frames_per_second();
            info.live = capture.is_live();
            info.config = Some(config);
        }
        log::info!(
            "stream started: {} ({} frames, {:.1} fps)",
            capture.location(),
            capture.total_frames(),
            capture.frames_per_second()
        );
        *lock(&self.shared.capture) = Some(capture);
        self.shared.captures_opened.fetch_add(1, Ordering::SeqCst);
        self.spawn_worker();
        Ok(())
    }

    /// Halt frame consumption without cancelling the worker or releasing
    /// the capture resource.
    pub fn pause(&self) -> Result<()> {
        if !self
            .shared
            .try_transition(StreamState::Playing, StreamState::Paused)
        {
            return Err(VisionError::InvalidState(format!(
                "cannot pause while {:?}",
                self.shared.state()
            ))
            .into());
        }
        log::info!("stream paused");
        Ok(())
    }

    /// Resume a paused stream; the worker picks up within the poll interval.
    pub fn resume(&self) -> Result<()> {
        if !self
            .shared
            .try_transition(StreamState::Paused, StreamState::Playing)
        {
            return Err(VisionError::InvalidState(format!(
                "cannot resume while {:?}",
                self.shared.state()
            ))
            .into());
        }
        log::info!("stream resumed");
        Ok(())
    }

    /// Reposition a file-backed stream so the next delivered frame carries
    /// index `target`. The pause/play state is preserved across the seek.
    ///
    /// An unreachable target or an unopenable source aborts with the running
    /// session untouched.
    pub fn seek(&self, target: u64) -> Result<()> {
        let _control = lock(&self.control);
        let prior = if self
            .shared
            .try_transition(StreamState::Playing, StreamState::Seeking)
        {
            StreamState::Playing
        } else if self
            .shared
            .try_transition(StreamState::Paused, StreamState::Seeking)
        {
            StreamState::Paused
        } else {
            return Err(VisionError::InvalidState(format!(
                "cannot seek while {:?}",
                self.shared.state()
            ))
            .into());
        };

        let (config, live) = {
            let info = lock(&self.shared.info);
            (info.config.clone(), info.live)
        };
        let Some(config) = config else {
            self.shared.try_transition(StreamState::Seeking, prior);
            return Err(
                VisionError::InvalidState("no active capture to seek".to_string()).into(),
            );
        };
        if live {
            self.shared.try_transition(StreamState::Seeking, prior);
            return Err(VisionError::InvalidState(
                "seek requires a file-backed source".to_string(),
            )
            .into());
        }

        // The seeking flag keeps the outgoing worker's exit path from
        // tearing down the whole session while we swap handles.
        self.shared.seeking.store(true, Ordering::SeqCst);
        self.shared.cancel_worker();
        self.reap_worker(SEEK_GRACE);

        // Open and position the replacement before releasing the old handle,
        // so a failed seek leaves the running stream untouched.
        let mut fresh = match CaptureSource::open(config) {
            Ok(capture) => capture,
            Err(e) => {
                log::warn!("seek to frame {} aborted: {:#}", target, e);
                return self.abort_seek(prior, e);
            }
        };
        if let Err(e) = fresh.reposition(target) {
            log::warn!("seek to frame {} aborted: {:#}", target, e);
            return self.abort_seek(prior, e);
        }

        {
            // Old handle is dropped (released) inside the capture lock.
            let mut capture = lock(&self.shared.capture);
            *capture = Some(fresh);
        }
        self.shared.captures_opened.fetch_add(1, Ordering::SeqCst);
        self.shared.frame_index.store(target, Ordering::SeqCst);
        self.shared.seeking.store(false, Ordering::SeqCst);

        if !self.shared.try_transition(StreamState::Seeking, prior) {
            // stop() intervened and owns teardown; release what we opened.
            *lock(&self.shared.capture) = None;
            return Err(
                VisionError::InvalidState("stream stopped during seek".to_string()).into(),
            );
        }
        self.spawn_worker();
        log::info!("seeked to frame {}", target);
        Ok(())
    }

    /// Abort a seek whose replacement handle could not be prepared: the old
    /// capture stays, the worker is relaunched in the prior state.
    fn abort_seek(&self, prior: StreamState, cause: anyhow::Error) -> Result<()> {
        self.shared.seeking.store(false, Ordering::SeqCst);
        if self.shared.try_transition(StreamState::Seeking, prior) {
            self.spawn_worker();
        }
        Err(cause)
    }

    /// Stop the session and release the capture resource. Idempotent:
    /// concurrent or repeated calls are no-ops once teardown is owned.
    pub fn stop(&self) -> Result<()> {
        let _control = lock(&self.control);
        if !self.shared.begin_stop() {
            return Ok(());
        }
        self.shared.cancel_worker();
        self.reap_worker(SEEK_GRACE);
        self.shared.teardown();
        Ok(())
    }

    fn spawn_worker(&self) {
        let cancel = Arc::new(AtomicBool::new(false));
        *lock(&self.shared.cancel) = cancel.clone();

        let shared = self.shared.clone();
        let registry = self.registry.clone();
        let sinks = self.sinks.clone();
        let handle =
            std::thread::spawn(move || acquisition_loop(shared, registry, sinks, cancel));
        *lock(&self.worker) = Some(handle);
    }

    /// Wait up to `grace` for the worker to observe cancellation, then
    /// detach it. A straggler holds no locks between iterations and exits
    /// on its next cancel check.
    fn reap_worker(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let finished = {
                let worker = lock(&self.worker);
                worker.as_ref().map(|h| h.is_finished()).unwrap_or(true)
            };
            if finished {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("worker did not observe cancellation within {:?}", grace);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if let Some(handle) = lock(&self.worker).take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ----------------------------------------------------------------------------
// Acquisition loop (worker thread)
// ----------------------------------------------------------------------------

fn acquisition_loop(
    shared: Arc<Shared>,
    registry: Arc<Mutex<ModelRegistry>>,
    sinks: Arc<Vec<Box<dyn FrameSink>>>,
    cancel: Arc<AtomicBool>,
) {
    log::debug!("acquisition loop started");
    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match shared.state() {
            StreamState::Paused | StreamState::Seeking => {
                // Cooperative pause: no frames consumed, bounded sleep.
                std::thread::sleep(PAUSE_POLL);
                continue;
            }
            StreamState::Playing => {}
            StreamState::Idle | StreamState::Stopped => break,
        }

        // Read one frame under the capture lock; the lock is released
        // before detection and delivery.
        let read_result = {
            let mut capture = lock(&shared.capture);
            match capture.as_mut() {
                Some(capture) => capture.read(),
                None => break,
            }
        };
        let frame = match read_result {
            Err(e) => {
                log::error!("frame read failed: {:#}", e);
                break;
            }
            Ok(None) => {
                log::info!("end of stream");
                break;
            }
            Ok(Some(frame)) => frame,
        };
        if cancel.load(Ordering::SeqCst) {
            break;
        }

        let index = shared.frame_index.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let detections = {
            let mut registry = lock(&registry);
            match registry.active_engine_mut() {
                None => {
                    log::warn!("frame {} skipped: no active detection engine", index);
                    None
                }
                Some(engine) => match engine.detect(&frame) {
                    Ok(detections) => Some(detections),
                    // Per-frame recoverable: log, skip, keep streaming.
                    Err(e) => {
                        log::warn!("frame {} skipped: {:#}", index, e);
                        None
                    }
                },
            }
        };

        if let Some(detections) = detections {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            if cancel.load(Ordering::SeqCst) {
                // Cancelled mid-frame: exit without downstream delivery.
                break;
            }
            let processed = ProcessedFrame {
                frame: &frame,
                detections: &detections,
                frame_index: index,
                elapsed_ms,
            };
            for sink in sinks.iter() {
                sink.on_frame(&processed);
            }
            shared.frames_delivered.fetch_add(1, Ordering::SeqCst);
        }

        // File playback paces itself; live sources block at capture.
        let live = lock(&shared.info).live;
        if !live {
            std::thread::sleep(FRAME_INTERVAL);
        }
    }

    finalize_worker_exit(&shared, &cancel);
    log::debug!("acquisition loop exited");
}

/// Worker exit path. Teardown belongs to the worker only when it exits of
/// its own accord (end of stream, read failure): a set seeking flag or a
/// cancelled token means `seek()`/`stop()` owns resource teardown.
fn finalize_worker_exit(shared: &Shared, cancel: &AtomicBool) {
    if shared.seeking.load(Ordering::SeqCst) || cancel.load(Ordering::SeqCst) {
        return;
    }
    if !shared.begin_stop() {
        return;
    }
    shared.teardown();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> StreamController {
        StreamController::new(Arc::new(Mutex::new(ModelRegistry::new())), Vec::new())
    }

    fn clip(frames: u64) -> SourceConfig {
        SourceConfig {
            location: format!("stub://clip?frames={}", frames),
            target_fps: 30,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn controller_starts_idle() {
        let controller = controller();
        assert_eq!(controller.state(), StreamState::Idle);
        assert_eq!(controller.position().frame_index, 0);
    }

    #[test]
    fn pause_requires_a_playing_stream() {
        let controller = controller();
        let err = controller.pause().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::InvalidState(_))
        ));
    }

    #[test]
    fn start_twice_is_invalid() -> Result<()> {
        let controller = controller();
        controller.start(clip(1000))?;
        let err = controller.start(clip(1000)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::InvalidState(_))
        ));
        controller.stop()?;
        Ok(())
    }

    #[test]
    fn failed_open_restores_idle() {
        let controller = controller();
        let err = controller
            .start(SourceConfig {
                location: "/nonexistent/clip.png".to_string(),
                ..SourceConfig::default()
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::SourceUnavailable(_))
        ));
        assert_eq!(controller.state(), StreamState::Idle);
    }

    #[test]
    fn seek_requires_a_file_backed_source() -> Result<()> {
        let controller = controller();
        controller.start(SourceConfig {
            location: "stub://camera".to_string(),
            target_fps: 100,
            width: 64,
            height: 48,
        })?;
        let err = controller.seek(10).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::InvalidState(_))
        ));
        // The live session keeps playing after the rejected seek.
        assert_eq!(controller.state(), StreamState::Playing);
        controller.stop()?;
        Ok(())
    }

    #[test]
    fn stop_settles_at_idle_and_is_repeatable() -> Result<()> {
        let controller = controller();
        controller.start(clip(1000))?;
        controller.stop()?;
        assert_eq!(controller.state(), StreamState::Idle);
        assert_eq!(controller.position().frame_index, 0);
        controller.stop()?;
        assert_eq!(controller.state(), StreamState::Idle);
        Ok(())
    }
}
