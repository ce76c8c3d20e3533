//! Transport semantics of the stream controller, driven end-to-end over a
//! synthetic file-backed clip with a scripted detection engine.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use vision_kernel::{
    FrameSink, ModelConfig, ModelRegistry, ProcessedFrame, SourceConfig, StreamController,
    StreamState,
};

fn stub_registry() -> Arc<Mutex<ModelRegistry>> {
    // stub:// paths select the scripted backend and synthesized labels.
    let config = ModelConfig::object_detection("stub://assets");
    let mut registry = ModelRegistry::new();
    registry.load_model(config).expect("stub engine loads");
    Arc::new(Mutex::new(registry))
}

fn clip(frames: u64) -> SourceConfig {
    SourceConfig {
        location: format!("stub://clip?frames={}", frames),
        target_fps: 30,
        width: 64,
        height: 48,
    }
}

/// Records the index of every delivered frame.
struct RecordingSink {
    indices: Arc<Mutex<Vec<u64>>>,
}

impl FrameSink for RecordingSink {
    fn on_frame(&self, processed: &ProcessedFrame<'_>) {
        self.indices.lock().unwrap().push(processed.frame_index);
    }
}

fn controller_with_recorder() -> (StreamController, Arc<Mutex<Vec<u64>>>) {
    let indices = Arc::new(Mutex::new(Vec::new()));
    let sink = RecordingSink {
        indices: indices.clone(),
    };
    let controller = StreamController::new(stub_registry(), vec![Box::new(sink)]);
    (controller, indices)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn pause_halts_advancement_and_resume_continues_without_reopening() -> Result<()> {
    let (controller, _indices) = controller_with_recorder();
    controller.start(clip(10_000))?;

    assert!(
        wait_until(Duration::from_secs(5), || controller
            .position()
            .frame_index
            >= 2),
        "stream should deliver frames while playing"
    );

    controller.pause()?;
    // Let an in-flight frame drain before sampling.
    std::thread::sleep(Duration::from_millis(150));
    let halted_at = controller.position().frame_index;
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(
        controller.position().frame_index,
        halted_at,
        "a paused stream must not consume frames"
    );

    controller.resume()?;
    assert!(
        wait_until(Duration::from_secs(5), || controller
            .position()
            .frame_index
            > halted_at),
        "a resumed stream advances again"
    );
    // Pause and resume never touched the capture resource.
    assert_eq!(controller.stats().captures_opened, 1);

    controller.stop()?;
    Ok(())
}

#[test]
fn seek_makes_the_next_delivered_frame_match_the_target() -> Result<()> {
    let (controller, indices) = controller_with_recorder();
    controller.start(clip(1_000))?;
    controller.pause()?;
    std::thread::sleep(Duration::from_millis(100));

    controller.seek(500)?;
    assert_eq!(controller.position().frame_index, 500);
    assert_eq!(
        controller.state(),
        StreamState::Paused,
        "seek preserves the pause state"
    );

    let already_delivered = indices.lock().unwrap().len();
    controller.resume()?;
    assert!(
        wait_until(Duration::from_secs(5), || indices.lock().unwrap().len()
            > already_delivered),
        "frames flow again after the seek"
    );
    assert_eq!(
        indices.lock().unwrap()[already_delivered],
        500,
        "the first frame after a seek carries the requested index"
    );

    controller.stop()?;
    Ok(())
}

#[test]
fn seeking_twice_is_idempotent() -> Result<()> {
    let (controller, _indices) = controller_with_recorder();
    controller.start(clip(1_000))?;
    controller.pause()?;
    std::thread::sleep(Duration::from_millis(100));

    let opened_before = controller.stats().captures_opened;
    controller.seek(200)?;
    assert_eq!(controller.position().frame_index, 200);
    assert_eq!(
        controller.stats().captures_opened,
        opened_before + 1,
        "each seek opens exactly one replacement handle"
    );

    controller.seek(200)?;
    assert_eq!(controller.position().frame_index, 200);
    assert_eq!(controller.stats().captures_opened, opened_before + 2);
    assert_eq!(controller.state(), StreamState::Paused);

    controller.stop()?;
    Ok(())
}

#[test]
fn seek_beyond_the_end_aborts_with_no_state_change() -> Result<()> {
    let (controller, _indices) = controller_with_recorder();
    controller.start(clip(100))?;
    controller.pause()?;
    std::thread::sleep(Duration::from_millis(100));
    let position_before = controller.position().frame_index;

    assert!(controller.seek(500).is_err());

    assert_eq!(controller.state(), StreamState::Paused);
    assert_eq!(controller.position().frame_index, position_before);
    // The running capture was not replaced.
    assert_eq!(controller.stats().captures_opened, 1);

    // The session is still usable: a valid seek works afterwards.
    controller.seek(50)?;
    assert_eq!(controller.position().frame_index, 50);

    controller.stop()?;
    Ok(())
}

#[test]
fn concurrent_stops_release_the_session_exactly_once() -> Result<()> {
    let (controller, _indices) = controller_with_recorder();
    controller.start(clip(10_000))?;
    assert!(wait_until(Duration::from_secs(5), || controller
        .position()
        .frame_index
        >= 1));

    let controller = Arc::new(controller);
    let mut handles = Vec::new();
    for _ in 0..2 {
        let controller = controller.clone();
        handles.push(std::thread::spawn(move || controller.stop()));
    }
    for handle in handles {
        handle.join().expect("stop thread").expect("stop succeeds");
    }

    assert_eq!(controller.state(), StreamState::Idle);
    assert_eq!(controller.position().frame_index, 0);

    // The controller remains usable for a fresh session.
    controller.start(clip(10))?;
    controller.stop()?;
    Ok(())
}

#[test]
fn end_of_stream_settles_the_controller_at_idle() -> Result<()> {
    let (controller, indices) = controller_with_recorder();
    controller.start(clip(3))?;

    assert!(
        wait_until(Duration::from_secs(5), || controller.state()
            == StreamState::Idle),
        "a finished clip tears the session down"
    );
    assert_eq!(controller.position().frame_index, 0);
    assert_eq!(
        indices.lock().unwrap().as_slice(),
        &[0, 1, 2],
        "frame indices strictly increase from zero while playing"
    );
    Ok(())
}
