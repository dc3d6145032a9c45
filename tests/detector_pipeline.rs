//! End-to-end detector pipeline tests over stub models: three real threads,
//! a real pipe as the PCM source, no inference engine.

use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::time::{Duration, Instant};

use voz::detector::{WakeWordConfig, WakeWordDetector};
use voz::features::{
    AudioFeatures, CHUNK_SAMPLES, EMBED_DIM, EMBED_MELS, FRAME_CHUNKS, MEL_BINS, STAGE_SAMPLES,
};
use voz::input::{AudioFormat, InputProcessor};
use voz::pipeline;
use voz::test_utils::StubRunner;

const MELS_PER_CHUNK: usize = 8;
const MELS_PER_FRAME: usize = FRAME_CHUNKS * MELS_PER_CHUNK;
const WINDOW: usize = 16;

fn os_pipe() -> (File, File) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let reader = unsafe { File::from_raw_fd(fds[0]) };
    let writer = unsafe { File::from_raw_fd(fds[1]) };
    (reader, writer)
}

fn stub_features() -> AudioFeatures<StubRunner, StubRunner> {
    let mel = StubRunner::constant(&[1, STAGE_SAMPLES], &[1, 1, MELS_PER_FRAME, MEL_BINS], 0.0);
    let embed = StubRunner::constant(&[1, EMBED_MELS, MEL_BINS, 1], &[1, EMBED_DIM], 0.5);
    AudioFeatures::new(mel, embed, MELS_PER_CHUNK).unwrap()
}

fn stub_detector(score: f32, threshold: f32, patience: u32) -> WakeWordDetector<StubRunner> {
    let config = WakeWordConfig {
        name: "test".to_string(),
        model_path: "test.tflite".to_string(),
        threshold,
        patience,
    };
    let runner = StubRunner::constant(&[1, WINDOW, EMBED_DIM], &[1, 1], score);
    WakeWordDetector::new(vec![(config, runner)]).unwrap()
}

fn feed_chunks(mut writer: File, chunks: usize) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let chunk = vec![0u8; CHUNK_SAMPLES * 2];
        for _ in 0..chunks {
            if writer.write_all(&chunk).is_err() {
                break;
            }
            // Keep the producer a touch slower than the stub pipeline so
            // the hand-off buffers never overrun in this test.
            std::thread::sleep(Duration::from_millis(3));
        }
        // writer drops here: EOF for the capture thread
    })
}

#[test]
fn detects_over_the_full_pipeline_and_drains_on_eof() {
    let (reader, writer) = os_pipe();
    let input = InputProcessor::new(AudioFormat::Raw, false, None, None);
    let handles =
        pipeline::start(reader, input, stub_features(), stub_detector(0.9, 0.5, 2)).unwrap();

    let feeder = feed_chunks(writer, 24);

    // Main-thread style drain loop.
    let mut got = Vec::new();
    loop {
        let mut guard = handles.predictions.wait_any();
        let status = guard.status();
        got.extend_from_slice(guard.get());
        let n = guard.len();
        guard.shift(n);
        if status.reset {
            guard.release_and_signal();
        } else {
            guard.release();
        }
        if status.cancel && n == 0 {
            break;
        }
    }

    feeder.join().unwrap();
    let stats = handles.join();

    // 24 chunks plus the primed overlap stage six full frames, one
    // embedding per chunk once warm.
    assert_eq!(stats.capture.chunks, 24);
    assert_eq!(stats.features.frames, 6);
    assert_eq!(stats.features.embeddings, 24);
    // Sliding window of 16 over 24 embeddings gives 9 scored windows; the
    // bounded hand-off buffer may shed a window under scheduler pressure.
    assert!(
        (8..=9).contains(&stats.wake.windows),
        "unexpected window count {}",
        stats.wake.windows
    );
    // Patience 2 fires on every second super-threshold window.
    assert!(got.len() >= 3 && got.len() <= 4, "unexpected match count {}", got.len());
    assert!(got.iter().all(|p| p.name == "test" && p.score == 0.9));
    assert!(got.iter().all(|p| p.count == 2));
}

#[test]
fn below_threshold_scores_never_fire() {
    let (reader, writer) = os_pipe();
    let input = InputProcessor::new(AudioFormat::Raw, false, None, None);
    let handles =
        pipeline::start(reader, input, stub_features(), stub_detector(0.2, 0.5, 1)).unwrap();

    let feeder = feed_chunks(writer, 24);
    feeder.join().unwrap();

    // Wait for the cancel cascade, then make sure nothing was emitted.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !handles.predictions.status().cancel {
        assert!(Instant::now() < deadline, "pipeline never reached EOF");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(handles.predictions.len(), 0);
    handles.join();
}

#[test]
fn stop_flag_joins_all_threads_within_a_second() {
    let (reader, writer) = os_pipe();
    let input = InputProcessor::new(AudioFormat::Raw, false, None, None);
    let handles =
        pipeline::start(reader, input, stub_features(), stub_detector(0.9, 0.5, 1)).unwrap();

    // Keep the source open: the stop flag alone must tear everything down.
    let feeder = feed_chunks(writer, 100);
    std::thread::sleep(Duration::from_millis(200));

    handles.flags.stop();
    let stopping = Instant::now();

    // Drain like the real main loop would.
    loop {
        let mut guard = handles.predictions.wait_any();
        let status = guard.status();
        let n = guard.len();
        guard.shift(n);
        if status.reset {
            guard.release_and_signal();
        } else {
            guard.release();
        }
        if status.cancel && n == 0 {
            break;
        }
    }
    handles.join();
    assert!(
        stopping.elapsed() < Duration::from_secs(1),
        "threads took {:?} to join",
        stopping.elapsed()
    );

    feeder.join().unwrap();
}

#[test]
fn chunk_limit_stops_capture_by_itself() {
    let (reader, writer) = os_pipe();
    let input = InputProcessor::new(AudioFormat::Raw, false, None, Some(8));
    let handles =
        pipeline::start(reader, input, stub_features(), stub_detector(0.2, 0.5, 1)).unwrap();

    let feeder = feed_chunks(writer, 64);
    let stats = handles.join();
    assert_eq!(stats.capture.chunks, 8);
    feeder.join().unwrap();
}
