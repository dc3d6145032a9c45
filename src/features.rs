//! Audio feature pipeline: PCM frames in, 96-float embeddings out.
//!
//! The stage waits on its input buffer for one frame plus the 30 ms overlap,
//! runs the mel-spectrogram model over the staged samples, rescales the mel
//! rows and accumulates them, then invokes the embedding model on every
//! complete 76-row window. Reset re-runs the warm-ups and forwards the flag
//! downstream; cancel drains out of the loop and cancels the output.

use crate::error::{Result, VozError};
use crate::rollbuf::{RollBuffer, RollGuard, Status, SyncRollBuffer};
use crate::runner::{Infer, TfliteRunner};
use crate::stats::StageStats;

pub const SAMPLE_RATE: usize = 16_000;
/// 80 ms of audio.
pub const CHUNK_SAMPLES: usize = 1280;
pub const FRAME_CHUNKS: usize = 4;
/// 320 ms of audio, the per-iteration step of the pipeline.
pub const FRAME_SAMPLES: usize = CHUNK_SAMPLES * FRAME_CHUNKS;
/// 30 ms carried over between consecutive frames.
pub const OVERLAP_SAMPLES: usize = 480;
/// Samples staged per mel invocation.
pub const STAGE_SAMPLES: usize = FRAME_SAMPLES + OVERLAP_SAMPLES;
/// Capacity of the capture→features buffer: one staging window plus room
/// for the producer to always append one more chunk.
pub const AUDIO_BUFFER_CAPACITY: usize = STAGE_SAMPLES + CHUNK_SAMPLES;

pub const MEL_BINS: usize = 32;
pub const EMBED_DIM: usize = 96;
/// Mel rows consumed per embedding invocation.
pub const EMBED_MELS: usize = 76;

/// Consecutive inference failures tolerated before the stage aborts.
pub const MAX_ERRORS: u64 = 10;

pub type MelRow = [f32; MEL_BINS];
pub type Embedding = [f32; EMBED_DIM];

/// Unit mels expected by the embedding model before real audio arrives.
const WARM_MEL: MelRow = [1.0; MEL_BINS];
const WARM_INPUT: [i16; OVERLAP_SAMPLES] = [0; OVERLAP_SAMPLES];

/// Prefills `input` with the 30 ms zero lead-in so the first real frame has
/// a valid leading context. Run once before capture starts; the stage
/// re-runs it itself when it acknowledges a reset.
pub fn prime_input(input: &SyncRollBuffer<i16>) {
    let mut guard = input.lock();
    guard.reset();
    guard.append(&WARM_INPUT);
    guard.release();
}

pub struct AudioFeatures<M, E> {
    mel_model: M,
    embed_model: E,
    mels_per_chunk: usize,
    mels_per_frame: usize,
    mel_buf: RollBuffer<MelRow>,
    scratch: Vec<f32>,
    embed_in: Vec<f32>,
    staged: bool,
    stats: StageStats,
}

impl AudioFeatures<TfliteRunner, TfliteRunner> {
    /// Loads the mel and embedding models. The mel model is first bound to
    /// `[1, overlap + chunk]` to probe its per-chunk mel count, then resized
    /// to the full staging window. The embedding model gets XNNPACK and two
    /// threads on hosts with at least three cores.
    pub fn from_paths(mel_path: &str, embed_path: &str) -> Result<Self> {
        let mut mel_model = TfliteRunner::load(
            mel_path,
            1,
            false,
            Some(&[1, OVERLAP_SAMPLES + CHUNK_SAMPLES]),
        )?;
        let mels_per_chunk = mel_model.output_shape().get(2).copied().ok_or_else(|| {
            VozError::NotRunnable(format!(
                "mel model output shape {:?} has no per-chunk dimension",
                mel_model.output_shape()
            ))
        })?;
        mel_model.set_input_shape(&[1, STAGE_SAMPLES])?;

        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let (threads, use_xnn) = if cores >= 3 { (2, true) } else { (1, false) };
        let embed_model =
            TfliteRunner::load(embed_path, threads, use_xnn, Some(&[1, EMBED_MELS, MEL_BINS, 1]))?;

        AudioFeatures::new(mel_model, embed_model, mels_per_chunk)
    }
}

impl<M: Infer, E: Infer> AudioFeatures<M, E> {
    /// Builds the stage around already-bound models. `mels_per_chunk` is the
    /// mel model's per-80 ms row count (the probed third output dimension).
    pub fn new(mel_model: M, embed_model: E, mels_per_chunk: usize) -> Result<Self> {
        if mels_per_chunk == 0 || mels_per_chunk >= EMBED_MELS {
            return Err(VozError::Config(format!(
                "mel model produces {} rows per chunk, expected 1..{}",
                mels_per_chunk, EMBED_MELS
            )));
        }
        let mels_per_frame = FRAME_CHUNKS * mels_per_chunk;
        let mut features = AudioFeatures {
            mel_model,
            embed_model,
            mels_per_chunk,
            mels_per_frame,
            mel_buf: RollBuffer::new((EMBED_MELS - mels_per_chunk) + mels_per_frame),
            scratch: vec![0.0; STAGE_SAMPLES],
            embed_in: Vec::with_capacity(EMBED_MELS * MEL_BINS),
            staged: false,
            stats: StageStats::default(),
        };
        features.warm_mels();
        Ok(features)
    }

    pub fn mels_per_chunk(&self) -> usize {
        self.mels_per_chunk
    }

    /// Rows currently accumulated, visible for tests.
    pub fn mel_rows(&self) -> &[MelRow] {
        self.mel_buf.get()
    }

    /// Pipeline thread body. Loops until cancelled or the error budget is
    /// exhausted; the output buffer is cancelled on exit so EOF propagates
    /// downstream. The caller primes the input buffer (see [`prime_input`])
    /// before capture starts.
    pub fn run(
        &mut self,
        input: &SyncRollBuffer<i16>,
        output: &SyncRollBuffer<Embedding>,
    ) -> StageStats {
        loop {
            let status = self.process_input(input);
            if self.staged {
                if let Err(e) = self.to_mels() {
                    self.note_error(e);
                } else if let Err(e) = self.to_features(output) {
                    self.note_error(e);
                }
            }
            if status.cancel {
                break;
            }
            if status.reset {
                self.warm_mels();
                output.reset();
            }
            if self.stats.errors >= MAX_ERRORS {
                log::error!("feature stage: aborting after {} inference errors", self.stats.errors);
                break;
            }
        }

        output.cancel();
        self.stats
    }

    /// Re-runs both warm-ups; used on init and whenever reset is observed.
    fn warm_mels(&mut self) {
        self.mel_buf.reset();
        for _ in 0..(EMBED_MELS - self.mels_per_chunk) {
            self.mel_buf.append_one(WARM_MEL);
        }
    }

    fn warm_input(guard: &mut RollGuard<'_, i16>) {
        guard.reset();
        guard.append(&WARM_INPUT);
    }

    /// Waits for a full staging window, copy-converts it to floats and
    /// shifts the input by one frame. Returns the status observed under the
    /// lock; a pending reset is acknowledged here (input re-warmed included).
    fn process_input(&mut self, input: &SyncRollBuffer<i16>) -> Status {
        let mut guard = input.wait_at_least(STAGE_SAMPLES);
        let status = guard.status();
        self.staged = false;
        if !status.reset && guard.len() >= STAGE_SAMPLES {
            for (dst, &src) in self.scratch.iter_mut().zip(guard.get()) {
                *dst = f32::from(src);
            }
            guard.shift(FRAME_SAMPLES);
            self.staged = true;
            self.stats.frames += 1;
        }
        if status.reset {
            Self::warm_input(&mut guard);
            guard.release_and_signal();
        } else {
            guard.release();
        }
        status
    }

    /// Runs the mel model over the staged window and accumulates the
    /// rescaled rows. The `x·0.1 + 2` shift matches the embedding model's
    /// training pipeline and must be exact.
    fn to_mels(&mut self) -> Result<()> {
        let out = self.mel_model.run(&self.scratch)?;
        for row in out.chunks_exact(MEL_BINS) {
            let mut mel = [0.0f32; MEL_BINS];
            for (dst, &v) in mel.iter_mut().zip(row) {
                *dst = v.mul_add(0.1, 2.0);
            }
            self.mel_buf.append_one(mel);
        }
        Ok(())
    }

    /// Drains every complete 76-row window into one embedding each,
    /// advancing the mel buffer by one chunk per embedding.
    ///
    /// Each embedding is appended through the signalling append: the output
    /// buffer only holds `max_window + 1` vectors, so the consumer must be
    /// able to interleave with a multi-embedding batch or the tail of the
    /// batch shifts the head out unconsumed.
    fn to_features(&mut self, output: &SyncRollBuffer<Embedding>) -> Result<()> {
        while self.mel_buf.len() >= EMBED_MELS {
            self.embed_in.clear();
            for row in &self.mel_buf.get()[..EMBED_MELS] {
                self.embed_in.extend_from_slice(row);
            }
            let out = self.embed_model.run(&self.embed_in)?;
            let embedding: Embedding = out.as_slice().try_into().map_err(|_| {
                VozError::TensorRuntime(format!(
                    "embedding output length {}, expected {}",
                    out.len(),
                    EMBED_DIM
                ))
            })?;
            self.mel_buf.shift(self.mels_per_chunk);
            output.append_one(embedding);
            self.stats.embeddings += 1;
        }
        Ok(())
    }

    fn note_error(&mut self, e: VozError) {
        self.stats.errors += 1;
        log::warn!("feature stage error ({} so far): {}", self.stats.errors, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StubRunner;
    use std::sync::Arc;
    use std::time::Duration;

    const MELS_PER_CHUNK: usize = 8;
    const MELS_PER_FRAME: usize = FRAME_CHUNKS * MELS_PER_CHUNK;

    fn stub_features() -> AudioFeatures<StubRunner, StubRunner> {
        let mel = StubRunner::constant(
            &[1, STAGE_SAMPLES],
            &[1, 1, MELS_PER_FRAME, MEL_BINS],
            0.0,
        );
        let embed = StubRunner::constant(
            &[1, EMBED_MELS, MEL_BINS, 1],
            &[1, 1, 1, EMBED_DIM],
            0.5,
        );
        AudioFeatures::new(mel, embed, MELS_PER_CHUNK).unwrap()
    }

    fn run_stage(
        mut features: AudioFeatures<StubRunner, StubRunner>,
        input: Arc<SyncRollBuffer<i16>>,
        output: Arc<SyncRollBuffer<Embedding>>,
    ) -> std::thread::JoinHandle<StageStats> {
        std::thread::spawn(move || features.run(&input, &output))
    }

    fn wait_for_len<T: Clone>(buf: &SyncRollBuffer<T>, n: usize) {
        for _ in 0..200 {
            if buf.len() >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("buffer never reached {} elements (got {})", n, buf.len());
    }

    #[test]
    fn warm_up_prefills_unit_mels() {
        let features = stub_features();
        let rows = features.mel_rows();
        assert_eq!(rows.len(), EMBED_MELS - MELS_PER_CHUNK);
        assert!(rows.iter().all(|r| r.iter().all(|&v| v == 1.0)));
    }

    #[test]
    fn frame_without_overlap_yields_nothing() {
        let input = Arc::new(SyncRollBuffer::new(AUDIO_BUFFER_CAPACITY));
        let output = Arc::new(SyncRollBuffer::new(64));
        let stage = run_stage(stub_features(), Arc::clone(&input), Arc::clone(&output));

        // A bare frame is short of the frame+overlap staging window.
        input.append(&vec![0i16; FRAME_SAMPLES]);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(output.len(), 0);

        // Topping it up with the overlap releases one frame's worth of
        // embeddings: one per chunk of the frame.
        input.append(&vec![0i16; OVERLAP_SAMPLES]);
        wait_for_len(&output, FRAME_CHUNKS);
        assert_eq!(output.len(), FRAME_CHUNKS);

        input.cancel();
        let stats = stage.join().unwrap();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.embeddings, FRAME_CHUNKS as u64);
        assert!(output.status().cancel);
    }

    #[test]
    fn steady_state_produces_one_embedding_per_chunk() {
        let input = Arc::new(SyncRollBuffer::new(AUDIO_BUFFER_CAPACITY));
        let output = Arc::new(SyncRollBuffer::new(1024));
        prime_input(&input);
        let stage = run_stage(stub_features(), Arc::clone(&input), Arc::clone(&output));

        const FRAMES: usize = 5;
        // The priming supplies the overlap; feed whole frames chunk by chunk.
        for _ in 0..FRAMES * FRAME_CHUNKS {
            input.append(&vec![100i16; CHUNK_SAMPLES]);
            std::thread::sleep(Duration::from_millis(2));
        }
        wait_for_len(&output, FRAMES * FRAME_CHUNKS);
        assert_eq!(output.len(), FRAMES * FRAME_CHUNKS);

        input.cancel();
        let stats = stage.join().unwrap();
        assert_eq!(stats.frames, FRAMES as u64);
        assert_eq!(stats.embeddings, (FRAMES * FRAME_CHUNKS) as u64);
    }

    #[test]
    fn mel_rescale_shifts_zero_to_two() {
        let mut features = stub_features();
        features.scratch.fill(0.0);
        features.staged = true;
        features.to_mels().unwrap();
        let newest = features.mel_rows().last().unwrap();
        assert!(newest.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn reset_rewarms_and_forwards() {
        let input = Arc::new(SyncRollBuffer::new(AUDIO_BUFFER_CAPACITY));
        let output = Arc::new(SyncRollBuffer::<Embedding>::new(64));
        prime_input(&input);
        let stage = run_stage(stub_features(), Arc::clone(&input), Arc::clone(&output));

        input.append(&vec![5i16; FRAME_SAMPLES]);
        wait_for_len(&output, FRAME_CHUNKS);

        input.reset();
        for _ in 0..200 {
            if output.status().reset {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(output.status().reset, "reset must propagate downstream");
        assert_eq!(output.len(), 0);

        // Pipeline keeps working after the reset exactly as after init.
        {
            let guard = output.wait_any();
            guard.release_and_signal();
        }
        input.append(&vec![7i16; FRAME_SAMPLES]);
        wait_for_len(&output, FRAME_CHUNKS);
        assert_eq!(output.len(), FRAME_CHUNKS);

        input.cancel();
        stage.join().unwrap();
    }

    #[test]
    fn reset_is_idempotent() {
        let input = Arc::new(SyncRollBuffer::new(AUDIO_BUFFER_CAPACITY));
        let output = Arc::new(SyncRollBuffer::<Embedding>::new(64));
        prime_input(&input);
        let stage = run_stage(stub_features(), Arc::clone(&input), Arc::clone(&output));

        input.append(&vec![5i16; FRAME_SAMPLES]);
        wait_for_len(&output, FRAME_CHUNKS);

        for _ in 0..2 {
            input.reset();
            for _ in 0..200 {
                if output.status().reset {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            let guard = output.wait_any();
            let status = guard.status();
            guard.release_and_signal();
            assert!(status.reset);
        }

        input.append(&vec![3i16; FRAME_SAMPLES]);
        wait_for_len(&output, FRAME_CHUNKS);
        assert_eq!(output.len(), FRAME_CHUNKS);

        input.cancel();
        stage.join().unwrap();
    }

    #[test]
    fn inference_errors_count_up_to_the_abort_budget() {
        // Embedding model misbehaves: wrong output length on every call.
        let embed = StubRunner::from_fn(&[1, EMBED_MELS, MEL_BINS, 1], &[1, EMBED_DIM], |_| {
            vec![0.0; EMBED_DIM - 1]
        });
        let mut features = AudioFeatures::new(
            StubRunner::constant(&[1, STAGE_SAMPLES], &[1, 1, MELS_PER_FRAME, MEL_BINS], 0.0),
            embed,
            MELS_PER_CHUNK,
        )
        .unwrap();

        let input = SyncRollBuffer::new(AUDIO_BUFFER_CAPACITY);
        let output = SyncRollBuffer::<Embedding>::new(64);

        input.append(&vec![0i16; STAGE_SAMPLES]);
        for _ in 0..MAX_ERRORS {
            let status = features.process_input(&input);
            assert!(!status.flagged());
            assert!(features.staged);
            features.to_mels().unwrap();
            let err = features.to_features(&output).unwrap_err();
            features.note_error(err);
            input.append(&vec![0i16; FRAME_SAMPLES]);
        }

        assert_eq!(features.stats.errors, MAX_ERRORS);
        assert_eq!(output.len(), 0);
    }
}
