//! Detector thread orchestration: capture → features → wake-word, joined in
//! that order, with the predictions buffer handed back to the caller.

use std::io::Read;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::detector::{WakeWordDetector, WakeWordPrediction};
use crate::error::Result;
use crate::features::{self, AudioFeatures, Embedding, AUDIO_BUFFER_CAPACITY};
use crate::input::{CaptureFlags, InputProcessor};
use crate::rollbuf::SyncRollBuffer;
use crate::runner::Infer;
use crate::stats::{PipelineStats, StageStats};

const PREDICTIONS_CAPACITY: usize = 32;

pub struct PipelineHandles {
    pub predictions: Arc<SyncRollBuffer<WakeWordPrediction>>,
    pub flags: Arc<CaptureFlags>,
    capture: JoinHandle<StageStats>,
    features: JoinHandle<StageStats>,
    wake: JoinHandle<StageStats>,
}

/// Spawns the three detector stages over a PCM source. The audio buffer is
/// primed with the 30 ms zero lead-in before capture starts.
pub fn start<S, M, E, R>(
    source: S,
    input: InputProcessor,
    mut features: AudioFeatures<M, E>,
    mut detector: WakeWordDetector<R>,
) -> Result<PipelineHandles>
where
    S: AsFd + Read + Send + 'static,
    M: Infer + Send + 'static,
    E: Infer + Send + 'static,
    R: Infer + Send + 'static,
{
    let audio = Arc::new(SyncRollBuffer::<i16>::new(AUDIO_BUFFER_CAPACITY));
    let embeddings = Arc::new(SyncRollBuffer::<Embedding>::new(detector.features_capacity()));
    let predictions = Arc::new(SyncRollBuffer::new_broadcast(PREDICTIONS_CAPACITY));
    let flags = input.flags();

    features::prime_input(&audio);

    let capture = {
        let audio = Arc::clone(&audio);
        thread::Builder::new().name("capture".into()).spawn(move || {
            match input.run(source, &audio) {
                Ok(stats) => stats,
                Err(e) => {
                    log::error!("capture thread failed: {}", e);
                    StageStats::default()
                }
            }
        })?
    };

    let features_thread = {
        let audio = Arc::clone(&audio);
        let embeddings = Arc::clone(&embeddings);
        thread::Builder::new()
            .name("features".into())
            .spawn(move || features.run(&audio, &embeddings))?
    };

    let wake = {
        let embeddings = Arc::clone(&embeddings);
        let predictions = Arc::clone(&predictions);
        thread::Builder::new()
            .name("wakeword".into())
            .spawn(move || detector.run(&embeddings, &predictions))?
    };

    Ok(PipelineHandles {
        predictions,
        flags,
        capture,
        features: features_thread,
        wake,
    })
}

impl PipelineHandles {
    /// Joins capture → features → wake-word and collects their counters.
    pub fn join(self) -> PipelineStats {
        PipelineStats {
            capture: join_stage(self.capture, "capture"),
            features: join_stage(self.features, "features"),
            wake: join_stage(self.wake, "wakeword"),
        }
    }
}

fn join_stage(handle: JoinHandle<StageStats>, name: &str) -> StageStats {
    match handle.join() {
        Ok(stats) => stats,
        Err(_) => {
            log::error!("{} thread panicked", name);
            StageStats::default()
        }
    }
}
