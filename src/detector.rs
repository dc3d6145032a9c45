//! Wake-word scoring over the embedding stream.
//!
//! Every configured model reads from the tail of one shared feature window:
//! models with a smaller input window get an offset so they all see the most
//! recent embeddings. A match is only emitted after `patience` consecutive
//! super-threshold windows.

use serde::Serialize;

use crate::error::{Result, VozError};
use crate::features::{Embedding, EMBED_DIM};
use crate::rollbuf::SyncRollBuffer;
use crate::runner::{Infer, TfliteRunner};
use crate::stats::StageStats;

pub const DEFAULT_NAME: &str = "no_name";
pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_PATIENCE: u32 = 1;

/// Consecutive inference failures tolerated before the stage aborts.
pub const MAX_ERRORS: u64 = 10;

/// One wake-word model as configured on the command line:
/// `path[:name[:threshold[:patience]]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeWordConfig {
    pub name: String,
    pub model_path: String,
    pub threshold: f32,
    pub patience: u32,
}

impl WakeWordConfig {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(':');
        let path = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| {
            VozError::Config(format!("model spec '{}' has no path", spec))
        })?;

        let name = match parts.next() {
            Some("") | None => DEFAULT_NAME.to_string(),
            Some(name) => name.to_string(),
        };

        let threshold = match parts.next() {
            Some("") | None => DEFAULT_THRESHOLD,
            Some(t) => t.parse::<f32>().map_err(|_| {
                VozError::Config(format!("model spec '{}': bad threshold '{}'", spec, t))
            })?,
        };
        if !(0.0..=1.0).contains(&threshold) {
            return Err(VozError::Config(format!(
                "model spec '{}': threshold {} out of [0, 1]",
                spec, threshold
            )));
        }

        let patience = match parts.next() {
            Some("") | None => DEFAULT_PATIENCE,
            Some(p) => p.parse::<u32>().map_err(|_| {
                VozError::Config(format!("model spec '{}': bad patience '{}'", spec, p))
            })?,
        };
        if patience == 0 {
            return Err(VozError::Config(format!(
                "model spec '{}': patience must be at least 1",
                spec
            )));
        }

        if parts.next().is_some() {
            return Err(VozError::Config(format!(
                "model spec '{}' has trailing fields",
                spec
            )));
        }

        Ok(WakeWordConfig {
            name,
            model_path: path.to_string(),
            threshold,
            patience,
        })
    }
}

/// Emitted once a model's patience is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WakeWordPrediction {
    pub name: String,
    pub score: f32,
    pub count: u32,
}

struct ArmedModel<R> {
    config: WakeWordConfig,
    runner: R,
    window: usize,
    offset: usize,
    hits: u32,
}

pub struct WakeWordDetector<R> {
    models: Vec<ArmedModel<R>>,
    max_window: usize,
    min_window: usize,
    scratch: Vec<f32>,
    stats: StageStats,
}

impl WakeWordDetector<TfliteRunner> {
    /// Loads every configured model; each model's input dim 1 becomes its
    /// feature window.
    pub fn load(configs: Vec<WakeWordConfig>) -> Result<Self> {
        let mut models = Vec::with_capacity(configs.len());
        for config in configs {
            let runner = TfliteRunner::load(&config.model_path, 1, false, None)?;
            models.push((config, runner));
        }
        Self::new(models)
    }
}

impl<R: Infer> WakeWordDetector<R> {
    pub fn new(models: Vec<(WakeWordConfig, R)>) -> Result<Self> {
        if models.is_empty() {
            return Err(VozError::Config("no wake-word models configured".into()));
        }

        let mut armed = Vec::with_capacity(models.len());
        let mut max_window = 0usize;
        let mut min_window = usize::MAX;
        for (config, runner) in models {
            let window = runner.input_shape().get(1).copied().ok_or_else(|| {
                VozError::NotRunnable(format!(
                    "wake-word model {} input shape {:?} has no window dimension",
                    config.model_path,
                    runner.input_shape()
                ))
            })?;
            if window == 0 {
                return Err(VozError::NotRunnable(format!(
                    "wake-word model {} has a zero-width window",
                    config.model_path
                )));
            }
            max_window = max_window.max(window);
            min_window = min_window.min(window);
            armed.push(ArmedModel { config, runner, window, offset: 0, hits: 0 });
        }
        for model in &mut armed {
            model.offset = max_window - model.window;
        }

        Ok(WakeWordDetector {
            models: armed,
            max_window,
            min_window,
            scratch: Vec::with_capacity(max_window * EMBED_DIM),
            stats: StageStats::default(),
        })
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }

    pub fn min_window(&self) -> usize {
        self.min_window
    }

    /// Capacity the inter-stage features buffer must have.
    pub fn features_capacity(&self) -> usize {
        self.max_window + 1
    }

    /// Pipeline thread body: slide over the feature stream one embedding at
    /// a time, scoring every model per window.
    pub fn run(
        &mut self,
        features: &SyncRollBuffer<Embedding>,
        predictions: &SyncRollBuffer<WakeWordPrediction>,
    ) -> StageStats {
        loop {
            let mut guard = features.wait_at_least(self.max_window);
            let status = guard.status();

            if status.reset {
                guard.reset();
                for model in &mut self.models {
                    model.hits = 0;
                }
                guard.release_and_signal();
                predictions.reset();
                continue;
            }

            while guard.len() >= self.max_window {
                self.predict(&guard.get()[..self.max_window], predictions);
                guard.shift(1);
            }
            guard.release();

            if status.cancel {
                break;
            }
            if self.stats.errors >= MAX_ERRORS {
                log::error!(
                    "wake-word stage: aborting after {} inference errors",
                    self.stats.errors
                );
                break;
            }
        }

        predictions.cancel();
        self.stats
    }

    /// Scores one feature window with every model, in configuration order.
    fn predict(
        &mut self,
        window: &[Embedding],
        predictions: &SyncRollBuffer<WakeWordPrediction>,
    ) {
        self.scratch.clear();
        for embedding in window {
            self.scratch.extend_from_slice(embedding);
        }
        self.stats.windows += 1;

        for model in &mut self.models {
            if window.len() < model.window + model.offset {
                continue;
            }
            let lo = model.offset * EMBED_DIM;
            let hi = lo + model.window * EMBED_DIM;
            let score = match model.runner.run(&self.scratch[lo..hi]) {
                Ok(out) => out.first().copied().unwrap_or(0.0),
                Err(e) => {
                    self.stats.errors += 1;
                    log::warn!(
                        "wake-word '{}' inference error ({} so far): {}",
                        model.config.name,
                        self.stats.errors,
                        e
                    );
                    continue;
                }
            };

            if score <= model.config.threshold {
                model.hits = 0;
                continue;
            }
            model.hits += 1;
            if model.hits >= model.config.patience {
                let prediction = WakeWordPrediction {
                    name: model.config.name.clone(),
                    score,
                    count: model.hits,
                };
                log::info!(
                    "wake word '{}' matched (score {:.3}, count {})",
                    prediction.name,
                    prediction.score,
                    prediction.count
                );
                predictions.append_one(prediction);
                self.stats.predictions += 1;
                model.hits = 0;
            }
        }
    }
}
