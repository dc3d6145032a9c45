//! Audio cleanup over the WebRTC audio-processing engine.
//!
//! The engine is treated as a black box that consumes 10 ms sub-chunks and
//! rewrites them in place, reporting a per-sub-chunk voice-activity bit.
//! The engine frames audio at 48 kHz, so the 16 kHz stream is adapted by a
//! 3x zero-order hold in and 3x decimation out, confined to this module.

use webrtc_audio_processing::{
    Config as ApmConfig, GainControl, GainControlMode, InitializationConfig, NoiseSuppression,
    NoiseSuppressionLevel, Processor, VoiceDetection, VoiceDetectionLikelihood,
    NUM_SAMPLES_PER_FRAME,
};

use crate::error::{Result, VozError};

/// 10 ms at 16 kHz, the engine's processing granularity.
pub const SUBCHUNK_SAMPLES: usize = 160;
/// A VAD byte packs at most 8 sub-chunk bits.
pub const MAX_SUBCHUNKS: usize = 8;
pub const MAX_NOISE_LEVEL: u8 = 4;
pub const MAX_AUTOGAIN: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DspConfig {
    pub preamp: f32,
    pub noiser: u8,
    pub autogain: u8,
    pub vad: bool,
}

impl Default for DspConfig {
    fn default() -> Self {
        DspConfig { preamp: 1.0, noiser: 0, autogain: 0, vad: false }
    }
}

impl DspConfig {
    pub fn clamped(self) -> Self {
        DspConfig {
            noiser: self.noiser.min(MAX_NOISE_LEVEL),
            autogain: self.autogain.min(MAX_AUTOGAIN),
            ..self
        }
    }

    /// A processor is only instantiated when some cleanup is requested.
    pub fn is_active(&self) -> bool {
        self.noiser > 0 || self.autogain > 0 || self.preamp != 1.0 || self.vad
    }

    pub fn build(self) -> Result<Option<Denoiser>> {
        let config = self.clamped();
        if !config.is_active() {
            return Ok(None);
        }
        Denoiser::new(config).map(Some)
    }
}

/// MSB-first VAD bit packing: earlier sub-chunks land in higher bits.
pub(crate) fn push_vad_bit(bits: u8, voice: bool) -> u8 {
    (bits << 1) | u8::from(voice)
}

pub struct Denoiser {
    engine: Option<Processor>,
    preamp: f32,
    vad: bool,
    frame48: Vec<f32>,
}

impl Denoiser {
    fn new(config: DspConfig) -> Result<Self> {
        let engine = if config.noiser > 0 || config.autogain > 0 || config.vad {
            let mut processor = Processor::new(&InitializationConfig {
                num_capture_channels: 1,
                num_render_channels: 1,
                ..InitializationConfig::default()
            })
            .map_err(|e| VozError::Config(format!("audio processor init failed: {}", e)))?;

            let mut apm = ApmConfig::default();
            if config.noiser > 0 {
                apm.noise_suppression = Some(NoiseSuppression {
                    suppression_level: match config.noiser {
                        1 => NoiseSuppressionLevel::Low,
                        2 => NoiseSuppressionLevel::Moderate,
                        3 => NoiseSuppressionLevel::High,
                        _ => NoiseSuppressionLevel::VeryHigh,
                    },
                });
            }
            if config.autogain > 0 {
                apm.gain_control = Some(GainControl {
                    mode: GainControlMode::AdaptiveDigital,
                    target_level_dbfs: i32::from(config.autogain),
                    compression_gain_db: 9,
                    enable_limiter: true,
                });
            }
            if config.vad {
                apm.voice_detection = Some(VoiceDetection {
                    detection_likelihood: VoiceDetectionLikelihood::Moderate,
                });
            }
            processor.set_config(apm);
            Some(processor)
        } else {
            None
        };

        Ok(Denoiser {
            engine,
            preamp: config.preamp,
            vad: config.vad,
            frame48: vec![0.0; NUM_SAMPLES_PER_FRAME as usize],
        })
    }

    /// Rewrites `chunk` in place and returns its packed VAD byte. The chunk
    /// must be 1 to 8 whole 10 ms sub-chunks.
    pub fn process_chunk(&mut self, chunk: &mut [i16]) -> Result<u8> {
        let subs = chunk.len() / SUBCHUNK_SAMPLES;
        if chunk.len() % SUBCHUNK_SAMPLES != 0 || subs == 0 || subs > MAX_SUBCHUNKS {
            return Err(VozError::Config(format!(
                "chunk of {} samples is not 1-{} whole 10 ms sub-chunks",
                chunk.len(),
                MAX_SUBCHUNKS
            )));
        }

        let mut bits = 0u8;
        for sub in chunk.chunks_exact_mut(SUBCHUNK_SAMPLES) {
            let voice = self.process_subchunk(sub)?;
            bits = push_vad_bit(bits, voice);
        }
        Ok(bits)
    }

    fn process_subchunk(&mut self, sub: &mut [i16]) -> Result<bool> {
        let engine = match &mut self.engine {
            None => {
                // Preamp-only configuration; no engine round trip.
                for sample in sub.iter_mut() {
                    *sample =
                        (f32::from(*sample) * self.preamp).clamp(-32768.0, 32767.0) as i16;
                }
                return Ok(false);
            }
            Some(engine) => engine,
        };

        for (i, &sample) in sub.iter().enumerate() {
            let v = (f32::from(sample) / 32768.0 * self.preamp).clamp(-1.0, 1.0);
            let base = i * 3;
            self.frame48[base] = v;
            self.frame48[base + 1] = v;
            self.frame48[base + 2] = v;
        }

        engine
            .process_capture_frame(&mut self.frame48)
            .map_err(|e| VozError::Dsp(format!("capture frame processing failed: {}", e)))?;

        for (i, sample) in sub.iter_mut().enumerate() {
            let v = self.frame48[i * 3].clamp(-1.0, 1.0);
            *sample = (v * 32767.0) as i16;
        }

        let voice = self.vad && engine.get_stats().has_voice.unwrap_or(false);
        Ok(voice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_noise_and_gain_levels() {
        let config = DspConfig { preamp: 1.0, noiser: 9, autogain: 200, vad: false }.clamped();
        assert_eq!(config.noiser, MAX_NOISE_LEVEL);
        assert_eq!(config.autogain, MAX_AUTOGAIN);
    }

    #[test]
    fn inactive_config_builds_no_processor() {
        assert!(DspConfig::default().build().unwrap().is_none());
        assert!(!DspConfig::default().is_active());
        assert!(DspConfig { preamp: 2.0, ..DspConfig::default() }.is_active());
        assert!(DspConfig { vad: true, ..DspConfig::default() }.is_active());
    }

    #[test]
    fn vad_bits_pack_msb_first() {
        let mut bits = 0u8;
        for &voice in &[true, false, true, true, false, false, false, true] {
            bits = push_vad_bit(bits, voice);
        }
        assert_eq!(bits, 0b1011_0001);
    }

    #[test]
    fn preamp_only_scales_in_place() {
        let mut denoiser = DspConfig { preamp: 2.0, ..DspConfig::default() }
            .build()
            .unwrap()
            .unwrap();
        let mut chunk = vec![1000i16; SUBCHUNK_SAMPLES * 8];
        let vad = denoiser.process_chunk(&mut chunk).unwrap();
        assert_eq!(vad, 0);
        assert!(chunk.iter().all(|&s| s == 2000));
    }

    #[test]
    fn preamp_saturates_instead_of_wrapping() {
        let mut denoiser = DspConfig { preamp: 4.0, ..DspConfig::default() }
            .build()
            .unwrap()
            .unwrap();
        let mut chunk = vec![20_000i16; SUBCHUNK_SAMPLES];
        denoiser.process_chunk(&mut chunk).unwrap();
        assert!(chunk.iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn rejects_chunks_that_are_not_whole_subchunks() {
        let mut denoiser = DspConfig { preamp: 0.5, ..DspConfig::default() }
            .build()
            .unwrap()
            .unwrap();
        let mut odd = vec![0i16; SUBCHUNK_SAMPLES + 1];
        assert!(denoiser.process_chunk(&mut odd).is_err());
        let mut too_long = vec![0i16; SUBCHUNK_SAMPLES * (MAX_SUBCHUNKS + 1)];
        assert!(denoiser.process_chunk(&mut too_long).is_err());
        let mut empty: Vec<i16> = Vec::new();
        assert!(denoiser.process_chunk(&mut empty).is_err());
    }
}
