//! Capture stage: poll-driven chunk assembly, in-place DSP and pacing.
//!
//! Reads the PCM byte stream into 80 ms chunks, cleans each chunk when a
//! processor is configured and appends it to the audio roll buffer. EOF and
//! the stop flag cancel downstream; the reset flag discards the partial
//! chunk and resets the output buffer.

use std::io::Read;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::dsp::Denoiser;
use crate::error::{Result, VozError};
use crate::features::{CHUNK_SAMPLES, SAMPLE_RATE};
use crate::rollbuf::SyncRollBuffer;
use crate::stats::StageStats;

pub const CHUNK_BYTES: usize = CHUNK_SAMPLES * 2;
pub const CHUNK_TIME_MS: u64 = (CHUNK_SAMPLES * 1000 / SAMPLE_RATE) as u64;
const CHUNK_TIME: Duration = Duration::from_millis(CHUNK_TIME_MS);
/// Margin subtracted from the pacing sleep to absorb wake-up latency.
const PACING_GUARD: Duration = Duration::from_micros(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AudioFormat {
    /// Bytes are 16 kHz mono s16le PCM.
    Raw,
    /// A 44-byte RIFF header precedes the PCM.
    Wav,
}

/// Stop/reset requests observed by the capture loop between chunks.
#[derive(Debug, Default)]
pub struct CaptureFlags {
    stop: AtomicBool,
    reset: AtomicBool,
}

impl CaptureFlags {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::SeqCst)
    }
}

pub struct InputProcessor {
    format: AudioFormat,
    sync: bool,
    limit: Option<u64>,
    dsp: Option<Denoiser>,
    flags: Arc<CaptureFlags>,
}

impl InputProcessor {
    /// `sync` paces file playback to wall-clock audio time; `limit` stops
    /// capture after that many chunks (`--bench`).
    pub fn new(
        format: AudioFormat,
        sync: bool,
        dsp: Option<Denoiser>,
        limit: Option<u64>,
    ) -> Self {
        InputProcessor { format, sync, limit, dsp, flags: Arc::new(CaptureFlags::default()) }
    }

    pub fn flags(&self) -> Arc<CaptureFlags> {
        Arc::clone(&self.flags)
    }

    /// Capture thread body. Always cancels `out` on the way out.
    pub fn run<S: AsFd + Read>(
        mut self,
        mut source: S,
        out: &SyncRollBuffer<i16>,
    ) -> Result<StageStats> {
        let result = self.capture(&mut source, out);
        out.cancel();
        result
    }

    fn capture<S: AsFd + Read>(
        &mut self,
        source: &mut S,
        out: &SyncRollBuffer<i16>,
    ) -> Result<StageStats> {
        if self.format == AudioFormat::Wav {
            read_wav_header(source)?;
        }

        let mut stats = StageStats::default();
        let mut bytes = [0u8; CHUNK_BYTES];
        let mut chunk = [0i16; CHUNK_SAMPLES];
        let mut filled = 0usize;
        let mut chunk_start = Instant::now();

        loop {
            if self.flags.stopped() {
                log::info!("capture: stop requested");
                break;
            }
            if self.flags.take_reset() {
                out.reset();
                filled = 0;
                continue;
            }

            if !wait_readable(source, CHUNK_TIME_MS as u16)? {
                continue;
            }

            if filled == 0 {
                chunk_start = Instant::now();
            }
            let n = match source.read(&mut bytes[filled..]) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                log::info!("capture: end of input");
                break;
            }
            filled += n;
            if filled < CHUNK_BYTES {
                continue;
            }

            for (sample, pair) in chunk.iter_mut().zip(bytes.chunks_exact(2)) {
                *sample = i16::from_le_bytes([pair[0], pair[1]]);
            }
            if let Some(dsp) = &mut self.dsp {
                dsp.process_chunk(&mut chunk)?;
            }
            out.append(&chunk);
            stats.chunks += 1;
            filled = 0;

            if self.sync {
                let budget = CHUNK_TIME
                    .saturating_sub(chunk_start.elapsed())
                    .saturating_sub(PACING_GUARD);
                if !budget.is_zero() {
                    thread::sleep(budget);
                }
            }

            if self.limit.is_some_and(|limit| stats.chunks >= limit) {
                log::info!("capture: chunk limit reached");
                break;
            }
        }

        Ok(stats)
    }
}

fn wait_readable<F: AsFd>(fd: &F, timeout_ms: u16) -> Result<bool> {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(0) => Ok(false),
        // HUP/ERR surface through the following read.
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Reads and validates the fixed 44-byte RIFF header: only 16 kHz mono
/// 16-bit PCM with a `d..a` data chunk id is accepted.
pub fn read_wav_header<R: Read>(source: &mut R) -> Result<()> {
    let mut header = [0u8; 44];
    let mut filled = 0usize;
    while filled < header.len() {
        match source.read(&mut header[filled..]) {
            Ok(0) => {
                return Err(VozError::Config("input ended inside the WAV header".into()))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    validate_wav_header(&header)
}

pub fn validate_wav_header(header: &[u8; 44]) -> Result<()> {
    let format = u16::from_le_bytes([header[20], header[21]]);
    let channels = u16::from_le_bytes([header[22], header[23]]);
    let rate = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);
    let bits = u16::from_le_bytes([header[34], header[35]]);
    let data_id_ok = header[36] == b'd' && header[39] == b'a';

    if format != 1 || channels != 1 || rate != SAMPLE_RATE as u32 || bits != 16 || !data_id_ok {
        return Err(VozError::Config(format!(
            "unsupported WAV input (format {}, {} ch, {} Hz, {} bit)",
            format, channels, rate, bits
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hound_header(rate: u32, channels: u16, bits: u16) -> [u8; 44] {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: bits,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..64 {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        let bytes = cursor.into_inner();
        let mut header = [0u8; 44];
        header.copy_from_slice(&bytes[..44]);
        header
    }

    #[test]
    fn accepts_canonical_pcm_header() {
        let header = hound_header(16000, 1, 16);
        assert!(validate_wav_header(&header).is_ok());
    }

    #[test]
    fn rejects_wrong_rate_channels_or_depth() {
        assert!(validate_wav_header(&hound_header(44100, 1, 16)).is_err());
        assert!(validate_wav_header(&hound_header(16000, 2, 16)).is_err());
        assert!(validate_wav_header(&hound_header(16000, 1, 8)).is_err());
    }

    #[test]
    fn rejects_mangled_data_chunk_id() {
        let mut header = hound_header(16000, 1, 16);
        header[36] = b'x';
        assert!(validate_wav_header(&header).is_err());
    }

    #[test]
    fn chunk_time_is_80_ms() {
        assert_eq!(CHUNK_TIME_MS, 80);
        assert_eq!(CHUNK_BYTES, 2560);
    }
}
