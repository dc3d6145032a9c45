//! Audio preprocessor: PCM on stdin, cleaned PCM (optionally VAD-prefixed)
//! on stdout. Single-threaded.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use nix::sys::signal::Signal;

use voz::dsp::DspConfig;
use voz::input::{read_wav_header, AudioFormat, CHUNK_BYTES};
use voz::signals::SignalPipe;

#[derive(Parser)]
#[command(name = "voz-pre", version)]
#[command(about = "Noise suppression, auto-gain and VAD over 16 kHz mono s16le PCM")]
struct Args {
    /// Input byte stream format
    #[arg(long, value_enum, default_value_t = AudioFormat::Raw)]
    audio: AudioFormat,

    /// Write cleaned PCM to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Input pre-amplification factor
    #[arg(long, default_value_t = 1.0)]
    preamp: f32,

    /// Noise suppression level, 0 (off) to 4
    #[arg(long, default_value_t = 0)]
    noiser: u8,

    /// Auto-gain target, 0 (off) to 31
    #[arg(long, default_value_t = 0)]
    autogain: u8,

    /// Prefix each output chunk with its packed VAD byte
    #[arg(long)]
    vad: bool,

    /// Report per-chunk processing time at exit
    #[arg(long)]
    timming: bool,
}

fn parse_args() -> Args {
    Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        let code = match e.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
            _ => 1,
        };
        std::process::exit(code);
    })
}

fn main() {
    env_logger::init();
    let args = parse_args();
    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Reads up to one chunk, tolerating short reads. Returns bytes read; 0 is
/// a clean EOF.
fn read_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut dsp = DspConfig {
        preamp: args.preamp,
        noiser: args.noiser,
        autogain: args.autogain,
        vad: args.vad,
    }
    .build()?;

    let signal_pipe = SignalPipe::install(&[Signal::SIGINT, Signal::SIGTERM])?;

    let mut stdin = io::stdin().lock();
    let mut sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    };

    if args.audio == AudioFormat::Wav {
        read_wav_header(&mut stdin)?;
    }

    let mut bytes = [0u8; CHUNK_BYTES];
    let mut chunk = [0i16; CHUNK_BYTES / 2];
    let mut chunks = 0u64;
    let mut spent = Duration::ZERO;

    loop {
        if matches!(signal_pipe.take(), Some(Signal::SIGINT | Signal::SIGTERM)) {
            log::info!("stop requested");
            break;
        }

        let n = read_chunk(&mut stdin, &mut bytes)?;
        if n == 0 {
            break;
        }
        if n < CHUNK_BYTES {
            log::warn!("dropping {} trailing bytes (not a whole chunk)", n);
            break;
        }

        for (sample, pair) in chunk.iter_mut().zip(bytes.chunks_exact(2)) {
            *sample = i16::from_le_bytes([pair[0], pair[1]]);
        }

        let vad_byte = match &mut dsp {
            Some(dsp) => {
                let t0 = Instant::now();
                let vad_byte = dsp.process_chunk(&mut chunk)?;
                spent += t0.elapsed();
                vad_byte
            }
            None => 0,
        };

        for (pair, sample) in bytes.chunks_exact_mut(2).zip(chunk.iter()) {
            pair.copy_from_slice(&sample.to_le_bytes());
        }
        if args.vad {
            sink.write_all(&[vad_byte])?;
        }
        sink.write_all(&bytes)?;
        sink.flush()?;
        chunks += 1;
    }

    if args.timming && chunks > 0 {
        log::info!(
            "processed {} chunks, {:.3} ms per 80 ms chunk on average",
            chunks,
            spent.as_secs_f64() * 1000.0 / chunks as f64
        );
    }

    Ok(())
}
