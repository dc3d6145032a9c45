//! Streaming wake-word detector: PCM on stdin, detection events on stdout.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use nix::sys::signal::Signal;

use voz::detector::{WakeWordConfig, WakeWordDetector};
use voz::dsp::DspConfig;
use voz::features::AudioFeatures;
use voz::input::{AudioFormat, InputProcessor, CHUNK_TIME_MS};
use voz::output::{self, OutputFormat};
use voz::pipeline;
use voz::signals::SignalPipe;

#[derive(Parser)]
#[command(name = "voz-oww", version)]
#[command(about = "Streaming wake-word detection over 16 kHz mono s16le PCM")]
struct Args {
    /// Input byte stream format
    #[arg(long, value_enum, default_value_t = AudioFormat::Raw)]
    audio: AudioFormat,

    /// Event output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    output: OutputFormat,

    /// Pace file playback to wall-clock audio time
    #[arg(long)]
    sync: bool,

    /// Input pre-amplification factor
    #[arg(long, default_value_t = 1.0)]
    preamp: f32,

    /// Noise suppression level, 0 (off) to 4
    #[arg(long, default_value_t = 0)]
    noiser: u8,

    /// Auto-gain target, 0 (off) to 31
    #[arg(long, default_value_t = 0)]
    autogain: u8,

    /// Directory holding melspectrogram.tflite and embedding_model.tflite
    #[arg(long, default_value = "models")]
    modelsdir: PathBuf,

    /// Stop after N chunks and print throughput statistics
    #[arg(long, value_name = "N")]
    bench: Option<u64>,

    /// Wake-word models: path[:name[:threshold[:patience]]]
    #[arg(required = true, value_name = "MODELSPEC")]
    models: Vec<String>,
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

fn run(args: Args) -> anyhow::Result<()> {
    let configs = args
        .models
        .iter()
        .map(|spec| WakeWordConfig::parse(spec))
        .collect::<voz::Result<Vec<_>>>()?;

    let mel_path = args.modelsdir.join("melspectrogram.tflite");
    let embed_path = args.modelsdir.join("embedding_model.tflite");
    let features = AudioFeatures::from_paths(
        &mel_path.to_string_lossy(),
        &embed_path.to_string_lossy(),
    )?;
    let detector = WakeWordDetector::load(configs)?;
    log::info!(
        "loaded {} wake-word model(s), feature window {}",
        args.models.len(),
        detector.max_window()
    );

    let dsp = DspConfig {
        preamp: args.preamp,
        noiser: args.noiser,
        autogain: args.autogain,
        vad: false,
    }
    .build()?;
    let input = InputProcessor::new(args.audio, args.sync, dsp, args.bench);

    // Signal thread: SIGUSR1 resets the pipeline, SIGINT/SIGTERM stop it.
    let signal_pipe =
        SignalPipe::install(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGUSR1])?;
    let signal_flags = input.flags();
    std::thread::Builder::new().name("signals".into()).spawn(move || loop {
        match signal_pipe.wait() {
            Some(Signal::SIGUSR1) => {
                log::info!("pipeline reset requested");
                signal_flags.request_reset();
            }
            Some(_) => {
                signal_flags.stop();
                break;
            }
            None => break,
        }
    })?;

    let started = Instant::now();
    let handles = pipeline::start(std::io::stdin(), input, features, detector)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    output::write_ready(&mut out, args.output, true)?;

    let predictions = handles.predictions.clone();
    loop {
        let mut guard = predictions.wait_any();
        let status = guard.status();
        let batch: Vec<_> = guard.get().to_vec();
        guard.shift(batch.len());
        if status.reset {
            guard.release_and_signal();
        } else {
            guard.release();
        }

        for prediction in &batch {
            output::write_prediction(&mut out, args.output, prediction)?;
        }
        if status.cancel && batch.is_empty() {
            break;
        }
    }

    output::write_ready(&mut out, args.output, false)?;
    let stats = handles.join();

    if args.bench.is_some() {
        let elapsed = started.elapsed().as_secs_f64();
        let audio_secs = stats.capture.chunks as f64 * (CHUNK_TIME_MS as f64 / 1000.0);
        eprintln!(
            "bench: {} chunks ({:.1}s audio) in {:.1}s wall ({:.2}x realtime), \
             {} frames, {} embeddings, {} windows, {} errors",
            stats.capture.chunks,
            audio_secs,
            elapsed,
            if elapsed > 0.0 { audio_secs / elapsed } else { 0.0 },
            stats.features.frames,
            stats.features.embeddings,
            stats.wake.windows,
            stats.features.errors + stats.wake.errors,
        );
    }

    Ok(())
}
