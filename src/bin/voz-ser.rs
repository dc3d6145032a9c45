//! Serial bridge: exposes the detector and preprocessor to an embedded host
//! over a framed UART protocol and drives the status/interrupt GPIO lines.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use nix::sys::signal::Signal;

use voz::bridge::{exit_code, Bridge, BridgeConfig};
use voz::gpio::GpioSpec;
use voz::signals::SignalPipe;

#[derive(Parser)]
#[command(name = "voz-ser", version)]
#[command(about = "Serial control plane for the voz wake-word tools")]
struct Args {
    /// Serial device
    #[arg(long, default_value = "/dev/ttyS1")]
    device: String,

    /// Host interrupt line, gpiochipN:line (active-low pulse)
    #[arg(long, value_name = "GPIO")]
    int: Option<String>,

    /// Status LED line, gpiochipN:line
    #[arg(long, value_name = "GPIO")]
    led: Option<String>,

    /// Directory scanned for wake-word models
    #[arg(long, default_value = "models/wakewords")]
    wwmodeldir: PathBuf,

    /// Directory holding the shared mel/embedding models
    #[arg(long, default_value = "models")]
    basemodeldir: PathBuf,
}

fn parse_args() -> Args {
    Args::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        let code = match e.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
            _ => 1,
        };
        process::exit(code);
    })
}

fn main() {
    env_logger::init();
    let args = parse_args();

    let parse_gpio = |spec: &Option<String>| -> Option<GpioSpec> {
        spec.as_deref().map(|s| {
            GpioSpec::parse(s).unwrap_or_else(|e| {
                eprintln!("{}", e);
                process::exit(1);
            })
        })
    };
    let cfg = BridgeConfig {
        device: args.device,
        int: parse_gpio(&args.int),
        led: parse_gpio(&args.led),
        wwmodeldir: args.wwmodeldir,
        basemodeldir: args.basemodeldir,
    };

    let signals = match SignalPipe::install(&[Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD]) {
        Ok(signals) => signals,
        Err(e) => {
            log::error!("cannot install signal handlers: {}", e);
            process::exit(exit_code::FATAL);
        }
    };

    let mut bridge = match Bridge::new(cfg) {
        Ok(bridge) => bridge,
        Err(e) => {
            log::error!("bridge startup failed: {}", e);
            process::exit(exit_code::FATAL);
        }
    };

    let code = match bridge.run(&signals) {
        Ok(code) => code,
        Err(e) => {
            log::error!("bridge failed: {}", e);
            exit_code::RESTART
        }
    };
    process::exit(code);
}
