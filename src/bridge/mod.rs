//! Serial control plane: one UART poll loop supervising a detector or
//! preprocessor child and a GPIO worker.
//!
//! The host commands mode changes over the framed protocol; the bridge
//! stops/spawns the matching child executable, forwards inbound audio to
//! its stdin and translates its stdout back into protocol events. A 30 s
//! watchdog keeps emitting status frames; fatal child errors demote the
//! bridge to idle.

pub mod catalog;
pub mod child;

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use serial_protocol::{read_event, write_event, AudioConf, Event, FrameError, StatusReport, WwMatch};
use serialport::{DataBits, FlowControl, Parity, StopBits, TTYPort};

use crate::error::{Result, VozError};
use crate::gpio::{GpioCommand, GpioController, GpioSpec};
use crate::input::CHUNK_BYTES;
use crate::signals::SignalPipe;
use catalog::Catalog;
use child::{parse_stdout_line, ChildEvent, ChildProc};

pub const BAUD_RATE: u32 = 576_000;
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(200);
const POLL_TIMEOUT_MS: u16 = 500;
const WATCHDOG_PERIOD: Duration = Duration::from_secs(30);
/// Settle time after spawning a child before declaring the mode switched.
const CHILD_GRACE: Duration = Duration::from_millis(750);
/// Preprocessor stdout record: one VAD byte plus one chunk.
const PRE_RECORD_BYTES: usize = 1 + CHUNK_BYTES;

pub mod exit_code {
    pub const OK: i32 = 0;
    pub const RESTART: i32 = 1;
    pub const RESTART_RETRY: i32 = 2;
    pub const FATAL: i32 = 5;
    pub const REQUESTED: i32 = 6;
}

/// Error kinds reported in the status frame.
pub mod status_kind {
    pub const OK: u8 = 0;
    pub const IO: u8 = 1;
    pub const TENSOR: u8 = 2;
    pub const FRAME: u8 = 3;
    pub const CONFIG: u8 = 4;
    pub const CHILD_IO: u8 = 5;
    pub const INTERNAL: u8 = 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Idle = 0,
    WakeWord = 1,
    Preprocessor = 2,
}

impl Mode {
    pub fn from_u8(value: u8) -> Option<Mode> {
        match value {
            0 => Some(Mode::Idle),
            1 => Some(Mode::WakeWord),
            2 => Some(Mode::Preprocessor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub device: String,
    pub int: Option<GpioSpec>,
    pub led: Option<GpioSpec>,
    pub wwmodeldir: PathBuf,
    pub basemodeldir: PathBuf,
}

/// Command-line arguments shared by both child kinds.
fn audio_args(conf: &AudioConf) -> Vec<String> {
    vec![
        format!("--preamp={}", conf.preamp),
        format!("--noiser={}", conf.noiser),
        format!("--autogain={}", conf.autogain),
    ]
}

fn detector_args(conf: &AudioConf, basemodeldir: &Path, specs: &[String]) -> Vec<String> {
    let mut args = vec![
        "--output=machine".to_string(),
        "--audio=raw".to_string(),
        format!("--modelsdir={}", basemodeldir.display()),
    ];
    args.extend(audio_args(conf));
    args.extend(specs.iter().cloned());
    args
}

fn preprocessor_args(conf: &AudioConf) -> Vec<String> {
    let mut args = vec!["--vad".to_string()];
    args.extend(audio_args(conf));
    args
}

/// Children live next to the bridge executable.
fn sibling_exe(name: &str) -> Result<PathBuf> {
    let me = std::env::current_exe()?;
    let dir = me
        .parent()
        .ok_or_else(|| VozError::Internal("executable has no parent directory".into()))?;
    Ok(dir.join(name))
}

pub struct Bridge {
    cfg: BridgeConfig,
    port: TTYPort,
    catalog: Catalog,
    audio: AudioConf,
    mode: Mode,
    child: Option<ChildProc>,
    gpio: Option<GpioController>,
    refrac: u32,
    kind: u8,
    frames: u32,
    matches: u32,
    running: bool,
    exit: i32,
    last_status: Instant,
    frames_at_last_status: u32,
}

impl Bridge {
    pub fn new(cfg: BridgeConfig) -> Result<Bridge> {
        let port = serialport::new(cfg.device.as_str(), BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(SERIAL_TIMEOUT)
            .open_native()?;
        log::info!("serial link up on {} at {} 8N1", cfg.device, BAUD_RATE);

        let catalog = Catalog::load(&cfg.wwmodeldir)?;

        let gpio = if cfg.led.is_some() || cfg.int.is_some() {
            match GpioController::start(cfg.led.as_ref(), cfg.int.as_ref()) {
                Ok(gpio) => Some(gpio),
                Err(e) => {
                    log::warn!("GPIO unavailable, continuing without it: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Bridge {
            cfg,
            port,
            catalog,
            audio: AudioConf::default(),
            mode: Mode::Idle,
            child: None,
            gpio,
            refrac: 0,
            kind: status_kind::OK,
            frames: 0,
            matches: 0,
            running: true,
            exit: exit_code::OK,
            last_status: Instant::now(),
            frames_at_last_status: 0,
        })
    }

    /// Main poll loop; returns the process exit code.
    pub fn run(&mut self, signals: &SignalPipe) -> Result<i32> {
        self.emit_status()?;

        while self.running {
            let (sig_ready, uart_ready, out_ready, err_ready) = self.poll_once(signals)?;

            if sig_ready {
                while let Some(sig) = signals.take() {
                    match sig {
                        Signal::SIGTERM | Signal::SIGINT => {
                            log::info!("termination requested");
                            self.running = false;
                            self.exit = exit_code::REQUESTED;
                        }
                        Signal::SIGCHLD => log::debug!("SIGCHLD"),
                        other => log::debug!("ignoring signal {:?}", other),
                    }
                }
            }

            if uart_ready {
                self.service_uart();
            }
            if out_ready {
                self.pump_child_stdout();
            }
            if err_ready {
                self.relay_child_stderr();
            }
            self.reap_dead_child();

            if self.last_status.elapsed() >= WATCHDOG_PERIOD {
                let delta = self.frames.wrapping_sub(self.frames_at_last_status);
                log::info!(
                    "watchdog: mode {:?}, {} frames in the last {}s",
                    self.mode,
                    delta,
                    WATCHDOG_PERIOD.as_secs()
                );
                if let Err(e) = self.emit_status() {
                    self.fail_link(e);
                }
            }
        }

        self.teardown();
        Ok(self.exit)
    }

    /// One poll over the signal pipe, the UART and the child pipes.
    fn poll_once(&self, signals: &SignalPipe) -> Result<(bool, bool, bool, bool)> {
        let uart_raw = self.port.as_raw_fd();
        let out_raw = self.child.as_ref().and_then(|c| c.stdout_fd().map(|f| f.as_raw_fd()));
        let err_raw = self.child.as_ref().and_then(|c| c.stderr_fd().map(|f| f.as_raw_fd()));

        // The raw fds are owned by self and outlive this call.
        let borrow = |raw: i32| unsafe { BorrowedFd::borrow_raw(raw) };
        let mut fds = vec![
            PollFd::new(signals.as_fd(), PollFlags::POLLIN),
            PollFd::new(borrow(uart_raw), PollFlags::POLLIN),
        ];
        if let Some(raw) = out_raw {
            fds.push(PollFd::new(borrow(raw), PollFlags::POLLIN));
        }
        if let Some(raw) = err_raw {
            fds.push(PollFd::new(borrow(raw), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) => return Ok((false, false, false, false)),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok((true, false, false, false)),
            Err(e) => return Err(e.into()),
        }

        let readable = |fd: &PollFd| {
            fd.revents()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
                .unwrap_or(false)
        };
        let sig_ready = readable(&fds[0]);
        let uart_ready = readable(&fds[1]);
        let mut child_fds = fds.iter().skip(2);
        let out_ready = out_raw.is_some() && child_fds.next().map(readable).unwrap_or(false);
        let err_ready = err_raw.is_some() && child_fds.next().map(readable).unwrap_or(false);
        Ok((sig_ready, uart_ready, out_ready, err_ready))
    }

    fn service_uart(&mut self) {
        match read_event(&mut self.port) {
            Ok(event) => {
                if let Err(e) = self.handle_event(event) {
                    log::error!("event handling failed: {}", e);
                    self.fail(status_kind::INTERNAL);
                }
            }
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                log::warn!("serial read timed out mid-frame");
            }
            Err(FrameError::Io(e)) => {
                log::error!("serial link failed: {}", e);
                self.kind = status_kind::IO;
                self.running = false;
                self.exit = exit_code::RESTART_RETRY;
            }
            Err(e) => {
                // Bad frame: warn and resync on the next read.
                log::warn!("dropping bad frame: {}", e);
                self.kind = status_kind::FRAME;
            }
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Nop => {}
            Event::Status(_) => self.emit_status()?,
            Event::Mode { mode } => match Mode::from_u8(mode) {
                Some(mode) => self.set_mode(mode)?,
                None => {
                    log::warn!("host requested unknown mode {}", mode);
                    self.kind = status_kind::CONFIG;
                    self.emit_status()?;
                }
            },
            Event::Config(None) => self.send(&Event::Config(Some(self.audio)))?,
            Event::Config(Some(conf)) => {
                self.audio = conf;
                log::info!(
                    "audio config: preamp {}, noiser {}, autogain {}, vad {}",
                    conf.preamp,
                    conf.noiser,
                    conf.autogain,
                    conf.vad
                );
                // Restart the child in place so the new settings apply.
                if self.mode != Mode::Idle {
                    self.set_mode(self.mode)?;
                }
                self.send(&Event::Config(Some(self.audio)))?;
            }
            Event::Audio(pcm) => self.forward_audio(&pcm),
            Event::BAudio { pcm, .. } => self.forward_audio(&pcm),
            Event::Areset { refrac } => {
                if let Some(child) = &self.child {
                    child.signal_reset();
                }
                self.refrac = u32::from(refrac);
                log::info!("audio reset, dropping next {} frames", self.refrac);
            }
            Event::Reboot => {
                log::info!("host requested reboot");
                self.running = false;
                self.exit = exit_code::RESTART;
            }
            Event::WwList { clear } => {
                if clear {
                    self.catalog.clear_enabled();
                }
                for status in self.catalog.statuses() {
                    self.send(&Event::WwStatus(status))?;
                }
                self.emit_status()?;
            }
            Event::WwConf(conf) => {
                match self.catalog.apply(&conf) {
                    Ok(echo) => {
                        self.send(&Event::WwStatus(echo))?;
                        // Apply the change by restarting the detector.
                        if self.mode == Mode::WakeWord {
                            self.set_mode(Mode::WakeWord)?;
                        }
                    }
                    Err(e) => {
                        log::warn!("rejected wake-word config: {}", e);
                        self.kind = status_kind::CONFIG;
                        self.emit_status()?;
                    }
                }
            }
            Event::WwStatus(_) | Event::WwMatch(_) => {
                log::warn!("ignoring device-to-host event from the host");
            }
        }
        Ok(())
    }

    fn forward_audio(&mut self, pcm: &[u8]) {
        self.frames = self.frames.wrapping_add(1);
        if self.refrac > 0 {
            self.refrac -= 1;
            return;
        }
        let Some(child) = &mut self.child else {
            log::debug!("dropping audio frame while idle");
            return;
        };
        if let Err(e) = child.feed(pcm) {
            log::error!("feeding child failed: {}", e);
            self.fail(status_kind::CHILD_IO);
        }
    }

    fn pump_child_stdout(&mut self) {
        match self.mode {
            Mode::WakeWord | Mode::Idle => {
                let lines = match &mut self.child {
                    Some(child) => child.drain_stdout_lines(),
                    None => return,
                };
                if self.mode == Mode::Idle {
                    return;
                }
                for line in lines {
                    match parse_stdout_line(&line) {
                        Some(ChildEvent::Ready(ready)) => {
                            if let Some(child) = &mut self.child {
                                child.ready = ready;
                            }
                            self.gpio_send(if ready { GpioCommand::On } else { GpioCommand::Off });
                            if let Err(e) = self.emit_status() {
                                self.fail_link(e);
                            }
                        }
                        Some(ChildEvent::Match { name, score, count }) => {
                            self.matches = self.matches.wrapping_add(1);
                            let index = name.parse::<u8>().unwrap_or(u8::MAX);
                            if index == u8::MAX {
                                log::warn!("match for unknown catalog entry '{}'", name);
                            }
                            log::info!(
                                "🎯 wake word match: entry {} score {:.3} count {}",
                                index,
                                score,
                                count
                            );
                            self.gpio_send(GpioCommand::Int);
                            self.gpio_send(GpioCommand::Blink);
                            if let Err(e) =
                                self.send(&Event::WwMatch(WwMatch { index, score, count }))
                            {
                                self.fail_link(e);
                            }
                        }
                        None => {}
                    }
                }
            }
            Mode::Preprocessor => {
                let records = match &mut self.child {
                    Some(child) => child.drain_stdout_records(PRE_RECORD_BYTES),
                    None => return,
                };
                for record in records {
                    let event = Event::BAudio { vad: record[0], pcm: record[1..].to_vec() };
                    if let Err(e) = self.send(&event) {
                        self.fail_link(e);
                        break;
                    }
                }
            }
        }
    }

    fn relay_child_stderr(&mut self) {
        let Some(child) = &mut self.child else {
            return;
        };
        for line in child.drain_stderr_lines() {
            log::info!("[child] {}", line);
        }
    }

    /// Handles a child that closed its pipes: drain stderr, reap, go idle.
    fn reap_dead_child(&mut self) {
        if !self.child.as_ref().map(|c| c.eof).unwrap_or(false) {
            return;
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        for line in child.drain_stderr_lines() {
            log::info!("[child] {}", line);
        }
        let status = child.reap();
        let failed = status.map(|s| !s.success()).unwrap_or(true);
        if failed {
            log::error!("child exited abnormally: {:?}", status);
            self.kind = status_kind::CHILD_IO;
        } else {
            log::info!("child exited cleanly");
        }
        self.mode = Mode::Idle;
        self.gpio_send(GpioCommand::Off);
        if let Err(e) = self.emit_status() {
            self.fail_link(e);
        }
    }

    /// Stops the current child, reconfigures and spawns the one the new
    /// mode needs, then reports.
    fn set_mode(&mut self, new_mode: Mode) -> Result<()> {
        if let Some(child) = self.child.take() {
            child.stop();
        }
        self.mode = Mode::Idle;
        self.gpio_send(GpioCommand::Off);

        let spawned = match new_mode {
            Mode::Idle => None,
            Mode::WakeWord => {
                let specs = self.catalog.enabled_specs();
                if specs.is_empty() {
                    log::warn!("no wake-word entries enabled, staying idle");
                    self.kind = status_kind::CONFIG;
                    None
                } else {
                    let args = detector_args(&self.audio, &self.cfg.basemodeldir, &specs);
                    Some(("voz-oww", args))
                }
            }
            Mode::Preprocessor => Some(("voz-pre", preprocessor_args(&self.audio))),
        };

        if let Some((exe, args)) = spawned {
            match sibling_exe(exe).and_then(|path| ChildProc::spawn(&path, &args)) {
                Ok(child) => {
                    self.child = Some(child);
                    // Give the child time to come up before feeding it.
                    std::thread::sleep(CHILD_GRACE);
                    self.mode = new_mode;
                    self.kind = status_kind::OK;
                    self.refrac = 0;
                    log::info!("mode changed to {:?}", new_mode);
                }
                Err(e) => {
                    log::error!("cannot enter {:?}: {}", new_mode, e);
                    self.kind = status_kind::CHILD_IO;
                }
            }
        } else if new_mode == Mode::Idle {
            log::info!("mode changed to Idle");
            self.kind = status_kind::OK;
        }

        self.emit_status()
    }

    fn emit_status(&mut self) -> Result<()> {
        let report = StatusReport {
            mode: self.mode as u8,
            kind: self.kind,
            ready: u8::from(self.child.as_ref().map(|c| c.ready).unwrap_or(false)),
            wakeword_mask: self.catalog.mask(),
            frames: self.frames,
            matches: self.matches,
        };
        self.last_status = Instant::now();
        self.frames_at_last_status = self.frames;
        self.send(&Event::Status(Some(report)))
    }

    fn send(&mut self, event: &Event) -> Result<()> {
        write_event(&mut self.port, event)?;
        Ok(())
    }

    /// Non-link failure: record the kind and demote to idle.
    fn fail(&mut self, kind: u8) {
        self.kind = kind;
        if self.mode != Mode::Idle {
            if let Err(e) = self.set_mode(Mode::Idle) {
                self.fail_link(e);
            }
        }
    }

    /// The UART itself failed; leave with a restart-worthy exit code.
    fn fail_link(&mut self, e: VozError) {
        log::error!("serial link write failed: {}", e);
        self.kind = status_kind::IO;
        self.running = false;
        self.exit = exit_code::RESTART_RETRY;
    }

    fn gpio_send(&self, command: GpioCommand) {
        if let Some(gpio) = &self.gpio {
            gpio.send(command);
        }
    }

    fn teardown(&mut self) {
        if let Some(child) = self.child.take() {
            child.stop();
        }
        self.gpio_send(GpioCommand::Off);
        self.gpio = None;
        log::info!("bridge stopped (exit {})", self.exit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_u8() {
        for mode in [Mode::Idle, Mode::WakeWord, Mode::Preprocessor] {
            assert_eq!(Mode::from_u8(mode as u8), Some(mode));
        }
        assert_eq!(Mode::from_u8(7), None);
    }

    #[test]
    fn detector_args_carry_config_and_specs() {
        let conf = AudioConf { preamp: 1.5, noiser: 2, autogain: 10, vad: 0 };
        let specs = vec!["m.tflite:0:0.5:1".to_string()];
        let args = detector_args(&conf, &PathBuf::from("/opt/models"), &specs);
        assert_eq!(args[0], "--output=machine");
        assert!(args.contains(&"--modelsdir=/opt/models".to_string()));
        assert!(args.contains(&"--preamp=1.5".to_string()));
        assert!(args.contains(&"--noiser=2".to_string()));
        assert_eq!(args.last().unwrap(), "m.tflite:0:0.5:1");
    }

    #[test]
    fn preprocessor_always_reports_vad() {
        let args = preprocessor_args(&AudioConf::default());
        assert_eq!(args[0], "--vad");
    }
}
