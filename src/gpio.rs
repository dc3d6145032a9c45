//! Status LED and host-interrupt lines, driven by a single worker thread.
//!
//! Commands are queued through a roll buffer so the poll loop never blocks
//! on a sleep-carrying blink or pulse. The interrupt line idles high and
//! pulses low; the LED line idles low.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};

use crate::error::{Result, VozError};
use crate::rollbuf::SyncRollBuffer;

const BLINK_TIME: Duration = Duration::from_millis(350);
const INT_PULSE_TIME: Duration = Duration::from_millis(10);
const QUEUE_CAPACITY: usize = 16;
const CONSUMER: &str = "voz-ser";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioCommand {
    On,
    Off,
    Blink,
    Int,
    Quit,
}

/// A `gpiochipN:line` pair from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioSpec {
    pub chip: String,
    pub line: u32,
}

impl GpioSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (chip, line) = spec
            .split_once(':')
            .ok_or_else(|| VozError::Config(format!("GPIO spec '{}' is not chip:line", spec)))?;
        if chip.is_empty() {
            return Err(VozError::Config(format!("GPIO spec '{}' has no chip", spec)));
        }
        let line = line
            .parse::<u32>()
            .map_err(|_| VozError::Config(format!("GPIO spec '{}': bad line number", spec)))?;
        Ok(GpioSpec { chip: chip.to_string(), line })
    }

    fn device_path(&self) -> String {
        format!("/dev/{}", self.chip)
    }
}

fn request_line(chip: &mut Chip, line: u32, default: u8) -> Result<LineHandle> {
    let line = chip.get_line(line)?;
    Ok(line.request(LineRequestFlags::OUTPUT, default, CONSUMER)?)
}

/// Requests both lines, reusing one chip handle when they live on the same
/// `gpiochipN`.
fn request_lines(
    led: Option<&GpioSpec>,
    int: Option<&GpioSpec>,
) -> Result<(Option<LineHandle>, Option<LineHandle>)> {
    match (led, int) {
        (Some(led), Some(int)) if led.chip == int.chip => {
            let mut chip = Chip::new(led.device_path())?;
            let led = request_line(&mut chip, led.line, 0)?;
            let int = request_line(&mut chip, int.line, 1)?;
            Ok((Some(led), Some(int)))
        }
        _ => {
            let led = led
                .map(|spec| request_line(&mut Chip::new(spec.device_path())?, spec.line, 0))
                .transpose()?;
            let int = int
                .map(|spec| request_line(&mut Chip::new(spec.device_path())?, spec.line, 1))
                .transpose()?;
            Ok((led, int))
        }
    }
}

pub struct GpioController {
    queue: Arc<SyncRollBuffer<GpioCommand>>,
    worker: Option<JoinHandle<()>>,
}

impl GpioController {
    /// Requests the configured lines and starts the worker. The LED starts
    /// low, the interrupt line high (open-high idle, active-low pulse).
    pub fn start(led: Option<&GpioSpec>, int: Option<&GpioSpec>) -> Result<Self> {
        let (led, int) = request_lines(led, int)?;

        let queue = Arc::new(SyncRollBuffer::new(QUEUE_CAPACITY));
        let worker = {
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name("gpio".into())
                .spawn(move || worker_loop(&queue, led, int))?
        };

        Ok(GpioController { queue, worker: Some(worker) })
    }

    pub fn send(&self, command: GpioCommand) {
        self.queue.append_one(command);
    }
}

impl Drop for GpioController {
    fn drop(&mut self) {
        self.queue.append_one(GpioCommand::Quit);
        self.queue.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    queue: &SyncRollBuffer<GpioCommand>,
    led: Option<LineHandle>,
    int: Option<LineHandle>,
) {
    loop {
        let mut guard = queue.wait_any();
        if guard.is_empty() {
            if guard.status().cancel {
                break;
            }
            guard.release_and_signal();
            continue;
        }
        let command = guard.get()[0];
        guard.shift(1);
        guard.release();

        match command {
            GpioCommand::On => set(&led, 1),
            GpioCommand::Off => set(&led, 0),
            GpioCommand::Blink => {
                set(&led, 1);
                thread::sleep(BLINK_TIME);
                set(&led, 0);
            }
            GpioCommand::Int => {
                set(&int, 0);
                thread::sleep(INT_PULSE_TIME);
                set(&int, 1);
            }
            GpioCommand::Quit => break,
        }
    }
}

fn set(line: &Option<LineHandle>, value: u8) {
    if let Some(line) = line {
        if let Err(e) = line.set_value(value) {
            log::warn!("GPIO write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chip_and_line() {
        let spec = GpioSpec::parse("gpiochip0:17").unwrap();
        assert_eq!(spec.chip, "gpiochip0");
        assert_eq!(spec.line, 17);
        assert_eq!(spec.device_path(), "/dev/gpiochip0");
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(GpioSpec::parse("gpiochip0").is_err());
        assert!(GpioSpec::parse(":17").is_err());
        assert!(GpioSpec::parse("gpiochip0:x").is_err());
    }
}
