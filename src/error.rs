//! Error types shared by the voz tools.

use thiserror::Error;

/// Result type alias for voz operations.
pub type Result<T> = std::result::Result<T, VozError>;

#[derive(Error, Debug)]
pub enum VozError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor allocation failed: {0}")]
    TensorAlloc(String),

    #[error("tensor runtime error: {0}")]
    TensorRuntime(String),

    #[error("model is not runnable: {0}")]
    NotRunnable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("child process I/O: {0}")]
    ChildIo(String),

    #[error("audio processor error: {0}")]
    Dsp(String),

    #[error("serial frame error: {0}")]
    Frame(#[from] serial_protocol::FrameError),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("GPIO error: {0}")]
    Gpio(#[from] gpio_cdev::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<nix::Error> for VozError {
    fn from(e: nix::Error) -> Self {
        VozError::Io(std::io::Error::from(e))
    }
}
