//! Self-pipe signal delivery.
//!
//! The handler writes the signal number to a non-blocking pipe; whoever owns
//! the read end (a dedicated thread in the detector, the poll loop in the
//! bridge) consumes it. Nothing but the pipe's write fd is process-global.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Result, VozError};

static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: libc::c_int) {
    let fd = PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        // Async-signal-safe; a full pipe just drops the notification, the
        // pending one already in it will wake the consumer.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Read end of the signal pipe. Install once per process.
pub struct SignalPipe {
    rx: OwnedFd,
}

impl SignalPipe {
    pub fn install(signals: &[Signal]) -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        if PIPE_WR
            .compare_exchange(-1, fds[1], Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(VozError::Internal("signal pipe installed twice".into()));
        }
        let rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for &sig in signals {
            unsafe { sigaction(sig, &action) }?;
        }

        Ok(SignalPipe { rx })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.rx.as_fd()
    }

    /// Non-blocking: drains one pending signal if any.
    pub fn take(&self) -> Option<Signal> {
        let mut byte = [0u8; 1];
        let n = unsafe {
            libc::read(self.rx.as_raw_fd(), byte.as_mut_ptr() as *mut libc::c_void, 1)
        };
        if n == 1 {
            Signal::try_from(i32::from(byte[0])).ok()
        } else {
            None
        }
    }

    /// Blocks until a signal arrives.
    pub fn wait(&self) -> Option<Signal> {
        loop {
            let mut fds = [PollFd::new(self.rx.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(0) | Err(nix::errno::Errno::EINTR) => continue,
                Ok(_) => {
                    if let Some(sig) = self.take() {
                        return Some(sig);
                    }
                }
                Err(_) => return None,
            }
        }
    }
}
