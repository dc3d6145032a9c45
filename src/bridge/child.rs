//! Supervised child process: spawn, feed audio on stdin, harvest stdout and
//! stderr through non-blocking pipes.
//!
//! In wake-word mode stdout is the newline-framed machine protocol
//! (`R:0|1`, `P:name:score:count`); in preprocessor mode it is binary
//! `[vad byte][chunk]` records. Stderr is always relayed line by line.

use std::io::Read;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{Result, VozError};

const STOP_GRACE: Duration = Duration::from_millis(1500);
const REAP_POLL: Duration = Duration::from_millis(50);

/// Parsed child stdout line (wake-word mode).
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Ready(bool),
    Match { name: String, score: f32, count: u8 },
}

/// Parses one machine-format line; unknown event letters are warned about
/// and dropped.
pub fn parse_stdout_line(line: &str) -> Option<ChildEvent> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    match line.split_once(':') {
        Some(("R", state)) => match state {
            "0" => Some(ChildEvent::Ready(false)),
            "1" => Some(ChildEvent::Ready(true)),
            _ => {
                log::warn!("child sent malformed ready line '{}'", line);
                None
            }
        },
        Some(("P", rest)) => {
            let mut fields = rest.rsplitn(3, ':');
            let count = fields.next()?.parse::<u8>().ok();
            let score = fields.next()?.parse::<f32>().ok();
            let name = fields.next()?;
            match (count, score) {
                (Some(count), Some(score)) if !name.is_empty() => Some(ChildEvent::Match {
                    name: name.to_string(),
                    score,
                    count,
                }),
                _ => {
                    log::warn!("child sent malformed match line '{}'", line);
                    None
                }
            }
        }
        _ => {
            log::warn!("child sent unknown event line '{}'", line);
            None
        }
    }
}

pub struct ChildProc {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    pub ready: bool,
    pub eof: bool,
}

impl ChildProc {
    pub fn spawn(exe: &Path, args: &[String]) -> Result<ChildProc> {
        log::info!("spawning child {} {}", exe.display(), args.join(" "));
        let mut child = Command::new(exe)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VozError::ChildIo(format!("spawn {}: {}", exe.display(), e)))?;

        if let Some(stdout) = &child.stdout {
            set_nonblocking(stdout.as_raw_fd())?;
        }
        if let Some(stderr) = &child.stderr {
            set_nonblocking(stderr.as_raw_fd())?;
        }
        let stdin = child.stdin.take();

        Ok(ChildProc {
            child,
            stdin,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            ready: false,
            eof: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn stdout_fd(&self) -> Option<BorrowedFd<'_>> {
        self.child.stdout.as_ref().map(|s| s.as_fd())
    }

    pub fn stderr_fd(&self) -> Option<BorrowedFd<'_>> {
        self.child.stderr.as_ref().map(|s| s.as_fd())
    }

    /// Writes one audio frame to the child's stdin.
    pub fn feed(&mut self, pcm: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VozError::ChildIo("child stdin already closed".into()))?;
        stdin
            .write_all(pcm)
            .and_then(|_| stdin.flush())
            .map_err(|e| VozError::ChildIo(format!("write to child stdin: {}", e)))
    }

    /// Sends the pipeline-reset signal.
    pub fn signal_reset(&self) {
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = kill(pid, Signal::SIGUSR1) {
            log::warn!("failed to signal child {}: {}", pid, e);
        }
    }

    /// Drains whatever is readable from stdout into the line buffer and
    /// returns the complete lines.
    pub fn drain_stdout_lines(&mut self) -> Vec<String> {
        let eof = drain_pipe(self.child.stdout.as_mut(), &mut self.stdout_buf);
        self.eof |= eof;
        pop_lines(&mut self.stdout_buf)
    }

    /// Drains stdout as fixed-size binary records (preprocessor mode).
    pub fn drain_stdout_records(&mut self, record_len: usize) -> Vec<Vec<u8>> {
        let eof = drain_pipe(self.child.stdout.as_mut(), &mut self.stdout_buf);
        self.eof |= eof;
        let mut records = Vec::new();
        while self.stdout_buf.len() >= record_len {
            records.push(self.stdout_buf.drain(..record_len).collect());
        }
        records
    }

    pub fn drain_stderr_lines(&mut self) -> Vec<String> {
        let eof = drain_pipe(self.child.stderr.as_mut(), &mut self.stderr_buf);
        self.eof |= eof;
        pop_lines(&mut self.stderr_buf)
    }

    /// Closes stdin and reaps the child, escalating to SIGTERM after a
    /// grace period.
    pub fn stop(mut self) -> Option<ExitStatus> {
        drop(self.stdin.take());

        let deadline = Instant::now() + STOP_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("child {} exited: {}", self.child.id(), status);
                    return Some(status);
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(REAP_POLL);
                }
                Err(e) => {
                    log::warn!("waiting for child failed: {}", e);
                    return None;
                }
            }
        }

        log::warn!("child {} ignored stdin close, terminating", self.child.id());
        let _ = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);
        match self.child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                log::warn!("reaping child failed: {}", e);
                None
            }
        }
    }

    /// Reaps a child that already reached EOF on its pipes.
    pub fn reap(mut self) -> Option<ExitStatus> {
        drop(self.stdin.take());
        match self.child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                log::warn!("reaping child failed: {}", e);
                None
            }
        }
    }
}

fn set_nonblocking(fd: i32) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Reads all currently available bytes; returns true on EOF.
fn drain_pipe<R: Read>(pipe: Option<&mut R>, buf: &mut Vec<u8>) -> bool {
    let Some(pipe) = pipe else {
        return true;
    };
    let mut scratch = [0u8; 4096];
    loop {
        match pipe.read(&mut scratch) {
            Ok(0) => return true,
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("child pipe read failed: {}", e);
                return true;
            }
        }
    }
}

fn pop_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ready_and_match_lines() {
        assert_eq!(parse_stdout_line("R:1"), Some(ChildEvent::Ready(true)));
        assert_eq!(parse_stdout_line("R:0"), Some(ChildEvent::Ready(false)));
        assert_eq!(
            parse_stdout_line("P:0:0.750000:2"),
            Some(ChildEvent::Match { name: "0".into(), score: 0.75, count: 2 })
        );
        assert_eq!(
            parse_stdout_line("P:hey_mycroft:0.9:1"),
            Some(ChildEvent::Match { name: "hey_mycroft".into(), score: 0.9, count: 1 })
        );
    }

    #[test]
    fn drops_unknown_and_malformed_lines() {
        assert_eq!(parse_stdout_line("X:whatever"), None);
        assert_eq!(parse_stdout_line("R:2"), None);
        assert_eq!(parse_stdout_line("P:name"), None);
        assert_eq!(parse_stdout_line("P::0.5:1"), None);
        assert_eq!(parse_stdout_line(""), None);
    }

    #[test]
    fn pop_lines_keeps_partial_tail() {
        let mut buf = b"R:1\nP:0:0.5:1\npartial".to_vec();
        let lines = pop_lines(&mut buf);
        assert_eq!(lines, vec!["R:1".to_string(), "P:0:0.5:1".to_string()]);
        assert_eq!(buf, b"partial");
    }
}
