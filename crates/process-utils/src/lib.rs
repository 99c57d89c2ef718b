//! Small process-related helpers shared across the workspace.
//!
//! Covers the three things every collaborator process needs: building a
//! command that cannot outlive its owner, creating the named pipes the
//! processes talk through, and describing how a process ended.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

/// Create a `tokio::process::Command` for a supervised collaborator.
///
/// The child is killed when its handle is dropped and stdin is closed unless
/// the caller asks for a pipe.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.kill_on_drop(true).stdin(Stdio::null());
    cmd
}

/// Create a named pipe at `path`.
///
/// An existing FIFO is reused. Any other file at that path is an error, since
/// writing media into a regular file would silently grow it forever.
#[cfg(unix)]
pub fn ensure_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a FIFO", path.display()),
            ));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    match nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => Ok(()),
        // Lost a race with another creator; accept it if it is a FIFO.
        Err(nix::errno::Errno::EEXIST) => ensure_fifo(path),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

/// Whether `err` means a FIFO was opened for writing before any reader
/// attached to it.
#[cfg(unix)]
pub fn is_fifo_without_reader(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ENXIO as i32)
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Report for a process that exited with `code`.
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Report for a process terminated by `signal`.
    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        Self::from_status(status)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}
