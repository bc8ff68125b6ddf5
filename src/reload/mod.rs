//! Reload supervisor subsystem.
//!
//! # Data Flow
//! ```text
//! Parent (supervisor.rs):
//!     bind listener once → mark inheritable → spawn worker
//!     every interval: watcher.rs polls → signature.rs compares mtimes
//!         → change: kill worker, spawn a new one on the same socket
//!     worker exit: 0 stops, 3 restarts, anything else waits for a change
//!
//! Worker (lifecycle::startup):
//!     DEVSERVE_RUN_MAIN=true → adopt DEVSERVE_SERVER_FD → serve
//! ```
//!
//! # Design Decisions
//! - The parent owns the socket for the whole session, so restarts never
//!   race on the address
//! - The supervisor is an explicit object; nothing here is global except the
//!   environment variables of the child protocol
//! - Unix only

#[cfg(unix)]
pub mod supervisor;
pub mod signature;
pub mod watcher;

use std::io;
use std::path::PathBuf;

pub use signature::{Signature, WatchSet};
#[cfg(unix)]
pub use supervisor::{Supervisor, WorkerCommand};
pub use watcher::FileWatcher;

/// Set to `true` in the worker process.
pub const RUN_MAIN_ENV: &str = "DEVSERVE_RUN_MAIN";

/// Descriptor number of the inherited listening socket.
pub const SERVER_FD_ENV: &str = "DEVSERVE_SERVER_FD";

/// Worker exit code asking the supervisor for an immediate restart.
pub const RESTART_EXIT_CODE: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("the reloader is not supported on this platform")]
    Unsupported,

    #[error("failed to resolve the current executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to share the listening socket with workers: {0}")]
    Socket(#[source] io::Error),

    #[error("invalid DEVSERVE_SERVER_FD value {0:?}")]
    InvalidFd(String),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),
}

/// Whether this process is a worker started by the supervisor.
pub fn is_running_from_reloader() -> bool {
    std::env::var(RUN_MAIN_ENV).is_ok_and(|value| value == "true")
}

/// The listening socket descriptor handed down by the supervisor, if any.
#[cfg(unix)]
pub fn inherited_fd() -> Result<Option<std::os::fd::RawFd>, ReloadError> {
    parse_fd(std::env::var(SERVER_FD_ENV))
}

#[cfg(unix)]
fn parse_fd(
    value: Result<String, std::env::VarError>,
) -> Result<Option<std::os::fd::RawFd>, ReloadError> {
    match value {
        Ok(value) => match value.trim().parse() {
            Ok(fd) if fd >= 0 => Ok(Some(fd)),
            _ => Err(ReloadError::InvalidFd(value)),
        },
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(value)) => {
            Err(ReloadError::InvalidFd(value.to_string_lossy().into_owned()))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::env::VarError;

    #[test]
    fn server_fd_values() {
        assert_eq!(parse_fd(Err(VarError::NotPresent)).unwrap(), None);
        assert_eq!(parse_fd(Ok("7".into())).unwrap(), Some(7));
        assert_eq!(parse_fd(Ok(" 12\n".into())).unwrap(), Some(12));
        for bad in ["", "-1", "three"] {
            let err = parse_fd(Ok(bad.into())).unwrap_err();
            assert!(matches!(err, ReloadError::InvalidFd(ref v) if v == bad));
        }
    }
}
