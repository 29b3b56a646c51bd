use alloc_counter::no_alloc;
use std::ffi::{c_int, CStr};
use std::fmt;

use crate::mapping::IdKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failed system call or protocol step: the errno (0 if the OS was not involved), what went
/// wrong, and what we were doing at the time. Building and printing one never allocates, so the
/// cloned child can use it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub errno: c_int,
    pub cause: Option<&'static str>,
    pub context: Option<&'static str>,
}

impl Error {
    /// An error with no errno and no message.
    pub fn new() -> Error {
        Error::default()
    }

    /// An error which is only a message.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn msg(cause: &'static str) -> Error {
        Error {
            cause: Some(cause),
            ..Error::default()
        }
    }

    /// Capture `errno` as left by the last failed call.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn last_os_error() -> Error {
        Error {
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            ..Error::default()
        }
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn cause(self, msg: &'static str) -> Error {
        Error {
            cause: Some(msg),
            ..self
        }
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn context(self, msg: &'static str) -> Error {
        Error {
            context: Some(msg),
            ..self
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error {
            errno: e.raw_os_error().unwrap_or(0),
            ..Error::default()
        }
    }
}

/// `strerror(3)`, borrowed from libc's static table.
fn strerror(errno: c_int) -> &'static str {
    let msg = unsafe { CStr::from_ptr(libc::strerror(errno)) };
    msg.to_str().unwrap_or("unknown error")
}

/// Prints `context: cause: strerror (errno N)`, leaving out whatever is missing.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for part in [self.context, self.cause].into_iter().flatten() {
            write!(f, "{sep}{part}")?;
            sep = ": ";
        }

        match self.errno {
            // strerror(0) is "Success".
            0 if sep.is_empty() => f.write_str("unknown error"),
            0 => Ok(()),
            errno => write!(f, "{sep}{} (errno {errno})", strerror(errno)),
        }
    }
}

impl std::error::Error for Error {}

/// Failure of a whole launch request, one variant per fatal terminal state.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The request was rejected before any resource was created.
    #[error("invalid arguments: {0}")]
    InvalidArguments(&'static str),

    #[error("failed to open rendezvous channel: {0}")]
    Channel(#[source] Error),

    #[error("failed to create child process: {0}")]
    ProcessCreation(#[source] Error),

    /// Writing an ID map failed. The child `pid` has already been killed and reaped.
    #[error("failed to write {kind} map for child {pid}: {source}")]
    MappingWrite {
        pid: libc::pid_t,
        kind: IdKind,
        #[source]
        source: Error,
    },

    /// Closing the parent's end of the rendezvous channel failed. The child `pid` has already
    /// been killed and reaped.
    #[error("failed to release child {pid}: {source}")]
    Release {
        pid: libc::pid_t,
        #[source]
        source: Error,
    },

    #[error("failed to wait for child: {0}")]
    Wait(#[source] Error),
}

/// Return early with an error carrying only a message.
macro_rules! bail {
    ($msg:expr) => {
        return Err(Error::msg($msg))
    };
}
pub(crate) use bail;

/// Return early with the last OS error, optionally naming the call which failed.
macro_rules! bail_errno {
    () => {
        return Err(Error::last_os_error());
    };
    ($msg:expr) => {
        return Err(Error::last_os_error().cause($msg));
    };
}
pub(crate) use bail_errno;
