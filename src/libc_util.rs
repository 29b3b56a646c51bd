use alloc_counter::no_alloc;
use std::ffi::{c_int, c_void};

use crate::error::{bail, bail_errno, Error, Result};

/// Log a message (given in format_args! style) by writing it to a file descriptor.
///
/// This cannot allocate---buffer messages to a fixed-length, stack-allocated 2048-byte buffer.
///
/// ```ignore
/// log_fd!(fd, "msg {param}", param = 42)
/// ```
macro_rules! log_fd {
    ($fd:expr, $($arg:tt)*) => {
        {
            use std::io::Write as _;
            let mut buffer = [0u8; 2048];
            let mut cursor = std::io::Cursor::new(&mut buffer[..]);
            let _ = writeln!(cursor, $($arg)*);
            let _ = unsafe {
                libc::write(
                    $fd,
                    cursor.get_ref().as_ptr() as *const std::ffi::c_void,
                    cursor.position() as usize,
                )
            };
        }
    };
}
pub(crate) use log_fd;

/// Get the topmost valid stack pointer inside a segment of stack memory.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn get_topmost_stack_pointer(stack: &mut [u8]) -> *mut c_void {
    let top_addr = stack.as_mut_ptr().add(stack.len()) as *mut c_void;

    // Align downwards, multiple of 16.
    let top_addr = top_addr as usize & !0xf;

    top_addr as *mut c_void
}

/// Create a close-on-exec pipe, returning `(read_fd, write_fd)`.
pub fn pipe() -> Result<(c_int, c_int)> {
    let mut fds = [0; 2];
    let 0.. = (unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }) else {
        bail_errno!("failed to create pipe");
    };
    let [read_fd, write_fd] = fds;
    Ok((read_fd, write_fd))
}

/// Close a file descriptor, reporting failure.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn close(fd: c_int) -> Result<()> {
    let 0 = (unsafe { libc::close(fd) }) else {
        bail_errno!("failed to close file descriptor");
    };
    Ok(())
}

/// Block until a single byte can be read from `fd`, or until EOF. Returns the number of bytes
/// read (0 or 1). Retries on `EINTR`.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn read_byte(fd: c_int) -> Result<usize> {
    let mut byte = 0u8;
    loop {
        let result = unsafe { libc::read(fd, (&mut byte) as *mut u8 as *mut c_void, 1) };
        if result >= 0 {
            return Ok(result as usize);
        }
        let err = Error::last_os_error();
        if err.errno != libc::EINTR {
            return Err(err.cause("failed to read from pipe"));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(c_int),
    Signal(c_int),
}

impl ExitStatus {
    pub fn from_wait_status(wait_status: c_int) -> Result<ExitStatus> {
        if libc::WIFEXITED(wait_status) {
            return Ok(ExitStatus::Code(libc::WEXITSTATUS(wait_status)));
        }
        if libc::WIFSIGNALED(wait_status) {
            return Ok(ExitStatus::Signal(libc::WTERMSIG(wait_status)));
        }

        bail!("invalid wait status")
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    /// The status a shell would report for this termination: the exit code itself, or
    /// `128 + signal` for a signal death.
    pub fn shell_code(&self) -> u8 {
        match *self {
            ExitStatus::Code(code) => (code & 0xff) as u8,
            ExitStatus::Signal(signal) => (128 + signal).clamp(0, 255) as u8,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {code}"),
            ExitStatus::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Wait for `pid` to terminate. `__WALL` is passed so children with a non-`SIGCHLD`
/// termination signal can be reaped too.
pub unsafe fn waitpid(pid: c_int) -> Result<ExitStatus> {
    let mut status: c_int = 0;
    loop {
        let 0.. = (unsafe { libc::waitpid(pid, &mut status as *mut c_int, libc::__WALL) }) else {
            let err = Error::last_os_error();
            if err.errno == libc::EINTR {
                continue;
            }
            return Err(err.cause("waitpid failed"));
        };
        return ExitStatus::from_wait_status(status);
    }
}

/// Poll `pid` without blocking. Returns `None` while it is still running.
pub unsafe fn try_waitpid(pid: c_int) -> Result<Option<ExitStatus>> {
    let mut status: c_int = 0;
    let result = unsafe {
        libc::waitpid(
            pid,
            &mut status as *mut c_int,
            libc::__WALL | libc::WNOHANG,
        )
    };
    match result {
        0 => Ok(None),
        1.. => ExitStatus::from_wait_status(status).map(Some),
        _ => Err(Error::last_os_error().cause("waitpid failed")),
    }
}

pub unsafe fn kill(pid: c_int, signal: c_int) -> Result<()> {
    let 0 = (unsafe { libc::kill(pid, signal) }) else {
        bail_errno!("kill failed");
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_codes() {
        assert_eq!(ExitStatus::Code(0).shell_code(), 0);
        assert_eq!(ExitStatus::Code(3).shell_code(), 3);
        assert_eq!(ExitStatus::Signal(libc::SIGKILL).shell_code(), 137);
        assert!(ExitStatus::Code(0).success());
        assert!(!ExitStatus::Signal(libc::SIGTERM).success());
    }

    #[test]
    fn pipe_reports_eof_after_close() {
        let (read_fd, write_fd) = pipe().unwrap();
        close(write_fd).unwrap();
        assert_eq!(read_byte(read_fd).unwrap(), 0);
        close(read_fd).unwrap();
    }

    #[test]
    fn stack_pointer_is_aligned_and_in_bounds() {
        let mut stack = vec![0u8; 4099];
        let base = stack.as_ptr() as usize;
        let top = unsafe { get_topmost_stack_pointer(&mut stack) } as usize;
        assert_eq!(top % 16, 0);
        assert!(top <= base + 4099);
        assert!(top > base + 4099 - 16);
    }
}
