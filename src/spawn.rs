use std::ffi::{c_int, c_void};

use tracing::debug;

use crate::error::{bail_errno, Error, Result};
use crate::libc_util::*;
use crate::namespace::{IsolationMask, TerminationSignal};

/// Size of the stack for cloned children.
const STACK_SIZE: usize = 8 * 1024 * 1024; // 8 MB

/// Exit status of a child whose entry action panicked.
pub const PANIC_EXIT_CODE: c_int = 126;

/// Stack memory for a cloned child. `clone(2)` does not allocate one itself.
pub struct ChildStack(Vec<u8>);

impl ChildStack {
    pub fn new() -> ChildStack {
        Self::with_size(STACK_SIZE)
    }

    pub fn with_size(size: usize) -> ChildStack {
        ChildStack(vec![0; size])
    }

    fn top(&mut self) -> *mut c_void {
        unsafe { get_topmost_stack_pointer(self.0.as_mut()) }
    }
}

impl Default for ChildStack {
    fn default() -> Self {
        Self::new()
    }
}

/// How a child should be created: which namespaces it gets, and what the kernel tells the
/// parent when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Isolation {
    pub mask: IsolationMask,
    pub exit_signal: TerminationSignal,
}

impl Isolation {
    pub fn new(mask: IsolationMask) -> Isolation {
        Isolation {
            mask,
            exit_signal: TerminationSignal::default(),
        }
    }
}

/// Handle representing a cloned child process. Reaping consumes the handle.
#[derive(Debug)]
pub struct Child {
    pid: libc::pid_t,
}

/// Clone a child process with the namespaces in `isolation.mask`, running `entry` in it. The
/// child's exit status is whatever `entry` returns, or [`PANIC_EXIT_CODE`] if it panics.
///
/// The namespaces exist from the moment the child does; with a PID namespace the child is PID
/// 1 in it.
///
/// # Safety
///
/// The child runs on a copy of the parent's memory. If other threads exist in the parent, a
/// lock they held at clone time stays held forever in the child, so `entry` must not
/// allocate or take locks. It should either `exec` or return promptly.
pub unsafe fn clone_child<F>(
    isolation: Isolation,
    stack: &mut ChildStack,
    entry: &mut F,
) -> Result<Child>
where
    F: FnMut() -> c_int,
{
    // NOTE: The termination signal lives in the low byte of the flags, and only here.
    let clone_flags = isolation.mask.bits() | isolation.exit_signal.as_raw();

    let pid @ 0.. = libc::clone(
        entry_trampoline::<F>,
        stack.top(),
        clone_flags,
        entry as *mut F as *mut c_void,
    ) else {
        bail_errno!("clone(2) failed");
    };

    debug!(pid, clone_flags = %format!("{clone_flags:#x}"), "cloned child");
    Ok(Child { pid })
}

extern "C" fn entry_trampoline<F>(arg: *mut c_void) -> c_int
where
    F: FnMut() -> c_int,
{
    let entry: &mut F = unsafe { &mut *(arg as *mut F) };

    // Catch any panics.
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
        Ok(code) => code,
        Err(_) => {
            log_fd!(libc::STDERR_FILENO, "nsrun: child entry action panicked");
            PANIC_EXIT_CODE
        }
    }
}

impl Child {
    /// The child's PID, as seen from the parent's PID namespace.
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Wait for the child to exit, returning the exit status.
    pub fn wait(self) -> Result<ExitStatus> {
        unsafe { waitpid(self.pid) }
    }

    /// Check whether the child has exited, without blocking.
    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        unsafe { try_waitpid(self.pid) }
    }

    /// Kill the child with `SIGKILL` and reap it.
    pub fn terminate(self) -> Result<ExitStatus> {
        if let Err(err) = unsafe { kill(self.pid, libc::SIGKILL) } {
            // ESRCH can't happen while we hold the unreaped child, but reap regardless.
            debug!(pid = self.pid, %err, "failed to kill child");
        }
        self.wait()
    }
}
