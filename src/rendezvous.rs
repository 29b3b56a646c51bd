//! One-shot parent/child synchronization over a pipe.
//!
//! The only signal is EOF: the child blocks reading the pipe until every copy of the write end
//! is closed. The parent holds the last copy and closes it after writing the child's ID maps,
//! so the maps are in place before the child can `exec` and its capabilities survive the
//! transition.

use alloc_counter::no_alloc;
use std::ffi::c_int;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use crate::error::{bail, Error, Result};
use crate::libc_util::{close, pipe, read_byte};

/// Both ends of the channel, before the child exists.
#[derive(Debug)]
pub struct Rendezvous {
    read: OwnedFd,
    write: OwnedFd,
}

/// The child's view of the channel: raw descriptors, valid in the child's copy of the fd table.
#[derive(Debug, Clone, Copy)]
pub struct ChildEnd {
    read_fd: c_int,
    write_fd: c_int,
}

/// The parent's write end, kept open until the child may proceed.
#[derive(Debug)]
pub struct Release {
    write: OwnedFd,
}

impl Rendezvous {
    pub fn open() -> Result<Rendezvous> {
        let (read_fd, write_fd) = pipe()?;
        Ok(Rendezvous {
            read: unsafe { OwnedFd::from_raw_fd(read_fd) },
            write: unsafe { OwnedFd::from_raw_fd(write_fd) },
        })
    }

    /// Descriptors for the child to wait on. Must be taken before cloning.
    pub fn child_end(&self) -> ChildEnd {
        ChildEnd {
            read_fd: self.read.as_raw_fd(),
            write_fd: self.write.as_raw_fd(),
        }
    }

    /// Give up the parent's copy of the read end, keeping only the write end.
    pub fn into_release(self) -> Release {
        drop(self.read);
        Release { write: self.write }
    }
}

impl Release {
    /// Close the write end, letting the child proceed.
    pub fn release(self) -> Result<()> {
        close(self.write.into_raw_fd()).map_err(|e| e.context("failed to release rendezvous"))
    }
}

impl ChildEnd {
    /// Block until the parent releases the channel.
    ///
    /// Closes the child's inherited copy of the write end first, otherwise EOF could never
    /// arrive. Any data read instead of EOF is a protocol violation.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn wait(self) -> Result<()> {
        close(self.write_fd).map_err(|e| e.context("rendezvous: closing write end"))?;

        let read = read_byte(self.read_fd).map_err(|e| e.context("rendezvous"))?;
        let _ = close(self.read_fd);

        if read != 0 {
            bail!("rendezvous: received data instead of EOF");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libc_util::ExitStatus;
    use crate::spawn::{clone_child, ChildStack, Child, Isolation};
    use std::time::Duration;

    const VIOLATION: c_int = 2;

    fn spawn_waiter(rendezvous: &Rendezvous) -> Child {
        let end = rendezvous.child_end();
        let mut entry = || match end.wait() {
            Ok(()) => 0,
            Err(Error { errno: 0, .. }) => VIOLATION,
            Err(_) => 3,
        };
        let mut stack = ChildStack::new();
        unsafe { clone_child(Isolation::default(), &mut stack, &mut entry) }.unwrap()
    }

    #[test]
    fn child_blocks_until_release() {
        let rendezvous = Rendezvous::open().unwrap();
        let child = spawn_waiter(&rendezvous);
        let release = rendezvous.into_release();

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(child.try_wait().unwrap(), None, "child proceeded before release");

        release.release().unwrap();
        assert_eq!(child.wait().unwrap(), ExitStatus::Code(0));
    }

    #[test]
    fn stray_data_is_a_protocol_violation() {
        let rendezvous = Rendezvous::open().unwrap();
        let child = spawn_waiter(&rendezvous);
        let release = rendezvous.into_release();

        let byte = 0u8;
        let written = unsafe {
            libc::write(
                release.write.as_raw_fd(),
                (&byte) as *const u8 as *const std::ffi::c_void,
                1,
            )
        };
        assert_eq!(written, 1);

        release.release().unwrap();
        assert_eq!(child.wait().unwrap(), ExitStatus::Code(VIOLATION));
    }

    #[test]
    fn dropping_release_also_unblocks() {
        let rendezvous = Rendezvous::open().unwrap();
        let child = spawn_waiter(&rendezvous);
        drop(rendezvous.into_release());
        assert_eq!(child.wait().unwrap(), ExitStatus::Code(0));
    }
}
