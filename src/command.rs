use alloc_counter::no_alloc;
use std::ffi::{c_char, c_int, CString};
use std::path::Path;
use std::ptr;

use tracing::{debug, info, span, warn, Level};

use crate::error::{Error, LaunchError};
use crate::libc_util::{log_fd, ExitStatus};
use crate::mapping::{MapWriter, SetgroupsPolicy};
use crate::rendezvous::{ChildEnd, Rendezvous};
use crate::spawn::{clone_child, Child, ChildStack, Isolation};
use crate::{IdMap, Namespace, NamespaceSet, TerminationSignal};

/// Exit status of a child which saw data on the rendezvous channel instead of EOF.
pub const PROTOCOL_VIOLATION_EXIT_CODE: c_int = 1;

/// Exit status of a child whose `execvp(3)` failed.
pub const EXEC_FAILED_EXIT_CODE: c_int = 127;

/// A command to be launched inside a fresh set of namespaces.
#[derive(Debug, Clone)]
pub struct Command {
    // Exec information
    program: String,
    args: Vec<String>,

    // Namespace information.
    namespaces: NamespaceSet,
    exit_signal: TerminationSignal,

    // User and group information.
    uid_map: Option<IdMap>,
    gid_map: Option<IdMap>,
    map_zero: bool,
    map_writer: MapWriter,

    verbose: bool,
}

/// The caller's real IDs, which map-to-zero maps onto ID 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn current() -> Credentials {
        Credentials {
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

/// A validated request, with map-to-zero already expanded into explicit maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub namespaces: NamespaceSet,
    pub uid_map: Option<IdMap>,
    pub gid_map: Option<IdMap>,
}

/// Progress of a launch request, in order. Logged at debug level as each is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    MaskBuilt,
    ChannelOpen,
    ChildSpawned,
    MappingWritten,
    ChannelReleased,
    ChildRunning,
    ChildExited,

    /// A failure after the child exists: the child is killed and reaped before the error is
    /// returned.
    ChildTerminatedForCleanup,
}

fn enter(stage: Stage) {
    debug!(?stage);
}

impl Command {
    /// Create a new command. `program` is looked up in `PATH` if it has no slash.
    pub fn new(program: impl AsRef<str>) -> Command {
        Command {
            program: program.as_ref().to_owned(),
            args: vec![program.as_ref().to_owned()],
            namespaces: NamespaceSet::default(),
            exit_signal: TerminationSignal::default(),
            uid_map: None,
            gid_map: None,
            map_zero: false,
            map_writer: MapWriter::default(),
            verbose: false,
        }
    }

    /// Have the child announce itself on stderr just before exec.
    pub fn verbose(&mut self, enabled: bool) -> &mut Command {
        self.verbose = enabled;
        self
    }

    /// Append an argument.
    pub fn arg(&mut self, arg: impl AsRef<str>) -> &mut Command {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Append several arguments.
    pub fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<str>>) -> &mut Command {
        self.args
            .extend(args.into_iter().map(|e| e.as_ref().to_owned()));
        self
    }

    /// Unshares a namespace in the child process.
    pub fn unshare(&mut self, namespace: Namespace) -> &mut Command {
        self.namespaces.insert(namespace);
        self
    }

    /// Replace the whole set of namespaces to unshare.
    pub fn namespaces(&mut self, namespaces: NamespaceSet) -> &mut Command {
        self.namespaces = namespaces;
        self
    }

    /// Sets the user ID mapping and enables writing the `uid_map`.
    pub fn uid_map(&mut self, map: IdMap) -> &mut Command {
        self.uid_map = Some(map);
        self
    }

    /// Sets the group ID mapping and enables writing the `gid_map`.
    pub fn gid_map(&mut self, map: IdMap) -> &mut Command {
        self.gid_map = Some(map);
        self
    }

    /// Map the caller's UID and GID to 0 in the new user namespace. Cannot be combined with
    /// [`uid_map`](Self::uid_map) or [`gid_map`](Self::gid_map).
    pub fn map_zero(&mut self, enabled: bool) -> &mut Command {
        self.map_zero = enabled;
        self
    }

    /// Signal sent to us when the child exits. `SIGCHLD` by default.
    pub fn exit_signal(&mut self, signal: TerminationSignal) -> &mut Command {
        self.exit_signal = signal;
        self
    }

    /// What to do with the child's `setgroups` before its GID map. By default `deny` is
    /// written only for non-root callers.
    pub fn setgroups(&mut self, policy: SetgroupsPolicy) -> &mut Command {
        self.map_writer = self.map_writer.clone().setgroups(policy);
        self
    }

    /// Use the procfs mounted at `path` to write ID maps.
    pub fn proc_root(&mut self, path: impl AsRef<Path>) -> &mut Command {
        self.map_writer = self.map_writer.clone().proc_root(path);
        self
    }

    /// Returns an iterator over the arguments passed to the program.
    pub fn get_args(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|e| e.as_str())
    }

    /// Gets the executable name.
    pub fn get_program(&self) -> &str {
        self.program.as_str()
    }

    /// Check the request against the caller's real IDs.
    pub fn validate(&self) -> Result<Plan, LaunchError> {
        self.validate_with(Credentials::current())
    }

    /// Check the request, expanding map-to-zero against `caller`.
    pub fn validate_with(&self, caller: Credentials) -> Result<Plan, LaunchError> {
        if self.program.is_empty() {
            return Err(LaunchError::InvalidArguments("no command given"));
        }

        let explicit_map = self.uid_map.is_some() || self.gid_map.is_some();
        if (explicit_map || self.map_zero) && !self.namespaces.user {
            return Err(LaunchError::InvalidArguments(
                "UID/GID maps require a new user namespace",
            ));
        }
        if self.map_zero && explicit_map {
            return Err(LaunchError::InvalidArguments(
                "map-to-zero cannot be combined with an explicit UID or GID map",
            ));
        }
        if [&self.uid_map, &self.gid_map]
            .into_iter()
            .flatten()
            .any(IdMap::is_empty)
        {
            return Err(LaunchError::InvalidArguments("ID map has no records"));
        }

        let (uid_map, gid_map) = if self.map_zero {
            (
                Some(IdMap::zero_to(caller.uid)),
                Some(IdMap::zero_to(caller.gid)),
            )
        } else {
            (self.uid_map.clone(), self.gid_map.clone())
        };

        Ok(Plan {
            namespaces: self.namespaces,
            uid_map,
            gid_map,
        })
    }

    /// Executes a command as a child process, waiting for it to finish and collecting
    /// its status.
    pub fn status(&self) -> Result<ExitStatus, LaunchError> {
        let child = self.spawn()?;
        let pid = child.pid();

        let status = child.wait().map_err(LaunchError::Wait)?;
        enter(Stage::ChildExited);
        info!(pid, %status, "child returned");

        Ok(status)
    }

    /// Spawn the child and let it run. Returns once the child has been released to `exec`.
    pub fn spawn(&self) -> Result<Child, LaunchError> {
        let span = span!(Level::DEBUG, "spawn", program = %self.program);
        let _span_guard = span.enter();

        enter(Stage::Validating);
        let plan = self.validate()?;
        let exec = ExecArgs::new(&self.program, &self.args)?;

        let isolation = Isolation {
            mask: plan.namespaces.mask(),
            exit_signal: self.exit_signal,
        };
        enter(Stage::MaskBuilt);
        debug!(mask = %format!("{:#x}", isolation.mask.bits()));

        let rendezvous = Rendezvous::open().map_err(LaunchError::Channel)?;
        enter(Stage::ChannelOpen);

        // Everything the child touches is prepared above; it only reads and execs.
        let end = rendezvous.child_end();
        let verbose = self.verbose;
        let mut entry = || child_main(end, &exec, verbose);
        let mut stack = ChildStack::new();

        let child = unsafe { clone_child(isolation, &mut stack, &mut entry) }
            .map_err(LaunchError::ProcessCreation)?;
        let pid = child.pid();
        enter(Stage::ChildSpawned);
        info!("PID of child created by clone() is {pid}");

        let release = rendezvous.into_release();

        let maps = (plan.uid_map.as_ref(), plan.gid_map.as_ref());
        if let Err(err) = self.map_writer.write(pid, maps.0, maps.1) {
            return Err(terminate_for_cleanup(child, err));
        }
        if plan.uid_map.is_some() || plan.gid_map.is_some() {
            enter(Stage::MappingWritten);
        }

        // The maps must be written before this point: closing the write end is what lets the
        // child exec.
        if let Err(source) = release.release() {
            return Err(terminate_for_cleanup(
                child,
                LaunchError::Release { pid, source },
            ));
        }
        enter(Stage::ChannelReleased);
        enter(Stage::ChildRunning);

        Ok(child)
    }
}

fn terminate_for_cleanup(child: Child, err: LaunchError) -> LaunchError {
    enter(Stage::ChildTerminatedForCleanup);
    let pid = child.pid();
    match child.terminate() {
        Ok(status) => debug!(pid, %status, "terminated child for cleanup"),
        Err(reap_err) => warn!(pid, err = %reap_err, "failed to reap child during cleanup"),
    }
    err
}

/// Null-terminated argv for `execvp(3)`, built before cloning so the child never allocates.
struct ExecArgs {
    program: CString,
    _args_buf: Vec<CString>,
    argv: Vec<*const c_char>,
}

impl ExecArgs {
    fn new(program: &str, args: &[String]) -> Result<ExecArgs, LaunchError> {
        let Ok(program) = CString::new(program) else {
            return Err(LaunchError::InvalidArguments(
                "command contains an interior NUL",
            ));
        };

        let args_buf = args
            .iter()
            .map(|e| {
                CString::new(e.as_str())
                    .map_err(|_| LaunchError::InvalidArguments("argument contains an interior NUL"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut argv: Vec<*const c_char> = args_buf.iter().map(|a| a.as_ptr()).collect();
        argv.push(ptr::null());

        Ok(ExecArgs {
            program,
            _args_buf: args_buf,
            argv,
        })
    }
}

/// Entry action for the cloned child: wait for release, then exec.
#[cfg_attr(debug_assertions, no_alloc)]
fn child_main(end: ChildEnd, exec: &ExecArgs, verbose: bool) -> c_int {
    if let Err(err) = end.wait() {
        log_fd!(libc::STDERR_FILENO, "nsrun: child: {err}");
        return PROTOCOL_VIOLATION_EXIT_CODE;
    }

    if verbose {
        log_fd!(libc::STDERR_FILENO, "nsrun: about to exec {:?}", exec.program);
    }

    unsafe { libc::execvp(exec.program.as_ptr(), exec.argv.as_ptr()) };

    let err = Error::last_os_error().cause("execvp failed");
    log_fd!(libc::STDERR_FILENO, "nsrun: child: {err}");
    EXEC_FAILED_EXIT_CODE
}
