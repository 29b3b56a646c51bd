use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, LaunchError};
use crate::id_map::IdMap;

/// Which identity a map applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    User,
    Group,
}

impl IdKind {
    /// Name of the map file under `/proc/PID/`.
    pub fn map_file(self) -> &'static str {
        match self {
            IdKind::User => "uid_map",
            IdKind::Group => "gid_map",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdKind::User => "UID",
            IdKind::Group => "GID",
        })
    }
}

/// What happens to a child's `setgroups` file before its GID map is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetgroupsPolicy {
    /// Write `deny` unless the caller is root. Without `CAP_SETGID` in the parent namespace the
    /// kernel refuses a GID map until `setgroups` is denied.
    #[default]
    Auto,
    /// Always write `deny`.
    Deny,
    /// Never touch `setgroups`.
    Leave,
}

impl SetgroupsPolicy {
    /// Whether a caller with effective UID `euid` writes `deny`.
    pub fn denies(self, euid: libc::uid_t) -> bool {
        match self {
            SetgroupsPolicy::Auto => euid != 0,
            SetgroupsPolicy::Deny => true,
            SetgroupsPolicy::Leave => false,
        }
    }
}

/// Writes ID maps into a child's procfs entries.
#[derive(Debug, Clone)]
pub struct MapWriter {
    proc_root: PathBuf,
    setgroups: SetgroupsPolicy,
}

impl Default for MapWriter {
    fn default() -> Self {
        MapWriter {
            proc_root: PathBuf::from("/proc"),
            setgroups: SetgroupsPolicy::default(),
        }
    }
}

impl MapWriter {
    pub fn new() -> MapWriter {
        MapWriter::default()
    }

    /// Look for per-process files under `proc_root` instead of `/proc`.
    pub fn proc_root(mut self, proc_root: impl AsRef<Path>) -> MapWriter {
        self.proc_root = proc_root.as_ref().to_owned();
        self
    }

    pub fn setgroups(mut self, policy: SetgroupsPolicy) -> MapWriter {
        self.setgroups = policy;
        self
    }

    fn path(&self, pid: libc::pid_t, file: &str) -> PathBuf {
        self.proc_root.join(pid.to_string()).join(file)
    }

    /// Write the UID map, then `setgroups`, then the GID map, for process `pid`.
    ///
    /// The kernel accepts each map file exactly once and validates the ranges; its rejections
    /// are returned as they are.
    pub fn write(
        &self,
        pid: libc::pid_t,
        uid_map: Option<&IdMap>,
        gid_map: Option<&IdMap>,
    ) -> Result<(), LaunchError> {
        let failed = |kind: IdKind| move |source: Error| LaunchError::MappingWrite { pid, kind, source };

        if let Some(uid_map) = uid_map {
            self.write_map(pid, IdKind::User, uid_map)
                .map_err(failed(IdKind::User))?;
        }

        if let Some(gid_map) = gid_map {
            if self.setgroups.denies(unsafe { libc::geteuid() }) {
                self.write_setgroups_deny(pid)
                    .map_err(failed(IdKind::Group))?;
            }
            self.write_map(pid, IdKind::Group, gid_map)
                .map_err(failed(IdKind::Group))?;
        }

        Ok(())
    }

    fn write_map(&self, pid: libc::pid_t, kind: IdKind, map: &IdMap) -> Result<(), Error> {
        let path = self.path(pid, kind.map_file());
        let contents = map.to_proc_contents();
        debug!(path = %path.display(), contents = %contents.replace('\n', ","), "writing {kind} map");

        std::fs::write(&path, contents)
            .map_err(Error::from)
            .map_err(|e| e.context("failed to write ID map"))
    }

    fn write_setgroups_deny(&self, pid: libc::pid_t) -> Result<(), Error> {
        let path = self.path(pid, "setgroups");
        debug!(path = %path.display(), "disabling setgroups");

        match std::fs::write(&path, "deny") {
            Ok(()) => Ok(()),
            // Kernels before 3.19 have no setgroups file, and no restriction to lift.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && self.proc_dir_exists(pid) => {
                Ok(())
            }
            Err(e) => Err(Error::from(e).context("failed to disable setgroups")),
        }
    }

    fn proc_dir_exists(&self, pid: libc::pid_t) -> bool {
        self.proc_root.join(pid.to_string()).is_dir()
    }
}
