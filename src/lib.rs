//! Launch a process into a chosen set of Linux namespaces, optionally remapping its UID and GID
//! inside a new user namespace.
//!
//! The child is held on a pipe until the parent has written its ID maps, so that its `execve`
//! happens as the mapped user and it keeps its capabilities in the new namespace.

mod libc_util;

mod error;
mod id_map;
mod mapping;
mod namespace;
pub mod rendezvous;
pub mod spawn;

mod command;

pub use error::{Error, LaunchError};
pub use id_map::{IdMap, IdMapParseError, Mapping};
pub use libc_util::ExitStatus;
pub use mapping::{IdKind, MapWriter, SetgroupsPolicy};
pub use namespace::{IsolationMask, Namespace, NamespaceSet, TerminationSignal};
pub use rendezvous::Rendezvous;

pub use command::{
    Command, Credentials, Plan, Stage, EXEC_FAILED_EXIT_CODE, PROTOCOL_VIOLATION_EXIT_CODE,
};
pub use spawn::Child;

/// In test builds, use alloc_counter to verify at runtime that the functions which must be
/// async-signal-safe do not allocate.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
