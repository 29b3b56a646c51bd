use std::ffi::c_int;
use std::ops::BitOr;

/// A kind of namespace the child can be placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Ipc,
    Mount,
    Network,
    Pid,
    Uts,
    User,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::Ipc,
        Namespace::Mount,
        Namespace::Network,
        Namespace::Pid,
        Namespace::Uts,
        Namespace::User,
    ];

    /// The `CLONE_NEW*` flag which creates this namespace.
    pub fn clone_flag(self) -> c_int {
        match self {
            Namespace::Ipc => libc::CLONE_NEWIPC,
            Namespace::Mount => libc::CLONE_NEWNS,
            Namespace::Network => libc::CLONE_NEWNET,
            Namespace::Pid => libc::CLONE_NEWPID,
            Namespace::Uts => libc::CLONE_NEWUTS,
            Namespace::User => libc::CLONE_NEWUSER,
        }
    }
}

/// Bitset of namespaces to enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NamespaceSet {
    pub ipc: bool,
    pub mount: bool,
    pub network: bool,
    pub pid: bool,
    pub uts: bool,
    pub user: bool,
}

impl NamespaceSet {
    pub fn new() -> NamespaceSet {
        NamespaceSet::default()
    }

    /// Request a namespace. Requesting one twice is the same as requesting it once.
    pub fn insert(&mut self, namespace: Namespace) {
        *self.slot(namespace) = true;
    }

    pub fn contains(&self, namespace: Namespace) -> bool {
        match namespace {
            Namespace::Ipc => self.ipc,
            Namespace::Mount => self.mount,
            Namespace::Network => self.network,
            Namespace::Pid => self.pid,
            Namespace::Uts => self.uts,
            Namespace::User => self.user,
        }
    }

    /// Iterate over the requested namespaces.
    pub fn iter(&self) -> impl Iterator<Item = Namespace> + '_ {
        Namespace::ALL.into_iter().filter(|ns| self.contains(*ns))
    }

    /// Build the isolation mask for this set.
    pub fn mask(&self) -> IsolationMask {
        self.iter().collect()
    }

    fn slot(&mut self, namespace: Namespace) -> &mut bool {
        match namespace {
            Namespace::Ipc => &mut self.ipc,
            Namespace::Mount => &mut self.mount,
            Namespace::Network => &mut self.network,
            Namespace::Pid => &mut self.pid,
            Namespace::Uts => &mut self.uts,
            Namespace::User => &mut self.user,
        }
    }
}

impl FromIterator<Namespace> for NamespaceSet {
    fn from_iter<I: IntoIterator<Item = Namespace>>(iter: I) -> Self {
        let mut set = NamespaceSet::new();
        for ns in iter {
            set.insert(ns);
        }
        set
    }
}

/// The combined `CLONE_NEW*` flags for a set of namespaces.
///
/// This carries namespace flags only. The signal delivered to the parent when the child exits
/// is a [`TerminationSignal`], kept apart and merged in only by the `clone(2)` call itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsolationMask(c_int);

impl IsolationMask {
    /// The mask which isolates nothing; the child is an ordinary process.
    pub const fn empty() -> IsolationMask {
        IsolationMask(0)
    }

    pub const fn bits(self) -> c_int {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, namespace: Namespace) -> bool {
        self.0 & namespace.clone_flag() != 0
    }
}

impl From<Namespace> for IsolationMask {
    fn from(namespace: Namespace) -> Self {
        IsolationMask(namespace.clone_flag())
    }
}

impl BitOr<Namespace> for IsolationMask {
    type Output = IsolationMask;

    fn bitor(self, rhs: Namespace) -> IsolationMask {
        IsolationMask(self.0 | rhs.clone_flag())
    }
}

impl FromIterator<Namespace> for IsolationMask {
    fn from_iter<I: IntoIterator<Item = Namespace>>(iter: I) -> Self {
        iter.into_iter().fold(IsolationMask::empty(), |mask, ns| mask | ns)
    }
}

/// The signal the kernel sends the parent when the child terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationSignal(c_int);

impl TerminationSignal {
    /// Deliver no signal at all on termination.
    pub const NONE: TerminationSignal = TerminationSignal(0);

    /// Use an arbitrary signal number. Only the low byte of the `clone(2)` flags carries it,
    /// so numbers outside `0..=255` are rejected.
    pub fn new(signal: c_int) -> Option<TerminationSignal> {
        (0..=0xff)
            .contains(&signal)
            .then_some(TerminationSignal(signal))
    }

    pub const fn as_raw(self) -> c_int {
        self.0
    }
}

impl Default for TerminationSignal {
    fn default() -> Self {
        TerminationSignal(libc::SIGCHLD)
    }
}
