//! CLI argument definitions

use clap::Parser;
use nsrun::{IdMap, Namespace};

const AFTER_HELP: &str = "\
If -z, -M, or -G is specified, -U is required.
It is not permitted to specify both -z and either -M or -G.

Map strings for -M and -G consist of records of the form:

    ID-inside-ns   ID-outside-ns   len

A map string can contain multiple records, separated by commas;
the commas are replaced by newlines before writing to map files.";

#[derive(Parser, Debug)]
#[command(name = "nsrun")]
#[command(about = "Create a child process that executes a command in new namespace(s)")]
#[command(after_help = AFTER_HELP)]
#[command(version)]
pub struct Cli {
    /// New IPC namespace
    #[arg(short = 'i')]
    pub ipc: bool,

    /// New mount namespace
    #[arg(short = 'm')]
    pub mount: bool,

    /// New network namespace
    #[arg(short = 'n')]
    pub network: bool,

    /// New PID namespace
    #[arg(short = 'p')]
    pub pid: bool,

    /// New UTS namespace
    #[arg(short = 'u')]
    pub uts: bool,

    /// New user namespace
    #[arg(short = 'U')]
    pub user: bool,

    /// Specify UID map for user namespace
    #[arg(short = 'M', value_name = "MAP")]
    pub uid_map: Option<IdMap>,

    /// Specify GID map for user namespace
    #[arg(short = 'G', value_name = "MAP")]
    pub gid_map: Option<IdMap>,

    /// Map user's UID and GID to 0 in user namespace
    /// (equivalent to: -M '0 <uid> 1' -G '0 <gid> 1')
    #[arg(short = 'z')]
    pub map_zero: bool,

    /// Display verbose messages
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Command to run, with its arguments
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// The requested namespaces, in flag order.
    pub fn namespaces(&self) -> impl Iterator<Item = Namespace> {
        [
            (self.ipc, Namespace::Ipc),
            (self.mount, Namespace::Mount),
            (self.network, Namespace::Network),
            (self.pid, Namespace::Pid),
            (self.uts, Namespace::Uts),
            (self.user, Namespace::User),
        ]
        .into_iter()
        .filter_map(|(requested, ns)| requested.then_some(ns))
    }

    /// Translate the flags into a launch request. Flag combinations are checked when it is
    /// spawned.
    pub fn to_command(&self) -> nsrun::Command {
        let (program, args) = self
            .command
            .split_first()
            .map(|(program, args)| (program.as_str(), args))
            .unwrap_or_default();

        let mut cmd = nsrun::Command::new(program);
        cmd.args(args)
            .namespaces(self.namespaces().collect())
            .verbose(self.verbose)
            .map_zero(self.map_zero);
        if let Some(map) = &self.uid_map {
            cmd.uid_map(map.clone());
        }
        if let Some(map) = &self.gid_map {
            cmd.gid_map(map.clone());
        }
        cmd
    }
}
