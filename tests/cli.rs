use assert_cmd::Command;
use std::os::unix::process::CommandExt as _;
use predicates::prelude::*;

fn nsrun() -> Command {
    Command::new(env!("CARGO_BIN_EXE_nsrun"))
}

/// Whether this host lets us create a user namespace.
fn userns_available() -> bool {
    let ok = nsrun()
        .args(["-U", "/bin/true"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !ok {
        eprintln!("skipping: user namespaces unavailable");
    }
    ok
}

fn caller_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[test]
fn help_documents_map_grammar() {
    nsrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ID-inside-ns"))
        .stdout(predicate::str::contains("-U is required"));
}

#[test]
fn mapping_without_user_namespace_is_rejected() {
    nsrun()
        .args(["-M", "0 1000 1", "/bin/echo", "should-not-run"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("user namespace"));
}

#[test]
fn map_zero_with_explicit_map_is_rejected() {
    nsrun()
        .args(["-U", "-z", "-M", "0 1000 1", "/bin/echo", "should-not-run"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[test]
fn usage_errors_exit_1() {
    nsrun().arg("-Q").assert().code(1);
    nsrun().assert().code(1);
    nsrun()
        .args(["-U", "-M", "zero 1000 1", "/bin/true"])
        .assert()
        .code(1);
}

#[test]
fn plain_launch_runs_the_command() {
    nsrun()
        .args(["/bin/echo", "hi"])
        .assert()
        .success()
        .stdout("hi\n");
}

#[test]
fn child_exit_status_is_propagated() {
    nsrun().args(["/bin/sh", "-c", "exit 3"]).assert().code(3);
    nsrun()
        .args(["/nonexistent/nsrun-missing"])
        .assert()
        .code(127)
        .stderr(predicate::str::contains("execvp failed"));
}

#[test]
fn verbose_announces_exec() {
    nsrun()
        .args(["-v", "/bin/true"])
        .assert()
        .success()
        .stderr(predicate::str::contains("about to exec"))
        .stderr(predicate::str::contains("PID of child created by clone()"));
}

#[test]
fn pid_and_user_namespace_with_map_zero() {
    if !userns_available() {
        return;
    }

    nsrun()
        .args(["-p", "-U", "-z", "/bin/echo", "hi"])
        .assert()
        .success()
        .stdout("hi\n");

    let expected = format!("1\n0 {} 1\n", caller_uid());
    nsrun()
        .args([
            "-p",
            "-U",
            "-z",
            "/bin/sh",
            "-c",
            r#"echo $$; set -- $(cat /proc/self/uid_map); echo "$1 $2 $3""#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::diff(expected));
}

#[test]
fn every_namespace_at_once() {
    if !userns_available() {
        return;
    }

    nsrun()
        .args(["-i", "-m", "-n", "-p", "-u", "-U", "-z", "/bin/sh", "-c", "echo $$"])
        .assert()
        .success()
        .stdout("1\n");
}

#[test]
fn kernel_rejected_map_stops_the_child_before_exec() {
    if !userns_available() {
        return;
    }

    // Overlapping inside ranges are refused by the kernel for any caller.
    nsrun()
        .args(["-U", "-M", "0 1000 1,0 1001 1", "/bin/echo", "should-not-run"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("failed to write UID map"));
}

#[test]
fn clone_failure_exits_1_without_running_the_command() {
    if unsafe { libc::geteuid() } == 0 {
        eprintln!("skipping: root is exempt from RLIMIT_NPROC");
        return;
    }

    // With no processes left under RLIMIT_NPROC, clone(2) fails with EAGAIN.
    let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_nsrun"));
    cmd.args(["/bin/echo", "should-not-run"]);
    unsafe {
        cmd.pre_exec(|| {
            let limit = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::setrlimit(libc::RLIMIT_NPROC, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    Command::from_std(cmd)
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("failed to create child process"));
}

#[test]
fn setgroups_is_denied_only_for_unprivileged_callers() {
    if !userns_available() {
        return;
    }

    if unsafe { libc::geteuid() } == 0 {
        nsrun()
            .args(["-U", "-G", "0 0 1", "/bin/cat", "/proc/self/setgroups"])
            .assert()
            .success()
            .stdout("allow\n");
    } else {
        nsrun()
            .args(["-U", "-z", "/bin/cat", "/proc/self/setgroups"])
            .assert()
            .success()
            .stdout("deny\n");
    }
}
