use std::{io, path::Path, process::ExitStatus, process::Stdio, time::Duration};

use tokio::process::{Child, Command};
use tracing::debug;

use super::command::JobCommand;

/// Spawn `command` in its own process group with piped output.
pub(crate) fn spawn(command: &JobCommand, default_dir: &Path) -> io::Result<Child> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(command.current_dir.as_deref().unwrap_or(default_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
}

/// Ask the process group to stop, then force it after `grace`.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        signal_group(child, nix::sys::signal::Signal::SIGTERM);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        signal_group(child, nix::sys::signal::Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = grace;

    // Also covers a leader that left the group.
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill after group signal failed");
    }
    child.wait().await
}

/// Kill whatever is left in the group led by `pid` after the leader exited.
pub(crate) fn kill_leftovers(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_pid_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    if let Some(pid) = child.id() {
        signal_pid_group(pid, signal);
    }
}

#[cfg(unix)]
fn signal_pid_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

    #[allow(clippy::cast_possible_wrap)]
    let group = Pid::from_raw(pid as i32);
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => debug!(pid, ?signal, %errno, "failed to signal process group"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_stops_a_process_ignoring_sigterm() {
        let command = JobCommand::new("sh").args(["-c", "trap '' TERM; sleep 30"]);
        let mut child = spawn(&command, Path::new("/")).unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        let status = terminate(&mut child, Duration::from_millis(300)).await.unwrap();

        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
