/*!
 * Process Executor
 * OS-level spawning and signalling of isolated children
 *
 * Every child leads its own process group, so graceful and forceful signals
 * reach anything it forked as well.
 */

use super::ipc::HEARTBEAT_ENV;
use super::types::{IsolatedWork, RunOptions};
use crate::core::errors::RunError;
use crate::core::types::{millis, Pid};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// A freshly spawned child with its IPC pipes detached
pub struct SpawnedChild {
    pub child: Child,
    pub pid: Pid,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Spawn `work` in a new process group with piped stdin/stdout
///
/// stderr is inherited so the child's logs land next to the host's.
pub fn spawn(work: &IsolatedWork, options: &RunOptions) -> Result<SpawnedChild, RunError> {
    work.validate()?;
    let program = work.program.display().to_string();
    let spawn_error = |cause: String| RunError::Spawn {
        program: program.clone(),
        cause,
    };

    let mut cmd = Command::new(&work.program);
    cmd.args(&work.args)
        .envs(work.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(HEARTBEAT_ENV, millis(options.heartbeat_interval).to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
    let pid = child
        .id()
        .ok_or_else(|| spawn_error("child exited before its pid was read".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error("stdin not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error("stdout not piped".to_string()))?;

    info!(pid, program = %program, entry = %work.entry, "spawned isolated child");
    Ok(SpawnedChild {
        child,
        pid,
        stdin,
        stdout,
    })
}

/// Deliver `sig` to the child's process group
///
/// Returns `Ok(false)` when the group no longer exists.
pub fn signal_group(pid: Pid, sig: Signal) -> nix::Result<bool> {
    let pgid = to_nix_pid(pid)?;
    match signal::killpg(pgid, sig) {
        Ok(()) => {
            debug!(pid, signal = %sig, "signalled process group");
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Ask the group to exit
pub fn terminate_group(pid: Pid) -> nix::Result<bool> {
    signal_group(pid, Signal::SIGTERM)
}

/// Unconditionally destroy the group; an already vanished group is success
pub fn kill_group(pid: Pid) -> anyhow::Result<()> {
    match signal_group(pid, Signal::SIGKILL) {
        Ok(true) => {
            warn!(pid, "force-killed process group");
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("SIGKILL to process group {} failed: {}", pid, e)),
    }
}

/// Whether a process with this pid still exists (zombies included)
pub fn is_alive(pid: Pid) -> bool {
    match to_nix_pid(pid) {
        Ok(pid) => !matches!(signal::kill(pid, None), Err(Errno::ESRCH)),
        Err(_) => false,
    }
}

fn to_nix_pid(pid: Pid) -> nix::Result<NixPid> {
    // pid 0 or negative would address our own group or every process
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(NixPid::from_raw(raw)),
        _ => Err(Errno::EINVAL),
    }
}
