//! Spawning and addressing of ssh child processes.
//!
//! This module never implements the SSH protocol. It drives the system
//! `ssh` binary, which means tunnels inherit the user's full OpenSSH
//! configuration (keys, agents, ProxyJump chains) for free.
//!
//! All arguments are passed as argv to process execution with no shell in
//! between: host aliases and forward specs are untrusted input and must not
//! be interpretable.
//!
//! Children are spawned as process-group leaders (`setpgid(0, 0)` via
//! `pre_exec`) so cancellation can signal the whole tree. They are NOT
//! killed on drop: a tunnel started by a one-shot command keeps running
//! after the command exits, and a later invocation re-attaches to it
//! through the persisted runtime state.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{ForwardSpec, HostEntry};
use crate::security::HostKeyPolicy;

/// Grace period between SIGTERM and SIGKILL when a cancelled tunnel's
/// process group does not exit on its own.
const TERMINATE_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// A running tunnel child handed back to the supervisor.
///
/// The supervisor owns the lifecycle from here: it awaits `child` for exit
/// detection and must drain `stderr` so the child cannot block on a full
/// pipe buffer.
pub struct TunnelHandle {
    /// OS process ID (also the process-group ID, since the child is a group
    /// leader).
    pub pid: u32,
    pub child: Child,
    pub stderr: Option<ChildStderr>,
}

/// Errors starting or addressing ssh processes.
#[derive(Debug)]
pub enum LauncherError {
    /// No `ssh` binary on PATH.
    BinaryMissing,
    /// The child could not be spawned.
    Spawn(String),
}

impl std::fmt::Display for LauncherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LauncherError::BinaryMissing => write!(f, "ssh binary not found in PATH"),
            LauncherError::Spawn(e) => write!(f, "failed to spawn ssh: {e}"),
        }
    }
}

impl std::error::Error for LauncherError {}

/// The capability set the supervisor requires from an ssh launcher.
///
/// Production uses [`SystemSsh`]; tests substitute a fake that spawns inert
/// stand-in processes.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Spawn a background tunnel process for `host`/`fwd`, bound to `cancel`:
    /// cancelling the token terminates the child's process group.
    async fn start_tunnel(
        &self,
        cancel: CancellationToken,
        host: &HostEntry,
        fwd: &ForwardSpec,
    ) -> Result<TunnelHandle, LauncherError>;

    /// Verify an ssh client exists on the execution path.
    fn ensure_binary(&self) -> Result<(), LauncherError>;

    /// Prepare (but do not start) an interactive session command for `host`.
    fn connect_command(&self, host: &HostEntry) -> std::process::Command;
}

/// Launcher backed by the system `ssh` binary.
pub struct SystemSsh {
    host_key_policy: std::sync::Mutex<HostKeyPolicy>,
}

impl SystemSsh {
    pub fn new() -> Self {
        Self {
            host_key_policy: std::sync::Mutex::new(HostKeyPolicy::Strict),
        }
    }

    /// Change the host-key verification mode applied to subsequent spawns.
    pub fn set_host_key_policy(&self, policy: HostKeyPolicy) {
        *self.host_key_policy.lock().expect("host key policy lock") = policy;
    }

    fn policy(&self) -> HostKeyPolicy {
        *self.host_key_policy.lock().expect("host key policy lock")
    }

    /// Compose the tunnel argv: `-N -L <spec>` plus host-key options, ending
    /// with the destination. For ad-hoc hosts the destination is synthesized
    /// from explicit connection arguments instead of the alias.
    pub fn build_tunnel_args(&self, host: &HostEntry, fwd: &ForwardSpec) -> Vec<String> {
        // Endpoint strings are canonical (defaults filled in, IPv6
        // bracketed) and match the persisted runtime record, which is what
        // makes restored processes recognizable on their command line.
        let mut args = vec![
            "-N".to_string(),
            "-L".to_string(),
            format!("{}:{}", fwd.local_endpoint(), fwd.remote_endpoint()),
        ];
        args.extend(self.policy().ssh_options());
        args.extend(destination_args(host));
        args
    }
}

impl Default for SystemSsh {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection arguments for `host`: just the alias for configured hosts
/// (OpenSSH resolves everything else from ssh config), explicit `-p`/`-i`/
/// `-J` plus `[user@]hostname` for ad-hoc ones.
fn destination_args(host: &HostEntry) -> Vec<String> {
    if !host.ad_hoc {
        return vec![host.alias.clone()];
    }
    let mut args = Vec::new();
    if host.port != 22 {
        args.push("-p".to_string());
        args.push(host.port.to_string());
    }
    if let Some(identity) = host.identity_file.as_deref() {
        if !identity.is_empty() {
            args.push("-i".to_string());
            args.push(identity.to_string());
        }
    }
    if let Some(jump) = host.proxy_jump.as_deref() {
        if !jump.is_empty() {
            args.push("-J".to_string());
            args.push(jump.to_string());
        }
    }
    let target = host.display_target();
    match host.user.as_deref() {
        Some(user) if !user.is_empty() => args.push(format!("{user}@{target}")),
        _ => args.push(target.to_string()),
    }
    args
}

#[async_trait]
impl TunnelLauncher for SystemSsh {
    async fn start_tunnel(
        &self,
        cancel: CancellationToken,
        host: &HostEntry,
        fwd: &ForwardSpec,
    ) -> Result<TunnelHandle, LauncherError> {
        self.ensure_binary()?;
        let args = self.build_tunnel_args(host, fwd);
        debug!("spawning ssh {}", args.join(" "));
        let mut cmd = Command::new("ssh");
        cmd.args(&args);
        spawn_cancellable(cmd, &cancel).map_err(|e| LauncherError::Spawn(e.to_string()))
    }

    fn ensure_binary(&self) -> Result<(), LauncherError> {
        if find_on_path("ssh") {
            Ok(())
        } else {
            Err(LauncherError::BinaryMissing)
        }
    }

    fn connect_command(&self, host: &HostEntry) -> std::process::Command {
        let mut cmd = std::process::Command::new("ssh");
        cmd.args(destination_args(host));
        cmd
    }
}

/// Spawn `cmd` as a process-group leader with stderr piped, and arrange for
/// `cancel` to terminate the group (SIGTERM, then SIGKILL after a grace
/// period).
///
/// Shared by the production launcher and test fakes so cancellation
/// semantics are identical in both.
pub fn spawn_cancellable(
    mut cmd: Command,
    cancel: &CancellationToken,
) -> std::io::Result<TunnelHandle> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    let mut child = cmd.spawn()?;
    let pid = child.id().unwrap_or(0);
    let stderr = child.stderr.take();

    let token = cancel.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        signal_group(pid, Signal::SIGTERM);
        tokio::time::sleep(TERMINATE_GRACE).await;
        signal_group(pid, Signal::SIGKILL);
    });

    Ok(TunnelHandle { pid, child, stderr })
}

/// Signal an entire process group; ESRCH (already gone) is the common,
/// ignorable outcome after a clean exit.
fn signal_group(pid: u32, signal: Signal) {
    if pid == 0 {
        return;
    }
    let _ = kill(Pid::from_raw(-(pid as i32)), signal);
}

/// Best-effort SIGTERM to a single process, used by the supervisor only
/// after confirming the PID is alive.
pub fn terminate_pid(pid: u32) {
    if pid == 0 {
        return;
    }
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

/// Whether a process with `pid` is still running, via the signal-0 probe:
/// deliverable means alive and signalable by us.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Look for an executable on `$PATH`.
fn find_on_path(bin: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(bin)))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fwd(lp: u16, rp: u16) -> ForwardSpec {
        ForwardSpec {
            local_addr: "127.0.0.1".into(),
            local_port: lp,
            remote_addr: "localhost".into(),
            remote_port: rp,
        }
    }

    #[test]
    fn test_build_tunnel_args_alias_host() {
        let ssh = SystemSsh::new();
        let args = ssh.build_tunnel_args(&HostEntry::named("prod-db"), &fwd(8080, 80));
        assert_eq!(args[0], "-N");
        assert_eq!(args[1], "-L");
        assert_eq!(args[2], "127.0.0.1:8080:localhost:80");
        assert_eq!(args.last().unwrap(), "prod-db");
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
    }

    #[test]
    fn test_build_tunnel_args_defaults_empty_addrs() {
        let ssh = SystemSsh::new();
        let spec = ForwardSpec {
            local_addr: String::new(),
            local_port: 9000,
            remote_addr: String::new(),
            remote_port: 80,
        };
        let args = ssh.build_tunnel_args(&HostEntry::named("api"), &spec);
        assert_eq!(args[2], "127.0.0.1:9000:localhost:80");
    }

    #[test]
    fn test_build_tunnel_args_ad_hoc_host() {
        let ssh = SystemSsh::new();
        let host = HostEntry {
            alias: "adhoc".into(),
            host_name: "10.1.2.3".into(),
            user: Some("deploy".into()),
            port: 2222,
            identity_file: Some("/keys/id_ed25519".into()),
            proxy_jump: Some("bastion".into()),
            forwards: Vec::new(),
            ad_hoc: true,
        };
        let args = ssh.build_tunnel_args(&host, &fwd(8080, 80));
        let joined = args.join(" ");
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("-i /keys/id_ed25519"));
        assert!(joined.contains("-J bastion"));
        assert_eq!(args.last().unwrap(), "deploy@10.1.2.3");
        assert!(!joined.contains(" adhoc"));
    }

    #[test]
    fn test_build_tunnel_args_ad_hoc_default_port_omitted() {
        let ssh = SystemSsh::new();
        let mut host = HostEntry::named("adhoc");
        host.ad_hoc = true;
        host.host_name = "example.com".into();
        let args = ssh.build_tunnel_args(&host, &fwd(8080, 80));
        assert!(!args.contains(&"-p".to_string()));
        assert_eq!(args.last().unwrap(), "example.com");
    }

    #[test]
    fn test_host_key_policy_is_mutable() {
        let ssh = SystemSsh::new();
        ssh.set_host_key_policy(HostKeyPolicy::AcceptNew);
        let args = ssh.build_tunnel_args(&HostEntry::named("api"), &fwd(8080, 80));
        assert!(args.contains(&"StrictHostKeyChecking=accept-new".to_string()));
    }

    #[test]
    fn test_process_alive_self_and_bogus() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }

    #[tokio::test]
    async fn test_spawn_cancellable_kills_group_on_cancel() {
        let cancel = CancellationToken::new();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut handle = spawn_cancellable(cmd, &cancel).unwrap();
        assert!(handle.pid > 0);
        assert!(process_alive(handle.pid));

        cancel.cancel();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), handle.child.wait())
            .await
            .expect("child did not exit after cancel")
            .unwrap();
        assert!(!status.success());
    }
}
