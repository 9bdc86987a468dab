//! Tunnel lifecycle supervision.
//!
//! The [`Supervisor`] sits between the ssh process launcher and the
//! user-facing layers. It owns every tunnel's runtime record, drives the
//! state machine `starting → up → {stopping → down | error | quarantined}`,
//! spawns a watcher task per running tunnel, persists state after every
//! transition, appends lifecycle events, probes local endpoints for health,
//! and applies the auto-restart policy with backoff, a per-tunnel attempt
//! budget, and a stable-uptime counter reset.
//!
//! ## Concurrency
//!
//! All mutable state lives behind one `Mutex` and critical sections are
//! short: process spawning, TCP probes, persistence writes, and event
//! appends always happen outside the lock. For a single tunnel id,
//! start/stop/start execute serially because every step passes through the
//! mutex and `stop` marks the entry `stopping` before cancelling. Across
//! ids, operations are independent.
//!
//! ## Cancellation
//!
//! Every start allocates a fresh [`CancellationToken`]; tokens are never
//! reused across restart generations. `stop` cancels the token, which
//! terminates the child's process group. A termination the supervisor did
//! not request is an unexpected exit and feeds the restart policy instead.

mod preflight;

pub use preflight::{PreflightFinding, PreflightReport};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventStore, Query};
use crate::forward::{
    is_public_bind_addr, parse_endpoint_string, validate_forward_spec, ForwardParseError,
};
use crate::launcher::{process_alive, terminate_pid, TunnelHandle, TunnelLauncher};
use crate::model::{tunnel_id, ForwardSpec, HostEntry, TunnelRuntime, TunnelState};
use crate::security::{BindPolicy, ClassifiedError};
use crate::sshconfig;
use crate::store::RuntimeStore;
use crate::util::{now_ms, PROBE_COLLECT_SLACK, PROBE_DIAL_TIMEOUT};

/// Auto-restart tuning. Defaults: enabled, 3 attempts, 2 s backoff, 30 s
/// stable window.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Attempts per tunnel before quarantine.
    pub max_attempts: u32,
    /// Delay before each scheduled restart.
    pub backoff: Duration,
    /// Continuous uptime after which the attempt counter resets to zero.
    pub stable_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff: Duration::from_secs(2),
            stable_window: Duration::from_secs(30),
        }
    }
}

/// Monotonic per-tunnel restart counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RestartStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Errors surfaced by supervisor operations. User-visible text only; debug
/// detail stays inside the classified variants.
#[derive(Debug)]
pub enum SupervisorError {
    NotFound(String),
    NoActiveTunnels(String),
    NotQuarantined(String),
    NoneQuarantined(String),
    Forward(ForwardParseError),
    Policy(ClassifiedError),
    Launch(ClassifiedError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::NotFound(id) => write!(f, "tunnel not found: {id}"),
            SupervisorError::NoActiveTunnels(alias) => {
                write!(f, "no active tunnel for host {alias}")
            }
            SupervisorError::NotQuarantined(id) => {
                write!(f, "tunnel {id} is not quarantined")
            }
            SupervisorError::NoneQuarantined(alias) => {
                write!(f, "no quarantined tunnels for host {alias}")
            }
            SupervisorError::Forward(e) => write!(f, "invalid forward specification: {e}"),
            SupervisorError::Policy(e) | SupervisorError::Launch(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Everything guarded by the supervisor lock.
struct State {
    runtime: HashMap<String, TunnelRuntime>,
    cancel: HashMap<String, CancellationToken>,
    /// Host entries as last seen by `start`, for restarting ad-hoc tunnels
    /// whose alias is not in ssh config.
    hosts: HashMap<String, HostEntry>,
    restart_attempts: HashMap<String, u32>,
    restart_stats: HashMap<String, RestartStats>,
    bind_policy: BindPolicy,
    /// One-shot override, consumed by the next `start`.
    allow_public_bind: bool,
    redact_errors: bool,
    restart_policy: RestartPolicy,
}

struct Inner {
    launcher: Arc<dyn TunnelLauncher>,
    store: RuntimeStore,
    events: EventStore,
    state: Mutex<State>,
}

/// Coordinates ssh tunnel processes and tracks their runtime state.
///
/// Cloneable; all clones share the same inner state. Safe for concurrent
/// use from the dashboard refresh loop and CLI commands at once.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor persisting under `state_dir` (`runtime.json` and
    /// `events.jsonl`). The returned supervisor has empty state; call
    /// [`Supervisor::load_runtime`] to restore a previous session.
    pub fn new(launcher: Arc<dyn TunnelLauncher>, state_dir: &Path) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                store: RuntimeStore::new(state_dir.join("runtime.json")),
                events: EventStore::new(state_dir.join("events.jsonl")),
                state: Mutex::new(State {
                    runtime: HashMap::new(),
                    cancel: HashMap::new(),
                    hosts: HashMap::new(),
                    restart_attempts: HashMap::new(),
                    restart_stats: HashMap::new(),
                    bind_policy: BindPolicy::LoopbackOnly,
                    allow_public_bind: false,
                    redact_errors: true,
                    restart_policy: RestartPolicy::default(),
                }),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("supervisor state lock")
    }

    pub fn set_bind_policy(&self, policy: BindPolicy) {
        self.state().bind_policy = policy;
    }

    /// Permit one non-loopback bind on the next `start` only.
    pub fn set_allow_public_bind(&self, allow: bool) {
        self.state().allow_public_bind = allow;
    }

    pub fn set_redact_errors(&self, redact: bool) {
        self.state().redact_errors = redact;
    }

    pub fn set_restart_policy(&self, policy: RestartPolicy) {
        self.state().restart_policy = policy;
    }

    /// Start a tunnel for `host`/`fwd`.
    ///
    /// Idempotent against an already-`up` tunnel with the same id: the
    /// existing record is returned and no second process is spawned. On
    /// launch failure the record lands in `error` with a user-safe message
    /// and the restart policy takes over.
    pub fn start<'a>(
        &'a self,
        host: &'a HostEntry,
        fwd: &'a ForwardSpec,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<TunnelRuntime, SupervisorError>> + Send + 'a>,
    > {
        Box::pin(self.start_impl(host, fwd))
    }

    async fn start_impl(
        &self,
        host: &HostEntry,
        fwd: &ForwardSpec,
    ) -> Result<TunnelRuntime, SupervisorError> {
        if fwd.local_port == 0 {
            return Err(SupervisorError::Forward(ForwardParseError::PortOutOfRange(0)));
        }
        if fwd.remote_port == 0 {
            return Err(SupervisorError::Forward(ForwardParseError::PortOutOfRange(0)));
        }
        validate_forward_spec(fwd).map_err(SupervisorError::Forward)?;

        let id = tunnel_id(&host.alias, fwd);
        let cancel = CancellationToken::new();

        {
            let mut state = self.state();
            // The override is consumed by a single start attempt.
            let allow_public = std::mem::replace(&mut state.allow_public_bind, false);
            if state.bind_policy == BindPolicy::LoopbackOnly
                && !allow_public
                && is_public_bind_addr(&fwd.local_addr)
            {
                return Err(SupervisorError::Policy(ClassifiedError::new(
                    "public bind rejected by security policy",
                    format!(
                        "local bind address {:?} requires allow-public override",
                        fwd.local_addr
                    ),
                )));
            }

            if let Some(existing) = state.runtime.get(&id) {
                if existing.state == TunnelState::Up {
                    let mut out = existing.clone();
                    out.uptime_seconds = out.uptime_now();
                    return Ok(out);
                }
            }

            state.runtime.insert(
                id.clone(),
                TunnelRuntime {
                    id: id.clone(),
                    host_alias: host.alias.clone(),
                    local: fwd.local_endpoint(),
                    remote: fwd.remote_endpoint(),
                    state: TunnelState::Starting,
                    pid: 0,
                    uptime_seconds: 0,
                    latency_ms: 0,
                    last_error: String::new(),
                    forward: Some(fwd.clone()),
                    started_at_ms: now_ms(),
                },
            );
            state.cancel.insert(id.clone(), cancel.clone());
            state.hosts.insert(host.alias.clone(), host.clone());
        }

        self.persist().await;
        self.emit(
            Event::new("start_requested")
                .tunnel(&id, &host.alias)
                .state(TunnelState::Starting),
        )
        .await;

        match self
            .inner
            .launcher
            .start_tunnel(cancel.clone(), host, fwd)
            .await
        {
            Err(launch_err) => {
                let user_msg = {
                    let mut state = self.state();
                    let msg = if state.redact_errors {
                        crate::security::redact_message(&launch_err.to_string())
                    } else {
                        launch_err.to_string()
                    };
                    if let Some(entry) = state.runtime.get_mut(&id) {
                        entry.state = TunnelState::Error;
                        entry.last_error = msg.clone();
                    }
                    state.cancel.remove(&id);
                    msg
                };
                self.persist().await;
                self.emit(
                    Event::new("start_failed")
                        .tunnel(&id, &host.alias)
                        .state(TunnelState::Error)
                        .message(user_msg),
                )
                .await;
                self.maybe_schedule_restart(&id).await;
                Err(SupervisorError::Launch(ClassifiedError::new(
                    "failed to start tunnel",
                    launch_err.to_string(),
                )))
            }
            Ok(handle) => {
                let started_at_ms;
                {
                    let mut state = self.state();
                    if let Some(entry) = state.runtime.get_mut(&id) {
                        entry.pid = handle.pid;
                        entry.state = TunnelState::Up;
                        started_at_ms = entry.started_at_ms;
                    } else {
                        started_at_ms = 0;
                    }
                }
                self.persist().await;
                self.emit(
                    Event::new("start_succeeded")
                        .tunnel(&id, &host.alias)
                        .state(TunnelState::Up)
                        .pid(handle.pid),
                )
                .await;
                info!("tunnel {id} up (pid {})", handle.pid);

                let sup = self.clone();
                let watch_id = id.clone();
                tokio::spawn(async move {
                    sup.watch_tunnel(watch_id, handle, cancel).await;
                });
                self.schedule_restart_reset(&id, started_at_ms);

                self.get(&id)
            }
        }
    }

    /// Block until the tunnel child exits, then classify the exit.
    ///
    /// A cancelled token or a `stopping` state means the supervisor asked
    /// for the termination, and the record is left alone. Anything else
    /// transitions to `error` (nonzero/failed exit) or `down` (clean exit)
    /// and consults the restart policy.
    async fn watch_tunnel(&self, id: String, mut handle: TunnelHandle, cancel: CancellationToken) {
        // Drain stderr so the child cannot block on a full pipe; keep the
        // last line as the most useful failure message ssh gives us.
        let last_stderr: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = handle.stderr.take() {
            let sink = Arc::clone(&last_stderr);
            let stderr_id = id.clone();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    if !line.is_empty() {
                        debug!("tunnel {stderr_id} stderr: {line}");
                        *sink.lock().expect("stderr sink lock") = line;
                    }
                }
            });
        }

        let status = handle.child.wait().await;
        let requested = cancel.is_cancelled();
        // Reap the cancel-watch task from spawn_cancellable; a no-op when
        // the stop path already cancelled.
        cancel.cancel();

        let mut unexpected = false;
        let mut event: Option<Event> = None;
        {
            let mut state = self.state();
            let redact = state.redact_errors;
            state.cancel.remove(&id);
            let Some(entry) = state.runtime.get_mut(&id) else {
                return;
            };
            if !requested && entry.state != TunnelState::Stopping {
                let clean = matches!(&status, Ok(s) if s.success());
                entry.pid = 0;
                if clean {
                    entry.state = TunnelState::Down;
                } else {
                    entry.state = TunnelState::Error;
                    let stderr_line = last_stderr.lock().expect("stderr sink lock").clone();
                    let raw = if stderr_line.is_empty() {
                        match &status {
                            Ok(s) => format!("tunnel exited: {s}"),
                            Err(e) => format!("tunnel wait error: {e}"),
                        }
                    } else {
                        stderr_line
                    };
                    entry.last_error = if redact {
                        crate::security::redact_message(&raw)
                    } else {
                        raw
                    };
                }
                unexpected = true;
                event = Some(
                    Event::new("unexpected_exit")
                        .tunnel(&id, &entry.host_alias)
                        .state(entry.state)
                        .message(entry.last_error.clone()),
                );
            }
        }

        self.persist().await;
        if let Some(evt) = event {
            self.emit(evt).await;
        }
        if unexpected {
            self.maybe_schedule_restart(&id).await;
        }
    }

    /// Consult the restart policy after a non-stopping exit (or a failed
    /// launch). Either quarantines at budget exhaustion or schedules a
    /// delayed start.
    async fn maybe_schedule_restart(&self, id: &str) {
        // Decide under the lock; act (persist, emit, sleep) outside it.
        enum Decision {
            Quarantine { alias: String },
            Schedule {
                alias: String,
                fwd: ForwardSpec,
                backoff: Duration,
                attempt: u32,
                max: u32,
            },
        }

        let decision = {
            let mut state = self.state();
            let policy = state.restart_policy;
            if !policy.enabled {
                return;
            }
            let Some(entry) = state.runtime.get(id) else {
                return;
            };
            if !matches!(entry.state, TunnelState::Down | TunnelState::Error) {
                return;
            }
            let alias = entry.host_alias.clone();
            let reconstructed = forward_from_runtime(entry);
            let attempts = state.restart_attempts.entry(id.to_string()).or_insert(0);
            if *attempts >= policy.max_attempts {
                if let Some(entry) = state.runtime.get_mut(id) {
                    entry.state = TunnelState::Quarantined;
                    entry.pid = 0;
                }
                state
                    .restart_stats
                    .entry(id.to_string())
                    .or_default()
                    .failures += 1;
                Decision::Quarantine { alias }
            } else {
                *attempts += 1;
                let attempt = *attempts;
                state
                    .restart_stats
                    .entry(id.to_string())
                    .or_default()
                    .attempts += 1;
                let Some(fwd) = reconstructed else {
                    warn!("tunnel {id} has no reconstructable forward; skipping restart");
                    return;
                };
                Decision::Schedule {
                    alias,
                    fwd,
                    backoff: policy.backoff,
                    attempt,
                    max: policy.max_attempts,
                }
            }
        };

        let (alias, fwd, backoff, attempt, max) = match decision {
            Decision::Quarantine { alias } => {
                self.persist().await;
                self.emit(
                    Event::new("quarantined")
                        .tunnel(id, &alias)
                        .state(TunnelState::Quarantined)
                        .message("restart budget exhausted"),
                )
                .await;
                warn!("tunnel {id} quarantined after exhausting restart budget");
                return;
            }
            Decision::Schedule {
                alias,
                fwd,
                backoff,
                attempt,
                max,
            } => (alias, fwd, backoff, attempt, max),
        };

        self.emit(
            Event::new("restart_scheduled")
                .tunnel(id, &alias)
                .message(format!("attempt {attempt}/{max} in {}s", backoff.as_secs())),
        )
        .await;

        let sup = self.clone();
        let id = id.to_string();
        // Boxed so the start → schedule → start type cycle stays finite.
        tokio::spawn(Box::pin(async move {
            tokio::time::sleep(backoff).await;
            let host = sup.resolve_host(&alias);
            match sup.start(&host, &fwd).await {
                Ok(rt) => {
                    sup.state()
                        .restart_stats
                        .entry(id.clone())
                        .or_default()
                        .successes += 1;
                    sup.emit(
                        Event::new("restart_succeeded")
                            .tunnel(&id, &alias)
                            .state(rt.state)
                            .pid(rt.pid),
                    )
                    .await;
                }
                Err(e) => {
                    sup.state()
                        .restart_stats
                        .entry(id.clone())
                        .or_default()
                        .failures += 1;
                    sup.emit(
                        Event::new("restart_failed")
                            .tunnel(&id, &alias)
                            .message(e.to_string()),
                    )
                    .await;
                }
            }
        }));
    }

    /// Arm the stable-window reset: if the tunnel is still on the same
    /// start (same started-at) when the window elapses, its attempt budget
    /// refills.
    fn schedule_restart_reset(&self, id: &str, started_at_ms: u64) {
        let window = self.state().restart_policy.stable_window;
        let sup = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut state = sup.state();
            // Still up on the same start means the tunnel really was stable for
            // the whole window, not merely between restarts.
            let stable = state
                .runtime
                .get(&id)
                .is_some_and(|e| e.state == TunnelState::Up && e.started_at_ms == started_at_ms);
            if stable {
                state.restart_attempts.insert(id.clone(), 0);
                debug!("tunnel {id} stable for {}s; restart budget reset", window.as_secs());
            }
        });
    }

    /// Stop a tunnel by id. Idempotent against already-dead processes.
    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let (cancel, pid, alias) = {
            let mut state = self.state();
            let Some(entry) = state.runtime.get_mut(id) else {
                return Err(SupervisorError::NotFound(id.to_string()));
            };
            // Mark stopping before any signal so the watcher knows this
            // termination is intentional.
            entry.state = TunnelState::Stopping;
            let pid = entry.pid;
            let alias = entry.host_alias.clone();
            (state.cancel.get(id).cloned(), pid, alias)
        };

        // Cancelling terminates the child's process group.
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        // Courtesy SIGTERM directly to the child, only when it is still
        // alive, to avoid "no such process" noise.
        if pid > 0 && process_alive(pid) {
            terminate_pid(pid);
        }

        {
            let mut state = self.state();
            state.cancel.remove(id);
            if let Some(entry) = state.runtime.get_mut(id) {
                entry.state = TunnelState::Down;
                entry.pid = 0;
            }
        }

        self.persist().await;
        self.emit(
            Event::new("stop_succeeded")
                .tunnel(id, &alias)
                .state(TunnelState::Down),
        )
        .await;
        info!("tunnel {id} stopped");
        Ok(())
    }

    /// Stop all active tunnels for a host alias. An `error` entry counts as
    /// active: it may still have a lingering process, and stopping it is
    /// harmless.
    pub async fn stop_by_host(&self, alias: &str) -> Result<usize, SupervisorError> {
        let ids: Vec<String> = {
            let state = self.state();
            state
                .runtime
                .values()
                .filter(|rt| {
                    rt.host_alias == alias
                        && matches!(
                            rt.state,
                            TunnelState::Up | TunnelState::Starting | TunnelState::Error
                        )
                })
                .map(|rt| rt.id.clone())
                .collect()
        };
        if ids.is_empty() {
            return Err(SupervisorError::NoActiveTunnels(alias.to_string()));
        }
        let count = ids.len();
        for id in ids {
            let _ = self.stop(&id).await;
        }
        Ok(count)
    }

    /// Stop every managed tunnel, e.g. on application shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.state().runtime.keys().cloned().collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }

    /// Stop and immediately start a tunnel again, reusing its forward. The
    /// host is reloaded from ssh config so edits take effect.
    pub async fn restart(&self, id: &str) -> Result<TunnelRuntime, SupervisorError> {
        let (alias, fwd) = {
            let state = self.state();
            let Some(entry) = state.runtime.get(id) else {
                return Err(SupervisorError::NotFound(id.to_string()));
            };
            let Some(fwd) = forward_from_runtime(entry) else {
                return Err(SupervisorError::Forward(ForwardParseError::MissingParts));
            };
            (entry.host_alias.clone(), fwd)
        };

        self.emit(Event::new("restart_requested").tunnel(id, &alias))
            .await;
        self.stop(id).await?;
        let host = self.resolve_host(&alias);
        match self.start(&host, &fwd).await {
            Ok(rt) => {
                self.emit(
                    Event::new("restart_succeeded")
                        .tunnel(id, &alias)
                        .state(rt.state)
                        .pid(rt.pid),
                )
                .await;
                Ok(rt)
            }
            Err(e) => {
                self.emit(
                    Event::new("restart_failed")
                        .tunnel(id, &alias)
                        .message(e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Clear quarantine on one tunnel, reset its attempt budget, and start
    /// it again. Errors on entries in any other state.
    pub async fn recover(&self, id: &str) -> Result<TunnelRuntime, SupervisorError> {
        let (alias, fwd) = {
            let mut state = self.state();
            let Some(entry) = state.runtime.get(id) else {
                return Err(SupervisorError::NotFound(id.to_string()));
            };
            if entry.state != TunnelState::Quarantined {
                return Err(SupervisorError::NotQuarantined(id.to_string()));
            }
            let Some(fwd) = forward_from_runtime(entry) else {
                return Err(SupervisorError::Forward(ForwardParseError::MissingParts));
            };
            let alias = entry.host_alias.clone();
            state.restart_attempts.insert(id.to_string(), 0);
            (alias, fwd)
        };

        let host = self.resolve_host(&alias);
        let rt = self.start(&host, &fwd).await?;
        self.emit(
            Event::new("recovered")
                .tunnel(id, &alias)
                .state(rt.state)
                .pid(rt.pid),
        )
        .await;
        Ok(rt)
    }

    /// Recover every quarantined tunnel for a host alias.
    pub async fn recover_by_host(
        &self,
        alias: &str,
    ) -> Result<Vec<TunnelRuntime>, SupervisorError> {
        let ids: Vec<String> = {
            let state = self.state();
            state
                .runtime
                .values()
                .filter(|rt| rt.host_alias == alias && rt.state == TunnelState::Quarantined)
                .map(|rt| rt.id.clone())
                .collect()
        };
        if ids.is_empty() {
            return Err(SupervisorError::NoneQuarantined(alias.to_string()));
        }
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.recover(&id).await?);
        }
        Ok(out)
    }

    /// Snapshot of one tunnel with freshly computed uptime.
    pub fn get(&self, id: &str) -> Result<TunnelRuntime, SupervisorError> {
        let state = self.state();
        let Some(entry) = state.runtime.get(id) else {
            return Err(SupervisorError::NotFound(id.to_string()));
        };
        let mut out = entry.clone();
        out.uptime_seconds = out.uptime_now();
        Ok(out)
    }

    /// Read-only snapshot of every tunnel, with current uptime and, for
    /// `up` entries, freshly probed latency.
    ///
    /// Probes are TCP dials against each tunnel's local endpoint, bounded
    /// overall by the dial timeout plus a collection slack. Probe failures
    /// never change tunnel state; probes still in flight at the deadline
    /// are abandoned and contribute latency 0.
    pub async fn snapshot(&self) -> Vec<TunnelRuntime> {
        let mut out: Vec<TunnelRuntime> = {
            let state = self.state();
            state
                .runtime
                .values()
                .map(|rt| {
                    let mut copy = rt.clone();
                    copy.uptime_seconds = copy.uptime_now();
                    copy
                })
                .collect()
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel::<(usize, u64)>(out.len().max(1));
        let mut expected = 0usize;
        for (idx, rt) in out.iter().enumerate() {
            if rt.state != TunnelState::Up {
                continue;
            }
            expected += 1;
            let tx = tx.clone();
            let local = rt.local.clone();
            tokio::spawn(async move {
                let start = std::time::Instant::now();
                let latency =
                    match tokio::time::timeout(PROBE_DIAL_TIMEOUT, TcpStream::connect(&local))
                        .await
                    {
                        Ok(Ok(_conn)) => start.elapsed().as_millis() as u64,
                        Ok(Err(e)) => {
                            debug!("tunnel probe failed for {local}: {e}");
                            0
                        }
                        Err(_) => {
                            debug!("tunnel probe timed out for {local}");
                            0
                        }
                    };
                let _ = tx.send((idx, latency)).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(PROBE_DIAL_TIMEOUT + PROBE_COLLECT_SLACK);
        tokio::pin!(deadline);
        let mut collected = 0usize;
        while collected < expected {
            tokio::select! {
                recv = rx.recv() => {
                    match recv {
                        Some((idx, latency)) => {
                            out[idx].latency_ms = latency;
                            collected += 1;
                        }
                        None => break,
                    }
                }
                () = &mut deadline => {
                    warn!("tunnel probe round timed out ({collected}/{expected} collected)");
                    break;
                }
            }
        }
        out
    }

    /// Run read-only preflight checks for a prospective tunnel. Never
    /// changes supervisor state. See [`preflight`].
    pub fn preflight(&self, host: &HostEntry, fwd: &ForwardSpec) -> PreflightReport {
        let (bind_policy, allow_public) = {
            let state = self.state();
            (state.bind_policy, state.allow_public_bind)
        };
        preflight::run(host, fwd, bind_policy, allow_public)
    }

    /// Read lifecycle events from the journal.
    pub async fn events(&self, query: &Query) -> std::io::Result<Vec<Event>> {
        self.inner.events.read(query).await
    }

    /// Current restart statistics per tunnel id.
    pub fn restart_stats(&self) -> HashMap<String, RestartStats> {
        self.state().restart_stats.clone()
    }

    /// Restore persisted state from a previous invocation.
    ///
    /// Records whose PID is alive and whose command line carries the
    /// managed-tunnel signature are adopted as-is: displayed, but without
    /// a watcher or cancel token, so they cannot be auto-restarted by this
    /// instance (a v1 limitation surfaced by doctor). An alive PID with an
    /// unrecognizable command line is quarantined rather than falsely
    /// adopted; dead PIDs come back as `down`.
    pub async fn load_runtime(&self) -> std::io::Result<()> {
        let records = self.inner.store.load().await?;
        for mut rt in records {
            rt.forward = forward_from_runtime(&rt);
            if rt.pid > 0 && process_alive(rt.pid) {
                let cmdline = process_command(rt.pid).await;
                if cmdline
                    .as_deref()
                    .is_some_and(|c| is_managed_tunnel_process(c, &rt))
                {
                    debug!("adopted tunnel {} (pid {})", rt.id, rt.pid);
                    self.state().runtime.insert(rt.id.clone(), rt);
                    continue;
                }
                rt.state = TunnelState::Quarantined;
                rt.last_error =
                    "recovered runtime entry was quarantined (process mismatch)".to_string();
                rt.pid = 0;
                warn!("quarantined restored tunnel {}", rt.id);
            } else {
                rt.state = TunnelState::Down;
                rt.pid = 0;
            }
            self.state().runtime.insert(rt.id.clone(), rt);
        }
        Ok(())
    }

    /// Quarantine entries that claim to be `up` but have no live process
    /// behind them. With `strict`, additionally require the process command
    /// line to match the managed-tunnel signature. Returns a description of
    /// every action taken.
    pub async fn reconcile(&self, host_alias: Option<&str>, strict: bool) -> Vec<String> {
        // Collect candidates under the lock, check processes outside it.
        let candidates: Vec<TunnelRuntime> = {
            let state = self.state();
            state
                .runtime
                .values()
                .filter(|rt| host_alias.map_or(true, |a| rt.host_alias == a))
                .filter(|rt| rt.state == TunnelState::Up)
                .cloned()
                .collect()
        };

        let mut to_quarantine: Vec<(String, String)> = Vec::new();
        for rt in candidates {
            if rt.pid == 0 || !process_alive(rt.pid) {
                to_quarantine.push((rt.id.clone(), "process missing".to_string()));
                continue;
            }
            if strict {
                let cmdline = process_command(rt.pid).await;
                let matches = cmdline
                    .as_deref()
                    .is_some_and(|c| is_managed_tunnel_process(c, &rt));
                if !matches {
                    to_quarantine.push((rt.id.clone(), "process signature mismatch".to_string()));
                }
            }
        }

        let mut actions = Vec::with_capacity(to_quarantine.len());
        if to_quarantine.is_empty() {
            return actions;
        }
        let mut events = Vec::new();
        {
            let mut state = self.state();
            for (id, reason) in &to_quarantine {
                if let Some(entry) = state.runtime.get_mut(id) {
                    entry.state = TunnelState::Quarantined;
                    entry.pid = 0;
                    entry.last_error = format!("quarantined by reconcile: {reason}");
                    actions.push(format!("quarantined {id}: {reason}"));
                    events.push(
                        Event::new("quarantined")
                            .tunnel(id, &entry.host_alias)
                            .state(TunnelState::Quarantined)
                            .message(reason.clone()),
                    );
                }
                state.cancel.remove(id);
            }
        }
        self.persist().await;
        for evt in events {
            self.emit(evt).await;
        }
        actions
    }

    /// Prefer the freshest host definition: ssh config first, then the
    /// entry recorded at start time (covers ad-hoc hosts), then a minimal
    /// alias-only entry.
    fn resolve_host(&self, alias: &str) -> HostEntry {
        if let Some(host) = sshconfig::find_host(alias) {
            return host;
        }
        if let Some(host) = self.state().hosts.get(alias).cloned() {
            return host;
        }
        HostEntry::named(alias)
    }

    /// Serialize the whole runtime map. Failures are logged, never
    /// propagated: a missed persist is repaired by the next successful one.
    async fn persist(&self) {
        let records: Vec<TunnelRuntime> = {
            let state = self.state();
            state
                .runtime
                .values()
                .map(|rt| {
                    let mut copy = rt.clone();
                    copy.uptime_seconds = copy.uptime_now();
                    copy
                })
                .collect()
        };
        if let Err(e) = self.inner.store.save(&records).await {
            warn!("failed to persist tunnel state: {e}");
        }
    }

    /// Best-effort journal append.
    async fn emit(&self, event: Event) {
        if let Err(e) = self.inner.events.append(&event).await {
            warn!("failed to append event {}: {e}", event.event_type);
        }
    }
}

/// The forward for a runtime record: the live one if present, otherwise
/// reconstructed from the canonical endpoint strings (the post-reload
/// case).
fn forward_from_runtime(rt: &TunnelRuntime) -> Option<ForwardSpec> {
    if let Some(fwd) = &rt.forward {
        return Some(fwd.clone());
    }
    let (local_addr, local_port) = parse_endpoint_string(&rt.local).ok()?;
    let (remote_addr, remote_port) = parse_endpoint_string(&rt.remote).ok()?;
    Some(ForwardSpec {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
    })
}

/// Whether a command line looks like one of our tunnel children: the ssh
/// binary in `-N -L` mode, naming this record's alias and both endpoints.
fn is_managed_tunnel_process(cmdline: &str, rt: &TunnelRuntime) -> bool {
    let cmdline = cmdline.trim();
    cmdline.contains("ssh")
        && cmdline.contains("-N")
        && cmdline.contains("-L")
        && cmdline.contains(&rt.host_alias)
        && cmdline.contains(&rt.local)
        && cmdline.contains(&rt.remote)
}

/// Fetch a process's command line: `/proc` where available, `ps` otherwise.
async fn process_command(pid: u32) -> Option<String> {
    if let Ok(raw) = tokio::fs::read(format!("/proc/{pid}/cmdline")).await {
        let cmd = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        if !cmd.is_empty() {
            return Some(cmd);
        }
    }
    let output = tokio::process::Command::new("ps")
        .args(["-o", "command=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    let cmd = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if cmd.is_empty() {
        None
    } else {
        Some(cmd)
    }
}
