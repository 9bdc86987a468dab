//! Shared value types used across the parser, supervisor, and CLI layers.

use serde::{Deserialize, Serialize};

use crate::util::{normalize_addr, now_ms};

/// One local → remote SSH tunnel mapping.
///
/// Empty addresses are legal and canonicalize to `127.0.0.1` (local) and
/// `localhost` (remote); use [`ForwardSpec::local_endpoint`] /
/// [`ForwardSpec::remote_endpoint`] for the canonical forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    /// Canonical `addr:port` string for the local side. IPv6 literals are
    /// bracketed so the string survives colon-splitting.
    pub fn local_endpoint(&self) -> String {
        format!(
            "{}:{}",
            bracket(normalize_addr(&self.local_addr, "127.0.0.1")),
            self.local_port
        )
    }

    /// Canonical `addr:port` string for the remote side.
    pub fn remote_endpoint(&self) -> String {
        format!(
            "{}:{}",
            bracket(normalize_addr(&self.remote_addr, "localhost")),
            self.remote_port
        )
    }
}

/// Re-bracket an IPv6 literal so `addr:port` strings stay parseable.
fn bracket(addr: &str) -> String {
    if addr.contains(':') && !addr.starts_with('[') {
        format!("[{addr}]")
    } else {
        addr.to_string()
    }
}

impl std::fmt::Display for ForwardSpec {
    /// Canonical `localAddr:localPort:remoteAddr:remotePort` form, with IPv6
    /// literals bracketed so the output re-parses to the same spec.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            bracket(normalize_addr(&self.local_addr, "127.0.0.1")),
            self.local_port,
            bracket(normalize_addr(&self.remote_addr, "localhost")),
            self.remote_port
        )
    }
}

/// A normalized host configuration extracted from ssh config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub alias: String,
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_jump: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forwards: Vec<ForwardSpec>,
    /// Session-only entry built from explicit CLI input (`user@host:port`)
    /// rather than an alias in ssh config. The launcher must synthesize
    /// explicit connection arguments instead of passing the alias.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ad_hoc: bool,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostEntry {
    /// A minimal entry for `alias`, as produced by a config with a bare
    /// `Host` block: hostname defaults to the alias, port to 22.
    pub fn named(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            host_name: alias.to_string(),
            user: None,
            port: 22,
            identity_file: None,
            proxy_jump: None,
            forwards: Vec::new(),
            ad_hoc: false,
        }
    }

    /// Hostname for display, falling back to the alias.
    pub fn display_target(&self) -> &str {
        if self.host_name.is_empty() {
            &self.alias
        } else {
            &self.host_name
        }
    }
}

/// Lifecycle state of an SSH tunnel.
///
/// `Quarantined` is terminal until an explicit recover request; every other
/// non-running state is start-eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Down,
    Starting,
    Up,
    Error,
    Stopping,
    Quarantined,
}

impl TunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Down => "down",
            TunnelState::Starting => "starting",
            TunnelState::Up => "up",
            TunnelState::Error => "error",
            TunnelState::Stopping => "stopping",
            TunnelState::Quarantined => "quarantined",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime record of an active or historical tunnel.
///
/// Mutated only through the supervisor's serialized state transitions and
/// persisted to `runtime.json` after every change. The JSON field set is a
/// stable contract consumed by `status --json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRuntime {
    pub id: String,
    pub host_alias: String,
    pub local: String,
    pub remote: String,
    pub state: TunnelState,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub uptime_seconds: u64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    /// The forward that produced this tunnel. Absent after a process-boundary
    /// reload; `Restart` then reconstructs it from `local`/`remote`.
    #[serde(skip)]
    pub forward: Option<ForwardSpec>,
    /// Milliseconds since epoch at the last successful start; 0 when the
    /// tunnel has never run in this incarnation.
    #[serde(skip)]
    pub started_at_ms: u64,
}

impl TunnelRuntime {
    /// Seconds elapsed since the tunnel last started, 0 when not started.
    pub fn uptime_now(&self) -> u64 {
        if self.started_at_ms == 0 {
            return 0;
        }
        now_ms().saturating_sub(self.started_at_ms) / 1000
    }
}

/// Deterministic tunnel identity derived from the host alias and the
/// canonicalized endpoints.
///
/// Format: `alias|localAddr:localPort|remoteAddr:remotePort`, e.g.
/// `prod-db|127.0.0.1:5432|localhost:5432`. Two forwards that canonicalize
/// to the same endpoints always produce the same ID, so the ID survives
/// restarts and serves as the key in all supervisor maps.
pub fn tunnel_id(host_alias: &str, fwd: &ForwardSpec) -> String {
    format!(
        "{}|{}|{}",
        host_alias,
        fwd.local_endpoint(),
        fwd.remote_endpoint()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_id_canonicalizes_empty_addrs() {
        let explicit = ForwardSpec {
            local_addr: "127.0.0.1".into(),
            local_port: 8080,
            remote_addr: "localhost".into(),
            remote_port: 80,
        };
        let implicit = ForwardSpec {
            local_addr: String::new(),
            local_port: 8080,
            remote_addr: String::new(),
            remote_port: 80,
        };
        assert_eq!(tunnel_id("h", &explicit), tunnel_id("h", &implicit));
        assert_eq!(tunnel_id("h", &explicit), "h|127.0.0.1:8080|localhost:80");
    }

    #[test]
    fn test_forward_display_brackets_ipv6() {
        let fwd = ForwardSpec {
            local_addr: "::1".into(),
            local_port: 8080,
            remote_addr: "2001:db8::1".into(),
            remote_port: 5432,
        };
        assert_eq!(fwd.to_string(), "[::1]:8080:[2001:db8::1]:5432");
    }

    #[test]
    fn test_uptime_zero_when_never_started() {
        let rt = TunnelRuntime {
            id: "x".into(),
            host_alias: "x".into(),
            local: "127.0.0.1:1".into(),
            remote: "localhost:1".into(),
            state: TunnelState::Down,
            pid: 0,
            uptime_seconds: 0,
            latency_ms: 0,
            last_error: String::new(),
            forward: None,
            started_at_ms: 0,
        };
        assert_eq!(rt.uptime_now(), 0);
    }

    #[test]
    fn test_host_entry_display_target_falls_back() {
        let mut h = HostEntry::named("api");
        assert_eq!(h.display_target(), "api");
        h.host_name = "10.0.0.1".into();
        assert_eq!(h.display_target(), "10.0.0.1");
    }
}
