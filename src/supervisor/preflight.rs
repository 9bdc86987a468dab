//! Read-only preflight checks for a prospective tunnel.
//!
//! Produces a structured report without touching supervisor state: port
//! ranges, endpoint syntax, bind-policy compliance, whether the local
//! endpoint can actually be bound right now (a momentary listen that is
//! released immediately, the precise way to catch "address already in
//! use"), whether the alias resolves in ssh config, and the posture of a
//! declared identity file.

use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;

use serde::Serialize;

use crate::forward::{is_public_bind_addr, validate_forward_spec};
use crate::model::{ForwardSpec, HostEntry};
use crate::security::BindPolicy;
use crate::sshconfig;
use crate::util::expand_tilde;

/// One preflight check outcome.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightFinding {
    pub check: String,
    pub ok: bool,
    pub message: String,
}

/// All findings for one host/forward pair. `ok` is the conjunction.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub ok: bool,
    pub findings: Vec<PreflightFinding>,
}

impl PreflightReport {
    fn push(&mut self, check: &str, ok: bool, message: impl Into<String>) {
        self.findings.push(PreflightFinding {
            check: check.to_string(),
            ok,
            message: message.into(),
        });
        self.ok = self.ok && ok;
    }
}

pub(super) fn run(
    host: &HostEntry,
    fwd: &ForwardSpec,
    bind_policy: BindPolicy,
    allow_public_bind: bool,
) -> PreflightReport {
    let mut report = PreflightReport {
        ok: true,
        findings: Vec::new(),
    };

    if fwd.local_port == 0 {
        report.push("local-port", false, "local port must be 1-65535");
    } else {
        report.push("local-port", true, format!("local port {}", fwd.local_port));
    }
    if fwd.remote_port == 0 {
        report.push("remote-port", false, "remote port must be 1-65535");
    } else {
        report.push(
            "remote-port",
            true,
            format!("remote port {}", fwd.remote_port),
        );
    }

    match validate_forward_spec(fwd) {
        Ok(()) => report.push("endpoint-syntax", true, "endpoint addresses are valid"),
        Err(e) => report.push("endpoint-syntax", false, e.to_string()),
    }

    if bind_policy == BindPolicy::LoopbackOnly
        && !allow_public_bind
        && is_public_bind_addr(&fwd.local_addr)
    {
        report.push(
            "bind-policy",
            false,
            format!(
                "local bind {:?} requires allow-public override under loopback-only policy",
                fwd.local_addr
            ),
        );
    } else {
        report.push("bind-policy", true, "bind policy satisfied");
    }

    // A momentary listen catches "address already in use" precisely; the
    // socket is dropped before we return.
    if fwd.local_port > 0 {
        let endpoint = fwd.local_endpoint();
        match TcpListener::bind(&endpoint) {
            Ok(listener) => {
                drop(listener);
                report.push("port-available", true, format!("{endpoint} is free"));
            }
            Err(e) => report.push("port-available", false, format!("cannot bind {endpoint}: {e}")),
        }
    }

    if !host.ad_hoc {
        if sshconfig::find_host(&host.alias).is_some() {
            report.push(
                "host-config",
                true,
                format!("host {} found in ssh config", host.alias),
            );
        } else {
            report.push(
                "host-config",
                false,
                format!("host {} not found in ssh config", host.alias),
            );
        }
    }

    if let Some(identity) = host.identity_file.as_deref() {
        if !identity.trim().is_empty() {
            let expanded = expand_tilde(identity).into_owned();
            match std::fs::metadata(&expanded) {
                Ok(meta) => {
                    let mode = meta.permissions().mode() & 0o777;
                    if mode & 0o077 != 0 {
                        report.push(
                            "identity-file",
                            false,
                            format!("identity file permissions {mode:03o} are looser than 600"),
                        );
                    } else {
                        report.push("identity-file", true, "identity file present");
                    }
                }
                Err(_) => report.push("identity-file", false, "identity file does not exist"),
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use crate::model::{ForwardSpec, HostEntry};
    use crate::security::BindPolicy;

    fn fwd(port: u16) -> ForwardSpec {
        ForwardSpec {
            local_addr: "127.0.0.1".into(),
            local_port: port,
            remote_addr: "localhost".into(),
            remote_port: 80,
        }
    }

    fn adhoc(alias: &str) -> HostEntry {
        // Ad-hoc skips the ssh-config lookup, keeping these tests
        // independent of the environment's ~/.ssh/config.
        let mut host = HostEntry::named(alias);
        host.ad_hoc = true;
        host
    }

    #[test]
    fn test_preflight_passes_for_free_loopback_port() {
        let report = super::run(&adhoc("api"), &fwd(39101), BindPolicy::LoopbackOnly, false);
        assert!(report.ok, "unexpected findings: {:?}", report.findings);
    }

    #[test]
    fn test_preflight_fails_for_port_in_use() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let report = super::run(&adhoc("api"), &fwd(port), BindPolicy::LoopbackOnly, false);
        assert!(!report.ok);
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "port-available" && !f.ok));
    }

    #[test]
    fn test_preflight_fails_for_public_bind_without_override() {
        let mut spec = fwd(39102);
        spec.local_addr = "0.0.0.0".into();
        let report = super::run(&adhoc("api"), &spec, BindPolicy::LoopbackOnly, false);
        assert!(!report.ok);
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "bind-policy" && !f.ok));
    }

    #[test]
    fn test_preflight_public_bind_allowed_with_override() {
        let mut spec = fwd(39103);
        spec.local_addr = "0.0.0.0".into();
        let report = super::run(&adhoc("api"), &spec, BindPolicy::LoopbackOnly, true);
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "bind-policy" && f.ok));
    }

    #[test]
    fn test_preflight_flags_bad_port_and_missing_identity() {
        let mut host = adhoc("api");
        host.identity_file = Some("/definitely/not/here/id_ed25519".into());
        let report = super::run(&host, &fwd(0), BindPolicy::LoopbackOnly, false);
        assert!(!report.ok);
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "local-port" && !f.ok));
        assert!(report
            .findings
            .iter()
            .any(|f| f.check == "identity-file" && !f.ok));
    }
}
