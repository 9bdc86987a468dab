//! Local diagnostics: one pass over everything that commonly breaks tunnel
//! workflows, aggregated into a severity-sorted report.

use serde::Serialize;

use crate::config::Config;
use crate::launcher::{process_alive, TunnelLauncher};
use crate::model::TunnelState;
use crate::security::{self, Severity};
use crate::sshconfig;
use crate::supervisor::Supervisor;

/// One diagnostic issue with a concrete recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub check: String,
    pub target: String,
    pub message: String,
    pub recommendation: String,
}

/// Result of [`run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub issues: Vec<Issue>,
}

/// Execute local diagnostics against the given supervisor (which should
/// already have restored runtime state).
pub async fn run(cfg: &Config, launcher: &dyn TunnelLauncher, sup: &Supervisor) -> Report {
    let mut issues = Vec::new();

    if let Err(e) = launcher.ensure_binary() {
        issues.push(Issue {
            severity: Severity::High,
            check: "ssh-binary".into(),
            target: "PATH".into(),
            message: e.to_string(),
            recommendation: "install the OpenSSH client and ensure `ssh` is on PATH".into(),
        });
    }

    if let Ok(res) = sshconfig::parse_default() {
        for warning in &res.warnings {
            issues.push(Issue {
                severity: Severity::Medium,
                check: "config-warning".into(),
                target: "~/.ssh/config".into(),
                message: security::redact_message(warning),
                recommendation: "fix malformed or unsupported ssh config directives".into(),
            });
        }
        issues.extend(duplicate_bind_issues(&res.hosts));
    }

    for rt in sup.snapshot().await {
        match rt.state {
            TunnelState::Quarantined => issues.push(Issue {
                severity: Severity::Medium,
                check: "runtime-quarantine".into(),
                target: rt.id.clone(),
                message: "tunnel is quarantined".into(),
                recommendation: "inspect with `tunnel status` and run `tunnel recover` when safe"
                    .into(),
            }),
            TunnelState::Up if rt.pid == 0 => issues.push(Issue {
                severity: Severity::Medium,
                check: "runtime-stale".into(),
                target: rt.id.clone(),
                message: "runtime shows up state with missing PID".into(),
                recommendation: "restart the tunnel to refresh runtime state".into(),
            }),
            TunnelState::Up if process_alive(rt.pid) => issues.push(Issue {
                // Adopted from an earlier invocation: visible, but this
                // instance holds no watcher or cancel token for it.
                severity: Severity::Low,
                check: "runtime-adopted".into(),
                target: rt.id.clone(),
                message: "tunnel was adopted from a previous run and cannot be auto-restarted"
                    .into(),
                recommendation: "run `tunnel restart` to bring it under full supervision".into(),
            }),
            _ => {}
        }
    }

    for finding in security::run_local_audit(cfg).findings {
        issues.push(Issue {
            severity: finding.severity,
            check: "security-audit".into(),
            target: finding.target,
            message: finding.message,
            recommendation: finding.recommendation,
        });
    }

    issues.sort_by(|a, b| {
        b.severity
            .rank()
            .cmp(&a.severity.rank())
            .then_with(|| a.check.cmp(&b.check))
            .then_with(|| a.target.cmp(&b.target))
            .then_with(|| a.message.cmp(&b.message))
    });
    Report { issues }
}

/// High-severity issues for local endpoints claimed by more than one host;
/// those tunnels can never run at the same time.
fn duplicate_bind_issues(hosts: &[crate::model::HostEntry]) -> Vec<Issue> {
    use std::collections::BTreeMap;
    let mut by_bind: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for host in hosts {
        for fwd in &host.forwards {
            by_bind
                .entry(fwd.local_endpoint())
                .or_default()
                .push(&host.alias);
        }
    }
    by_bind
        .into_iter()
        .filter(|(_, aliases)| aliases.len() > 1)
        .map(|(bind, aliases)| Issue {
            severity: Severity::High,
            check: "duplicate-local-bind".into(),
            target: bind,
            message: format!("local bind is configured by {} hosts", aliases.len()),
            recommendation: "use unique local ports per host/forward to avoid startup conflicts"
                .into(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ForwardSpec, HostEntry};

    #[test]
    fn test_duplicate_bind_issues() {
        let fwd = ForwardSpec {
            local_addr: "127.0.0.1".into(),
            local_port: 9000,
            remote_addr: "localhost".into(),
            remote_port: 80,
        };
        let mut a = HostEntry::named("a");
        a.forwards.push(fwd.clone());
        let mut b = HostEntry::named("b");
        b.forwards.push(fwd);
        let mut c = HostEntry::named("c");
        c.forwards.push(ForwardSpec {
            local_addr: "127.0.0.1".into(),
            local_port: 9001,
            remote_addr: "localhost".into(),
            remote_port: 80,
        });

        let issues = duplicate_bind_issues(&[a, b, c]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].target, "127.0.0.1:9000");
        assert!(issues[0].message.contains("2 hosts"));
    }
}
