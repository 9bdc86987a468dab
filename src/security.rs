//! Security policy surface: bind and host-key policies, error
//! classification with redaction, and the local file-posture audit.

use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::Serialize;

use crate::config;
use crate::sshconfig;
use crate::util::expand_tilde;

/// Local bind-address policy for tunnel forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindPolicy {
    /// Reject forwards that bind an unspecified address (`0.0.0.0`, `::`,
    /// `*`) unless the one-shot override is set. The default.
    LoopbackOnly,
    /// Permit any local bind address.
    AllowPublic,
}

impl BindPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            BindPolicy::LoopbackOnly => "loopback-only",
            BindPolicy::AllowPublic => "allow-public",
        }
    }

    /// Normalize a config string; unknown values fall back to the default.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow-public" => BindPolicy::AllowPublic,
            _ => BindPolicy::LoopbackOnly,
        }
    }
}

/// Remote host-key verification mode, translated into ssh flags by the
/// launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Reject unknown host keys. The default.
    Strict,
    /// Trust on first use.
    AcceptNew,
    /// Disable host-key checking entirely. Flagged by the audit.
    Insecure,
}

impl HostKeyPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            HostKeyPolicy::Strict => "strict",
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::Insecure => "insecure",
        }
    }

    /// Normalize a config string; unknown values fall back to `strict`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept-new" => HostKeyPolicy::AcceptNew,
            "insecure" => HostKeyPolicy::Insecure,
            _ => HostKeyPolicy::Strict,
        }
    }

    /// ssh `-o` options implementing this policy.
    pub fn ssh_options(self) -> Vec<String> {
        match self {
            HostKeyPolicy::Strict => vec!["-o".into(), "StrictHostKeyChecking=yes".into()],
            HostKeyPolicy::AcceptNew => {
                vec!["-o".into(), "StrictHostKeyChecking=accept-new".into()]
            }
            HostKeyPolicy::Insecure => vec![
                "-o".into(),
                "StrictHostKeyChecking=no".into(),
                "-o".into(),
                "UserKnownHostsFile=/dev/null".into(),
            ],
        }
    }
}

/// An error split into a user-safe message and verbose debug detail.
///
/// Only the user-safe half is stored in runtime records or printed by the
/// CLI; the debug detail goes to logs.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub user_safe: String,
    pub debug_detail: String,
}

impl ClassifiedError {
    pub fn new(user_safe: impl Into<String>, debug_detail: impl Into<String>) -> Self {
        Self {
            user_safe: user_safe.into(),
            debug_detail: debug_detail.into(),
        }
    }

    /// The message safe to show in CLI/TUI contexts, redacted when asked.
    pub fn user_message(&self, redact: bool) -> String {
        let msg = if self.user_safe.trim().is_empty() {
            "operation failed"
        } else {
            &self.user_safe
        };
        if redact {
            redact_message(msg)
        } else {
            msg.to_string()
        }
    }

    /// Detailed error text for logs, falling back to the user-safe message.
    pub fn debug_message(&self) -> &str {
        if self.debug_detail.trim().is_empty() {
            &self.user_safe
        } else {
            &self.debug_detail
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user_safe.trim().is_empty() {
            f.write_str("operation failed")
        } else {
            f.write_str(&self.user_safe)
        }
    }
}

impl std::error::Error for ClassifiedError {}

/// Strip common sensitive path fragments from user-visible text: the home
/// directory becomes `~` and anything under `/.ssh/` is obscured.
pub fn redact_message(msg: &str) -> String {
    if msg.is_empty() {
        return String::new();
    }
    let mut out = msg.to_string();
    if let Some(home) = dirs::home_dir() {
        let home = home.to_string_lossy();
        if !home.is_empty() {
            out = out.replace(home.as_ref(), "~");
        }
    }
    if out.contains("/.ssh/") {
        out = out.replace("/.ssh/", "/.ssh/[redacted]/");
    }
    out
}

/// Severity of an audit finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn rank(self) -> u8 {
        match self {
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// One local-posture problem found by the audit.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub target: String,
    pub message: String,
    pub recommendation: String,
}

/// Result of [`run_local_audit`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn has_high(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == Severity::High)
    }
}

/// Inspect local ssh-manager and OpenSSH file posture: risky policy settings
/// and permissions looser than owner-only on key material and state files.
pub fn run_local_audit(cfg: &config::Config) -> AuditReport {
    let mut findings = Vec::new();

    if BindPolicy::parse(&cfg.security.bind_policy) == BindPolicy::AllowPublic {
        findings.push(Finding {
            severity: Severity::Medium,
            target: "config.toml".into(),
            message: "public tunnel binds are allowed by default".into(),
            recommendation: "set security.bind_policy to loopback-only".into(),
        });
    }
    if HostKeyPolicy::parse(&cfg.security.host_key_policy) == HostKeyPolicy::Insecure {
        findings.push(Finding {
            severity: Severity::High,
            target: "config.toml".into(),
            message: "host key policy is insecure".into(),
            recommendation: "set security.host_key_policy to strict or accept-new".into(),
        });
    }

    if let Some(home) = dirs::home_dir() {
        check_path_perm(&mut findings, &home.join(".ssh"), 0o700);
        check_path_perm(&mut findings, &home.join(".ssh").join("config"), 0o600);
    }

    if let Ok(dir) = config::config_dir() {
        check_path_perm(&mut findings, &dir, 0o700);
        check_path_perm(&mut findings, &dir.join("config.toml"), 0o600);
        check_path_perm(&mut findings, &dir.join("runtime.json"), 0o600);
    }

    if let Ok(res) = sshconfig::parse_default() {
        let mut seen = std::collections::HashSet::new();
        for host in &res.hosts {
            let Some(identity) = host.identity_file.as_deref() else {
                continue;
            };
            if identity.trim().is_empty() {
                continue;
            }
            let expanded = expand_tilde(identity).into_owned();
            if !seen.insert(expanded.clone()) {
                continue;
            }
            check_path_perm(&mut findings, Path::new(&expanded), 0o600);
        }
    }

    findings.sort_by(|a, b| {
        b.severity
            .rank()
            .cmp(&a.severity.rank())
            .then_with(|| a.target.cmp(&b.target))
            .then_with(|| a.message.cmp(&b.message))
    });
    AuditReport { findings }
}

/// Record a finding when `path` exists with permission bits beyond
/// `max_mode`. Missing paths are fine; the audit only judges what is there.
fn check_path_perm(findings: &mut Vec<Finding>, path: &Path, max_mode: u32) {
    let Ok(meta) = std::fs::metadata(path) else {
        return;
    };
    let mode = meta.permissions().mode() & 0o777;
    if mode & !max_mode != 0 {
        findings.push(Finding {
            severity: Severity::Medium,
            target: redact_message(&path.to_string_lossy()),
            message: format!("permissions {mode:03o} are looser than {max_mode:03o}"),
            recommendation: format!("chmod {max_mode:o} the path"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_policy_normalization() {
        assert_eq!(BindPolicy::parse("allow-public"), BindPolicy::AllowPublic);
        assert_eq!(BindPolicy::parse("loopback-only"), BindPolicy::LoopbackOnly);
        assert_eq!(BindPolicy::parse("bogus"), BindPolicy::LoopbackOnly);
        assert_eq!(BindPolicy::parse(""), BindPolicy::LoopbackOnly);
    }

    #[test]
    fn test_host_key_policy_normalization() {
        assert_eq!(HostKeyPolicy::parse("strict"), HostKeyPolicy::Strict);
        assert_eq!(HostKeyPolicy::parse("ACCEPT-NEW"), HostKeyPolicy::AcceptNew);
        assert_eq!(HostKeyPolicy::parse("insecure"), HostKeyPolicy::Insecure);
        assert_eq!(HostKeyPolicy::parse("whatever"), HostKeyPolicy::Strict);
    }

    #[test]
    fn test_host_key_policy_ssh_options() {
        assert_eq!(
            HostKeyPolicy::AcceptNew.ssh_options(),
            vec!["-o".to_string(), "StrictHostKeyChecking=accept-new".to_string()]
        );
        assert!(HostKeyPolicy::Insecure
            .ssh_options()
            .contains(&"UserKnownHostsFile=/dev/null".to_string()));
    }

    #[test]
    fn test_classified_error_fallback_message() {
        let err = ClassifiedError::new("", "detail");
        assert_eq!(err.user_message(false), "operation failed");
        assert_eq!(err.debug_message(), "detail");
        let err = ClassifiedError::new("visible", "");
        assert_eq!(err.debug_message(), "visible");
    }

    #[test]
    fn test_redact_message_hides_home_and_ssh_paths() {
        let home = dirs::home_dir().unwrap();
        let msg = format!("open {}/.ssh/id_rsa failed", home.display());
        let redacted = redact_message(&msg);
        assert!(!redacted.contains(home.to_string_lossy().as_ref()));
        assert!(redacted.starts_with("open ~"));
        assert!(redacted.contains("/.ssh/[redacted]/"));
    }
}
