//! Application configuration and state-file paths.
//!
//! Settings load from `config.toml` in the config directory; a missing file
//! yields compiled defaults and a malformed one is logged and ignored rather
//! than aborting. Out-of-range values are clamped back to defaults and
//! policy strings are normalized on read.
//!
//! ```toml
//! [ui]
//! refresh_seconds = 3
//!
//! [security]
//! bind_policy = "loopback-only"     # or "allow-public"
//! host_key_policy = "strict"        # or "accept-new", "insecure"
//! redact_errors = true
//!
//! [tunnel]
//! auto_restart = true
//! restart_max_attempts = 3
//! restart_backoff_seconds = 2
//! restart_stable_window_seconds = 30
//! ```

use std::io;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::security::{BindPolicy, HostKeyPolicy};
use crate::util::DEFAULT_REFRESH_SECONDS;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Dashboard display settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UiConfig {
    /// Seconds between periodic status refreshes (default 3).
    #[serde(default = "default_refresh_seconds")]
    pub refresh_seconds: u64,
}

/// Security policy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Local bind-address policy (default `loopback-only`).
    #[serde(default = "default_bind_policy")]
    pub bind_policy: String,
    /// Host-key verification mode (default `strict`).
    #[serde(default = "default_host_key_policy")]
    pub host_key_policy: String,
    /// Hide home and `.ssh` path fragments in user-visible errors (default
    /// true).
    #[serde(default = "default_redact_errors")]
    pub redact_errors: bool,
}

/// Tunnel auto-restart settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Restart tunnels that exit unexpectedly (default true).
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    /// Restart attempts per tunnel before quarantine (default 3).
    #[serde(default = "default_restart_max_attempts")]
    pub restart_max_attempts: u32,
    /// Delay before each restart attempt (default 2).
    #[serde(default = "default_restart_backoff_seconds")]
    pub restart_backoff_seconds: u64,
    /// Continuous uptime after which the attempt counter resets (default 30).
    #[serde(default = "default_restart_stable_window_seconds")]
    pub restart_stable_window_seconds: u64,
}

fn default_refresh_seconds() -> u64 {
    DEFAULT_REFRESH_SECONDS
}
fn default_bind_policy() -> String {
    BindPolicy::LoopbackOnly.as_str().to_string()
}
fn default_host_key_policy() -> String {
    HostKeyPolicy::Strict.as_str().to_string()
}
fn default_redact_errors() -> bool {
    true
}
fn default_auto_restart() -> bool {
    true
}
fn default_restart_max_attempts() -> u32 {
    3
}
fn default_restart_backoff_seconds() -> u64 {
    2
}
fn default_restart_stable_window_seconds() -> u64 {
    30
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            refresh_seconds: default_refresh_seconds(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            bind_policy: default_bind_policy(),
            host_key_policy: default_host_key_policy(),
            redact_errors: default_redact_errors(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            auto_restart: default_auto_restart(),
            restart_max_attempts: default_restart_max_attempts(),
            restart_backoff_seconds: default_restart_backoff_seconds(),
            restart_stable_window_seconds: default_restart_stable_window_seconds(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ui: UiConfig::default(),
            security: SecurityConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the config directory. Missing file → defaults;
    /// unreadable or malformed file → warning + defaults. Values are
    /// normalized before returning.
    pub fn load() -> Self {
        let Ok(path) = config_file_path() else {
            return Self::default();
        };
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str::<Config>(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("ignoring malformed {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("cannot read {}: {e}", path.display());
                Self::default()
            }
        };
        cfg.normalize();
        cfg
    }

    /// Clamp out-of-range numbers back to defaults and canonicalize policy
    /// strings (unknown policies silently fall back to the safe default).
    pub fn normalize(&mut self) {
        if self.ui.refresh_seconds == 0 {
            self.ui.refresh_seconds = default_refresh_seconds();
        }
        if self.tunnel.restart_max_attempts == 0 {
            self.tunnel.restart_max_attempts = default_restart_max_attempts();
        }
        if self.tunnel.restart_backoff_seconds == 0 {
            self.tunnel.restart_backoff_seconds = default_restart_backoff_seconds();
        }
        if self.tunnel.restart_stable_window_seconds == 0 {
            self.tunnel.restart_stable_window_seconds = default_restart_stable_window_seconds();
        }
        self.security.bind_policy = BindPolicy::parse(&self.security.bind_policy)
            .as_str()
            .to_string();
        self.security.host_key_policy = HostKeyPolicy::parse(&self.security.host_key_policy)
            .as_str()
            .to_string();
    }

    /// The normalized bind policy.
    pub fn bind_policy(&self) -> BindPolicy {
        BindPolicy::parse(&self.security.bind_policy)
    }

    /// The normalized host-key policy.
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        HostKeyPolicy::parse(&self.security.host_key_policy)
    }
}

/// The application config directory: `$XDG_CONFIG_HOME/ssh-manager` when
/// set, otherwise `~/.config/ssh-manager`.
pub fn config_dir() -> io::Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg).join("ssh-manager"));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "cannot determine home directory")
    })?;
    Ok(home.join(".config").join("ssh-manager"))
}

/// Full path to `config.toml`.
pub fn config_file_path() -> io::Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Full path to the persisted runtime state.
pub fn runtime_file_path() -> io::Result<PathBuf> {
    Ok(config_dir()?.join("runtime.json"))
}

/// Full path to the lifecycle event journal.
pub fn events_file_path() -> io::Result<PathBuf> {
    Ok(config_dir()?.join("events.jsonl"))
}

/// Full path to the recent-host history store.
pub fn history_file_path() -> io::Result<PathBuf> {
    Ok(config_dir()?.join("history.json"))
}

/// Full path to the named-bundle store.
pub fn bundles_file_path() -> io::Result<PathBuf> {
    Ok(config_dir()?.join("bundles.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.ui.refresh_seconds, 3);
        assert_eq!(cfg.security.bind_policy, "loopback-only");
        assert_eq!(cfg.security.host_key_policy, "strict");
        assert!(cfg.security.redact_errors);
        assert!(cfg.tunnel.auto_restart);
        assert_eq!(cfg.tunnel.restart_max_attempts, 3);
        assert_eq!(cfg.tunnel.restart_backoff_seconds, 2);
        assert_eq!(cfg.tunnel.restart_stable_window_seconds, 30);
    }

    #[test]
    fn test_normalize_clamps_and_canonicalizes() {
        let mut cfg: Config = toml::from_str(
            r#"
            [ui]
            refresh_seconds = 0

            [security]
            bind_policy = "whatever"
            host_key_policy = "Accept-New"

            [tunnel]
            restart_max_attempts = 0
            restart_backoff_seconds = 0
            restart_stable_window_seconds = 0
            "#,
        )
        .unwrap();
        cfg.normalize();
        assert_eq!(cfg.ui.refresh_seconds, 3);
        assert_eq!(cfg.security.bind_policy, "loopback-only");
        assert_eq!(cfg.security.host_key_policy, "accept-new");
        assert_eq!(cfg.tunnel.restart_max_attempts, 3);
        assert_eq!(cfg.tunnel.restart_backoff_seconds, 2);
        assert_eq!(cfg.tunnel.restart_stable_window_seconds, 30);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str("[tunnel]\nauto_restart = false\n").unwrap();
        assert!(!cfg.tunnel.auto_restart);
        assert_eq!(cfg.tunnel.restart_max_attempts, 3);
        assert_eq!(cfg.security.host_key_policy, "strict");
    }

    #[test]
    fn test_config_dir_honors_xdg() {
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-test");
        let dir = config_dir().unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/xdg-test/ssh-manager"));
        std::env::remove_var("XDG_CONFIG_HOME");
    }
}
