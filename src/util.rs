//! Small helpers and tuning constants shared across modules.

use std::borrow::Cow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum nesting level for SSH config `Include` directives.
///
/// Bounds recursion when config files form an include chain that escapes the
/// cycle-detection logic (e.g. symlinks resolving to distinct absolute
/// paths). 16 levels is generous for any real config hierarchy.
pub const MAX_INCLUDE_DEPTH: usize = 16;

/// Dial timeout for a single TCP health probe against a tunnel's local
/// endpoint. Local connections complete well under this unless the tunnel is
/// genuinely unhealthy.
pub const PROBE_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Extra slack on top of [`PROBE_DIAL_TIMEOUT`] for collecting all probe
/// results in one snapshot round. Probes still in flight after this are
/// abandoned and report latency 0.
pub const PROBE_COLLECT_SLACK: Duration = Duration::from_millis(100);

/// Fallback interval in seconds for the dashboard's periodic status refresh.
pub const DEFAULT_REFRESH_SECONDS: u64 = 3;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Return `addr` if non-empty after trimming, otherwise `fallback`.
///
/// Fills in the OpenSSH defaults for omitted forward addresses: `127.0.0.1`
/// on the local side, `localhost` on the remote side. Centralized so tunnel
/// IDs, ssh argv composition, and display strings all agree.
pub fn normalize_addr<'a>(addr: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}

/// Current wall-clock time as milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Return `"-"` for empty or whitespace-only strings, used by table output so
/// optional fields (User, ProxyJump) stay visually aligned.
pub fn empty_dash(s: &str) -> &str {
    if s.trim().is_empty() {
        "-"
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_home() {
        let home = std::env::var("HOME").expect("HOME set in test environment");
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/x/y"), format!("{home}/x/y"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
        assert_eq!(expand_tilde("rel/path"), "rel/path");
    }

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr("", "127.0.0.1"), "127.0.0.1");
        assert_eq!(normalize_addr("   ", "localhost"), "localhost");
        assert_eq!(normalize_addr("0.0.0.0", "127.0.0.1"), "0.0.0.0");
        assert_eq!(normalize_addr(" 10.0.0.1 ", "localhost"), "10.0.0.1");
    }

    #[test]
    fn test_empty_dash() {
        assert_eq!(empty_dash(""), "-");
        assert_eq!(empty_dash("  "), "-");
        assert_eq!(empty_dash("deploy"), "deploy");
    }
}
