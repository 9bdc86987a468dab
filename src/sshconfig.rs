//! OpenSSH configuration parser producing structured [`HostEntry`] records.
//!
//! Supports the subset of `ssh_config(5)` that host browsing and tunnel
//! management need: `Host` (with wildcard and negation patterns),
//! `HostName`, `User`, `Port`, `IdentityFile`, `ProxyJump`, `LocalForward`,
//! and recursive `Include` with glob expansion and cycle detection.
//!
//! Parsing is best-effort: malformed directives, missing include targets,
//! cycles, and unparsable forwards become warnings, never failures, so a
//! config with exotic directives still yields every usable host.
//!
//! Block semantics follow OpenSSH: a `Host` line opens a block, directives
//! before the first `Host` line belong to an implicit `*` block, and every
//! block whose patterns match an alias contributes directives to it (last
//! matching value wins, except `LocalForward` which is additive).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::forward::parse_local_forward;
use crate::model::HostEntry;
use crate::util::{expand_tilde, MAX_INCLUDE_DEPTH};

/// Outcome of parsing an SSH config tree.
#[derive(Debug, Default)]
pub struct ParseResult {
    /// Concrete (non-wildcard) host entries, sorted by alias.
    pub hosts: Vec<HostEntry>,
    /// Non-fatal problems encountered along the way.
    pub warnings: Vec<String>,
}

/// Unrecoverable parser failures. Almost everything is downgraded to a
/// warning; these are the exceptions.
#[derive(Debug)]
pub enum ParseError {
    /// The home directory could not be determined for the default path.
    NoHome,
    /// A file could not be read for a reason other than not existing.
    Io { path: PathBuf, source: io::Error },
    /// Include nesting exceeded [`MAX_INCLUDE_DEPTH`].
    DepthExceeded { path: PathBuf },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::NoHome => write!(f, "cannot determine home directory"),
            ParseError::Io { path, source } => {
                write!(f, "read {}: {source}", path.display())
            }
            ParseError::DepthExceeded { path } => write!(
                f,
                "include depth exceeded at {} (max {MAX_INCLUDE_DEPTH})",
                path.display()
            ),
        }
    }
}

impl std::error::Error for ParseError {}

/// One `Host <patterns>` block plus its directives. Directives before the
/// first `Host` line accumulate into an implicit `*` block.
#[derive(Debug)]
struct RawBlock {
    patterns: Vec<String>,
    /// Lowercased directive name → values in file order. Multi-value
    /// directives like `LocalForward` keep every occurrence.
    values: HashMap<String, Vec<String>>,
}

impl RawBlock {
    fn wildcard() -> Self {
        Self {
            patterns: vec!["*".to_string()],
            values: HashMap::new(),
        }
    }

    fn last(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.last()).map(String::as_str)
    }
}

/// Parse the user's default config at `~/.ssh/config`.
pub fn parse_default() -> Result<ParseResult, ParseError> {
    let home = dirs::home_dir().ok_or(ParseError::NoHome)?;
    parse_file(home.join(".ssh").join("config"))
}

/// Parse a config file and everything it includes.
pub fn parse_file(path: impl AsRef<Path>) -> Result<ParseResult, ParseError> {
    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    let mut warnings = Vec::new();
    parse_recursive(path.as_ref(), &mut seen, 0, &mut blocks, &mut warnings)?;
    prevalidate_forwards(&mut blocks, &mut warnings);
    let hosts = compile_hosts(&blocks);
    Ok(ParseResult { hosts, warnings })
}

/// Look up one concrete host from the default config.
pub fn find_host(alias: &str) -> Option<HostEntry> {
    parse_default()
        .ok()?
        .hosts
        .into_iter()
        .find(|h| h.alias == alias)
}

/// Read one file, expanding `Include` directives depth-first. Cycles are
/// detected on absolute paths and skipped with a warning.
fn parse_recursive(
    path: &Path,
    seen: &mut HashSet<PathBuf>,
    depth: usize,
    blocks: &mut Vec<RawBlock>,
    warnings: &mut Vec<String>,
) -> Result<(), ParseError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ParseError::DepthExceeded {
            path: path.to_path_buf(),
        });
    }

    let abs = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(abs.clone()) {
        warnings.push(format!("include cycle skipped: {}", abs.display()));
        return Ok(());
    }

    let content = match std::fs::read_to_string(&abs) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // Optional includes pointing at nothing are routine.
            warnings.push(format!("config file not found: {}", abs.display()));
            return Ok(());
        }
        Err(e) => {
            return Err(ParseError::Io {
                path: abs,
                source: e,
            })
        }
    };

    let mut current = RawBlock::wildcard();
    let mut has_host_decl = false;

    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = strip_inline_comment(line);
        if line.is_empty() {
            continue;
        }

        let Some((key, value)) = split_directive(line) else {
            warnings.push(format!("{}:{line_no} invalid directive", abs.display()));
            continue;
        };
        let lower_key = key.to_ascii_lowercase();

        match lower_key.as_str() {
            "include" => {
                for pattern in value.split_whitespace() {
                    let expanded = expand_tilde(pattern);
                    let mut inc = PathBuf::from(expanded.as_ref());
                    if inc.is_relative() {
                        // Relative includes resolve against the including
                        // file's directory.
                        if let Some(parent) = abs.parent() {
                            inc = parent.join(inc);
                        }
                    }
                    let mut matches: Vec<PathBuf> = match glob::glob(&inc.to_string_lossy()) {
                        Ok(paths) => paths.filter_map(Result::ok).collect(),
                        Err(_) => {
                            warnings.push(format!(
                                "{}:{line_no} bad include pattern {pattern:?}",
                                abs.display()
                            ));
                            continue;
                        }
                    };
                    if matches.is_empty() {
                        warnings.push(format!(
                            "{}:{line_no} include matched nothing: {pattern:?}",
                            abs.display()
                        ));
                    }
                    matches.sort();
                    for m in matches {
                        if let Err(e) = parse_recursive(&m, seen, depth + 1, blocks, warnings) {
                            // A broken include must not sink the rest of the
                            // parse.
                            warnings.push(format!("include {} failed: {e}", m.display()));
                        }
                    }
                }
            }
            "host" => {
                if has_host_decl || !current.values.is_empty() {
                    blocks.push(std::mem::replace(&mut current, RawBlock::wildcard()));
                }
                current.patterns = value.split_whitespace().map(str::to_string).collect();
                current.values.clear();
                has_host_decl = true;
            }
            _ => {
                current
                    .values
                    .entry(lower_key)
                    .or_default()
                    .push(value.to_string());
            }
        }
    }

    // The file may end without a trailing Host line.
    if has_host_decl || !current.values.is_empty() {
        blocks.push(current);
    }
    Ok(())
}

/// Check every `LocalForward` value once, up front, so each offending line
/// produces exactly one warning no matter how many aliases its block
/// matches. Bad values are dropped from the block.
fn prevalidate_forwards(blocks: &mut [RawBlock], warnings: &mut Vec<String>) {
    for block in blocks {
        let Some(values) = block.values.get_mut("localforward") else {
            continue;
        };
        values.retain(|v| match parse_local_forward(v) {
            Ok(_) => true,
            Err(e) => {
                warnings.push(format!("ignoring LocalForward {v:?}: {e}"));
                false
            }
        });
    }
}

/// Resolve blocks into concrete hosts: collect concrete aliases, then merge
/// directives from every matching block in file order.
fn compile_hosts(blocks: &[RawBlock]) -> Vec<HostEntry> {
    let aliases: BTreeSet<&str> = blocks
        .iter()
        .flat_map(|b| b.patterns.iter())
        .filter(|p| is_concrete_alias(p))
        .map(String::as_str)
        .collect();

    let mut hosts = Vec::with_capacity(aliases.len());
    for alias in aliases {
        let mut host = HostEntry::named(alias);
        for block in blocks {
            if !matches_any(alias, &block.patterns) {
                continue;
            }
            if let Some(v) = block.last("hostname") {
                host.host_name = v.to_string();
            }
            if let Some(v) = block.last("user") {
                host.user = Some(v.to_string());
            }
            if let Some(v) = block.last("port") {
                if let Ok(p) = v.parse::<u16>() {
                    if p > 0 {
                        host.port = p;
                    }
                }
            }
            if let Some(v) = block.last("identityfile") {
                host.identity_file = Some(expand_tilde(v).into_owned());
            }
            if let Some(v) = block.last("proxyjump") {
                host.proxy_jump = Some(v.to_string());
            }
            if let Some(values) = block.values.get("localforward") {
                for v in values {
                    // Invalid values were already dropped by
                    // prevalidate_forwards.
                    if let Ok(fwd) = parse_local_forward(v) {
                        host.forwards.push(fwd);
                    }
                }
            }
        }
        hosts.push(host);
    }
    hosts
}

/// Whether `alias` matches the pattern list. A matching negated (`!`)
/// pattern rejects immediately; otherwise any matching plain pattern
/// accepts.
fn matches_any(alias: &str, patterns: &[String]) -> bool {
    let mut matched = false;
    for pattern in patterns {
        let (negated, pat) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern.as_str()),
        };
        if !glob_match(alias, pat) {
            continue;
        }
        if negated {
            return false;
        }
        matched = true;
    }
    matched
}

/// Single glob match supporting `*`, `?`, and `[...]` classes. Invalid or
/// empty patterns match nothing.
fn glob_match(alias: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    glob::Pattern::new(pattern).is_ok_and(|p| p.matches(alias))
}

/// A concrete alias names a host directly: non-empty, no glob
/// metacharacters, not negated.
fn is_concrete_alias(pattern: &str) -> bool {
    !pattern.is_empty()
        && !pattern.starts_with('!')
        && !pattern.contains('*')
        && !pattern.contains('?')
}

/// Split a directive line into key and value on the first whitespace run or
/// `=`, whichever the config author used.
fn split_directive(line: &str) -> Option<(&str, &str)> {
    if let Some(i) = line.find(|c: char| c == ' ' || c == '\t') {
        let key = line[..i].trim();
        let value = line[i + 1..].trim();
        if !key.is_empty() && !value.is_empty() {
            return Some((key, value));
        }
        return None;
    }
    if let Some(i) = line.find('=') {
        let key = line[..i].trim();
        let value = line[i + 1..].trim();
        if i > 0 && !key.is_empty() && !value.is_empty() {
            return Some((key, value));
        }
    }
    None
}

/// Drop an inline `#` comment, leaving `#` inside double quotes alone.
fn strip_inline_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (i, b) in line.bytes().enumerate() {
        match b {
            b'"' => in_quote = !in_quote,
            b'#' if !in_quote => return line[..i].trim_end(),
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_basic_and_wildcard_merge() {
        let dir = TempDir::new().unwrap();
        let root = write(
            &dir,
            "config",
            "User shared\n\
             Host api\n\
             \tHostName 10.0.0.1\n\
             \tPort 2222\n\
             \tLocalForward 9000 localhost:80\n\
             Host db\n\
             \tHostName db.internal\n\
             \tUser dba\n\
             Host *\n\
             \tProxyJump bastion\n",
        );

        let res = parse_file(&root).unwrap();
        assert_eq!(res.warnings, Vec::<String>::new());
        assert_eq!(res.hosts.len(), 2);

        let api = &res.hosts[0];
        assert_eq!(api.alias, "api");
        assert_eq!(api.host_name, "10.0.0.1");
        assert_eq!(api.port, 2222);
        // Pre-Host directives form an implicit "*" block.
        assert_eq!(api.user.as_deref(), Some("shared"));
        assert_eq!(api.proxy_jump.as_deref(), Some("bastion"));
        assert_eq!(api.forwards.len(), 1);
        assert_eq!(api.forwards[0].local_port, 9000);

        let db = &res.hosts[1];
        assert_eq!(db.alias, "db");
        assert_eq!(db.user.as_deref(), Some("dba"));
        assert_eq!(db.port, 22);
    }

    #[test]
    fn test_hosts_sorted_by_alias() {
        let dir = TempDir::new().unwrap();
        let root = write(&dir, "config", "Host zeta\nHost alpha\nHost mid\n");
        let res = parse_file(&root).unwrap();
        let aliases: Vec<&str> = res.hosts.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_include_and_malformed_line() {
        let dir = TempDir::new().unwrap();
        write(&dir, "extra.conf", "Host extra\n\tHostName extra.example\n");
        let root = write(
            &dir,
            "config",
            "Include extra.conf\n\
             Include nothere.conf\n\
             JustOneToken\n\
             Host api\n\tHostName 10.0.0.1\n",
        );

        let res = parse_file(&root).unwrap();
        let aliases: Vec<&str> = res.hosts.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["api", "extra"]);
        assert!(res.warnings.iter().any(|w| w.contains("matched nothing")));
        assert!(res.warnings.iter().any(|w| w.contains("invalid directive")));
    }

    #[test]
    fn test_include_glob_sorted() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("conf.d")).unwrap();
        fs::write(
            dir.path().join("conf.d").join("b.conf"),
            "Host bee\n\tPort 2202\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("conf.d").join("a.conf"),
            "Host ay\n\tPort 2201\n",
        )
        .unwrap();
        let root = write(&dir, "config", "Include conf.d/*.conf\n");
        let res = parse_file(&root).unwrap();
        let aliases: Vec<&str> = res.hosts.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["ay", "bee"]);
    }

    #[test]
    fn test_include_cycle_warns_and_terminates() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.conf", "Include b.conf\nHost froma\n");
        write(&dir, "b.conf", "Include a.conf\nHost fromb\n");
        let res = parse_file(dir.path().join("a.conf")).unwrap();
        let aliases: Vec<&str> = res.hosts.iter().map(|h| h.alias.as_str()).collect();
        assert_eq!(aliases, vec!["froma", "fromb"]);
        assert!(res.warnings.iter().any(|w| w.contains("cycle")));
    }

    #[test]
    fn test_include_depth_bounded() {
        let dir = TempDir::new().unwrap();
        // A chain of 18 files: depths 0..=17; descent must stop at 17 with a
        // warning, not an error or a hang.
        for i in 0..18 {
            let body = if i < 17 {
                format!("Host h{i:02}\nInclude f{:02}.conf\n", i + 1)
            } else {
                format!("Host h{i:02}\n")
            };
            write(&dir, &format!("f{i:02}.conf"), &body);
        }
        let res = parse_file(dir.path().join("f00.conf")).unwrap();
        assert!(res.warnings.iter().any(|w| w.contains("depth")));
        // Hosts up to depth 16 made it in; the file at depth 17 did not.
        assert!(res.hosts.iter().any(|h| h.alias == "h16"));
        assert!(!res.hosts.iter().any(|h| h.alias == "h17"));
    }

    #[test]
    fn test_local_forward_bracketed_ipv6() {
        let dir = TempDir::new().unwrap();
        let root = write(
            &dir,
            "config",
            "Host v6\n\tLocalForward [::1]:9000 [2001:db8::1]:5432\n",
        );
        let res = parse_file(&root).unwrap();
        assert_eq!(res.hosts[0].forwards.len(), 1);
        assert_eq!(res.hosts[0].forwards[0].local_addr, "::1");
        assert_eq!(res.hosts[0].forwards[0].remote_addr, "2001:db8::1");
    }

    #[test]
    fn test_local_forward_unbracketed_ipv6_skipped_with_warning() {
        let dir = TempDir::new().unwrap();
        let root = write(
            &dir,
            "config",
            "Host v6\n\
             \tLocalForward ::1:9000 localhost:80\n\
             \tLocalForward 9001 localhost:81\n",
        );
        let res = parse_file(&root).unwrap();
        // The bad line is dropped, the next valid one still lands.
        assert_eq!(res.hosts[0].forwards.len(), 1);
        assert_eq!(res.hosts[0].forwards[0].local_port, 9001);
        assert_eq!(
            res.warnings
                .iter()
                .filter(|w| w.contains("LocalForward"))
                .count(),
            1
        );
    }

    #[test]
    fn test_negation_pattern_excludes_host() {
        let dir = TempDir::new().unwrap();
        let root = write(
            &dir,
            "config",
            "Host app-prod\nHost app-staging\n\
             Host app-* !app-staging\n\tUser deploy\n",
        );
        let res = parse_file(&root).unwrap();
        let prod = res.hosts.iter().find(|h| h.alias == "app-prod").unwrap();
        let staging = res.hosts.iter().find(|h| h.alias == "app-staging").unwrap();
        assert_eq!(prod.user.as_deref(), Some("deploy"));
        assert_eq!(staging.user, None);
    }

    #[test]
    fn test_equals_syntax_and_inline_comments() {
        let dir = TempDir::new().unwrap();
        let root = write(
            &dir,
            "config",
            "Host api # production box\n\
             \tHostName=api.example.com\n\
             \tUser ops # on-call account\n",
        );
        let res = parse_file(&root).unwrap();
        assert_eq!(res.hosts[0].host_name, "api.example.com");
        assert_eq!(res.hosts[0].user.as_deref(), Some("ops"));
    }

    #[test]
    fn test_last_matching_value_wins() {
        let dir = TempDir::new().unwrap();
        let root = write(
            &dir,
            "config",
            "Host api\n\tPort 2222\n\
             Host *\n\tPort 2200\n",
        );
        let res = parse_file(&root).unwrap();
        // The wildcard block appears later in the file, so its Port wins.
        assert_eq!(res.hosts[0].port, 2200);
    }

    #[test]
    fn test_local_forward_additive_across_blocks() {
        let dir = TempDir::new().unwrap();
        let root = write(
            &dir,
            "config",
            "Host api\n\tLocalForward 9000 localhost:80\n\
             Host api\n\tLocalForward 9001 localhost:81\n",
        );
        let res = parse_file(&root).unwrap();
        assert_eq!(res.hosts.len(), 1);
        assert_eq!(res.hosts[0].forwards.len(), 2);
    }

    #[test]
    fn test_missing_root_is_warning_not_error() {
        let dir = TempDir::new().unwrap();
        let res = parse_file(dir.path().join("nonexistent")).unwrap();
        assert!(res.hosts.is_empty());
        assert!(res.warnings.iter().any(|w| w.contains("not found")));
    }

    #[test]
    fn test_bad_port_value_keeps_default() {
        let dir = TempDir::new().unwrap();
        let root = write(&dir, "config", "Host api\n\tPort notaport\n");
        let res = parse_file(&root).unwrap();
        assert_eq!(res.hosts[0].port, 22);
    }
}
