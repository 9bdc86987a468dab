#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

//! # ssh-manager
//!
//! Browse hosts from `~/.ssh/config`, open interactive sessions, and
//! supervise background local port-forwarding tunnels driven through the
//! system `ssh` binary.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `list` | List parsed hosts (`--recent` orders by history) |
//! | `connect <host>` | Interactive ssh session |
//! | `tunnel up <host>` | Start tunnel(s) for a host |
//! | `tunnel down <id\|host>` | Stop one tunnel or all for a host |
//! | `tunnel status` | Tunnel table, `--json` for the stable contract |
//! | `tunnel restart <id\|host>` | Stop + start with a fresh config read |
//! | `tunnel recover <id\|host>` | Clear quarantine and start again |
//! | `tunnel check <host>` | Read-only preflight checks |
//! | `tunnel events` | Filtered lifecycle journal |
//! | `bundle ...` | Named groups of tunnels |
//! | `doctor` | Local diagnostics |
//! | `audit` | Security posture audit |

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::warn;

use ssh_manager::bundle::{BundleItem, BundleStore};
use ssh_manager::config::{self, Config};
use ssh_manager::doctor;
use ssh_manager::events::Query;
use ssh_manager::forward::parse_forward_arg;
use ssh_manager::history::{sort_hosts_recent, History};
use ssh_manager::launcher::{SystemSsh, TunnelLauncher};
use ssh_manager::model::{ForwardSpec, HostEntry, TunnelRuntime};
use ssh_manager::security::{self, HostKeyPolicy};
use ssh_manager::sshconfig;
use ssh_manager::supervisor::{RestartPolicy, Supervisor};
use ssh_manager::util::empty_dash;

/// Modern SSH config and tunnel manager.
#[derive(Parser)]
#[command(name = "ssh-manager", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List parsed hosts from ~/.ssh/config.
    List {
        /// Order by recent activity instead of alphabetically.
        #[arg(long)]
        recent: bool,
        #[arg(long)]
        json: bool,
    },
    /// Open an interactive ssh session to a host.
    Connect { host: String },
    /// Manage SSH tunnels.
    Tunnel {
        #[command(subcommand)]
        command: TunnelCommands,
    },
    /// Manage named tunnel bundles.
    Bundle {
        #[command(subcommand)]
        command: BundleCommands,
    },
    /// Run local diagnostics.
    Doctor {
        #[arg(long)]
        json: bool,
    },
    /// Audit local security posture.
    Audit {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TunnelCommands {
    /// Start tunnel(s) for a host.
    Up {
        /// Host alias from ssh config. Omit when using --target.
        host: Option<String>,
        /// Forward index (0-based) or explicit spec
        /// localPort:remoteHost:remotePort.
        #[arg(long)]
        forward: Option<String>,
        /// Ad-hoc destination `[user@]host[:port]` instead of a configured
        /// alias.
        #[arg(long)]
        target: Option<String>,
        /// Allow 0.0.0.0/:: local binds for this command only.
        #[arg(long)]
        allow_public_bind: bool,
        /// Host key policy override: strict, accept-new, insecure.
        #[arg(long)]
        host_key_policy: Option<String>,
    },
    /// Stop a tunnel by id, or all tunnels for a host.
    Down { target: String },
    /// Show tunnel status.
    Status {
        #[arg(long)]
        json: bool,
        /// Only tunnels for this host alias.
        #[arg(long)]
        host: Option<String>,
        /// Only tunnels in this state.
        #[arg(long)]
        state: Option<String>,
    },
    /// Restart a tunnel by id, or all tunnels for a host.
    Restart {
        target: String,
        #[arg(long)]
        allow_public_bind: bool,
        #[arg(long)]
        host_key_policy: Option<String>,
    },
    /// Recover quarantined tunnel(s) by id or host.
    Recover { target: String },
    /// Run tunnel preflight checks for a host's forwards.
    Check {
        host: String,
        #[arg(long)]
        forward: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show tunnel lifecycle events.
    Events {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Only events at or after this RFC3339 timestamp.
        #[arg(long)]
        since: Option<String>,
        /// Keep only the last N matching events (0 = all).
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum BundleCommands {
    /// List saved bundles.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Create or replace a bundle from `host=forwardspec` members.
    Create {
        name: String,
        /// Members, each `<host>=<localPort:remoteHost:remotePort>`.
        #[arg(required = true)]
        members: Vec<String>,
    },
    /// Run a bundle and start its tunnels.
    Run { name: String },
    /// Delete a bundle.
    Delete { name: String },
}

type CliError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let cfg = Config::load();
    match cli.command {
        Commands::List { recent, json } => cmd_list(recent, json),
        Commands::Connect { host } => cmd_connect(&host),
        Commands::Tunnel { command } => run_tunnel(&cfg, command).await,
        Commands::Bundle { command } => run_bundle(&cfg, command).await,
        Commands::Doctor { json } => {
            let (sup, launcher) = build_supervisor(&cfg).await?;
            let report = doctor::run(&cfg, launcher.as_ref(), &sup).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.issues.is_empty() {
                println!("no issues found");
            } else {
                for issue in &report.issues {
                    println!(
                        "[{}] {} {}: {} ({})",
                        issue.severity.as_str(),
                        issue.check,
                        issue.target,
                        issue.message,
                        issue.recommendation
                    );
                }
            }
            Ok(())
        }
        Commands::Audit { json } => {
            let report = security::run_local_audit(&cfg);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.findings.is_empty() {
                println!("no findings");
            } else {
                for finding in &report.findings {
                    println!(
                        "[{}] {}: {} ({})",
                        finding.severity.as_str(),
                        finding.target,
                        finding.message,
                        finding.recommendation
                    );
                }
            }
            if report.has_high() {
                return Err("audit found high-severity issues".into());
            }
            Ok(())
        }
    }
}

/// Wire a supervisor to the system launcher with all configured policies
/// applied, and restore persisted runtime state.
async fn build_supervisor(cfg: &Config) -> Result<(Supervisor, Arc<SystemSsh>), CliError> {
    let dir = config::config_dir()?;
    let launcher = Arc::new(SystemSsh::new());
    launcher.set_host_key_policy(cfg.host_key_policy());

    let sup = Supervisor::new(
        Arc::clone(&launcher) as Arc<dyn TunnelLauncher>,
        &dir,
    );
    sup.set_bind_policy(cfg.bind_policy());
    sup.set_redact_errors(cfg.security.redact_errors);
    sup.set_restart_policy(RestartPolicy {
        enabled: cfg.tunnel.auto_restart,
        max_attempts: cfg.tunnel.restart_max_attempts,
        backoff: Duration::from_secs(cfg.tunnel.restart_backoff_seconds),
        stable_window: Duration::from_secs(cfg.tunnel.restart_stable_window_seconds),
    });
    sup.load_runtime().await?;
    Ok((sup, launcher))
}

fn cmd_list(recent: bool, json: bool) -> Result<(), CliError> {
    let res = sshconfig::parse_default()?;
    for warning in &res.warnings {
        eprintln!("warning: {}", security::redact_message(warning));
    }

    let hosts = if recent {
        let history = History::new(config::history_file_path()?);
        sort_hosts_recent(res.hosts, &history.last_used()?)
    } else {
        res.hosts
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&hosts)?);
        return Ok(());
    }
    println!(
        "{:<20} {:<30} {:<12} {:>5}  {}",
        "ALIAS", "TARGET", "USER", "PORT", "FORWARDS"
    );
    for host in &hosts {
        let forwards = host
            .forwards
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{:<20} {:<30} {:<12} {:>5}  {}",
            host.alias,
            host.display_target(),
            empty_dash(host.user.as_deref().unwrap_or("")),
            host.port,
            empty_dash(&forwards)
        );
    }
    Ok(())
}

fn cmd_connect(alias: &str) -> Result<(), CliError> {
    let launcher = SystemSsh::new();
    launcher.ensure_binary()?;
    let host = find_host_required(alias)?;
    let status = launcher.connect_command(&host).status()?;
    if !status.success() {
        return Err(format!("ssh exited with {status}").into());
    }
    Ok(())
}

async fn run_tunnel(cfg: &Config, command: TunnelCommands) -> Result<(), CliError> {
    match command {
        TunnelCommands::Up {
            host,
            forward,
            target,
            allow_public_bind,
            host_key_policy,
        } => {
            let entry = match (host, target) {
                (Some(alias), None) => find_host_required(&alias)?,
                (None, Some(target)) => parse_ad_hoc_target(&target)?,
                _ => return Err("pass a host alias or --target (not both)".into()),
            };
            let (sup, launcher) = build_supervisor(cfg).await?;
            launcher.ensure_binary()?;
            if let Some(policy) = host_key_policy.as_deref() {
                launcher.set_host_key_policy(HostKeyPolicy::parse(policy));
            }

            let forwards = resolve_forwards(&entry, forward.as_deref())?;
            let history = History::new(config::history_file_path()?);
            for fwd in &forwards {
                sup.set_allow_public_bind(allow_public_bind);
                let rt = sup.start(&entry, fwd).await?;
                if let Err(e) = history.touch(&entry.alias) {
                    warn!("failed to record history: {e}");
                }
                println!("started {} pid={} {} -> {}", rt.id, rt.pid, rt.local, rt.remote);
            }
            Ok(())
        }
        TunnelCommands::Down { target } => {
            let (sup, _) = build_supervisor(cfg).await?;
            // Tunnel ids contain '|'; anything else is a host alias.
            if target.contains('|') {
                sup.stop(&target).await?;
                println!("stopped {target}");
            } else {
                let count = sup.stop_by_host(&target).await?;
                println!("stopped {count} tunnel(s) for host {target}");
            }
            Ok(())
        }
        TunnelCommands::Status { json, host, state } => {
            let (sup, _) = build_supervisor(cfg).await?;
            let mut snapshot: Vec<TunnelRuntime> = sup
                .snapshot()
                .await
                .into_iter()
                .filter(|rt| host.as_deref().map_or(true, |h| rt.host_alias == h))
                .filter(|rt| {
                    state
                        .as_deref()
                        .map_or(true, |s| rt.state.as_str().eq_ignore_ascii_case(s))
                })
                .collect();
            snapshot.sort_by(|a, b| a.id.cmp(&b.id));

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                return Ok(());
            }
            if snapshot.is_empty() {
                println!("no tunnels");
                return Ok(());
            }
            println!(
                "{:<46} {:<12} {:>7} {:>8} {:>8}  {}",
                "ID", "STATE", "PID", "UPTIME", "LATENCY", "LAST ERROR"
            );
            for rt in &snapshot {
                println!(
                    "{:<46} {:<12} {:>7} {:>7}s {:>6}ms  {}",
                    rt.id,
                    rt.state.as_str(),
                    rt.pid,
                    rt.uptime_seconds,
                    rt.latency_ms,
                    empty_dash(&rt.last_error)
                );
            }
            Ok(())
        }
        TunnelCommands::Restart {
            target,
            allow_public_bind,
            host_key_policy,
        } => {
            let (sup, launcher) = build_supervisor(cfg).await?;
            if let Some(policy) = host_key_policy.as_deref() {
                launcher.set_host_key_policy(HostKeyPolicy::parse(policy));
            }

            let ids: Vec<String> = if target.contains('|') {
                vec![target]
            } else {
                let mut ids: Vec<String> = sup
                    .snapshot()
                    .await
                    .into_iter()
                    .filter(|rt| rt.host_alias == target)
                    .map(|rt| rt.id)
                    .collect();
                ids.sort();
                if ids.is_empty() {
                    return Err(format!("no tunnels found for {target}").into());
                }
                ids
            };
            for id in ids {
                sup.set_allow_public_bind(allow_public_bind);
                let rt = sup.restart(&id).await?;
                println!("restarted {} pid={}", rt.id, rt.pid);
            }
            Ok(())
        }
        TunnelCommands::Recover { target } => {
            let (sup, _) = build_supervisor(cfg).await?;
            let recovered = if target.contains('|') {
                vec![sup.recover(&target).await?]
            } else {
                sup.recover_by_host(&target).await?
            };
            for rt in &recovered {
                println!("recovered {} pid={}", rt.id, rt.pid);
            }
            Ok(())
        }
        TunnelCommands::Check {
            host,
            forward,
            json,
        } => {
            let entry = find_host_required(&host)?;
            let (sup, _) = build_supervisor(cfg).await?;
            let forwards = resolve_forwards(&entry, forward.as_deref())?;
            let reports: Vec<_> = forwards
                .iter()
                .map(|fwd| sup.preflight(&entry, fwd))
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for (fwd, report) in forwards.iter().zip(&reports) {
                    println!(
                        "{} {}:",
                        if report.ok { "PASS" } else { "FAIL" },
                        fwd
                    );
                    for finding in &report.findings {
                        println!(
                            "  [{}] {}: {}",
                            if finding.ok { "ok" } else { "!!" },
                            finding.check,
                            finding.message
                        );
                    }
                }
            }
            if reports.iter().any(|r| !r.ok) {
                return Err("preflight checks failed".into());
            }
            Ok(())
        }
        TunnelCommands::Events {
            host,
            id,
            event_type,
            since,
            limit,
            json,
        } => {
            let since = match since.as_deref() {
                Some(raw) => Some(
                    DateTime::parse_from_rfc3339(raw)
                        .map_err(|e| format!("invalid --since timestamp: {e}"))?
                        .with_timezone(&Utc),
                ),
                None => None,
            };
            let (sup, _) = build_supervisor(cfg).await?;
            let events = sup
                .events(&Query {
                    host_alias: host,
                    tunnel_id: id,
                    event_type,
                    since,
                    limit,
                })
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
                return Ok(());
            }
            for evt in &events {
                println!(
                    "{} {:<18} {:<46} {}",
                    evt.timestamp.to_rfc3339(),
                    evt.event_type,
                    empty_dash(&evt.tunnel_id),
                    empty_dash(&evt.message)
                );
            }
            Ok(())
        }
    }
}

async fn run_bundle(cfg: &Config, command: BundleCommands) -> Result<(), CliError> {
    let store = BundleStore::new(config::bundles_file_path()?);
    match command {
        BundleCommands::List { json } => {
            let names = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else if names.is_empty() {
                println!("no bundles");
            } else {
                for name in &names {
                    let count = store.get(name)?.map(|items| items.len()).unwrap_or(0);
                    println!("{name} ({count} tunnel(s))");
                }
            }
            Ok(())
        }
        BundleCommands::Create { name, members } => {
            let mut items = Vec::with_capacity(members.len());
            for member in &members {
                let Some((host, forward)) = member.split_once('=') else {
                    return Err(format!(
                        "invalid member {member:?}: expected <host>=<forwardspec>"
                    )
                    .into());
                };
                // Validate the spec now so `bundle run` cannot trip on it.
                parse_forward_arg(forward)?;
                items.push(BundleItem {
                    host: host.to_string(),
                    forward: forward.to_string(),
                });
            }
            let count = items.len();
            store.save(&name, items)?;
            println!("saved bundle {name} with {count} tunnel(s)");
            Ok(())
        }
        BundleCommands::Run { name } => {
            let Some(items) = store.get(&name)? else {
                return Err(format!("bundle not found: {name}").into());
            };
            let (sup, launcher) = build_supervisor(cfg).await?;
            launcher.ensure_binary()?;

            let total = items.len();
            let mut started = 0usize;
            for item in items {
                let outcome = async {
                    let host = find_host_required(&item.host)?;
                    let fwd = parse_forward_arg(&item.forward)?;
                    sup.start(&host, &fwd).await.map_err(CliError::from)
                }
                .await;
                match outcome {
                    Ok(rt) => {
                        started += 1;
                        println!("started {} pid={}", rt.id, rt.pid);
                    }
                    Err(e) => eprintln!("failed {}={}: {e}", item.host, item.forward),
                }
            }
            println!("bundle {name}: started {started}/{total}");
            if started < total {
                return Err(format!("bundle {name}: {started}/{total} tunnels started").into());
            }
            Ok(())
        }
        BundleCommands::Delete { name } => {
            store.delete(&name)?;
            println!("deleted bundle {name}");
            Ok(())
        }
    }
}

/// Look up a concrete host from ssh config.
fn find_host_required(alias: &str) -> Result<HostEntry, CliError> {
    let res = sshconfig::parse_default()?;
    res.hosts
        .into_iter()
        .find(|h| h.alias == alias)
        .ok_or_else(|| format!("host not found in ssh config: {alias}").into())
}

/// The forwards to act on: all of the host's configured forwards, a
/// 0-based index into them, or an explicit spec string.
fn resolve_forwards(
    host: &HostEntry,
    forward: Option<&str>,
) -> Result<Vec<ForwardSpec>, CliError> {
    match forward {
        None => {
            if host.forwards.is_empty() {
                return Err(format!(
                    "host {} has no LocalForward entries; pass --forward",
                    host.alias
                )
                .into());
            }
            Ok(host.forwards.clone())
        }
        Some(raw) => {
            if let Ok(index) = raw.parse::<usize>() {
                return host.forwards.get(index).cloned().map(|f| vec![f]).ok_or_else(
                    || {
                        format!(
                            "forward index {index} out of range ({} configured)",
                            host.forwards.len()
                        )
                        .into()
                    },
                );
            }
            Ok(vec![parse_forward_arg(raw)?])
        }
    }
}

/// Build a session-only host entry from `[user@]host[:port]`.
fn parse_ad_hoc_target(target: &str) -> Result<HostEntry, CliError> {
    let target = target.trim();
    if target.is_empty() {
        return Err("empty --target".into());
    }
    let (user, rest) = match target.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => return Err("empty user in --target".into()),
        None => (None, target),
    };
    let (host_name, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) if port_str.chars().all(|c| c.is_ascii_digit()) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| format!("invalid port in --target: {port_str}"))?;
            if port == 0 {
                return Err("port in --target must be 1-65535".into());
            }
            (host.to_string(), port)
        }
        _ => (rest.to_string(), 22),
    };
    if host_name.is_empty() {
        return Err("empty host in --target".into());
    }
    Ok(HostEntry {
        alias: target.to_string(),
        host_name,
        user,
        port,
        identity_file: None,
        proxy_jump: None,
        forwards: Vec::new(),
        ad_hoc: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ad_hoc_target_full() {
        let host = parse_ad_hoc_target("deploy@10.1.2.3:2222").unwrap();
        assert!(host.ad_hoc);
        assert_eq!(host.user.as_deref(), Some("deploy"));
        assert_eq!(host.host_name, "10.1.2.3");
        assert_eq!(host.port, 2222);
        assert_eq!(host.alias, "deploy@10.1.2.3:2222");
    }

    #[test]
    fn test_parse_ad_hoc_target_minimal() {
        let host = parse_ad_hoc_target("example.com").unwrap();
        assert_eq!(host.user, None);
        assert_eq!(host.host_name, "example.com");
        assert_eq!(host.port, 22);
    }

    #[test]
    fn test_parse_ad_hoc_target_rejects_bad_input() {
        assert!(parse_ad_hoc_target("").is_err());
        assert!(parse_ad_hoc_target("@host").is_err());
        assert!(parse_ad_hoc_target("user@host:0").is_err());
    }

    #[test]
    fn test_resolve_forwards_index_and_spec() {
        let mut host = HostEntry::named("api");
        host.forwards.push(ForwardSpec {
            local_addr: "127.0.0.1".into(),
            local_port: 9000,
            remote_addr: "localhost".into(),
            remote_port: 80,
        });

        let by_index = resolve_forwards(&host, Some("0")).unwrap();
        assert_eq!(by_index[0].local_port, 9000);
        assert!(resolve_forwards(&host, Some("3")).is_err());

        let by_spec = resolve_forwards(&host, Some("5432:localhost:5432")).unwrap();
        assert_eq!(by_spec[0].local_port, 5432);

        let all = resolve_forwards(&host, None).unwrap();
        assert_eq!(all.len(), 1);

        let empty = HostEntry::named("bare");
        assert!(resolve_forwards(&empty, None).is_err());
    }
}
