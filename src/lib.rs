#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! ssh-manager library: browse hosts from `~/.ssh/config`, open sessions,
//! and supervise background port-forwarding tunnels over the system `ssh`
//! binary.
//!
//! The key building blocks:
//! - `sshconfig` — OpenSSH config parser (Host blocks, Include, patterns)
//! - `forward` — forward-spec endpoint parsing and canonicalization
//! - `model` — shared value types (`HostEntry`, `ForwardSpec`, `TunnelRuntime`)
//! - `launcher` — spawns `ssh -N -L ...` children, bound to a cancel token
//! - `supervisor` — tunnel lifecycle, health probing, auto-restart, recovery
//! - `events` — append-only lifecycle journal (`events.jsonl`)
//! - `store` — persisted runtime state (`runtime.json`)
//! - `security` — bind/host-key policy, error classification, local audit
//! - `bundle`, `history`, `doctor` — convenience layers over the supervisor

pub mod bundle;
pub mod config;
pub mod doctor;
pub mod events;
pub mod forward;
pub mod history;
pub mod launcher;
pub mod model;
pub mod security;
pub mod sshconfig;
pub mod store;
pub mod supervisor;
pub mod util;
