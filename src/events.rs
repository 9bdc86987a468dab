//! Append-only journal of tunnel lifecycle events.
//!
//! One JSON object per line in `events.jsonl`, owner-only. Appends are a
//! single `write_all` on an `O_APPEND` descriptor, so concurrent writers
//! cannot interleave within a line. Reads are filtered and bounded;
//! malformed lines are skipped silently so a damaged journal still yields
//! everything readable.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::model::TunnelState;

/// One tunnel lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_alias: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TunnelState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pid: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Event {
    /// A new event stamped with the current UTC time.
    pub fn new(event_type: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            tunnel_id: String::new(),
            host_alias: String::new(),
            event_type: event_type.to_string(),
            state: None,
            message: String::new(),
            pid: 0,
        }
    }

    pub fn tunnel(mut self, id: &str, alias: &str) -> Self {
        self.tunnel_id = id.to_string();
        self.host_alias = alias.to_string();
        self
    }

    pub fn state(mut self, state: TunnelState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }
}

/// Filters for [`EventStore::read`]. Empty/None fields match everything;
/// `limit > 0` keeps only the last N matching events.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub host_alias: Option<String>,
    pub tunnel_id: Option<String>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Query {
    fn matches(&self, evt: &Event) -> bool {
        if let Some(host) = self.host_alias.as_deref() {
            if !host.trim().is_empty() && evt.host_alias != host {
                return false;
            }
        }
        if let Some(id) = self.tunnel_id.as_deref() {
            if !id.trim().is_empty() && evt.tunnel_id != id {
                return false;
            }
        }
        if let Some(kind) = self.event_type.as_deref() {
            if !kind.trim().is_empty() && evt.event_type != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if evt.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Append/read access to one journal file.
pub struct EventStore {
    path: PathBuf,
}

impl EventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single JSON line.
    pub async fn append(&self, event: &Event) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .await?;
        }
        let mut line = serde_json::to_vec(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read events in append order, filtered by `query`. A missing journal
    /// is an empty result, not an error.
    pub async fn read(&self, query: &Query) -> io::Result<Vec<Event>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(evt) = serde_json::from_str::<Event>(line) else {
                continue;
            };
            if !query.matches(&evt) {
                continue;
            }
            out.push(evt);
            if query.limit > 0 && out.len() > query.limit {
                // Sliding window: keep the most recent N.
                out.remove(0);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> EventStore {
        EventStore::new(dir.path().join("events.jsonl"))
    }

    #[tokio::test]
    async fn test_append_read_and_filters() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .append(
                &Event::new("start_succeeded")
                    .tunnel("api|127.0.0.1:9000|localhost:80", "api")
                    .state(TunnelState::Up)
                    .pid(41),
            )
            .await
            .unwrap();
        store
            .append(
                &Event::new("stop_succeeded")
                    .tunnel("api|127.0.0.1:9000|localhost:80", "api")
                    .state(TunnelState::Down),
            )
            .await
            .unwrap();
        store
            .append(&Event::new("start_succeeded").tunnel("db|127.0.0.1:5432|localhost:5432", "db"))
            .await
            .unwrap();

        let all = store.read(&Query::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        // Append order is preserved.
        assert_eq!(all[0].event_type, "start_succeeded");
        assert_eq!(all[1].event_type, "stop_succeeded");

        let api = store
            .read(&Query {
                host_alias: Some("api".into()),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(api.len(), 2);

        let stops = store
            .read(&Query {
                event_type: Some("stop_succeeded".into()),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].state, Some(TunnelState::Down));
    }

    #[tokio::test]
    async fn test_limit_keeps_last_n() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for i in 0..5 {
            store
                .append(&Event::new("start_requested").message(format!("n{i}")))
                .await
                .unwrap();
        }
        let out = store
            .read(&Query {
                limit: 2,
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "n3");
        assert_eq!(out[1].message, "n4");
    }

    #[tokio::test]
    async fn test_since_filter() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut old = Event::new("start_requested");
        old.timestamp = Utc::now() - Duration::hours(2);
        store.append(&old).await.unwrap();
        store.append(&Event::new("start_succeeded")).await.unwrap();

        let recent = store
            .read(&Query {
                since: Some(Utc::now() - Duration::hours(1)),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "start_succeeded");
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.append(&Event::new("start_succeeded")).await.unwrap();
        tokio::fs::write(
            store.path(),
            format!(
                "{}\nnot json at all\n{{\"event_type\":\"quarantined\"}}\n",
                tokio::fs::read_to_string(store.path()).await.unwrap().trim()
            ),
        )
        .await
        .unwrap();

        let out = store.read(&Query::default()).await.unwrap();
        assert_eq!(out.len(), 2);
        // The minimal line deserialized with a defaulted timestamp.
        assert_eq!(out[1].event_type, "quarantined");
    }

    #[tokio::test]
    async fn test_missing_journal_reads_empty() {
        let dir = TempDir::new().unwrap();
        let out = store(&dir).read(&Query::default()).await.unwrap();
        assert!(out.is_empty());
    }
}
