//! Persisted tunnel runtime state.
//!
//! The supervisor serializes its entire runtime map to `runtime.json` after
//! every state change: a pretty-printed JSON array, owner-only, since it
//! carries process IDs and host aliases. On startup the file is loaded and
//! reconciled against what is actually running (see the supervisor's
//! restore logic).

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::model::TunnelRuntime;

/// Load/save access to one runtime state file.
pub struct RuntimeStore {
    path: PathBuf,
}

impl RuntimeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all saved records. A missing file means no previous state and
    /// yields an empty list.
    pub async fn load(&self) -> io::Result<Vec<TunnelRuntime>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Replace the file with `records`, creating the parent directory
    /// (0700) and restricting the file to owner-only (0600).
    pub async fn save(&self, records: &[TunnelRuntime]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .await?;
        }
        let body = serde_json::to_vec_pretty(records)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .await?;
        file.write_all(&body).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TunnelState;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn record(id: &str, state: TunnelState, pid: u32) -> TunnelRuntime {
        TunnelRuntime {
            id: id.to_string(),
            host_alias: id.split('|').next().unwrap_or_default().to_string(),
            local: "127.0.0.1:9000".into(),
            remote: "localhost:80".into(),
            state,
            pid,
            uptime_seconds: 0,
            latency_ms: 0,
            last_error: String::new(),
            forward: None,
            started_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = RuntimeStore::new(dir.path().join("runtime.json"));
        let records = vec![
            record("api|127.0.0.1:9000|localhost:80", TunnelState::Up, 41),
            record("db|127.0.0.1:5432|localhost:5432", TunnelState::Down, 0),
        ];
        store.save(&records).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "api|127.0.0.1:9000|localhost:80");
        assert_eq!(loaded[0].state, TunnelState::Up);
        assert_eq!(loaded[0].pid, 41);
        assert_eq!(loaded[1].state, TunnelState::Down);
    }

    #[tokio::test]
    async fn test_file_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let store = RuntimeStore::new(dir.path().join("runtime.json"));
        store.save(&[]).await.unwrap();
        let mode = std::fs::metadata(store.path())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = RuntimeStore::new(dir.path().join("runtime.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_shrinks_previous_content() {
        let dir = TempDir::new().unwrap();
        let store = RuntimeStore::new(dir.path().join("runtime.json"));
        store
            .save(&[record("a|1|1", TunnelState::Down, 0), record("b|2|2", TunnelState::Down, 0)])
            .await
            .unwrap();
        store.save(&[record("a|1|1", TunnelState::Down, 0)]).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }
}
