//! Recent-host history: remembers when each alias was last used so the
//! host list can lead with what the user actually connects to.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::HostEntry;

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    /// Alias → last successful activity, seconds since the UNIX epoch.
    #[serde(default)]
    last_used: HashMap<String, i64>,
}

/// Load/store access to `history.json`.
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record successful activity for `alias` right now.
    pub fn touch(&self, alias: &str) -> io::Result<()> {
        let mut file = self.load()?;
        file.last_used
            .insert(alias.to_string(), chrono::Utc::now().timestamp());
        self.save(&file)
    }

    /// Last-used timestamps by alias.
    pub fn last_used(&self) -> io::Result<HashMap<String, i64>> {
        Ok(self.load()?.last_used)
    }

    fn load(&self) -> io::Result<HistoryFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => {
                // A corrupt history is not worth failing a command over.
                Ok(serde_json::from_str(&raw).unwrap_or_default())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HistoryFile::default()),
            Err(e) => Err(e),
        }
    }

    fn save(&self, file: &HistoryFile) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .ok();
        }
        let body = serde_json::to_vec_pretty(file)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, body)
    }
}

/// Hosts ordered by recent activity (newest first), then alias.
pub fn sort_hosts_recent(
    mut hosts: Vec<HostEntry>,
    last_used: &HashMap<String, i64>,
) -> Vec<HostEntry> {
    hosts.sort_by(|a, b| {
        let ta = last_used.get(&a.alias).copied().unwrap_or(0);
        let tb = last_used.get(&b.alias).copied().unwrap_or(0);
        tb.cmp(&ta).then_with(|| a.alias.cmp(&b.alias))
    });
    hosts
}
