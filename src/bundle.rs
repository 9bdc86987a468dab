//! Named bundles: saved groups of (host, forward) pairs the user starts as
//! one unit, e.g. everything a staging debug session needs.

use std::collections::BTreeMap;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One member of a bundle: a host alias plus a forward-spec string in the
/// same `LP:RH:RP` / `LA:LP:RH:RP` syntax the CLI accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleItem {
    pub host: String,
    pub forward: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BundleFile {
    #[serde(default)]
    bundles: BTreeMap<String, Vec<BundleItem>>,
}

/// Load/store access to `bundles.json`.
pub struct BundleStore {
    path: PathBuf,
}

impl BundleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bundle names in sorted order.
    pub fn list(&self) -> io::Result<Vec<String>> {
        Ok(self.load()?.bundles.keys().cloned().collect())
    }

    /// Members of one bundle, or None if it does not exist.
    pub fn get(&self, name: &str) -> io::Result<Option<Vec<BundleItem>>> {
        Ok(self.load()?.bundles.get(name).cloned())
    }

    /// Create or replace a bundle.
    pub fn save(&self, name: &str, items: Vec<BundleItem>) -> io::Result<()> {
        let mut file = self.load()?;
        file.bundles.insert(name.to_string(), items);
        self.persist(&file)
    }

    /// Delete a bundle; errors if it does not exist.
    pub fn delete(&self, name: &str) -> io::Result<()> {
        let mut file = self.load()?;
        if file.bundles.remove(name).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("bundle not found: {name}"),
            ));
        }
        self.persist(&file)
    }

    fn load(&self) -> io::Result<BundleFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BundleFile::default()),
            Err(e) => Err(e),
        }
    }

    fn persist(&self, file: &BundleFile) -> io::Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(host: &str, forward: &str) -> BundleItem {
        BundleItem {
            host: host.to_string(),
            forward: forward.to_string(),
        }
    }

    #[test]
    fn test_create_list_delete_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = BundleStore::new(dir.path().join("bundles.json"));
        assert!(store.list().unwrap().is_empty());

        store
            .save(
                "staging",
                vec![
                    item("api", "8080:localhost:80"),
                    item("db", "15432:localhost:5432"),
                ],
            )
            .unwrap();
        store.save("prod", vec![item("api", "9090:localhost:80")]).unwrap();

        assert_eq!(store.list().unwrap(), vec!["prod", "staging"]);
        let staging = store.get("staging").unwrap().unwrap();
        assert_eq!(staging.len(), 2);
        assert_eq!(staging[0].host, "api");

        store.delete("staging").unwrap();
        assert_eq!(store.list().unwrap(), vec!["prod"]);
        assert!(store.get("staging").unwrap().is_none());
        assert!(store.delete("staging").is_err());
    }

    #[test]
    fn test_save_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let store = BundleStore::new(dir.path().join("bundles.json"));
        store.save("dev", vec![item("api", "8080:localhost:80")]).unwrap();
        store.save("dev", vec![item("db", "5433:localhost:5432")]).unwrap();

        let items = store.get("dev").unwrap().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].host, "db");
    }
}
