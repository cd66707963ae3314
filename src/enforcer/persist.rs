//! Persistent diversion state.
//!
//! Redirect and block rules are serialized to one JSON file under the runtime
//! directory so they can be deleted after a restart without re-parsing kernel
//! state. The file is rewritten with the atomic-rename discipline (write
//! sibling `.tmp`, rename over) and an unparseable file is treated as empty:
//! it is only truthful about rules this engine installed itself.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Everything required to delete one installed rule later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiversionRecord {
    /// Packet-filter backend kind (`iptables`)
    pub backend: String,
    pub table: String,
    pub chain: String,
    /// Exact argv tail replayed with `-D` to delete the rule
    pub rule_spec: Vec<String>,
    #[serde(default)]
    pub dest_port: Option<u16>,
    #[serde(default)]
    pub canary_ip: Option<String>,
    /// `redirect` or `block`
    pub action: String,
}

/// Atomic-rename JSON store keyed by source address.
#[derive(Debug)]
pub struct DiversionStore {
    path: PathBuf,
}

impl DiversionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the persisted map; corruption degrades to empty.
    pub fn load(&self) -> HashMap<String, DiversionRecord> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return HashMap::new(),
        };
        match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!("Diversion state {:?} unreadable ({}), treating as empty", self.path, e);
                HashMap::new()
            }
        }
    }

    /// Replace the file atomically with the given map.
    pub fn save(&self, map: &HashMap<String, DiversionRecord>) -> bool {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Cannot create runtime dir {:?}: {}", parent, e);
                return false;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let serialized = match serde_json::to_string(map) {
            Ok(s) => s,
            Err(e) => {
                warn!("Cannot serialize diversion state: {}", e);
                return false;
            }
        };

        if let Err(e) = std::fs::write(&tmp, serialized) {
            warn!("Cannot write {:?}: {}", tmp, e);
            return false;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!("Cannot rename {:?} into place: {}", tmp, e);
            return false;
        }
        true
    }

    /// Insert or replace one record.
    pub fn upsert(&self, ip: &str, record: DiversionRecord) -> bool {
        let mut map = self.load();
        map.insert(ip.to_string(), record);
        let ok = self.save(&map);
        if ok {
            debug!("Persisted {} diversion for {}", map[ip].action, ip);
        }
        ok
    }

    /// Drop the record for one source, if present.
    pub fn remove(&self, ip: &str) -> bool {
        let mut map = self.load();
        if map.remove(ip).is_none() {
            return true;
        }
        self.save(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: &str) -> DiversionRecord {
        DiversionRecord {
            backend: "iptables".to_string(),
            table: if action == "redirect" { "nat" } else { "filter" }.to_string(),
            chain: if action == "redirect" { "PREROUTING" } else { "INPUT" }.to_string(),
            rule_spec: vec!["-s".into(), "203.0.113.7".into(), "-j".into(), "DROP".into()],
            dest_port: None,
            canary_ip: Some("172.16.10.10".to_string()),
            action: action.to_string(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiversionStore::new(dir.path().join("diversions.json"));

        let mut map = HashMap::new();
        map.insert("203.0.113.7".to_string(), record("block"));
        map.insert("198.51.100.4".to_string(), record("redirect"));
        assert!(store.save(&map));

        let loaded = store.load();
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiversionStore::new(dir.path().join("absent.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diversions.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = DiversionStore::new(path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_upsert_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiversionStore::new(dir.path().join("diversions.json"));

        assert!(store.upsert("203.0.113.7", record("redirect")));
        assert!(store.load().contains_key("203.0.113.7"));

        // Upsert replaces, never duplicates
        assert!(store.upsert("203.0.113.7", record("block")));
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["203.0.113.7"].action, "block");

        assert!(store.remove("203.0.113.7"));
        assert!(store.load().is_empty());
        // Removing an absent key is success
        assert!(store.remove("203.0.113.7"));
    }

    #[test]
    fn test_no_stray_tmp_file_left() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiversionStore::new(dir.path().join("diversions.json"));
        store.upsert("203.0.113.7", record("redirect"));
        assert!(!dir.path().join("diversions.tmp").exists());
    }
}
