// Crash-safe dedup fingerprint set.
//
// Membership is O(1) via HashSet; insertion order is tracked in a
// VecDeque so eviction drops the oldest fingerprints first. Eviction is
// safe: the Security log itself has bounded retention, so an event old
// enough to have been evicted can no longer resurface in a back-scan.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

/// Maximum fingerprints retained. Bounds memory and the size of the
/// persisted file on long-running agents.
pub const MAX_SEEN: usize = 50_000;

pub struct SeenStore {
    path: PathBuf,
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenStore {
    /// Load the persisted seen-set, or start fresh when the file is
    /// missing or unreadable. A lost file only means the collector's
    /// server-side dedup absorbs one round of re-sends.
    pub fn load(path: &Path) -> Self {
        Self::load_with_capacity(path, MAX_SEEN)
    }

    fn load_with_capacity(path: &Path, capacity: usize) -> Self {
        let mut store = Self {
            path: path.to_path_buf(),
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        };

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Vec<String>>(&content) {
                Ok(entries) => {
                    // Oldest first on disk; keep only the newest if the
                    // file is oversized.
                    let skip = entries.len().saturating_sub(capacity);
                    for fp in entries.into_iter().skip(skip) {
                        store.insert(fp);
                    }
                }
                Err(e) => {
                    tracing::warn!("could not parse {}: {}; starting fresh", path.display(), e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("could not read {}: {}; starting fresh", path.display(), e);
            }
        }

        store
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.set.contains(fingerprint)
    }

    /// Insert a fingerprint. Returns false if it was already present.
    /// Evicts oldest entries beyond capacity.
    pub fn insert(&mut self, fingerprint: String) -> bool {
        if !self.set.insert(fingerprint.clone()) {
            return false;
        }
        self.order.push_back(fingerprint);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }

    /// Persist to disk as a JSON array, oldest first.
    pub fn save(&self) -> std::io::Result<()> {
        let entries: Vec<&String> = self.order.iter().collect();
        let content = serde_json::to_string(&entries)?;
        std::fs::write(&self.path, content)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_insert_and_membership() {
        let dir = tempdir().unwrap();
        let mut store = SeenStore::load(&dir.path().join("h_seen.json"));

        assert!(store.insert("abc".into()));
        assert!(!store.insert("abc".into()));
        assert!(store.contains("abc"));
        assert!(!store.contains("def"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h_seen.json");

        let mut store = SeenStore::load(&path);
        for i in 0..10 {
            store.insert(format!("fp{}", i));
        }
        store.save().unwrap();

        let reloaded = SeenStore::load(&path);
        assert_eq!(reloaded.len(), 10);
        assert!(reloaded.contains("fp0"));
        assert!(reloaded.contains("fp9"));
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let dir = tempdir().unwrap();
        let mut store = SeenStore::load_with_capacity(&dir.path().join("s.json"), 3);

        for i in 0..5 {
            store.insert(format!("fp{}", i));
        }

        assert_eq!(store.len(), 3);
        assert!(!store.contains("fp0"));
        assert!(!store.contains("fp1"));
        assert!(store.contains("fp2"));
        assert!(store.contains("fp4"));
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h_seen.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = SeenStore::load(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_oversized_file_keeps_newest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h_seen.json");

        let entries: Vec<String> = (0..6).map(|i| format!("fp{}", i)).collect();
        std::fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

        let store = SeenStore::load_with_capacity(&path, 4);
        assert_eq!(store.len(), 4);
        assert!(!store.contains("fp0"));
        assert!(store.contains("fp5"));
    }
}
