//! Durable, single-writer-per-tree-id checkpoint store (§4.7 of the design
//! doc). Every write replaces the whole tree-record via a write-temp-then-
//! atomic-rename, so a crash between writes never leaves a torn record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};

use crate::types::{CHECKPOINT_SCHEMA_V1, TreeRecord};

/// Durable key-value log of tree-level replication state, keyed by tree-id.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, record: &TreeRecord) -> Result<()>;
    fn load(&self, tree_id: &str) -> Result<Option<TreeRecord>>;
    fn list(&self) -> Result<Vec<String>>;
    fn delete(&self, tree_id: &str) -> Result<()>;
}

/// Filesystem-backed checkpoint store: one `<tree-id>.json` file per tree
/// under `checkpoint-directory`. A future implementation could back this
/// with an object store (S3, GCS, Azure Blob) behind the same trait.
pub struct FileCheckpointStore {
    dir: PathBuf,
    // Serializes writes to the directory so two flushes for different
    // tree-ids can't race on directory creation; per-record atomicity
    // comes from the temp+rename dance itself.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, tree_id: &str) -> PathBuf {
        self.dir.join(format!("{tree_id}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, record: &TreeRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create checkpoint dir {}", self.dir.display()))?;
        if record.schema_version != CHECKPOINT_SCHEMA_V1 {
            bail!(
                "refusing to write unknown checkpoint schema version {}",
                record.schema_version
            );
        }
        atomic_write_json(&self.record_path(&record.tree_id), record)
    }

    fn load(&self, tree_id: &str) -> Result<Option<TreeRecord>> {
        let path = self.record_path(tree_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let record: TreeRecord = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse checkpoint {}", path.display()))?;
        Ok(Some(record))
    }

    fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list checkpoint dir {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, tree_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let path = self.record_path(tree_id);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed to delete checkpoint {}", path.display()))?;
        }
        Ok(())
    }
}

/// Discards every write. Used when checkpointing is disabled for a run so
/// the orchestrator can still call `save` unconditionally after every
/// repository without an `if enabled` branch at every call site.
#[derive(Debug, Default)]
pub struct NullCheckpointStore;

impl CheckpointStore for NullCheckpointStore {
    fn save(&self, _record: &TreeRecord) -> Result<()> {
        Ok(())
    }

    fn load(&self, _tree_id: &str) -> Result<Option<TreeRecord>> {
        Ok(None)
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn delete(&self, _tree_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Best-effort directory fsync so a rename is durable against power loss,
/// not just process crash. Ignored on platforms (e.g. Windows) that can't
/// open a directory for sync.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize checkpoint JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    fsync_parent_dir(path);

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::types::{FilterSet, TreeStatus};

    fn sample_record(tree_id: &str) -> TreeRecord {
        TreeRecord {
            schema_version: CHECKPOINT_SCHEMA_V1.to_string(),
            tree_id: tree_id.to_string(),
            source_registry_id: "src".into(),
            dest_registry_id: "dst".into(),
            source_prefix: "project-a".into(),
            dest_prefix: "mirror/project-a".into(),
            filters: FilterSet::default(),
            status: TreeStatus::InProgress,
            progress_percent: 0.0,
            started_at: Utc::now(),
            last_updated_at: Utc::now(),
            last_error: None,
            repos: BTreeMap::new(),
            resumed_from: None,
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let record = sample_record("tree-1");
        store.save(&record).unwrap();

        let loaded = store.load("tree-1").unwrap().unwrap();
        assert_eq!(loaded.tree_id, "tree-1");
        assert_eq!(loaded.source_prefix, "project-a");
    }

    #[test]
    fn load_missing_tree_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load("nonexistent").unwrap().is_none());
    }

    #[test]
    fn list_enumerates_saved_trees() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&sample_record("tree-1")).unwrap();
        store.save(&sample_record("tree-2")).unwrap();
        let mut ids = store.list().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["tree-1".to_string(), "tree-2".to_string()]);
    }

    #[test]
    fn delete_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&sample_record("tree-1")).unwrap();
        store.delete("tree-1").unwrap();
        assert!(store.load("tree-1").unwrap().is_none());
    }

    #[test]
    fn save_rejects_unknown_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut record = sample_record("tree-1");
        record.schema_version = "freightliner.checkpoint.v99".into();
        assert!(store.save(&record).is_err());
    }

    #[test]
    fn write_leaves_no_tmp_file_behind_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&sample_record("tree-1")).unwrap();
        assert!(!dir.path().join("tree-1.tmp").exists());
        assert!(dir.path().join("tree-1.json").exists());
    }

    #[test]
    fn null_checkpoint_store_discards_everything() {
        let store = NullCheckpointStore;
        store.save(&sample_record("tree-1")).unwrap();
        assert!(store.load("tree-1").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
        store.delete("tree-1").unwrap();
    }

    #[test]
    fn a_crash_leaving_a_stale_tmp_file_does_not_corrupt_the_real_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.save(&sample_record("tree-1")).unwrap();
        // Simulate a crash mid-write: a stale .tmp file exists but the
        // real record is untouched.
        fs::write(dir.path().join("tree-1.tmp"), b"not valid json").unwrap();
        let loaded = store.load("tree-1").unwrap().unwrap();
        assert_eq!(loaded.tree_id, "tree-1");
    }
}
