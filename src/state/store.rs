use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::types::{SCHEMA_VERSION, WorkflowState};
use crate::errors::StateError;

const ARCHIVE_DIR: &str = "archive";

/// Workflow ids double as file names: `[A-Za-z0-9._-]`, non-empty, no `..`.
pub fn validate_id(id: &str) -> Result<(), StateError> {
    let valid = !id.is_empty()
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidId { id: id.to_string() })
    }
}

/// Active records that parsed, and the ones that didn't.
#[derive(Debug, Default)]
pub struct Listing {
    pub records: Vec<WorkflowState>,
    pub corrupt: Vec<StateError>,
}

/// File-per-record workflow store.
///
/// There is no in-process locking: exactly one orchestrator process
/// read-modify-writes a given record at a time.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn active_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.root.join(ARCHIVE_DIR).join(format!("{}.json", id))
    }

    /// Load an active record. Never falls back to a default.
    pub fn get(&self, id: &str) -> Result<WorkflowState, StateError> {
        validate_id(id)?;
        read_record(id, &self.active_path(id))
    }

    /// `get`, with a missing record mapped to `None`.
    pub fn find(&self, id: &str) -> Result<Option<WorkflowState>, StateError> {
        match self.get(id) {
            Ok(state) => Ok(Some(state)),
            Err(StateError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load a record whether it is active or archived.
    pub fn find_any(&self, id: &str) -> Result<Option<WorkflowState>, StateError> {
        if let Some(state) = self.find(id)? {
            return Ok(Some(state));
        }
        match read_record(id, &self.archive_path(id)) {
            Ok(state) => Ok(Some(state)),
            Err(StateError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist a record atomically and bump `updated_at`.
    ///
    /// An archived record is written under `archive/` and its active file, if
    /// any, is removed.
    pub fn put(&self, state: &mut WorkflowState) -> Result<(), StateError> {
        validate_id(&state.id)?;
        state.updated_at = Utc::now();
        let target = if state.archived {
            self.archive_path(&state.id)
        } else {
            self.active_path(&state.id)
        };
        debug!(workflow = %state.id, status = %state.status, path = %target.display(), "writing workflow record");

        let mut buf = serde_json::to_string_pretty(state).map_err(|e| StateError::Corrupt {
            id: state.id.clone(),
            reason: format!("serialize: {}", e),
        })?;
        buf.push('\n');
        write_atomic(&target, &buf)?;

        if state.archived {
            let active = self.active_path(&state.id);
            match fs::remove_file(&active) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StateError::Io { path: active, source }),
            }
        }
        Ok(())
    }

    /// All active records, oldest first. Corrupt files are reported, not dropped.
    pub fn list(&self) -> Result<Listing, StateError> {
        let mut listing = Listing::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match read_record(id, &path) {
                Ok(state) => listing.records.push(state),
                Err(e) => listing.corrupt.push(e),
            }
        }
        listing
            .records
            .sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(listing)
    }

    /// Mark archived and move under `archive/`. Absent or already archived
    /// records are a no-op.
    pub fn archive(&self, id: &str) -> Result<(), StateError> {
        let Some(mut state) = self.find(id)? else {
            debug!(workflow = %id, "nothing to archive");
            return Ok(());
        };
        state.archived = true;
        self.put(&mut state)
    }
}

fn read_record(id: &str, path: &Path) -> Result<WorkflowState, StateError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StateError::NotFound { id: id.to_string() });
        }
        Err(e) => {
            return Err(StateError::Corrupt {
                id: id.to_string(),
                reason: format!("unreadable: {}", e),
            });
        }
    };

    let state: WorkflowState =
        serde_json::from_str(&contents).map_err(|e| StateError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

    if state.id != id {
        return Err(StateError::Corrupt {
            id: id.to_string(),
            reason: format!("record carries id '{}'", state.id),
        });
    }
    if state.schema_version > SCHEMA_VERSION {
        warn!(
            workflow = %id,
            version = state.schema_version,
            supported = SCHEMA_VERSION,
            "workflow record written by a newer version; reading known fields only"
        );
    }
    Ok(state)
}

/// Write to `<path>.tmp`, fsync, then rename over `path`.
fn write_atomic(path: &Path, contents: &str) -> Result<(), StateError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StateError::Io { path, source }
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;

    let tmp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
    file.write_all(contents.as_bytes())
        .map_err(io_err(&tmp_path))?;
    file.sync_all().map_err(io_err(&tmp_path))?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Phase, WorkflowStatus};
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("workflows"));
        (dir, store)
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("wf-local-1-ab12cd34").is_ok());
        assert!(validate_id("a.b_c").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a b").is_err());
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, store) = store();
        let mut state = WorkflowState::new("wf-1", "local#1");
        state.issue_title = "Fix login".to_string();
        state.transition(WorkflowStatus::Planning).unwrap();
        state.mark_completed(Phase::Plan);
        let before = state.updated_at;
        store.put(&mut state).unwrap();
        assert!(state.updated_at >= before);

        let loaded = store.get("wf-1").unwrap();
        assert_eq!(loaded, state);
        assert!(!store.root().join("wf-1.json.tmp").exists());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("wf-none"),
            Err(StateError::NotFound { .. })
        ));
        assert!(store.find("wf-none").unwrap().is_none());
    }

    #[test]
    fn test_get_corrupt_never_defaults() {
        let (_dir, store) = store();
        fs::create_dir_all(store.root()).unwrap();
        fs::write(store.root().join("wf-bad.json"), "{ not json").unwrap();
        match store.get("wf-bad") {
            Err(StateError::Corrupt { id, .. }) => assert_eq!(id, "wf-bad"),
            other => panic!("Expected Corrupt, got {:?}", other),
        }
        assert!(store.find("wf-bad").is_err());
    }

    #[test]
    fn test_get_rejects_mismatched_id() {
        let (_dir, store) = store();
        let mut state = WorkflowState::new("wf-a", "local#1");
        store.put(&mut state).unwrap();
        fs::rename(store.root().join("wf-a.json"), store.root().join("wf-b.json")).unwrap();
        assert!(matches!(store.get("wf-b"), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn test_get_rejects_invalid_id() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("../x"),
            Err(StateError::InvalidId { .. })
        ));
    }

    #[test]
    fn test_newer_schema_version_is_read() {
        let (_dir, store) = store();
        fs::create_dir_all(store.root()).unwrap();
        let json = r#"{
            "schema_version": 7,
            "id": "wf-new",
            "issue_ref": "local#2",
            "added_later": [1, 2, 3],
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        fs::write(store.root().join("wf-new.json"), json).unwrap();
        let state = store.get("wf-new").unwrap();
        assert_eq!(state.schema_version, 7);
        assert_eq!(state.issue_ref, "local#2");
    }

    #[test]
    fn test_list_reports_corrupt_records() {
        let (_dir, store) = store();
        let mut a = WorkflowState::new("wf-a", "local#1");
        let mut b = WorkflowState::new("wf-b", "local#2");
        store.put(&mut a).unwrap();
        store.put(&mut b).unwrap();
        fs::write(store.root().join("wf-c.json"), "garbage").unwrap();
        fs::write(store.root().join("notes.txt"), "ignored").unwrap();

        let listing = store.list().unwrap();
        let ids: Vec<&str> = listing.records.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["wf-a", "wf-b"]);
        assert_eq!(listing.corrupt.len(), 1);
    }

    #[test]
    fn test_list_empty_root() {
        let (_dir, store) = store();
        let listing = store.list().unwrap();
        assert!(listing.records.is_empty());
        assert!(listing.corrupt.is_empty());
    }

    #[test]
    fn test_archive_moves_record_and_is_idempotent() {
        let (_dir, store) = store();
        let mut state = WorkflowState::new("wf-1", "local#1");
        store.put(&mut state).unwrap();

        store.archive("wf-1").unwrap();
        assert!(!store.root().join("wf-1.json").exists());
        assert!(store.root().join("archive/wf-1.json").exists());
        assert!(store.find("wf-1").unwrap().is_none());
        let archived = store.find_any("wf-1").unwrap().unwrap();
        assert!(archived.archived);

        store.archive("wf-1").unwrap();
        store.archive("wf-never").unwrap();
        assert!(store.list().unwrap().records.is_empty());
    }
}
