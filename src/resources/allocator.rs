use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::lease::{PortPair, ResourceLease};
use super::workspace::{GitWorktrees, PlainDirectories, WorkspaceProvisioner};
use crate::config::Config;
use crate::conveyor_config::Isolation;
use crate::errors::ResourceError;
use crate::state::validate_id;

const INDEX_FILE: &str = "slots.json";
const LOCK_FILE: &str = "slots.lock";

/// On-disk slot arena. `slots[i]` is the lease holding slot `i`, if any.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SlotIndex {
    #[serde(default)]
    slots: Vec<Option<ResourceLease>>,
}

impl SlotIndex {
    fn owned_by(&self, workflow_id: &str) -> Option<&ResourceLease> {
        self.slots
            .iter()
            .flatten()
            .find(|lease| lease.workflow_id == workflow_id)
    }

    /// First free slot below `capacity`.
    fn first_free(&self, capacity: usize) -> Option<usize> {
        (0..capacity).find(|&i| self.slots.get(i).is_none_or(|slot| slot.is_none()))
    }

    fn set(&mut self, index: usize, lease: Option<ResourceLease>) {
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = lease;
    }
}

/// The index loaded under an exclusive lock. The lock is released when the
/// guard (and its file handle) drops.
struct LockedIndex {
    _lock: File,
    index: SlotIndex,
}

/// Leases workspaces and port pairs from a fixed pool shared across processes.
pub struct ResourceAllocator {
    resources_dir: PathBuf,
    workspace_root: PathBuf,
    capacity: usize,
    base_port: u16,
    provisioner: Box<dyn WorkspaceProvisioner>,
}

impl ResourceAllocator {
    pub fn new(
        resources_dir: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        capacity: usize,
        base_port: u16,
        provisioner: Box<dyn WorkspaceProvisioner>,
    ) -> Self {
        Self {
            resources_dir: resources_dir.into(),
            workspace_root: workspace_root.into(),
            capacity,
            base_port,
            provisioner,
        }
    }

    /// Pool and isolation from `[resources]`.
    pub fn from_config(config: &Config) -> Self {
        let resources = &config.toml.resources;
        let provisioner: Box<dyn WorkspaceProvisioner> = match resources.isolation {
            Isolation::Worktree => Box::new(GitWorktrees::new(config.project_dir.clone())),
            Isolation::Directory => Box::new(PlainDirectories),
        };
        Self::new(
            config.resources_dir.clone(),
            config.workspace_root.clone(),
            resources.pool_size,
            resources.base_port,
            provisioner,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn workspace_path(&self, workflow_id: &str) -> PathBuf {
        self.workspace_root.join(workflow_id)
    }

    fn index_path(&self) -> PathBuf {
        self.resources_dir.join(INDEX_FILE)
    }

    fn lock(&self) -> Result<LockedIndex, ResourceError> {
        fs::create_dir_all(&self.resources_dir)?;
        let lock_path = self.resources_dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| ResourceError::Lock {
                path: lock_path.clone(),
                source,
            })?;
        lock.lock_exclusive()
            .map_err(|source| ResourceError::Lock {
                path: lock_path.clone(),
                source,
            })?;

        let index = read_index(&self.index_path())?;
        Ok(LockedIndex { _lock: lock, index })
    }

    fn save(&self, index: &SlotIndex) -> Result<(), ResourceError> {
        let path = self.index_path();
        let mut buf = serde_json::to_string_pretty(index).map_err(|e| {
            ResourceError::IndexCorrupt {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        buf.push('\n');

        let tmp_path = path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Lease a slot for `workflow_id`.
    ///
    /// Re-entrant: a workflow that already owns a slot gets the same lease
    /// back (its workspace is re-created if it went missing). Otherwise the
    /// lowest free slot is taken. The slot is only recorded once the
    /// workspace exists.
    pub fn acquire(&self, workflow_id: &str, branch: &str) -> Result<ResourceLease, ResourceError> {
        validate_id(workflow_id).map_err(|e| ResourceError::Workspace {
            id: workflow_id.to_string(),
            message: e.to_string(),
        })?;

        let mut locked = self.lock()?;

        if let Some(existing) = locked.index.owned_by(workflow_id).cloned() {
            debug!(workflow = %workflow_id, slot = existing.slot, "re-using existing lease");
            if !existing.workspace.exists() {
                warn!(workflow = %workflow_id, path = %existing.workspace.display(), "leased workspace missing; re-creating");
                self.provision(workflow_id, &existing.workspace, &existing.branch)?;
            }
            return Ok(existing);
        }

        let capacity = self.capacity;
        let slot = locked
            .index
            .first_free(capacity)
            .ok_or(ResourceError::Exhausted { capacity })?;
        let ports = PortPair::for_slot(self.base_port, slot).ok_or_else(|| {
            ResourceError::Workspace {
                id: workflow_id.to_string(),
                message: format!(
                    "slot {} has no ports below 65536 (base port {})",
                    slot, self.base_port
                ),
            }
        })?;

        let workspace = self.workspace_path(workflow_id);
        self.provision(workflow_id, &workspace, branch)?;

        let lease = ResourceLease {
            workflow_id: workflow_id.to_string(),
            slot,
            workspace,
            branch: branch.to_string(),
            ports,
            acquired_at: Utc::now(),
        };
        locked.index.set(slot, Some(lease.clone()));
        if let Err(e) = self.save(&locked.index) {
            let _ = self.provisioner.remove(workflow_id, &lease.workspace);
            return Err(e);
        }

        info!(workflow = %workflow_id, slot, ports = %lease.ports, workspace = %lease.workspace.display(), "resources acquired");
        Ok(lease)
    }

    fn provision(&self, workflow_id: &str, path: &Path, branch: &str) -> Result<(), ResourceError> {
        self.provisioner
            .create(workflow_id, path, branch)
            .map_err(|e| ResourceError::Workspace {
                id: workflow_id.to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Free the slot held by `workflow_id` and remove its workspace.
    ///
    /// Releasing an id that holds nothing is a no-op. The slot is cleared
    /// even when workspace removal fails; that failure is still returned.
    pub fn release(&self, workflow_id: &str) -> Result<(), ResourceError> {
        let mut locked = self.lock()?;

        let Some(lease) = locked.index.owned_by(workflow_id).cloned() else {
            debug!(workflow = %workflow_id, "no lease to release");
            return Ok(());
        };

        let removal = self.provisioner.remove(workflow_id, &lease.workspace);
        locked.index.set(lease.slot, None);
        self.save(&locked.index)?;
        info!(workflow = %workflow_id, slot = lease.slot, "resources released");

        removal.map_err(|e| ResourceError::Cleanup {
            path: lease.workspace.clone(),
            message: format!("{:#}", e),
        })
    }

    /// Snapshot of every active lease, by slot.
    pub fn leases(&self) -> Result<Vec<ResourceLease>, ResourceError> {
        let locked = self.lock()?;
        Ok(locked.index.slots.iter().flatten().cloned().collect())
    }

    /// The lease held by `workflow_id`, if any.
    pub fn lease_for(&self, workflow_id: &str) -> Result<Option<ResourceLease>, ResourceError> {
        let locked = self.lock()?;
        Ok(locked.index.owned_by(workflow_id).cloned())
    }
}

fn read_index(path: &Path) -> Result<SlotIndex, ResourceError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SlotIndex::default()),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(SlotIndex::default());
    }
    serde_json::from_str(&contents).map_err(|e| ResourceError::IndexCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
