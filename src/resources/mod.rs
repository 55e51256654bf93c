//! Workspace and port isolation for concurrently running workflows.
//!
//! A fixed-size pool of slots is shared by every orchestrator process on the
//! machine. Slot `i` owns the port pair `(base + 2i, base + 2i + 1)`; the
//! workspace is a git worktree (or plain directory) named after the
//! workflow id. The slot index is a JSON file guarded by an exclusive OS file
//! lock for each read-modify-write.

pub mod allocator;
pub mod lease;
pub mod workspace;

pub use allocator::ResourceAllocator;
pub use lease::{PortPair, ResourceLease};
pub use workspace::{GitWorktrees, PlainDirectories, WorkspaceProvisioner};
