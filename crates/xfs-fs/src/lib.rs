//! Filesystem primitives for firmware extraction runs.
//!
//! # Architecture
//!
//! - `primitives/` - copy, move, link and remove helpers that never follow symlinks
//! - `workflow/workspace.rs` - run-exclusive scratch workspace with guaranteed cleanup
//! - `workflow/transaction.rs` - staged output commit with rollback
//! - `resource.rs` - read-only artifact content, memory-mapped above a threshold

mod error;
pub mod primitives;
pub mod resource;
pub mod workflow;

pub use error::{Error, Result};
pub use primitives::{
    FallbackStrategy, HardlinkOrCopyOptions, copy_dir_all, create_symlink, hardlink_or_copy,
    remove_path, replace_dir,
};
pub use resource::{Content, Resource};
pub use workflow::{OutputTransaction, ScratchWorkspace};
