//! Recursive multi-strategy firmware extraction into an arena forest.
//!
//! # Architecture
//!
//! - `format.rs` - Magic-byte detection and stream decoders
//! - `sanitize.rs` - Entry path sanitization (zip-slip prevention)
//! - `extract/` - Bounded, hashing writer shared by all plugins; cpio and squashfs readers
//! - `plugin/` - Extractor trait and the built-in carving and unpacking plugins
//! - `forest.rs` - Index-linked record of everything extracted
//! - `orchestrator.rs` - Bounded breadth-first work queue over a worker pool
//! - `budget.rs` - Byte budget, deadlines and cancellation

pub use budget::{Bound, CancelToken, ExtractionBudget, PassBudget};
pub use entry::{DeviceKind, NodeKind, ProducedEntry};
pub use error::{Error, Result};
pub use extract::PassWriter;
pub use forest::{Artifact, ArtifactId, ExtractionForest, ExtractionNode, NodeId, Pass, PassId};
pub use orchestrator::{
    Diagnostic, Extraction, ExtractionProgress, Orchestrator, OrchestratorConfig, PassRecord, ProgressCallback,
};
pub use plugin::{
    ArtifactView, Carve, Extractor, ExtractorResult, Interruption, PassStatus, Strategy, Unpack,
    default_extractors, extractor_names, select_extractors,
};

pub mod budget;
pub mod entry;
mod error;
pub mod extract;
pub mod format;
pub mod forest;
pub mod orchestrator;
pub mod plugin;
mod sanitize;
