//! Root filesystem identification and output for firmware images.
//!
//! # Architecture
//!
//! - `config.rs` - Immutable run configuration, loadable from TOML
//! - `score.rs` - Heuristic candidate discovery over the extraction forest
//! - `select.rs` - Deterministic winner selection with a confidence floor
//! - `materialize.rs` - Reproducible archive, rootfs copy and retained scratch
//! - `progress.rs` - Progress events and sinks
//! - `report.rs` - Serializable run report
//! - `engine.rs` - End-to-end run wiring all of the above

pub use config::RunConfig;
pub use engine::Run;
pub use error::{Result, RunError};
pub use materialize::{ArtifactStatus, OutputArtifactSet, OutputLayout, write_archive};
pub use progress::{CollectingSink, LogSink, NullSink, ProgressEvent, ProgressSink, RunPhase};
pub use report::{CandidateSummary, DeviceNode, Outcome, ReportedOutputs, RunReport};
pub use score::{Candidate, ScoringPolicy, Signal, score_forest};
pub use select::{DEFAULT_CONFIDENCE_FLOOR, SelectionResult, select};
pub use xfs_extract::CancelToken;

pub mod config;
mod engine;
mod error;
pub mod materialize;
pub mod progress;
pub mod report;
pub mod score;
pub mod select;
