pub mod transaction;
pub mod workspace;

pub use transaction::OutputTransaction;
pub use workspace::ScratchWorkspace;
