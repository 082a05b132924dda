pub mod config;
pub mod hash;
pub mod logging;
pub mod progress;
pub mod types;

pub use config::Settings;
pub use hash::content_hash;
pub use progress::{ProgressError, ProgressRecord, ProgressReporter, ProgressSink, Stage};
pub use types::{
    ChangeType, CompatibilityRule, ConflictRegion, ConflictSeverity, FileAnalysis, MergeContext,
    MergeStrategy, MergedResult, SemanticChange, TaskSnapshot,
};
