//! # merge-engine
//!
//! Semantic merging of one file edited by several concurrent tasks.
//!
//! ## Approach
//!
//! 1. **Semantic analysis**: each task's before/after pair is reduced to
//!    structured changes (imports added or removed, functions added, removed
//!    or modified, hook calls inserted) using per-language regex patterns.
//!
//! 2. **Compatibility rules**: a table keyed by pairs of change kinds says
//!    whether two changes at the same location can coexist and which
//!    deterministic strategy combines them. Pairs without a rule fall back to
//!    a same-target heuristic.
//!
//! 3. **Conflict detection**: overlapping changes from different tasks are
//!    grouped into one region per location, with an aggregated severity.
//!
//! 4. **Strategy execution**: auto-mergeable regions are combined
//!    (`combine_imports`, `append`, `hooks_first`); everything else becomes
//!    conflict-marker output for a reviewer.
//!
//! ## Example
//!
//! ```rust
//! use merge_engine::{ConflictDetector, SemanticAnalyzer};
//! use std::collections::BTreeMap;
//!
//! let analyzer = SemanticAnalyzer::new();
//! let base = "import json\n";
//! let mut analyses = BTreeMap::new();
//! for (task, after) in [("t1", "import json\nimport os\n"), ("t2", "import json\nimport sys\n")] {
//!     analyses.insert(task.to_string(), analyzer.analyze("app.py", base, after, ".py"));
//! }
//!
//! let regions = ConflictDetector::new().detect_conflicts(&analyses);
//! assert_eq!(regions.len(), 1);
//! assert!(regions[0].can_auto_merge);
//! ```

pub mod analyzer;
pub mod detector;
pub mod executor;
pub mod language;
pub mod pipeline;
pub mod rules;
pub mod validate;

// Re-export primary public API
pub use analyzer::SemanticAnalyzer;
pub use detector::{analyze_compatibility, CompatibilityVerdict, ConflictDetector};
pub use executor::{merge, MergeExecutor};
pub use language::{BlockStyle, Language, LanguagePatterns};
pub use pipeline::{
    Detection, FileMergePipeline, FileMergeReport, FileMergeRequest, PipelineError, RegionOutcome,
    RequestError, TaskEdit,
};
pub use rules::{default_rules, RuleTable};
