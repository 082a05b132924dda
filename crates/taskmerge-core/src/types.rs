use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Location tag for changes at module level (imports).
pub const FILE_TOP: &str = "file_top";

/// Build the location tag for a named function.
pub fn function_location(name: &str) -> String {
    format!("function:{}", name)
}

/// Extract the function name from a `function:<name>` location.
pub fn function_name_from_location(location: &str) -> Option<&str> {
    location.strip_prefix("function:")
}

/// The kinds of semantic edit the analyzer can recognize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    AddImport,
    RemoveImport,
    AddFunction,
    RemoveFunction,
    ModifyFunction,
    AddVariable,
    RemoveVariable,
    AddHookCall,
    RemoveHookCall,
    WrapJsx,
    AddClass,
    ModifyClass,
    AddComment,
    FormattingOnly,
    Unknown,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::AddImport => "add_import",
            ChangeType::RemoveImport => "remove_import",
            ChangeType::AddFunction => "add_function",
            ChangeType::RemoveFunction => "remove_function",
            ChangeType::ModifyFunction => "modify_function",
            ChangeType::AddVariable => "add_variable",
            ChangeType::RemoveVariable => "remove_variable",
            ChangeType::AddHookCall => "add_hook_call",
            ChangeType::RemoveHookCall => "remove_hook_call",
            ChangeType::WrapJsx => "wrap_jsx",
            ChangeType::AddClass => "add_class",
            ChangeType::ModifyClass => "modify_class",
            ChangeType::AddComment => "add_comment",
            ChangeType::FormattingOnly => "formatting_only",
            ChangeType::Unknown => "unknown",
        }
    }

    pub fn is_addition(&self) -> bool {
        matches!(
            self,
            ChangeType::AddImport
                | ChangeType::AddFunction
                | ChangeType::AddVariable
                | ChangeType::AddHookCall
                | ChangeType::AddClass
                | ChangeType::AddComment
        )
    }

    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            ChangeType::RemoveImport
                | ChangeType::RemoveFunction
                | ChangeType::RemoveVariable
                | ChangeType::RemoveHookCall
        )
    }

    /// Strategy used when two compatible changes of this kind meet and no
    /// rule supplied one.
    pub fn default_strategy(&self) -> Option<MergeStrategy> {
        match self {
            ChangeType::AddImport | ChangeType::RemoveImport => Some(MergeStrategy::CombineImports),
            ChangeType::AddFunction => Some(MergeStrategy::Append),
            ChangeType::AddHookCall => Some(MergeStrategy::HooksFirst),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a conflict region. Ordered None < Low < Medium < High < Critical
/// so that derived Ord can aggregate with `max`.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSeverity::None => "none",
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
            ConflictSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic algorithms for combining compatible changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Union of import lines, inserted after the existing imports.
    CombineImports,
    /// New blocks appended at the end of the file.
    Append,
    /// Hook calls inserted right after the function signature.
    HooksFirst,
    /// Hook calls first, then JSX wrapping.
    HooksThenWrap,
    /// Apply changes in task start order.
    OrderByTime,
    /// Sentinel: a person (or reviewer agent) has to decide.
    ManualReview,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::CombineImports => "combine_imports",
            MergeStrategy::Append => "append",
            MergeStrategy::HooksFirst => "hooks_first",
            MergeStrategy::HooksThenWrap => "hooks_then_wrap",
            MergeStrategy::OrderByTime => "order_by_time",
            MergeStrategy::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One atomic edit inferred from a before/after pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticChange {
    pub change_type: ChangeType,
    pub target: String,
    pub location: String,
    pub line_start: usize,
    pub line_end: usize,
    #[serde(default)]
    pub content_before: Option<String>,
    #[serde(default)]
    pub content_after: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SemanticChange {
    pub fn new(
        change_type: ChangeType,
        target: impl Into<String>,
        location: impl Into<String>,
        line_start: usize,
        line_end: usize,
    ) -> Self {
        Self {
            change_type,
            target: target.into(),
            location: location.into(),
            line_start,
            line_end,
            content_before: None,
            content_after: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_before(mut self, content: impl Into<String>) -> Self {
        self.content_before = Some(content.into());
        self
    }

    pub fn with_after(mut self, content: impl Into<String>) -> Self {
        self.content_after = Some(content.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Everything one task changed in one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub file_path: String,
    #[serde(default)]
    pub imports_added: BTreeSet<String>,
    #[serde(default)]
    pub imports_removed: BTreeSet<String>,
    #[serde(default)]
    pub functions_added: BTreeSet<String>,
    #[serde(default)]
    pub functions_removed: BTreeSet<String>,
    #[serde(default)]
    pub functions_modified: BTreeSet<String>,
    #[serde(default)]
    pub changes: Vec<SemanticChange>,
    #[serde(default)]
    pub total_lines_changed: usize,
}

impl FileAnalysis {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.total_lines_changed == 0
    }
}

/// Static declaration of whether two change kinds may coexist at one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityRule {
    pub change_type_a: ChangeType,
    pub change_type_b: ChangeType,
    pub compatible: bool,
    #[serde(default)]
    pub strategy: Option<MergeStrategy>,
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub severity: ConflictSeverity,
    /// Only applies when the two changes name different targets.
    #[serde(default)]
    pub distinct_targets: bool,
}

fn default_bidirectional() -> bool {
    true
}

impl CompatibilityRule {
    pub fn compatible(
        a: ChangeType,
        b: ChangeType,
        strategy: MergeStrategy,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            change_type_a: a,
            change_type_b: b,
            compatible: true,
            strategy: Some(strategy),
            bidirectional: true,
            reason: reason.into(),
            severity: ConflictSeverity::None,
            distinct_targets: false,
        }
    }

    /// An incompatible rule. Severity is raised to at least `Medium`.
    pub fn incompatible(
        a: ChangeType,
        b: ChangeType,
        severity: ConflictSeverity,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            change_type_a: a,
            change_type_b: b,
            compatible: false,
            strategy: None,
            bidirectional: true,
            reason: reason.into(),
            severity: severity.max(ConflictSeverity::Medium),
            distinct_targets: false,
        }
    }

    pub fn one_way(mut self) -> Self {
        self.bidirectional = false;
        self
    }

    pub fn for_distinct_targets(mut self) -> Self {
        self.distinct_targets = true;
        self
    }

    /// Severity this rule implies for a pair it matches.
    pub fn effective_severity(&self) -> ConflictSeverity {
        if self.compatible {
            self.severity
        } else {
            self.severity.max(ConflictSeverity::Medium)
        }
    }
}

/// One (file, location) touched by two or more tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRegion {
    pub file_path: String,
    pub location: String,
    pub tasks_involved: Vec<String>,
    pub change_types: Vec<ChangeType>,
    pub severity: ConflictSeverity,
    pub can_auto_merge: bool,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default)]
    pub reason: String,
}

/// One task's complete, immutable edit of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    #[serde(default)]
    pub task_intent: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub semantic_changes: Vec<SemanticChange>,
    #[serde(default)]
    pub content_hash_before: Option<String>,
    #[serde(default)]
    pub content_hash_after: Option<String>,
    #[serde(default)]
    pub raw_diff: Option<String>,
}

impl TaskSnapshot {
    pub fn new(task_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            task_intent: String::new(),
            started_at,
            completed_at: None,
            semantic_changes: Vec::new(),
            content_hash_before: None,
            content_hash_after: None,
            raw_diff: None,
        }
    }

    /// Build a snapshot from the task's before/after text, filling in content
    /// hashes and a unified diff.
    pub fn from_contents(
        task_id: impl Into<String>,
        task_intent: impl Into<String>,
        started_at: DateTime<Utc>,
        before: &str,
        after: &str,
        semantic_changes: Vec<SemanticChange>,
    ) -> Self {
        let task_id = task_id.into();
        let raw_diff = similar::TextDiff::from_lines(before, after)
            .unified_diff()
            .context_radius(3)
            .header("baseline", &task_id)
            .to_string();
        Self {
            task_intent: task_intent.into(),
            semantic_changes,
            content_hash_before: Some(crate::hash::content_hash(before)),
            content_hash_after: Some(crate::hash::content_hash(after)),
            raw_diff: Some(raw_diff),
            ..Self::new(task_id, started_at)
        }
    }

    pub fn with_completed_at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = Some(completed_at);
        self
    }

    /// Changes this task made at a given location.
    pub fn changes_at<'a>(&'a self, location: &'a str) -> impl Iterator<Item = &'a SemanticChange> {
        self.semantic_changes
            .iter()
            .filter(move |c| c.location == location)
    }
}

/// Inputs for one merge attempt. Not persisted.
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub file_path: String,
    pub baseline_content: String,
    pub task_snapshots: Vec<TaskSnapshot>,
    pub conflict: ConflictRegion,
}

/// Output of one merge attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub content: String,
    #[serde(default)]
    pub applied_strategy: Option<MergeStrategy>,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}
