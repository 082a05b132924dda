//! End-to-end merge of one file edited by several tasks.
//!
//! The pipeline strings the other modules together and reports its progress
//! stage by stage:
//!
//! 1. **analyzing**: each task's before/after pair becomes a
//!    [`FileAnalysis`] and a [`TaskSnapshot`].
//! 2. **detecting_conflicts**: the detector groups overlapping changes into
//!    regions.
//! 3. **resolving**: trivial cases are taken as-is; otherwise every task's
//!    edit must be reproduced by replaying its semantic changes, every region
//!    must be auto-mergeable, and the regions plus the remaining single-task
//!    changes are applied to the baseline one after another.
//! 4. **validating**: the composed result is checked for leaked markers and
//!    lost changes.
//!
//! Anything that cannot be merged safely ends in conflict-marker fallback
//! output for the whole file.
//!
//! Progress is best effort: a sink that fails is logged and the merge goes
//! on. A reporter that already reached `complete` or `error` starts a fresh
//! stage sequence for the next file.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use taskmerge_core::config::Settings;
use taskmerge_core::progress::{ProgressReporter, Stage};
use taskmerge_core::types::{
    ChangeType, ConflictRegion, FileAnalysis, MergeContext, MergeStrategy, SemanticChange,
    TaskSnapshot,
};
use thiserror::Error;
use uuid::Uuid;

use crate::analyzer::{normalize_line_endings, SemanticAnalyzer};
use crate::detector::ConflictDetector;
use crate::executor::{ordered_snapshots, render_fallback, stale_tasks, MergeExecutor};
use crate::validate::validate_merge;

/// One task's edit of the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEdit {
    pub task_id: String,
    #[serde(default)]
    pub task_intent: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Content the task started from; the request baseline when absent.
    #[serde(default)]
    pub before: Option<String>,
    pub after: String,
    #[serde(default)]
    pub raw_diff: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMergeRequest {
    pub file_path: String,
    pub baseline: String,
    pub tasks: Vec<TaskEdit>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request has no tasks")]
    NoTasks,
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),
    #[error("task id must not be empty")]
    EmptyTaskId,
    #[error("file path must not be empty")]
    EmptyFilePath,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid merge request: {0}")]
    Request(#[from] RequestError),
}

impl FileMergeRequest {
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.file_path.trim().is_empty() {
            return Err(RequestError::EmptyFilePath);
        }
        if self.tasks.is_empty() {
            return Err(RequestError::NoTasks);
        }
        let mut seen = BTreeSet::new();
        for task in &self.tasks {
            if task.task_id.trim().is_empty() {
                return Err(RequestError::EmptyTaskId);
            }
            if !seen.insert(task.task_id.as_str()) {
                return Err(RequestError::DuplicateTask(task.task_id.clone()));
            }
        }
        Ok(())
    }
}

/// What happened to one conflict region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionOutcome {
    pub location: String,
    pub applied_strategy: Option<MergeStrategy>,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMergeReport {
    pub run_id: Uuid,
    pub file_path: String,
    pub analyses: BTreeMap<String, FileAnalysis>,
    pub conflicts: Vec<ConflictRegion>,
    pub explanations: Vec<String>,
    pub region_results: Vec<RegionOutcome>,
    pub merged_content: String,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub validation_issues: Vec<String>,
}

/// Analyses and regions for a request, without merging.
#[derive(Debug, Clone)]
pub struct Detection {
    pub analyses: BTreeMap<String, FileAnalysis>,
    pub snapshots: Vec<TaskSnapshot>,
    pub conflicts: Vec<ConflictRegion>,
}

enum Resolution {
    Merged {
        content: String,
        composed: bool,
        regions: Vec<RegionOutcome>,
    },
    Fallback {
        reason: String,
        regions: Vec<RegionOutcome>,
    },
}

#[derive(Debug, Clone)]
pub struct FileMergePipeline {
    analyzer: SemanticAnalyzer,
    detector: ConflictDetector,
    executor: MergeExecutor,
    validate: bool,
}

impl Default for FileMergePipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn details(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Emit one record; a failing sink is logged and otherwise ignored.
fn emit(
    reporter: &mut ProgressReporter,
    stage: Stage,
    percent: f64,
    message: impl Into<String>,
    details: Option<Map<String, Value>>,
) {
    if let Err(err) = reporter.emit_progress(stage, percent, message, details) {
        tracing::warn!(%stage, error = %err, "Dropped progress record");
    }
}

/// Non-blank lines with indentation kept and trailing whitespace removed.
fn content_lines(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect()
}

/// Trimmed lines that replay may place differently than the task did:
/// added imports, added functions and inserted hook calls.
fn relocatable_lines(changes: &[SemanticChange]) -> BTreeSet<&str> {
    changes
        .iter()
        .filter(|c| {
            matches!(
                c.change_type,
                ChangeType::AddImport | ChangeType::AddFunction | ChangeType::AddHookCall
            )
        })
        .filter_map(|c| c.content_after.as_deref())
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

/// Whether `replayed` reproduces `after`.
///
/// Apart from blank lines, both must hold the same lines with the same
/// indentation, and every line outside the relocatable set must appear in
/// the same order.
fn reproduces(replayed: &str, after: &str, changes: &[SemanticChange]) -> bool {
    let after = normalize_line_endings(after);
    if replayed == after {
        return true;
    }
    let replayed_lines = content_lines(replayed);
    let after_lines = content_lines(&after);

    let mut sorted_replayed = replayed_lines.clone();
    let mut sorted_after = after_lines.clone();
    sorted_replayed.sort_unstable();
    sorted_after.sort_unstable();
    if sorted_replayed != sorted_after {
        return false;
    }

    let relocatable = relocatable_lines(changes);
    let fixed = |lines: &[&str]| -> Vec<String> {
        lines
            .iter()
            .filter(|l| !relocatable.contains(l.trim()))
            .map(|l| l.to_string())
            .collect()
    };
    fixed(&replayed_lines) == fixed(&after_lines)
}

impl FileMergePipeline {
    pub fn new() -> Self {
        Self {
            analyzer: SemanticAnalyzer::new(),
            detector: ConflictDetector::new(),
            executor: MergeExecutor::new(),
            validate: true,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let analyzer = SemanticAnalyzer::from_settings(&settings.analyzer);
        let mut detector = ConflictDetector::new();
        for rule in &settings.rules.extra {
            detector.add_rule(rule.clone());
        }
        let executor = MergeExecutor::new()
            .with_analyzer(analyzer.clone())
            .with_verify_baseline_hash(settings.merge.verify_baseline_hash);
        Self {
            analyzer,
            detector,
            executor,
            validate: settings.merge.validate,
        }
    }

    pub fn analyzer(&self) -> &SemanticAnalyzer {
        &self.analyzer
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    fn analyze_task(
        &self,
        request: &FileMergeRequest,
        task: &TaskEdit,
    ) -> (FileAnalysis, TaskSnapshot) {
        let before = task.before.as_deref().unwrap_or(&request.baseline);
        let analysis = self.analyzer.analyze_path(&request.file_path, before, &task.after);
        let mut snapshot = TaskSnapshot::from_contents(
            &task.task_id,
            &task.task_intent,
            task.started_at,
            before,
            &task.after,
            analysis.changes.clone(),
        );
        snapshot.completed_at = task.completed_at;
        if task.raw_diff.is_some() {
            snapshot.raw_diff = task.raw_diff.clone();
        }
        (analysis, snapshot)
    }

    /// Analyze every task and detect conflicts.
    pub fn detect(&self, request: &FileMergeRequest) -> Result<Detection, RequestError> {
        request.validate()?;
        let mut analyses = BTreeMap::new();
        let mut snapshots = Vec::new();
        for task in &request.tasks {
            let (analysis, snapshot) = self.analyze_task(request, task);
            analyses.insert(task.task_id.clone(), analysis);
            snapshots.push(snapshot);
        }
        let conflicts = self.detector.detect_conflicts(&analyses);
        Ok(Detection {
            analyses,
            snapshots,
            conflicts,
        })
    }

    /// Merge one file, reporting each stage.
    ///
    /// Only an invalid request is an error; every valid request produces a
    /// report, with fallback output when the merge cannot be automated.
    pub fn run(
        &self,
        request: &FileMergeRequest,
        reporter: &mut ProgressReporter,
    ) -> Result<FileMergeReport, PipelineError> {
        if reporter.current_stage().is_some_and(|s| s.is_terminal()) {
            reporter.restart();
        }

        if let Err(err) = request.validate() {
            tracing::error!(file = %request.file_path, error = %err, "Rejected merge request");
            let fields = details(json!({ "file_path": request.file_path }));
            if let Err(emit_err) = reporter.fail(err.to_string(), fields) {
                tracing::warn!(error = %emit_err, "Dropped progress record");
            }
            return Err(err.into());
        }

        let run_id = Uuid::new_v4();
        let file_path = request.file_path.as_str();
        tracing::info!(
            %run_id,
            file = file_path,
            tasks = request.tasks.len(),
            "Starting file merge"
        );

        emit(
            reporter,
            Stage::Analyzing,
            0.0,
            format!("Analyzing {} task(s) for {}", request.tasks.len(), file_path),
            details(json!({ "file_path": file_path, "run_id": run_id })),
        );
        let mut analyses = BTreeMap::new();
        let mut snapshots = Vec::new();
        let total = request.tasks.len() as f64;
        for (i, task) in request.tasks.iter().enumerate() {
            let (analysis, snapshot) = self.analyze_task(request, task);
            emit(
                reporter,
                Stage::Analyzing,
                20.0 * (i + 1) as f64 / total,
                format!("Analyzed {}", task.task_id),
                details(json!({
                    "task_id": task.task_id,
                    "changes": analysis.changes.len(),
                    "lines_changed": analysis.total_lines_changed,
                })),
            );
            analyses.insert(task.task_id.clone(), analysis);
            snapshots.push(snapshot);
        }

        emit(reporter, Stage::DetectingConflicts, 25.0, "Detecting conflicts", None);
        let conflicts = self.detector.detect_conflicts(&analyses);
        let explanations: Vec<String> = conflicts
            .iter()
            .map(|c| self.detector.explain_conflict(c))
            .collect();
        let blocking = conflicts.iter().filter(|c| !c.can_auto_merge).count();
        emit(
            reporter,
            Stage::DetectingConflicts,
            35.0,
            format!("Found {} conflict region(s)", conflicts.len()),
            details(json!({ "regions": conflicts.len(), "blocking": blocking })),
        );

        emit(reporter, Stage::Resolving, 40.0, "Resolving", None);
        let resolution = self.resolve(request, &snapshots, &conflicts, reporter);

        let (mut merged_content, mut fallback_reason, region_results, composed) =
            match resolution {
                Resolution::Merged {
                    content,
                    composed,
                    regions,
                } => (content, None, regions, composed),
                Resolution::Fallback { reason, regions } => {
                    (String::new(), Some(reason), regions, false)
                }
            };

        emit(reporter, Stage::Validating, 80.0, "Validating merged content", None);
        let mut validation_issues = Vec::new();
        if fallback_reason.is_none() && composed && self.validate {
            validation_issues = validate_merge(
                &merged_content,
                &request.baseline,
                &analyses,
                self.analyzer.patterns_for_path(file_path),
            );
            if !validation_issues.is_empty() {
                tracing::warn!(
                    file = file_path,
                    issues = ?validation_issues,
                    "Merged content failed validation"
                );
                fallback_reason = Some(format!(
                    "validation failed: {}",
                    validation_issues.join("; ")
                ));
            }
        }
        emit(
            reporter,
            Stage::Validating,
            90.0,
            format!("{} validation issue(s)", validation_issues.len()),
            details(json!({ "issues": validation_issues })),
        );

        let fallback_used = fallback_reason.is_some();
        if fallback_used {
            let every_task: Vec<String> = snapshots.iter().map(|s| s.task_id.clone()).collect();
            let ordered = ordered_snapshots(&snapshots, &every_task);
            merged_content = render_fallback(file_path, &request.baseline, &ordered, None);
        }

        let summary = match &fallback_reason {
            Some(reason) => format!("Fallback output for {}: {}", file_path, reason),
            None => format!("Merged {} automatically", file_path),
        };
        tracing::info!(%run_id, file = file_path, fallback_used, "{}", summary);
        emit(
            reporter,
            Stage::Complete,
            100.0,
            summary,
            details(json!({
                "run_id": run_id,
                "fallback_used": fallback_used,
                "regions": conflicts.len(),
                "validation_issues": validation_issues.len(),
            })),
        );

        Ok(FileMergeReport {
            run_id,
            file_path: file_path.to_string(),
            analyses,
            conflicts,
            explanations,
            region_results,
            merged_content,
            fallback_used,
            fallback_reason,
            validation_issues,
        })
    }

    fn resolve(
        &self,
        request: &FileMergeRequest,
        snapshots: &[TaskSnapshot],
        conflicts: &[ConflictRegion],
        reporter: &mut ProgressReporter,
    ) -> Resolution {
        let file_path = request.file_path.as_str();
        let baseline = normalize_line_endings(&request.baseline);
        let fallback = |reason: String| Resolution::Fallback {
            reason,
            regions: Vec::new(),
        };

        if self.verifies_baseline() {
            let stale = stale_tasks(&request.baseline, snapshots);
            if !stale.is_empty() {
                return fallback(format!(
                    "baseline changed since task(s) {} started",
                    stale.join(", ")
                ));
            }
        }

        let changed: Vec<&TaskEdit> = request
            .tasks
            .iter()
            .filter(|t| {
                let before = t.before.as_deref().unwrap_or(&request.baseline);
                normalize_line_endings(before) != normalize_line_endings(&t.after)
            })
            .collect();
        let distinct: BTreeSet<String> = changed
            .iter()
            .map(|t| normalize_line_endings(&t.after))
            .collect();

        if changed.is_empty() {
            return Resolution::Merged {
                content: request.baseline.clone(),
                composed: false,
                regions: Vec::new(),
            };
        }
        if distinct.len() == 1 {
            let task = changed[0];
            tracing::debug!(
                file = file_path,
                task = %task.task_id,
                "Taking the only distinct edit"
            );
            return Resolution::Merged {
                content: task.after.clone(),
                composed: false,
                regions: Vec::new(),
            };
        }

        if let Some(blocked) = conflicts.iter().find(|c| !c.can_auto_merge) {
            return fallback(format!(
                "region {} cannot be merged automatically: {}",
                blocked.location, blocked.reason
            ));
        }

        for task in &changed {
            let Some(snapshot) = snapshots.iter().find(|s| s.task_id == task.task_id) else {
                continue;
            };
            let replayed = self
                .executor
                .apply_task_changes(&baseline, file_path, snapshot, None);
            let covered = matches!(
                &replayed,
                Ok(content) if reproduces(content, &task.after, &snapshot.semantic_changes)
            );
            if !covered {
                return fallback(format!(
                    "edits by {} are not fully described by semantic changes",
                    task.task_id
                ));
            }
        }

        let mut content = baseline;
        let mut outcomes = Vec::new();
        let region_count = conflicts.len().max(1) as f64;
        for (i, region) in conflicts.iter().enumerate() {
            let ctx = MergeContext {
                file_path: file_path.to_string(),
                baseline_content: content.clone(),
                task_snapshots: snapshots.to_vec(),
                conflict: region.clone(),
            };
            let result = self.executor.merge_unchecked(&ctx);
            outcomes.push(RegionOutcome {
                location: region.location.clone(),
                applied_strategy: result.applied_strategy,
                fallback_used: result.fallback_used,
                fallback_reason: result.fallback_reason.clone(),
            });
            emit(
                reporter,
                Stage::Resolving,
                40.0 + 25.0 * (i + 1) as f64 / region_count,
                format!("Resolved {}", region.location),
                details(json!({
                    "location": region.location,
                    "strategy": result.applied_strategy,
                    "fallback_used": result.fallback_used,
                })),
            );
            if result.fallback_used {
                let reason = result
                    .fallback_reason
                    .unwrap_or_else(|| "region fallback".to_string());
                return Resolution::Fallback {
                    reason: format!("region {}: {}", region.location, reason),
                    regions: outcomes,
                };
            }
            content = result.content;
        }

        let region_locations: BTreeSet<&str> =
            conflicts.iter().map(|c| c.location.as_str()).collect();
        let every_task: Vec<String> = snapshots.iter().map(|s| s.task_id.clone()).collect();
        for snapshot in ordered_snapshots(snapshots, &every_task) {
            let solo: Vec<&SemanticChange> = snapshot
                .semantic_changes
                .iter()
                .filter(|c| !region_locations.contains(c.location.as_str()))
                .collect();
            match self.executor.apply_changes(&content, file_path, &solo) {
                Ok(next) => content = next,
                Err(reason) => {
                    return Resolution::Fallback {
                        reason: format!("changes by {}: {}", snapshot.task_id, reason),
                        regions: outcomes,
                    };
                }
            }
        }
        emit(reporter, Stage::Resolving, 70.0, "Applied single-task changes", None);

        Resolution::Merged {
            content,
            composed: true,
            regions: outcomes,
        }
    }

    fn verifies_baseline(&self) -> bool {
        self.executor.verifies_baseline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use taskmerge_core::progress::{MemorySink, ProgressError, ProgressRecord, ProgressSink};
    use taskmerge_core::types::CompatibilityRule;

    const PY: &str = "import json\n\n\ndef load(path):\n    return open(path).read()\n\n\n\
                      def save(path, data):\n    open(path, \"w\").write(data)\n";

    fn task(id: &str, offset: i64, after: &str) -> TaskEdit {
        TaskEdit {
            task_id: id.into(),
            task_intent: format!("intent of {}", id),
            started_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
                + Duration::seconds(offset),
            completed_at: None,
            before: None,
            after: after.into(),
            raw_diff: None,
        }
    }

    fn request(path: &str, baseline: &str, tasks: Vec<TaskEdit>) -> FileMergeRequest {
        FileMergeRequest {
            file_path: path.into(),
            baseline: baseline.into(),
            tasks,
        }
    }

    fn run(
        pipeline: &FileMergePipeline,
        req: &FileMergeRequest,
    ) -> (Result<FileMergeReport, PipelineError>, MemorySink) {
        let sink = MemorySink::new();
        let mut reporter = ProgressReporter::new(sink.clone());
        (pipeline.run(req, &mut reporter), sink)
    }

    #[test]
    fn test_import_scenario_merges() {
        let req = request(
            "app.py",
            PY,
            vec![
                task("t1", 0, &PY.replacen("import json\n", "import json\nimport os\n", 1)),
                task("t2", 1, &PY.replacen("import json\n", "import json\nimport sys\n", 1)),
            ],
        );
        let (report, sink) = run(&FileMergePipeline::new(), &req);
        let report = report.unwrap();
        assert!(!report.fallback_used, "{:?}", report.fallback_reason);
        assert!(report.merged_content.starts_with("import json\nimport os\nimport sys\n"));
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(
            report.region_results[0].applied_strategy,
            Some(MergeStrategy::CombineImports)
        );
        assert!(report.validation_issues.is_empty());

        let records = sink.records();
        let stages: Vec<Stage> = records.iter().map(|r| r.stage).collect();
        assert_eq!(stages.first(), Some(&Stage::Analyzing));
        assert_eq!(stages.last(), Some(&Stage::Complete));
        assert!(stages.contains(&Stage::DetectingConflicts));
        assert!(stages.contains(&Stage::Validating));
        assert_eq!(records.last().unwrap().percent, 100.0);
    }

    #[test]
    fn test_disjoint_edits_compose() {
        let t1 = PY.replace("open(path).read()", "open(path, encoding=\"utf-8\").read()");
        let t2 = format!(
            "{}\n\ndef helper():\n    return os.getcwd()\n",
            PY.replacen("import json\n", "import json\nimport os\n", 1)
        );
        let req = request("store.py", PY, vec![task("t1", 0, &t1), task("t2", 5, &t2)]);
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(!report.fallback_used, "{:?}", report.fallback_reason);
        assert!(report.conflicts.is_empty());
        let merged = &report.merged_content;
        assert!(merged.contains("import os\n"));
        assert!(merged.contains("encoding=\"utf-8\""));
        assert!(merged.contains("def helper():\n    return os.getcwd()\n"));
        assert!(merged.contains("def save(path, data):"));
    }

    #[test]
    fn test_process_rewrite_falls_back() {
        let base = "def process():\n    return 0\n";
        let req = request(
            "app.py",
            base,
            vec![
                task("t1", 0, "def process():\n    return 1\n"),
                task("t2", 1, "def process():\n    return 2\n"),
            ],
        );
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(report.fallback_used);
        assert_eq!(report.conflicts.len(), 1);
        assert!(!report.conflicts[0].can_auto_merge);
        assert!(report.merged_content.starts_with("<<<<<<< BASELINE app.py\n"));
        assert!(report.merged_content.contains("======= TASK t1: intent of t1\n"));
        assert!(report.merged_content.contains("+    return 2"));
        assert!(report.explanations[0].contains("function:process"));
    }

    #[test]
    fn test_single_change_taken() {
        let edited = PY.replace("read()", "read().strip()");
        let req = request("a.py", PY, vec![task("t1", 0, &edited), task("t2", 1, PY)]);
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(!report.fallback_used);
        assert_eq!(report.merged_content, edited);

        let same = request("a.py", PY, vec![task("t1", 0, &edited), task("t2", 1, &edited)]);
        let report = run(&FileMergePipeline::new(), &same).0.unwrap();
        assert!(!report.fallback_used);
        assert_eq!(report.merged_content, edited);
    }

    #[test]
    fn test_nothing_changed_keeps_baseline() {
        let req = request("a.py", PY, vec![task("t1", 0, PY)]);
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert_eq!(report.merged_content, PY);
        assert!(!report.fallback_used);
    }

    #[test]
    fn test_uncaptured_edit_falls_back() {
        let base = "import json\n\nTIMEOUT = 5\n";
        let req = request(
            "cfg.py",
            base,
            vec![
                task("t1", 0, "import json\n\nTIMEOUT = 10\n"),
                task("t2", 1, "import json\nimport os\n\nTIMEOUT = 5\n"),
            ],
        );
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(report.fallback_used);
        assert!(report.fallback_reason.unwrap().contains("t1"));
    }

    #[test]
    fn test_reindented_line_falls_back() {
        let base = "import json\n\nif DEBUG:\n    pass\nx = 1\n";
        let req = request(
            "flags.py",
            base,
            vec![
                task("t1", 0, "import json\n\nif DEBUG:\n    pass\n    x = 1\n"),
                task("t2", 1, "import json\nimport os\n\nif DEBUG:\n    pass\nx = 1\n"),
            ],
        );
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(report.fallback_used);
        assert!(report.fallback_reason.unwrap().contains("t1"));
        assert!(report.merged_content.contains("+    x = 1"));
    }

    #[test]
    fn test_reordered_lines_fall_back() {
        let req = request(
            "order.py",
            "a = 1\nb = 2\n",
            vec![
                task("t1", 0, "b = 2\na = 1\n"),
                task("t2", 1, "import os\na = 1\nb = 2\n"),
            ],
        );
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(report.fallback_used);
        assert!(report.fallback_reason.unwrap().contains("t1"));
        assert!(report.merged_content.starts_with("<<<<<<< BASELINE order.py\n"));
    }

    #[test]
    fn test_appended_function_placement_is_covered() {
        let base = "import json\n\n\ndef load():\n    return 1\n\n\ndef save():\n    return 2\n";
        let t1 = base.replace(
            "def save():",
            "def extra():\n    return 3\n\n\ndef save():",
        );
        let t2 = base.replacen("import json\n", "import json\nimport os\n", 1);
        let req = request("mod.py", base, vec![task("t1", 0, &t1), task("t2", 1, &t2)]);
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(!report.fallback_used, "{:?}", report.fallback_reason);
        assert!(report.merged_content.contains("import os\n"));
        assert!(report.merged_content.contains("def extra():\n    return 3\n"));
    }

    struct BrokenPipeSink;

    impl ProgressSink for BrokenPipeSink {
        fn emit(&mut self, _record: &ProgressRecord) -> Result<(), ProgressError> {
            Err(ProgressError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "pipe",
            )))
        }
    }

    #[test]
    fn test_failing_sink_does_not_abort() {
        let req = request(
            "app.py",
            PY,
            vec![
                task("t1", 0, &PY.replacen("import json\n", "import json\nimport os\n", 1)),
                task("t2", 1, &PY.replacen("import json\n", "import json\nimport sys\n", 1)),
            ],
        );
        let mut reporter = ProgressReporter::new(BrokenPipeSink);
        let report = FileMergePipeline::new().run(&req, &mut reporter).unwrap();
        assert!(!report.fallback_used);
        assert!(report.merged_content.starts_with("import json\nimport os\nimport sys\n"));

        let invalid = request("app.py", PY, vec![]);
        let err = FileMergePipeline::new().run(&invalid, &mut reporter).unwrap_err();
        assert_eq!(err, PipelineError::Request(RequestError::NoTasks));
    }

    #[test]
    fn test_reporter_reused_across_files() {
        let pipeline = FileMergePipeline::new();
        let sink = MemorySink::new();
        let mut reporter = ProgressReporter::new(sink.clone());

        let first = request("a.py", PY, vec![task("t1", 0, PY)]);
        let edited = PY.replace("read()", "read(1)");
        let second = request("b.py", PY, vec![task("t1", 0, &edited)]);
        pipeline.run(&first, &mut reporter).unwrap();
        let report = pipeline.run(&second, &mut reporter).unwrap();
        assert_eq!(report.merged_content, edited);

        let records = sink.records();
        let completes = records.iter().filter(|r| r.stage == Stage::Complete).count();
        assert_eq!(completes, 2);
        let first_complete = records.iter().position(|r| r.stage == Stage::Complete).unwrap();
        assert_eq!(records[first_complete + 1].stage, Stage::Analyzing);
        assert_eq!(reporter.current_stage(), Some(Stage::Complete));
    }

    #[test]
    fn test_hook_calls_merge() {
        let base =
            "import React from 'react';\n\nexport function Panel() {\n  return <div />;\n}\n";
        let with = |line: &str| {
            base.replace("  return <div />;", &format!("  {}\n  return <div />;", line))
        };
        let req = request(
            "Panel.jsx",
            base,
            vec![
                task("t1", 0, &with("const [open, setOpen] = useState(false);")),
                task("t2", 1, &with("useEffect(() => {}, []);")),
            ],
        );
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(!report.fallback_used, "{:?}", report.fallback_reason);
        assert_eq!(report.conflicts[0].merge_strategy, Some(MergeStrategy::HooksFirst));
        assert_eq!(
            report.merged_content,
            "import React from 'react';\n\nexport function Panel() {\n  \
             const [open, setOpen] = useState(false);\n  useEffect(() => {}, []);\n  \
             return <div />;\n}\n"
        );
    }

    #[test]
    fn test_stale_task_falls_back() {
        let mut stale = task("t1", 0, &PY.replace("read()", "read(10)"));
        stale.before = Some(format!("# header\n{}", PY));
        let req = request("a.py", PY, vec![stale, task("t2", 1, &PY.replace("json", "ujson"))]);
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        assert!(report.fallback_used);
        assert!(report.fallback_reason.unwrap().contains("baseline changed"));
    }

    #[test]
    fn test_invalid_requests_report_error() {
        let pipeline = FileMergePipeline::new();

        let (result, sink) = run(&pipeline, &request("a.py", PY, vec![]));
        assert!(matches!(result, Err(PipelineError::Request(RequestError::NoTasks))));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, Stage::Error);

        let dup = request("a.py", PY, vec![task("t1", 0, PY), task("t1", 1, PY)]);
        assert_eq!(dup.validate(), Err(RequestError::DuplicateTask("t1".into())));
        assert_eq!(
            request("a.py", PY, vec![task(" ", 0, PY)]).validate(),
            Err(RequestError::EmptyTaskId)
        );
        assert_eq!(
            request("", PY, vec![task("t1", 0, PY)]).validate(),
            Err(RequestError::EmptyFilePath)
        );
    }

    #[test]
    fn test_settings_applied() {
        let mut settings = Settings::default();
        settings.rules.extra.push(CompatibilityRule::incompatible(
            taskmerge_core::types::ChangeType::AddImport,
            taskmerge_core::types::ChangeType::AddImport,
            taskmerge_core::types::ConflictSeverity::High,
            "imports need review",
        ));
        let pipeline = FileMergePipeline::from_settings(&settings);
        let req = request(
            "app.py",
            PY,
            vec![
                task("t1", 0, &PY.replacen("import json\n", "import json\nimport os\n", 1)),
                task("t2", 1, &PY.replacen("import json\n", "import json\nimport sys\n", 1)),
            ],
        );
        let detection = pipeline.detect(&req).unwrap();
        assert_eq!(detection.snapshots.len(), 2);
        assert!(!detection.conflicts[0].can_auto_merge);
        let report = run(&pipeline, &req).0.unwrap();
        assert!(report.fallback_used);
    }

    #[test]
    fn test_report_serializes() {
        let req = request("a.py", PY, vec![task("t1", 0, PY)]);
        let report = run(&FileMergePipeline::new(), &req).0.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["file_path"], "a.py");
        assert!(json.get("fallback_reason").is_none());
        let back: FileMergeReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
