//! Strategy execution for conflict regions.
//!
//! Given a baseline and the snapshots of the tasks involved in one region,
//! produce merged content with the region's strategy, or conflict-marker
//! fallback output when the region cannot be merged automatically. Merging
//! is a pure function of the [`MergeContext`].

use std::collections::BTreeSet;

use taskmerge_core::hash::content_hash;
use taskmerge_core::types::{
    function_name_from_location, ChangeType, MergeContext, MergeStrategy, MergedResult,
    SemanticChange, TaskSnapshot,
};

use crate::analyzer::{normalize_line_endings, SemanticAnalyzer};
use crate::language::{BlockStyle, LanguagePatterns};

/// Executes merge strategies. Holds the analyzer so functions and imports
/// can be located in the content being merged.
#[derive(Debug, Clone)]
pub struct MergeExecutor {
    analyzer: SemanticAnalyzer,
    verify_baseline_hash: bool,
}

impl Default for MergeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeExecutor {
    pub fn new() -> Self {
        Self {
            analyzer: SemanticAnalyzer::new(),
            verify_baseline_hash: true,
        }
    }

    pub fn with_analyzer(mut self, analyzer: SemanticAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_verify_baseline_hash(mut self, verify: bool) -> Self {
        self.verify_baseline_hash = verify;
        self
    }

    pub fn verifies_baseline(&self) -> bool {
        self.verify_baseline_hash
    }

    /// Merge one conflict region.
    pub fn merge(&self, ctx: &MergeContext) -> MergedResult {
        if self.verify_baseline_hash {
            let stale = stale_tasks(&ctx.baseline_content, &ctx.task_snapshots);
            if !stale.is_empty() {
                let reason = format!("baseline changed since task(s) {} started", stale.join(", "));
                tracing::warn!(file = %ctx.file_path, %reason, "Refusing stale merge");
                return fallback(ctx, reason);
            }
        }
        self.merge_unchecked(ctx)
    }

    /// [`merge`](Self::merge) without the baseline hash check. The pipeline
    /// uses this to chain region merges over already-merged content.
    pub(crate) fn merge_unchecked(&self, ctx: &MergeContext) -> MergedResult {
        let conflict = &ctx.conflict;
        if !conflict.can_auto_merge {
            let reason = if conflict.reason.is_empty() {
                "conflict requires review".to_string()
            } else {
                conflict.reason.clone()
            };
            return fallback(ctx, reason);
        }
        let Some(strategy) = conflict.merge_strategy else {
            return fallback(ctx, "no merge strategy".to_string());
        };

        let changes = region_changes(ctx);
        let outcome = match strategy {
            MergeStrategy::CombineImports => self.run_combine_imports(ctx, &changes),
            MergeStrategy::Append => run_append(ctx, &changes),
            MergeStrategy::HooksFirst => self.run_hooks_first(ctx, &changes),
            MergeStrategy::HooksThenWrap
            | MergeStrategy::OrderByTime
            | MergeStrategy::ManualReview => Err(format!("strategy {} is not automated", strategy)),
        };

        match outcome {
            Ok(content) => {
                tracing::debug!(
                    file = %ctx.file_path,
                    location = %conflict.location,
                    strategy = %strategy,
                    "Region merged"
                );
                MergedResult {
                    content,
                    applied_strategy: Some(strategy),
                    fallback_used: false,
                    fallback_reason: None,
                }
            }
            Err(reason) => {
                tracing::warn!(
                    file = %ctx.file_path,
                    location = %conflict.location,
                    strategy = %strategy,
                    %reason,
                    "Strategy could not be applied; using fallback"
                );
                fallback(ctx, reason)
            }
        }
    }

    fn patterns(&self, file_path: &str) -> Result<&LanguagePatterns, String> {
        self.analyzer
            .patterns_for_path(file_path)
            .ok_or_else(|| format!("no structural patterns for {}", file_path))
    }

    fn run_combine_imports(
        &self,
        ctx: &MergeContext,
        changes: &[&SemanticChange],
    ) -> Result<String, String> {
        require_kinds(changes, &[ChangeType::AddImport, ChangeType::RemoveImport])?;
        let patterns = self.patterns(&ctx.file_path)?;
        let (added, removed) = import_lines(changes.iter().copied());
        Ok(combine_imports(&ctx.baseline_content, patterns, &added, &removed))
    }

    fn run_hooks_first(
        &self,
        ctx: &MergeContext,
        changes: &[&SemanticChange],
    ) -> Result<String, String> {
        require_kinds(
            changes,
            &[ChangeType::AddHookCall, ChangeType::RemoveHookCall, ChangeType::ModifyFunction],
        )?;
        let patterns = self.patterns(&ctx.file_path)?;
        let function = function_name_from_location(&ctx.conflict.location)
            .ok_or_else(|| format!("{} is not a function location", ctx.conflict.location))?;

        let mut bodies: Vec<&str> = Vec::new();
        for change in changes.iter().filter(|c| c.change_type == ChangeType::ModifyFunction) {
            let body = change
                .content_after
                .as_deref()
                .ok_or_else(|| format!("modification of {} has no content", function))?;
            if !bodies.contains(&body) {
                bodies.push(body);
            }
        }
        if bodies.len() > 1 {
            return Err(format!("{} rewritten by more than one task", function));
        }

        let (hooks, removed) = hook_lines(changes.iter().copied());
        let body = bodies.first().copied();
        insert_hooks(&ctx.baseline_content, patterns, function, body, &hooks, &removed)
            .ok_or_else(|| format!("cannot place hook calls in {}", function))
    }

    /// Apply one task's changes (optionally only those at `location`) on top
    /// of `content`. Fails when a change cannot be placed.
    pub fn apply_task_changes(
        &self,
        content: &str,
        file_path: &str,
        snapshot: &TaskSnapshot,
        location: Option<&str>,
    ) -> Result<String, String> {
        let changes: Vec<&SemanticChange> = snapshot
            .semantic_changes
            .iter()
            .filter(|c| location.is_none_or(|loc| c.location == loc))
            .collect();
        self.apply_changes(content, file_path, &changes)
    }

    /// Apply a list of changes from a single task.
    pub fn apply_changes(
        &self,
        content: &str,
        file_path: &str,
        changes: &[&SemanticChange],
    ) -> Result<String, String> {
        if changes.is_empty() {
            return Ok(content.to_string());
        }
        let patterns = self.patterns(file_path)?;
        let mut current = normalize_line_endings(content);

        let (added, removed) = import_lines(changes.iter().copied());
        if !added.is_empty() || !removed.is_empty() {
            current = combine_imports(&current, patterns, &added, &removed);
        }

        for change in changes {
            current = match change.change_type {
                ChangeType::AddImport | ChangeType::RemoveImport => continue,
                ChangeType::AddFunction => {
                    let block = required_after(change)?;
                    add_function(&current, patterns, &change.target, block)?
                }
                ChangeType::RemoveFunction => remove_function(&current, patterns, &change.target)
                    .unwrap_or(current),
                ChangeType::ModifyFunction => {
                    let block = required_after(change)?;
                    replace_function(&current, patterns, &change.target, block)
                        .ok_or_else(|| format!("function {} not found", change.target))?
                }
                ChangeType::AddHookCall | ChangeType::RemoveHookCall => {
                    let function = function_name_from_location(&change.location)
                        .ok_or_else(|| format!("{} is not a function location", change.location))?;
                    let (hooks, removed) = hook_lines(std::iter::once(*change));
                    insert_hooks(&current, patterns, function, None, &hooks, &removed)
                        .ok_or_else(|| format!("cannot place hook calls in {}", function))?
                }
                other => return Err(format!("{} changes are not applied automatically", other)),
            };
        }
        Ok(current)
    }
}

/// Merge with a default executor.
pub fn merge(ctx: &MergeContext) -> MergedResult {
    MergeExecutor::new().merge(ctx)
}

/// Tasks whose recorded baseline hash differs from the baseline content.
pub fn stale_tasks(baseline: &str, snapshots: &[TaskSnapshot]) -> Vec<String> {
    let current = content_hash(baseline);
    snapshots
        .iter()
        .filter(|s| s.content_hash_before.as_deref().is_some_and(|h| h != current))
        .map(|s| s.task_id.clone())
        .collect()
}

/// Snapshots of the region's tasks ordered by start time, then task id.
pub fn ordered_snapshots<'a>(
    snapshots: &'a [TaskSnapshot],
    tasks: &[String],
) -> Vec<&'a TaskSnapshot> {
    let mut ordered: Vec<&TaskSnapshot> = snapshots
        .iter()
        .filter(|s| tasks.iter().any(|t| *t == s.task_id))
        .collect();
    ordered.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    ordered
}

fn region_changes(ctx: &MergeContext) -> Vec<&SemanticChange> {
    ordered_snapshots(&ctx.task_snapshots, &ctx.conflict.tasks_involved)
        .into_iter()
        .flat_map(|s| s.changes_at(&ctx.conflict.location))
        .collect()
}

fn require_kinds(changes: &[&SemanticChange], allowed: &[ChangeType]) -> Result<(), String> {
    match changes.iter().find(|c| !allowed.contains(&c.change_type)) {
        Some(change) => Err(format!(
            "{} change to {} not covered by strategy",
            change.change_type, change.target
        )),
        None => Ok(()),
    }
}

fn required_after(change: &SemanticChange) -> Result<&str, String> {
    change
        .content_after
        .as_deref()
        .ok_or_else(|| format!("{} change to {} has no content", change.change_type, change.target))
}

fn import_lines<'a>(
    changes: impl Iterator<Item = &'a SemanticChange>,
) -> (Vec<String>, Vec<String>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for change in changes {
        match (change.change_type, &change.content_after, &change.content_before) {
            (ChangeType::AddImport, Some(line), _) => added.push(line.trim().to_string()),
            (ChangeType::RemoveImport, _, Some(line)) => removed.push(line.trim().to_string()),
            _ => {}
        }
    }
    (added, removed)
}

fn hook_lines<'a>(changes: impl Iterator<Item = &'a SemanticChange>) -> (Vec<String>, Vec<String>) {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for change in changes {
        match (change.change_type, &change.content_after, &change.content_before) {
            (ChangeType::AddHookCall, Some(line), _) => added.push(line.trim().to_string()),
            (ChangeType::RemoveHookCall, _, Some(line)) => removed.push(line.trim().to_string()),
            _ => {}
        }
    }
    (added, removed)
}

struct Lines {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl Lines {
    fn parse(content: &str) -> Self {
        let content = normalize_line_endings(content);
        Self {
            lines: content.lines().map(str::to_string).collect(),
            trailing_newline: content.ends_with('\n'),
        }
    }

    fn refs(&self) -> Vec<&str> {
        self.lines.iter().map(String::as_str).collect()
    }

    fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// Union of import lines. Removed lines are dropped unless re-added; new
/// lines go after the last existing import, sorted and de-duplicated.
pub fn combine_imports(
    content: &str,
    patterns: &LanguagePatterns,
    added: &[String],
    removed: &[String],
) -> String {
    let mut doc = Lines::parse(content);
    let added: BTreeSet<&str> = added
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    let removed: BTreeSet<&str> = removed
        .iter()
        .map(|l| l.trim())
        .filter(|l| !added.contains(l))
        .collect();

    doc.lines
        .retain(|line| !(patterns.is_import(line) && removed.contains(line.trim())));

    let present: BTreeSet<&str> = doc.lines.iter().map(|l| l.trim()).collect();
    let fresh: Vec<String> = added
        .iter()
        .filter(|l| !present.contains(*l))
        .map(|l| l.to_string())
        .collect();
    if fresh.is_empty() {
        return doc.render();
    }

    let at = import_insertion_point(&doc.lines, patterns);
    doc.trailing_newline |= doc.lines.is_empty();
    doc.lines.splice(at..at, fresh);
    doc.render()
}

fn import_insertion_point(lines: &[String], patterns: &LanguagePatterns) -> usize {
    match lines.iter().rposition(|l| patterns.is_import(l)) {
        Some(last) => {
            // Parenthesized import lists continue until the closing paren.
            if lines[last].contains('(') && !lines[last].contains(')') {
                lines[last..]
                    .iter()
                    .position(|l| l.contains(')'))
                    .map_or(last + 1, |offset| last + offset + 1)
            } else {
                last + 1
            }
        }
        None => lines.iter().take_while(|l| l.starts_with("#!")).count(),
    }
}

/// Append blocks at the end of the file. Blocks already present are skipped.
pub fn append_blocks(content: &str, blocks: &[&str]) -> String {
    let content = normalize_line_endings(content);
    let mut out = content.trim_end_matches('\n').to_string();
    let mut seen: Vec<&str> = Vec::new();
    for block in blocks {
        let block = block.trim_end_matches('\n');
        if block.trim().is_empty() || seen.contains(&block) || out.contains(block) {
            continue;
        }
        seen.push(block);
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(block);
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn run_append(ctx: &MergeContext, changes: &[&SemanticChange]) -> Result<String, String> {
    require_kinds(
        changes,
        &[ChangeType::AddFunction, ChangeType::AddVariable, ChangeType::AddClass],
    )?;
    let mut blocks = Vec::new();
    for change in changes {
        let block = required_after(change)?;
        if block.starts_with(char::is_whitespace) {
            return Err(format!("{} is nested and cannot be appended", change.target));
        }
        blocks.push(block);
    }
    Ok(append_blocks(&ctx.baseline_content, &blocks))
}

fn add_function(
    content: &str,
    patterns: &LanguagePatterns,
    name: &str,
    block: &str,
) -> Result<String, String> {
    let doc = Lines::parse(content);
    let lines = doc.refs();
    if let Some(existing) = patterns.find_function(&lines, name) {
        if existing.text(&lines) == block.trim_end_matches('\n') {
            return Ok(doc.render());
        }
        return Err(format!("function {} already exists with different content", name));
    }
    if block.starts_with(char::is_whitespace) {
        return Err(format!("{} is nested and cannot be appended", name));
    }
    Ok(append_blocks(content, &[block]))
}

/// Replace the first function called `name` with `block`.
pub fn replace_function(
    content: &str,
    patterns: &LanguagePatterns,
    name: &str,
    block: &str,
) -> Option<String> {
    let mut doc = Lines::parse(content);
    let found = patterns.find_function(&doc.refs(), name)?;
    let replacement: Vec<String> = normalize_line_endings(block)
        .lines()
        .map(str::to_string)
        .collect();
    doc.lines.splice(found.start..=found.end, replacement);
    Some(doc.render())
}

/// Remove the first function called `name`, with one trailing blank line.
pub fn remove_function(content: &str, patterns: &LanguagePatterns, name: &str) -> Option<String> {
    let mut doc = Lines::parse(content);
    let found = patterns.find_function(&doc.refs(), name)?;
    let mut end = found.end + 1;
    if doc.lines.get(end).is_some_and(|l| l.trim().is_empty()) {
        end += 1;
    }
    doc.lines.drain(found.start..end);
    Some(doc.render())
}

/// Put hook statements at the top of a function body, after optionally
/// replacing the function with `body`. Removed hook statements are dropped.
/// `None` when the function cannot be found or has no separate body line.
pub fn insert_hooks(
    content: &str,
    patterns: &LanguagePatterns,
    function: &str,
    body: Option<&str>,
    hooks: &[String],
    removed: &[String],
) -> Option<String> {
    let content = match body {
        Some(body) => replace_function(content, patterns, function, body)?,
        None => normalize_line_endings(content),
    };
    let mut doc = Lines::parse(&content);

    let block = patterns.find_function(&doc.refs(), function)?;
    let removed: BTreeSet<&str> = removed
        .iter()
        .map(|l| l.trim())
        .filter(|l| !hooks.iter().any(|h| h.trim() == *l))
        .collect();
    if !removed.is_empty() {
        let mut index = block.signature_end + 1;
        let mut end = block.end;
        while index <= end && index < doc.lines.len() {
            if removed.contains(doc.lines[index].trim()) {
                doc.lines.remove(index);
                end -= 1;
            } else {
                index += 1;
            }
        }
    }

    let block = patterns.find_function(&doc.refs(), function)?;
    if block.signature_end >= block.end {
        return None;
    }

    let present: BTreeSet<&str> = doc.lines[block.start..=block.end]
        .iter()
        .map(|l| l.trim())
        .collect();
    let mut fresh: Vec<&str> = Vec::new();
    for hook in hooks.iter().map(|h| h.trim()) {
        if !hook.is_empty() && !present.contains(hook) && !fresh.contains(&hook) {
            fresh.push(hook);
        }
    }
    if fresh.is_empty() {
        return Some(doc.render());
    }

    let indent = body_indent(&doc.lines, &block, patterns.block_style);
    let at = block.signature_end + 1;
    let inserted: Vec<String> = fresh.into_iter().map(|h| format!("{}{}", indent, h)).collect();
    doc.lines.splice(at..at, inserted);
    Some(doc.render())
}

fn body_indent(
    lines: &[String],
    block: &crate::language::FunctionBlock,
    style: BlockStyle,
) -> String {
    let leading = |l: &str| l[..l.len() - l.trim_start().len()].to_string();
    let last_body_line = match style {
        BlockStyle::Braces => block.end.saturating_sub(1),
        BlockStyle::Indent => block.end,
    };
    lines[block.signature_end + 1..=last_body_line.max(block.signature_end + 1)]
        .iter()
        .find(|l| {
            !l.trim().is_empty()
                && (style == BlockStyle::Indent || !l.trim_start().starts_with('}'))
        })
        .map(|l| leading(l.as_str()))
        .unwrap_or_else(|| format!("{}  ", leading(lines[block.start].as_str())))
}

fn fallback(ctx: &MergeContext, reason: String) -> MergedResult {
    let snapshots = ordered_snapshots(&ctx.task_snapshots, &ctx.conflict.tasks_involved);
    MergedResult {
        content: render_fallback(
            &ctx.file_path,
            &ctx.baseline_content,
            &snapshots,
            Some(&ctx.conflict.location),
        ),
        applied_strategy: None,
        fallback_used: true,
        fallback_reason: Some(reason),
    }
}

/// Conflict-marker rendering: the baseline, then each task's raw diff (or
/// its changes at `location` when no diff was recorded).
pub fn render_fallback(
    file_path: &str,
    baseline: &str,
    snapshots: &[&TaskSnapshot],
    location: Option<&str>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("<<<<<<< BASELINE {}\n", file_path));
    out.push_str(baseline);
    if !baseline.is_empty() && !baseline.ends_with('\n') {
        out.push('\n');
    }
    for snapshot in snapshots {
        if snapshot.task_intent.is_empty() {
            out.push_str(&format!("======= TASK {}\n", snapshot.task_id));
        } else {
            out.push_str(&format!("======= TASK {}: {}\n", snapshot.task_id, snapshot.task_intent));
        }
        let section = match &snapshot.raw_diff {
            Some(diff) if !diff.is_empty() => diff.clone(),
            _ => render_changes(snapshot, location),
        };
        out.push_str(&section);
        if !section.is_empty() && !section.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str(&format!(">>>>>>> CONFLICT {}\n", location.unwrap_or(file_path)));
    out
}

fn render_changes(snapshot: &TaskSnapshot, location: Option<&str>) -> String {
    let mut out = String::new();
    let changes = snapshot
        .semantic_changes
        .iter()
        .filter(|c| location.is_none_or(|loc| c.location == loc));
    for change in changes {
        out.push_str(&format!(
            "# {} {} ({})\n",
            change.change_type, change.target, change.location
        ));
        for line in change.content_before.iter().flat_map(|c| c.lines()) {
            out.push_str(&format!("-{}\n", line));
        }
        for line in change.content_after.iter().flat_map(|c| c.lines()) {
            out.push_str(&format!("+{}\n", line));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use taskmerge_core::types::{function_location, ConflictRegion, ConflictSeverity, FILE_TOP};

    use crate::language::Language;

    fn snapshot(
        id: &str,
        offset_secs: i64,
        baseline: &str,
        changes: Vec<SemanticChange>,
    ) -> TaskSnapshot {
        let started =
            Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_secs);
        let mut snap = TaskSnapshot::new(id, started);
        snap.semantic_changes = changes;
        snap.content_hash_before = Some(content_hash(baseline));
        snap
    }

    fn region(location: &str, tasks: &[&str], strategy: Option<MergeStrategy>) -> ConflictRegion {
        ConflictRegion {
            file_path: "app.py".into(),
            location: location.into(),
            tasks_involved: tasks.iter().map(|t| t.to_string()).collect(),
            change_types: vec![],
            severity: ConflictSeverity::None,
            can_auto_merge: strategy.is_some(),
            merge_strategy: strategy,
            reason: String::new(),
        }
    }

    fn add_import(line: &str) -> SemanticChange {
        SemanticChange::new(ChangeType::AddImport, line, FILE_TOP, 1, 1).with_after(line)
    }

    const PY: &str = "import json\n\n\ndef process(data):\n    return json.dumps(data)\n";

    #[test]
    fn test_combine_imports_strategy() {
        let ctx = MergeContext {
            file_path: "app.py".into(),
            baseline_content: PY.into(),
            task_snapshots: vec![
                snapshot("t2", 5, PY, vec![add_import("import sys")]),
                snapshot("t1", 0, PY, vec![add_import("import os"), add_import("import sys")]),
            ],
            conflict: region(FILE_TOP, &["t1", "t2"], Some(MergeStrategy::CombineImports)),
        };
        let result = merge(&ctx);
        assert!(!result.fallback_used);
        assert_eq!(result.applied_strategy, Some(MergeStrategy::CombineImports));
        assert_eq!(
            result.content,
            "import json\nimport os\nimport sys\n\n\ndef process(data):\n    return json.dumps(data)\n"
        );
    }

    #[test]
    fn test_merge_is_deterministic() {
        let ctx = MergeContext {
            file_path: "app.py".into(),
            baseline_content: PY.into(),
            task_snapshots: vec![
                snapshot("a", 0, PY, vec![add_import("import os")]),
                snapshot("b", 0, PY, vec![add_import("import re")]),
            ],
            conflict: region(FILE_TOP, &["a", "b"], Some(MergeStrategy::CombineImports)),
        };
        assert_eq!(merge(&ctx), merge(&ctx));
    }

    #[test]
    fn test_combine_imports_drops_removed() {
        let p = Language::Python.patterns();
        let base = "#!/usr/bin/env python\nimport os\nimport sys\n\nprint(1)\n";
        let merged = combine_imports(base, &p, &["import re".into()], &["import sys".into()]);
        assert_eq!(merged, "#!/usr/bin/env python\nimport os\nimport re\n\nprint(1)\n");

        let kept = combine_imports(base, &p, &["import sys".into()], &["import sys".into()]);
        assert_eq!(kept, base);

        let no_imports = combine_imports("#!/bin/sh\nprint(1)\n", &p, &["import os".into()], &[]);
        assert_eq!(no_imports, "#!/bin/sh\nimport os\nprint(1)\n");
    }

    #[test]
    fn test_combine_imports_after_parenthesized_list() {
        let p = Language::Python.patterns();
        let base = "from typing import (\n    List,\n    Dict,\n)\n\nx = 1\n";
        let merged = combine_imports(base, &p, &["import os".into()], &[]);
        assert_eq!(merged, "from typing import (\n    List,\n    Dict,\n)\nimport os\n\nx = 1\n");
    }

    #[test]
    fn test_append_strategy_orders_by_start() {
        let first = "def alpha():\n    return 1";
        let second = "def beta():\n    return 2";
        let ctx = MergeContext {
            file_path: "app.py".into(),
            baseline_content: PY.into(),
            task_snapshots: vec![
                snapshot(
                    "late",
                    10,
                    PY,
                    vec![SemanticChange::new(ChangeType::AddFunction, "beta", FILE_TOP, 6, 7)
                        .with_after(second)],
                ),
                snapshot(
                    "early",
                    0,
                    PY,
                    vec![SemanticChange::new(ChangeType::AddFunction, "alpha", FILE_TOP, 6, 7)
                        .with_after(first)],
                ),
            ],
            conflict: region(FILE_TOP, &["early", "late"], Some(MergeStrategy::Append)),
        };
        let result = merge(&ctx);
        assert!(!result.fallback_used);
        assert_eq!(result.content, format!("{}\n{}\n\n{}\n", PY, first, second));
    }

    #[test]
    fn test_append_skips_duplicates() {
        let block = "def helper():\n    return 1";
        let merged = append_blocks("x = 1\n", &[block, block]);
        assert_eq!(merged, format!("x = 1\n\n{}\n", block));
        assert_eq!(append_blocks(&merged, &[block]), merged);
    }

    #[test]
    fn test_hooks_first_strategy() {
        let base = "export function Panel() {\n  const ref = null;\n  return <div />;\n}\n";
        let loc = function_location("Panel");
        let hook = |id: &str, offset: i64, stmt: &str, target: &str| {
            snapshot(
                id,
                offset,
                base,
                vec![SemanticChange::new(ChangeType::AddHookCall, target, loc.as_str(), 2, 2)
                    .with_after(stmt)],
            )
        };
        let ctx = MergeContext {
            file_path: "Panel.jsx".into(),
            baseline_content: base.into(),
            task_snapshots: vec![
                hook("t2", 1, "useEffect(() => {}, []);", "useEffect"),
                hook("t1", 0, "const [open, setOpen] = useState(false);", "useState"),
            ],
            conflict: region(&loc, &["t1", "t2"], Some(MergeStrategy::HooksFirst)),
        };
        let result = merge(&ctx);
        assert!(!result.fallback_used, "{:?}", result.fallback_reason);
        assert_eq!(
            result.content,
            "export function Panel() {\n  const [open, setOpen] = useState(false);\n  useEffect(() => {}, []);\n  const ref = null;\n  return <div />;\n}\n"
        );
    }

    #[test]
    fn test_hooks_first_with_rewrite() {
        let base = "function Panel() {\n  return <div />;\n}\n";
        let rewritten = "function Panel() {\n  return <section />;\n}";
        let loc = function_location("Panel");
        let ctx = MergeContext {
            file_path: "Panel.tsx".into(),
            baseline_content: base.into(),
            task_snapshots: vec![
                snapshot(
                    "hooks",
                    0,
                    base,
                    vec![SemanticChange::new(ChangeType::AddHookCall, "useMemo", loc.as_str(), 2, 2)
                        .with_after("const v = useMemo(() => 1, []);")],
                ),
                snapshot(
                    "rewrite",
                    1,
                    base,
                    vec![
                        SemanticChange::new(ChangeType::ModifyFunction, "Panel", loc.as_str(), 1, 3)
                            .with_after(rewritten),
                    ],
                ),
            ],
            conflict: region(&loc, &["hooks", "rewrite"], Some(MergeStrategy::HooksFirst)),
        };
        let result = merge(&ctx);
        assert_eq!(
            result.content,
            "function Panel() {\n  const v = useMemo(() => 1, []);\n  return <section />;\n}\n"
        );
    }

    #[test]
    fn test_one_line_function_cannot_take_hooks() {
        let p = Language::JavaScript.patterns();
        let base = "function Panel() { return null; }\n";
        assert!(insert_hooks(base, &p, "Panel", None, &["useX();".into()], &[]).is_none());
        assert!(insert_hooks(base, &p, "Missing", None, &["useX();".into()], &[]).is_none());
    }

    #[test]
    fn test_blocked_region_falls_back() {
        let mut snap = snapshot("t1", 0, PY, vec![]);
        snap.task_intent = "tidy".into();
        snap.raw_diff = Some("--- baseline\n+++ t1\n@@ -1 +1 @@\n-a\n+b\n".into());
        let ctx = MergeContext {
            file_path: "app.py".into(),
            baseline_content: PY.into(),
            task_snapshots: vec![snap],
            conflict: ConflictRegion {
                reason: "Both tasks modified process".into(),
                ..region("function:process", &["t1"], None)
            },
        };
        let result = merge(&ctx);
        assert!(result.fallback_used);
        assert!(result.applied_strategy.is_none());
        assert_eq!(result.fallback_reason.as_deref(), Some("Both tasks modified process"));
        assert!(result.content.starts_with("<<<<<<< BASELINE app.py\n"));
        assert!(result.content.contains("======= TASK t1: tidy\n"));
        assert!(result.content.contains("+b\n"));
        assert!(result.content.ends_with(">>>>>>> CONFLICT function:process\n"));
    }

    #[test]
    fn test_unautomated_strategy_falls_back() {
        let change = SemanticChange::new(ChangeType::WrapJsx, "Panel", "function:Panel", 1, 1)
            .with_after("<Wrap/>");
        let ctx = MergeContext {
            file_path: "Panel.jsx".into(),
            baseline_content: "function Panel() {\n}\n".into(),
            task_snapshots: vec![snapshot("t1", 0, "function Panel() {\n}\n", vec![change])],
            conflict: region("function:Panel", &["t1"], Some(MergeStrategy::OrderByTime)),
        };
        let result = merge(&ctx);
        assert!(result.fallback_used);
        assert!(result.content.contains("+<Wrap/>"));
        assert!(result.fallback_reason.unwrap().contains("order_by_time"));
    }

    #[test]
    fn test_uncovered_change_falls_back() {
        let ctx = MergeContext {
            file_path: "app.py".into(),
            baseline_content: PY.into(),
            task_snapshots: vec![snapshot(
                "t1",
                0,
                PY,
                vec![
                    add_import("import os"),
                    SemanticChange::new(ChangeType::AddVariable, "DEBUG", FILE_TOP, 2, 2)
                        .with_after("DEBUG = 1"),
                ],
            )],
            conflict: region(FILE_TOP, &["t1"], Some(MergeStrategy::CombineImports)),
        };
        assert!(merge(&ctx).fallback_used);
    }

    #[test]
    fn test_stale_baseline_falls_back() {
        let ctx = MergeContext {
            file_path: "app.py".into(),
            baseline_content: format!("{}# edited\n", PY),
            task_snapshots: vec![snapshot("t1", 0, PY, vec![add_import("import os")])],
            conflict: region(FILE_TOP, &["t1"], Some(MergeStrategy::CombineImports)),
        };
        let result = merge(&ctx);
        assert!(result.fallback_used);
        assert!(result.fallback_reason.unwrap().contains("t1"));

        let unchecked = MergeExecutor::new().with_verify_baseline_hash(false).merge(&ctx);
        assert!(!unchecked.fallback_used);
    }

    #[test]
    fn test_apply_task_changes() {
        let base = "import json\n\n\ndef process(data):\n    return json.dumps(data)\n\n\ndef old():\n    pass\n";
        let snap = snapshot(
            "t1",
            0,
            base,
            vec![
                add_import("import os"),
                SemanticChange::new(ChangeType::RemoveFunction, "old", "function:old", 8, 9),
                SemanticChange::new(ChangeType::ModifyFunction, "process", "function:process", 4, 5)
                    .with_after("def process(data):\n    return os.getcwd()"),
                SemanticChange::new(ChangeType::AddFunction, "fresh", "function:fresh", 8, 9)
                    .with_after("def fresh():\n    return 2"),
            ],
        );
        let merged = MergeExecutor::new().apply_task_changes(base, "app.py", &snap, None).unwrap();
        assert_eq!(
            merged,
            "import json\nimport os\n\n\ndef process(data):\n    return os.getcwd()\n\ndef fresh():\n    return 2\n"
        );

        let only_imports = MergeExecutor::new()
            .apply_task_changes(base, "app.py", &snap, Some(FILE_TOP))
            .unwrap();
        assert!(only_imports.contains("import os") && only_imports.contains("def old"));
    }

    #[test]
    fn test_remove_hook_lines() {
        let p = Language::JavaScript.patterns();
        let base = "function A() {\n  useDebug();\n  return 1;\n}\n";
        let merged = insert_hooks(base, &p, "A", None, &[], &["useDebug();".into()]).unwrap();
        assert_eq!(merged, "function A() {\n  return 1;\n}\n");
    }
}
