//! Semantic change extraction.
//!
//! Turns a before/after pair of one file into a [`FileAnalysis`]: the set of
//! imports and functions that appeared or disappeared, which functions
//! changed (and whether the change was only added hook calls), plus the raw
//! count of changed lines. Unsupported extensions still get a line count;
//! missing structure never blocks a merge attempt.

use std::collections::{BTreeSet, HashMap, HashSet};

use similar::{ChangeTag, TextDiff};
use taskmerge_core::config::AnalyzerSettings;
use taskmerge_core::types::{
    function_location, ChangeType, FileAnalysis, SemanticChange, FILE_TOP,
};

use crate::language::{normalize_extension, extension_of, FunctionBlock, Language, LanguagePatterns};

/// Convert CRLF and lone CR line endings to LF.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Inserted plus deleted lines of a line-level diff.
pub fn count_changed_lines(before: &str, after: &str) -> usize {
    TextDiff::from_lines(before, after)
        .iter_all_changes()
        .filter(|c| c.tag() != ChangeTag::Equal)
        .count()
}

/// Extracts semantic changes using a per-extension pattern table.
#[derive(Debug, Clone)]
pub struct SemanticAnalyzer {
    table: HashMap<String, LanguagePatterns>,
}

impl Default for SemanticAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

struct ImportLine {
    line: usize,
    text: String,
    target: String,
}

impl SemanticAnalyzer {
    /// Analyzer with the built-in Python / JavaScript / TypeScript patterns.
    pub fn new() -> Self {
        let table = Language::builtin_extensions()
            .iter()
            .filter_map(|ext| {
                Language::from_extension(ext).map(|lang| (ext.to_string(), lang.patterns()))
            })
            .collect();
        Self { table }
    }

    /// Analyzer with no patterns at all; every file is analyzed in degraded mode.
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &AnalyzerSettings) -> Self {
        settings
            .extension_aliases
            .iter()
            .fold(Self::new(), |analyzer, (alias, target)| analyzer.with_alias(alias, target))
    }

    /// Register or replace the patterns for an extension.
    pub fn with_extension(mut self, ext: &str, patterns: LanguagePatterns) -> Self {
        self.table.insert(normalize_extension(ext), patterns);
        self
    }

    /// Make `alias` use the patterns already registered for `target`.
    pub fn with_alias(self, alias: &str, target: &str) -> Self {
        match self.patterns_for(target).cloned() {
            Some(patterns) => self.with_extension(alias, patterns),
            None => {
                tracing::warn!(alias, target, "Alias target has no registered patterns");
                self
            }
        }
    }

    pub fn patterns_for(&self, ext: &str) -> Option<&LanguagePatterns> {
        self.table.get(&normalize_extension(ext))
    }

    pub fn patterns_for_path(&self, path: &str) -> Option<&LanguagePatterns> {
        self.patterns_for(&extension_of(path))
    }

    pub fn supports(&self, ext: &str) -> bool {
        self.patterns_for(ext).is_some()
    }

    /// Analyze one task's edit of one file.
    pub fn analyze(
        &self,
        file_path: &str,
        before: &str,
        after: &str,
        extension: &str,
    ) -> FileAnalysis {
        let before = normalize_line_endings(before);
        let after = normalize_line_endings(after);
        let mut analysis = FileAnalysis::new(file_path);

        if before == after {
            return analysis;
        }
        analysis.total_lines_changed = count_changed_lines(&before, &after);

        let Some(patterns) = self.patterns_for(extension) else {
            tracing::debug!(
                file = file_path,
                extension,
                "No structural patterns for extension; reporting line counts only"
            );
            return analysis;
        };

        let before_lines: Vec<&str> = before.lines().collect();
        let after_lines: Vec<&str> = after.lines().collect();

        self.diff_imports(patterns, &before_lines, &after_lines, &mut analysis);
        self.diff_functions(patterns, &before_lines, &after_lines, &mut analysis);

        tracing::debug!(
            file = file_path,
            changes = analysis.changes.len(),
            lines = analysis.total_lines_changed,
            "Analyzed file"
        );
        analysis
    }

    /// Analyze using the extension of `file_path`.
    pub fn analyze_path(&self, file_path: &str, before: &str, after: &str) -> FileAnalysis {
        self.analyze(file_path, before, after, &extension_of(file_path))
    }

    fn diff_imports(
        &self,
        patterns: &LanguagePatterns,
        before: &[&str],
        after: &[&str],
        analysis: &mut FileAnalysis,
    ) {
        let old = collect_imports(patterns, before);
        let new = collect_imports(patterns, after);
        let old_set: HashSet<&str> = old.iter().map(|i| i.text.as_str()).collect();
        let new_set: HashSet<&str> = new.iter().map(|i| i.text.as_str()).collect();

        for import in new.iter().filter(|i| !old_set.contains(i.text.as_str())) {
            if analysis.imports_added.insert(import.text.clone()) {
                let line = import.line;
                analysis.changes.push(
                    SemanticChange::new(ChangeType::AddImport, &import.target, FILE_TOP, line, line)
                        .with_after(&import.text),
                );
            }
        }
        for import in old.iter().filter(|i| !new_set.contains(i.text.as_str())) {
            if analysis.imports_removed.insert(import.text.clone()) {
                let line = import.line;
                analysis.changes.push(
                    SemanticChange::new(
                        ChangeType::RemoveImport,
                        &import.target,
                        FILE_TOP,
                        line,
                        line,
                    )
                    .with_before(&import.text),
                );
            }
        }
    }

    fn diff_functions(
        &self,
        patterns: &LanguagePatterns,
        before: &[&str],
        after: &[&str],
        analysis: &mut FileAnalysis,
    ) {
        let old = first_by_name(patterns.find_functions(before));
        let new = first_by_name(patterns.find_functions(after));
        let old_names: HashSet<&str> = old.iter().map(|b| b.name.as_str()).collect();
        let new_names: HashSet<&str> = new.iter().map(|b| b.name.as_str()).collect();

        for block in new.iter().filter(|b| !old_names.contains(b.name.as_str())) {
            analysis.functions_added.insert(block.name.clone());
            analysis.changes.push(
                SemanticChange::new(
                    ChangeType::AddFunction,
                    &block.name,
                    function_location(&block.name),
                    block.start + 1,
                    block.end + 1,
                )
                .with_after(block.text(after)),
            );
        }

        for block in old.iter().filter(|b| !new_names.contains(b.name.as_str())) {
            analysis.functions_removed.insert(block.name.clone());
            analysis.changes.push(
                SemanticChange::new(
                    ChangeType::RemoveFunction,
                    &block.name,
                    function_location(&block.name),
                    block.start + 1,
                    block.end + 1,
                )
                .with_before(block.text(before)),
            );
        }

        for new_block in &new {
            let Some(old_block) = old.iter().find(|b| b.name == new_block.name) else {
                continue;
            };
            let old_text = old_block.text(before);
            let new_text = new_block.text(after);
            if old_text == new_text {
                continue;
            }
            analysis.functions_modified.insert(new_block.name.clone());
            analysis.changes.extend(classify_modification(
                patterns, old_block, new_block, &old_text, &new_text,
            ));
        }
    }
}

fn collect_imports(patterns: &LanguagePatterns, lines: &[&str]) -> Vec<ImportLine> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| {
            patterns.import_target(line).map(|target| ImportLine {
                line: i + 1,
                text: line.trim().to_string(),
                target,
            })
        })
        .collect()
}

fn first_by_name(blocks: Vec<FunctionBlock>) -> Vec<FunctionBlock> {
    let mut seen = BTreeSet::new();
    blocks
        .into_iter()
        .filter(|b| seen.insert(b.name.clone()))
        .collect()
}

/// A changed function is either a pure hook-call edit (hooks added or
/// removed, nothing else) or a general modification.
fn classify_modification(
    patterns: &LanguagePatterns,
    old_block: &FunctionBlock,
    new_block: &FunctionBlock,
    old_text: &str,
    new_text: &str,
) -> Vec<SemanticChange> {
    let name = &new_block.name;
    let location = function_location(name);
    let diff = TextDiff::from_lines(old_text, new_text);

    let mut added: Vec<(usize, String)> = Vec::new();
    let mut removed: Vec<(usize, String)> = Vec::new();
    for change in diff.iter_all_changes() {
        let text = change.value().trim().to_string();
        if text.is_empty() {
            continue;
        }
        match change.tag() {
            ChangeTag::Insert => {
                added.push((new_block.start + change.new_index().unwrap_or(0) + 1, text))
            }
            ChangeTag::Delete => {
                removed.push((old_block.start + change.old_index().unwrap_or(0) + 1, text))
            }
            ChangeTag::Equal => {}
        }
    }

    let all_hooks = |lines: &[(usize, String)]| {
        !lines.is_empty() && lines.iter().all(|(_, l)| patterns.hook_name(l).is_some())
    };

    if removed.is_empty() && all_hooks(&added) {
        return hook_changes(patterns, ChangeType::AddHookCall, name, &location, &added);
    }
    if added.is_empty() && all_hooks(&removed) {
        return hook_changes(patterns, ChangeType::RemoveHookCall, name, &location, &removed);
    }

    vec![
        SemanticChange::new(
            ChangeType::ModifyFunction,
            name,
            location,
            new_block.start + 1,
            new_block.end + 1,
        )
        .with_before(old_text)
        .with_after(new_text)
        .with_metadata("lines_added", added.len())
        .with_metadata("lines_removed", removed.len())
        .with_metadata("whitespace_only", added.is_empty() && removed.is_empty()),
    ]
}

fn hook_changes(
    patterns: &LanguagePatterns,
    change_type: ChangeType,
    function: &str,
    location: &str,
    lines: &[(usize, String)],
) -> Vec<SemanticChange> {
    lines
        .iter()
        .filter_map(|(line_no, statement)| {
            let hook = patterns.hook_name(statement)?;
            let change = SemanticChange::new(change_type, hook, location, *line_no, *line_no)
                .with_metadata("function", function);
            Some(if change_type == ChangeType::AddHookCall {
                change.with_after(statement)
            } else {
                change.with_before(statement)
            })
        })
        .collect()
}
