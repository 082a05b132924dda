//! Post-merge checks on auto-merged content.

use std::collections::{BTreeMap, BTreeSet};

use taskmerge_core::types::{ChangeType, FileAnalysis};

use crate::language::LanguagePatterns;

const MARKERS: [&str; 3] = ["<<<<<<<", "=======", ">>>>>>>"];

/// Problems found in `content`, empty when the merge looks sound.
///
/// Checks that no conflict markers leaked (marker-like lines already in the
/// baseline are ignored), every added import line and hook statement is
/// present, every added function exists, and no function removed by a task
/// (and kept by none) survived.
pub fn validate_merge(
    content: &str,
    baseline: &str,
    analyses: &BTreeMap<String, FileAnalysis>,
    patterns: Option<&LanguagePatterns>,
) -> Vec<String> {
    let mut issues = Vec::new();
    let lines: Vec<&str> = content.lines().collect();
    let trimmed: BTreeSet<&str> = lines.iter().map(|l| l.trim()).collect();

    let inherited: BTreeSet<&str> = baseline.lines().collect();
    let leaked = lines
        .iter()
        .position(|l| MARKERS.iter().any(|m| l.starts_with(m)) && !inherited.contains(l));
    if let Some(at) = leaked {
        issues.push(format!("conflict marker at line {}", at + 1));
    }

    let functions: BTreeSet<String> = patterns
        .map(|p| p.find_functions(&lines).into_iter().map(|b| b.name).collect())
        .unwrap_or_default();

    let mut kept: BTreeSet<&str> = BTreeSet::new();
    for analysis in analyses.values() {
        kept.extend(analysis.functions_added.iter().map(String::as_str));
        kept.extend(analysis.functions_modified.iter().map(String::as_str));
    }

    for (task_id, analysis) in analyses {
        for import in &analysis.imports_added {
            if !trimmed.contains(import.trim()) {
                issues.push(format!("import `{}` from {} is missing", import, task_id));
            }
        }
        for hook in analysis
            .changes
            .iter()
            .filter(|c| c.change_type == ChangeType::AddHookCall)
            .filter_map(|c| c.content_after.as_deref())
        {
            if !trimmed.contains(hook.trim()) {
                issues.push(format!("hook call `{}` from {} is missing", hook.trim(), task_id));
            }
        }
        if patterns.is_none() {
            continue;
        }
        for name in &analysis.functions_added {
            if !functions.contains(name) {
                issues.push(format!("function {} from {} is missing", name, task_id));
            }
        }
        for name in &analysis.functions_removed {
            if functions.contains(name) && !kept.contains(name.as_str()) {
                issues.push(format!("function {} removed by {} is still present", name, task_id));
            }
        }
    }
    issues
}
