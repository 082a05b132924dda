//! Cross-task conflict detection.
//!
//! Every pair of tasks is compared change by change; changes meet only when
//! they sit at the same location of the same file. Each meeting is judged by
//! the rule table, or by the same-target heuristic when no rule applies, and
//! the verdicts for one location fold into a single [`ConflictRegion`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use taskmerge_core::types::{
    ChangeType, CompatibilityRule, ConflictRegion, ConflictSeverity, FileAnalysis, MergeStrategy,
    SemanticChange,
};

use crate::rules::RuleTable;

/// Outcome of judging one pair of changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityVerdict {
    pub compatible: bool,
    pub strategy: Option<MergeStrategy>,
    pub reason: String,
    pub severity: ConflictSeverity,
    /// False when the verdict came from the same-target heuristic.
    pub rule_matched: bool,
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    rules: RuleTable,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates pair verdicts for one (file, location).
struct RegionBuilder {
    tasks: Vec<String>,
    change_types: Vec<ChangeType>,
    severity: ConflictSeverity,
    all_compatible: bool,
    strategy: Option<MergeStrategy>,
    compatible_reasons: Vec<String>,
    incompatible_reasons: Vec<String>,
}

impl RegionBuilder {
    fn new() -> Self {
        Self {
            tasks: Vec::new(),
            change_types: Vec::new(),
            severity: ConflictSeverity::None,
            all_compatible: true,
            strategy: None,
            compatible_reasons: Vec::new(),
            incompatible_reasons: Vec::new(),
        }
    }

    fn record(
        &mut self,
        task_a: &str,
        a: &SemanticChange,
        task_b: &str,
        b: &SemanticChange,
        verdict: CompatibilityVerdict,
    ) {
        for task in [task_a, task_b] {
            if !self.tasks.iter().any(|t| t == task) {
                self.tasks.push(task.to_string());
            }
        }
        for change_type in [a.change_type, b.change_type] {
            if !self.change_types.contains(&change_type) {
                self.change_types.push(change_type);
            }
        }
        self.severity = self.severity.max(verdict.severity);

        let reasons = if verdict.compatible {
            if self.strategy.is_none() {
                self.strategy = verdict.strategy;
            }
            &mut self.compatible_reasons
        } else {
            self.all_compatible = false;
            &mut self.incompatible_reasons
        };
        if !verdict.reason.is_empty() && !reasons.contains(&verdict.reason) {
            reasons.push(verdict.reason);
        }
    }

    fn build(self, file_path: &str, location: &str) -> ConflictRegion {
        let mut severity = self.severity;
        let mut reason = if self.incompatible_reasons.is_empty() {
            self.compatible_reasons.join("; ")
        } else {
            self.incompatible_reasons.join("; ")
        };

        let (can_auto_merge, merge_strategy) = if !self.all_compatible {
            (false, None)
        } else if let Some(strategy) = self.strategy {
            (true, Some(strategy))
        } else if let Some(strategy) = self.change_types.iter().find_map(|t| t.default_strategy()) {
            (true, Some(strategy))
        } else {
            severity = severity.max(ConflictSeverity::Low);
            let kinds: Vec<&str> = self.change_types.iter().map(|t| t.as_str()).collect();
            reason = format!("no merge strategy for {}", kinds.join(" + "));
            (false, None)
        };

        ConflictRegion {
            file_path: file_path.to_string(),
            location: location.to_string(),
            tasks_involved: self.tasks,
            change_types: self.change_types,
            severity,
            can_auto_merge,
            merge_strategy,
            reason,
        }
    }
}

impl ConflictDetector {
    /// Detector seeded with the default rules.
    pub fn new() -> Self {
        Self {
            rules: RuleTable::with_defaults(),
        }
    }

    /// Detector using exactly the given table.
    pub fn with_rules(rules: RuleTable) -> Self {
        Self { rules }
    }

    pub fn add_rule(&mut self, rule: CompatibilityRule) {
        self.rules.add_rule(rule);
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Judge one pair of changes: rule lookup, then the same-target heuristic.
    pub fn evaluate_pair(&self, a: &SemanticChange, b: &SemanticChange) -> CompatibilityVerdict {
        let rule = self
            .rules
            .lookup(a.change_type, b.change_type)
            .filter(|rule| !(rule.distinct_targets && a.target == b.target));

        if let Some(rule) = rule {
            return CompatibilityVerdict {
                compatible: rule.compatible,
                strategy: if rule.compatible { rule.strategy } else { None },
                reason: rule.reason.clone(),
                severity: rule.effective_severity(),
                rule_matched: true,
            };
        }

        let both_rewrote = a.target == b.target
            && matches!(
                (a.content_after.as_deref(), b.content_after.as_deref()),
                (Some(x), Some(y)) if !x.is_empty() && !y.is_empty() && x != y
            );
        if both_rewrote {
            return CompatibilityVerdict {
                compatible: false,
                strategy: None,
                reason: format!("Both tasks modified {}", a.target),
                severity: ConflictSeverity::High,
                rule_matched: false,
            };
        }

        tracing::warn!(
            a = %a.change_type,
            b = %b.change_type,
            location = %a.location,
            "No compatibility rule; assuming compatible"
        );
        CompatibilityVerdict {
            compatible: true,
            strategy: None,
            reason: format!(
                "No rule for {} + {}; assumed compatible",
                a.change_type, b.change_type
            ),
            severity: ConflictSeverity::None,
            rule_matched: false,
        }
    }

    /// Find every (file, location) touched by two or more tasks.
    pub fn detect_conflicts(
        &self,
        task_analyses: &BTreeMap<String, FileAnalysis>,
    ) -> Vec<ConflictRegion> {
        if task_analyses.len() < 2 {
            return Vec::new();
        }

        let tasks: Vec<(&String, &FileAnalysis)> = task_analyses.iter().collect();
        let mut regions: BTreeMap<(String, String), RegionBuilder> = BTreeMap::new();

        for (i, (task_a, analysis_a)) in tasks.iter().enumerate() {
            for (task_b, analysis_b) in &tasks[i + 1..] {
                if analysis_a.file_path != analysis_b.file_path {
                    continue;
                }
                for a in &analysis_a.changes {
                    for b in analysis_b.changes.iter().filter(|b| b.location == a.location) {
                        let verdict = self.evaluate_pair(a, b);
                        regions
                            .entry((analysis_a.file_path.clone(), a.location.clone()))
                            .or_insert_with(RegionBuilder::new)
                            .record(task_a, a, task_b, b, verdict);
                    }
                }
            }
        }

        let conflicts: Vec<ConflictRegion> = regions
            .into_iter()
            .map(|((file_path, location), builder)| builder.build(&file_path, &location))
            .collect();

        for region in &conflicts {
            tracing::debug!(
                file = %region.file_path,
                location = %region.location,
                severity = %region.severity,
                can_auto_merge = region.can_auto_merge,
                "Conflict region"
            );
        }
        conflicts
    }

    /// Compatible rules with a strategy, for introspection.
    pub fn get_compatible_pairs(&self) -> Vec<(ChangeType, ChangeType, MergeStrategy)> {
        self.rules
            .compatible_pairs()
            .into_iter()
            .filter_map(|rule| rule.strategy.map(|s| (rule.change_type_a, rule.change_type_b, s)))
            .collect()
    }

    /// Human-readable summary of a region.
    pub fn explain_conflict(&self, conflict: &ConflictRegion) -> String {
        let kinds: Vec<&str> = conflict.change_types.iter().map(|t| t.as_str()).collect();
        let mut out = String::new();
        let _ = writeln!(out, "Conflict in {} at {}", conflict.file_path, conflict.location);
        let _ = writeln!(out, "  Tasks: {}", conflict.tasks_involved.join(", "));
        let _ = writeln!(out, "  Changes: {}", kinds.join(", "));
        let _ = writeln!(out, "  Severity: {}", conflict.severity);
        if !conflict.reason.is_empty() {
            let _ = writeln!(out, "  Reason: {}", conflict.reason);
        }
        match (conflict.can_auto_merge, conflict.merge_strategy) {
            (true, Some(strategy)) => {
                let _ = write!(out, "  Auto-merge: yes (strategy: {})", strategy);
            }
            _ => {
                let _ = write!(out, "  Auto-merge: no (needs review)");
            }
        }
        out
    }
}

/// Judge a single pair without building a region.
pub fn analyze_compatibility(
    a: &SemanticChange,
    b: &SemanticChange,
    detector: Option<&ConflictDetector>,
) -> CompatibilityVerdict {
    match detector {
        Some(detector) => detector.evaluate_pair(a, b),
        None => ConflictDetector::new().evaluate_pair(a, b),
    }
}
