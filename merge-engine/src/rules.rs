//! Compatibility rule table.
//!
//! Rules are kept in insertion order; a `(a, b)` index points at the most
//! recent rule registered for that pair, so later rules override earlier ones.

use std::collections::HashMap;

use taskmerge_core::types::{ChangeType, CompatibilityRule, ConflictSeverity, MergeStrategy};

/// Ordered rule list plus a pair index.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<CompatibilityRule>,
    index: HashMap<(ChangeType, ChangeType), usize>,
}

impl RuleTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table seeded with [`default_rules`].
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for rule in default_rules() {
            table.add_rule(rule);
        }
        table
    }

    pub fn add_rule(&mut self, rule: CompatibilityRule) {
        let slot = self.rules.len();
        let (a, b) = (rule.change_type_a, rule.change_type_b);
        self.index.insert((a, b), slot);
        if rule.bidirectional && a != b {
            self.index.insert((b, a), slot);
        }
        tracing::trace!(
            a = %a,
            b = %b,
            compatible = rule.compatible,
            "Registered compatibility rule"
        );
        self.rules.push(rule);
    }

    pub fn lookup(&self, a: ChangeType, b: ChangeType) -> Option<&CompatibilityRule> {
        self.index.get(&(a, b)).map(|&slot| &self.rules[slot])
    }

    /// Every rule ever added, including overridden ones.
    pub fn rules(&self) -> &[CompatibilityRule] {
        &self.rules
    }

    /// Live compatible rules that carry a strategy, in insertion order.
    pub fn compatible_pairs(&self) -> Vec<&CompatibilityRule> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(slot, rule)| {
                rule.compatible
                    && rule.strategy.is_some()
                    && self.index.get(&(rule.change_type_a, rule.change_type_b)) == Some(slot)
            })
            .map(|(_, rule)| rule)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// The built-in rule set.
pub fn default_rules() -> Vec<CompatibilityRule> {
    use ChangeType::*;

    vec![
        CompatibilityRule::compatible(
            AddImport,
            AddImport,
            MergeStrategy::CombineImports,
            "Independent import additions can be combined",
        ),
        CompatibilityRule::compatible(
            AddImport,
            RemoveImport,
            MergeStrategy::CombineImports,
            "Import additions and removals touch different lines",
        ),
        CompatibilityRule::compatible(
            RemoveImport,
            RemoveImport,
            MergeStrategy::CombineImports,
            "Import removals can be combined",
        ),
        CompatibilityRule::compatible(
            AddFunction,
            AddFunction,
            MergeStrategy::Append,
            "Different new functions can both be appended",
        )
        .for_distinct_targets(),
        CompatibilityRule::compatible(
            AddHookCall,
            ModifyFunction,
            MergeStrategy::HooksFirst,
            "Hook calls go at the top of the function body",
        ),
        CompatibilityRule::compatible(
            AddHookCall,
            WrapJsx,
            MergeStrategy::HooksThenWrap,
            "Hooks are inserted before the JSX is wrapped",
        ),
        CompatibilityRule::compatible(
            WrapJsx,
            WrapJsx,
            MergeStrategy::OrderByTime,
            "JSX wrappers nest in task order",
        ),
        CompatibilityRule::compatible(
            AddVariable,
            AddVariable,
            MergeStrategy::Append,
            "Different new variables can both be added",
        )
        .for_distinct_targets(),
        CompatibilityRule::incompatible(
            RemoveFunction,
            ModifyFunction,
            ConflictSeverity::High,
            "One task removed a function another task modified",
        ),
        CompatibilityRule::incompatible(
            RemoveFunction,
            AddHookCall,
            ConflictSeverity::High,
            "One task removed a function another task added hooks to",
        ),
    ]
}
