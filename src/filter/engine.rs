use regex::Regex;
use tracing::warn;

use super::field::field_text;
use crate::domain::{FilterAction, FilterOperator, FilterRule, LogEvent};

#[derive(Debug)]
enum Matcher {
    Contains(String),
    Equals(String),
    Regex(Regex),
    /// Bad pattern or unknown operator; never matches.
    Never,
}

#[derive(Debug)]
struct CompiledRule {
    field: String,
    action: FilterAction,
    matcher: Matcher,
}

impl CompiledRule {
    fn compile(rule: &FilterRule) -> Self {
        let matcher = match rule.operator {
            FilterOperator::Contains => Matcher::Contains(rule.value.to_lowercase()),
            FilterOperator::Equals => Matcher::Equals(rule.value.to_lowercase()),
            FilterOperator::Regex => match Regex::new(&rule.value) {
                Ok(regex) => Matcher::Regex(regex),
                Err(e) => {
                    warn!(pattern = %rule.value, error = %e, "Invalid regex in filter rule, rule will never match");
                    Matcher::Never
                }
            },
            FilterOperator::Unknown => {
                warn!(field = %rule.field, "Unknown filter operator, rule will never match");
                Matcher::Never
            }
        };

        Self {
            field: rule.field.clone(),
            action: rule.action,
            matcher,
        }
    }

    fn matches(&self, event: &LogEvent) -> bool {
        let Some(value) = field_text(event, &self.field) else {
            return false;
        };
        if value.is_empty() {
            return false;
        }

        match &self.matcher {
            Matcher::Contains(needle) => value.to_lowercase().contains(needle.as_str()),
            Matcher::Equals(expected) => value.to_lowercase() == *expected,
            Matcher::Regex(regex) => regex.is_match(&value),
            Matcher::Never => false,
        }
    }
}

/// Ordered include/exclude rules evaluated against each event.
///
/// Patterns are compiled once up front; evaluation itself holds no state.
#[derive(Debug, Default)]
pub struct FilterEngine {
    rules: Vec<CompiledRule>,
}

impl FilterEngine {
    pub fn new(rules: &[FilterRule]) -> Self {
        Self {
            rules: rules.iter().map(CompiledRule::compile).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn should_include(&self, event: &LogEvent) -> bool {
        for rule in &self.rules {
            let matched = rule.matches(event);
            match rule.action {
                FilterAction::Exclude if matched => return false,
                FilterAction::Include if !matched => return false,
                _ => {}
            }
        }
        true
    }

    pub fn apply(&self, events: Vec<LogEvent>) -> Vec<LogEvent> {
        if self.rules.is_empty() {
            return events;
        }
        events.into_iter().filter(|e| self.should_include(e)).collect()
    }
}
