//! Data-quality checks on extracted fields.

use regex::Regex;

use crate::job::ValidationRules;
use crate::models::{Fields, ValidationResult};

/// Check `fields` against required names and per-field regex patterns.
///
/// Every value of a list field must match its pattern. An unparsable
/// pattern is reported as an error rather than silently skipped.
pub fn apply_rules(fields: &Fields, rules: &ValidationRules) -> ValidationResult {
    let mut result = ValidationResult::ok();

    for name in &rules.required {
        match fields.get(name) {
            None => result.error(format!("Required field '{name}' is missing")),
            Some(value) if value.is_blank() => {
                result.error(format!("Required field '{name}' is empty"))
            }
            Some(_) => {}
        }
    }

    for (name, pattern) in &rules.patterns {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                result.error(format!("Invalid pattern for field '{name}': {e}"));
                continue;
            }
        };
        let Some(value) = fields.get(name) else {
            if !rules.required.contains(name) {
                result.warn(format!("Pattern for '{name}' not checked: field absent"));
            }
            continue;
        };
        for v in value.values() {
            if !re.is_match(v) {
                result.error(format!("Field '{name}' value '{v}' does not match /{pattern}/"));
            }
        }
    }

    result
}

/// Presence check for selector-declared fields an adapter insists on.
pub fn require_selectors(fields: &[&str], rules: &ValidationRules) -> ValidationRules {
    let mut merged = rules.clone();
    for f in fields {
        if !merged.required.iter().any(|r| r == f) {
            merged.required.push((*f).to_string());
        }
    }
    merged
}
