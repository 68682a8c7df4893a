use crate::aggregate::{AggregateError, Errors};
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

/// Validates key/value pairs against a list of anchored regular expression
/// pairs.
///
/// An empty matcher allows nothing.
#[derive(Clone, Debug, Default)]
pub struct AllowListMatcher {
    entries: Vec<Entry>,
}

#[derive(Clone, Debug)]
struct Entry {
    key: Regex,
    value: Regex,
}

#[derive(Debug, Error)]
pub enum AllowListError {
    #[error("invalid {field} pattern {pattern:?}: {source}")]
    Pattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{key}={value:?} is not allowed")]
    NotAllowed { key: String, value: String },
}

// === impl AllowListMatcher ===

impl AllowListMatcher {
    /// Compiles and anchors both patterns before storing them.
    pub fn add(&mut self, key: &str, value: &str) -> Result<(), AllowListError> {
        let key = anchored("key", key)?;
        let value = anchored("value", value)?;
        self.entries.push(Entry { key, value });
        Ok(())
    }

    /// Succeeds on the first entry matching both `key` and `value`.
    pub fn validate(&self, key: &str, value: &str) -> Result<(), AllowListError> {
        if self
            .entries
            .iter()
            .any(|e| e.key.is_match(key) && e.value.is_match(value))
        {
            return Ok(());
        }

        Err(AllowListError::NotAllowed {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Validates every pair independently, reporting all violations.
    pub fn validate_all(&self, pairs: &BTreeMap<String, String>) -> Result<(), AggregateError> {
        let mut errors = Errors::default();
        for (k, v) in pairs {
            errors.collect(self.validate(k, v));
        }
        errors.finish()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn anchored(field: &'static str, pattern: &str) -> Result<Regex, AllowListError> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| AllowListError::Pattern {
        field,
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn matcher(entries: &[(&str, &str)]) -> AllowListMatcher {
        let mut m = AllowListMatcher::default();
        for (k, v) in entries {
            m.add(k, v).expect("patterns must compile");
        }
        m
    }

    #[test]
    fn matches_key_and_value() {
        let m = matcher(&[("a.*", "x|y")]);
        assert!(m.validate("abc", "x").is_ok());
        assert!(m.validate("abc", "y").is_ok());
        assert!(m.validate("abc", "z").is_err());
        assert!(m.validate("bc", "x").is_err());
    }

    #[test]
    fn patterns_are_anchored() {
        let m = matcher(&[("b", "x|y")]);
        assert!(m.validate("abc", "x").is_err());
        // Alternation must not escape the anchors.
        assert!(m.validate("b", "xx").is_err());
        assert!(m.validate("b", "yy").is_err());
    }

    #[test]
    fn zero_value_denies_everything() {
        let m = AllowListMatcher::default();
        assert!(m.validate("a", "b").is_err());
        assert!(m.validate("", "").is_err());
    }

    #[test]
    fn empty_key_pattern_only_matches_empty_key() {
        let m = matcher(&[("", ".*")]);
        assert!(m.validate("", "anything").is_ok());
        assert!(m.validate("a", "anything").is_err());
    }

    #[test]
    fn any_entry_may_match() {
        let m = matcher(&[("a", "1"), ("b", "2")]);
        assert!(m.validate("a", "1").is_ok());
        assert!(m.validate("b", "2").is_ok());
        assert!(m.validate("a", "2").is_err());
    }

    #[test]
    fn rejects_invalid_patterns() {
        let mut m = AllowListMatcher::default();
        let err = m.add("(", ".*").unwrap_err();
        assert!(matches!(err, AllowListError::Pattern { field: "key", .. }));
        let err = m.add(".*", "[").unwrap_err();
        assert!(matches!(err, AllowListError::Pattern { field: "value", .. }));
        assert!(m.is_empty());
    }

    #[test]
    fn validate_all_reports_every_violation() {
        let m = matcher(&[("ok-.*", ".*")]);
        let pairs = btreemap! {
            "ok-1".to_string() => "v".to_string(),
            "bad-1".to_string() => "v".to_string(),
            "bad-2".to_string() => "v".to_string(),
        };
        let err = m.validate_all(&pairs).unwrap_err();
        assert_eq!(err.len(), 2);
        let msg = err.to_string();
        assert!(msg.contains("bad-1"), "{msg}");
        assert!(msg.contains("bad-2"), "{msg}");
    }
}
