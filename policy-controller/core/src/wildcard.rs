use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};
use thiserror::Error;

/// A shell-style glob supporting `*` (any run of characters) and `?` (exactly
/// one character). Every other character matches literally.
#[derive(Clone, Debug)]
pub struct Wildcard {
    pattern: String,
    regex: Regex,
}

/// An ordered list of globs; a value is allowed if any glob matches it.
#[derive(Clone, Debug, Default)]
pub struct WildcardList(Vec<Wildcard>);

#[derive(Debug, Error)]
#[error("invalid wildcard pattern {pattern:?}: {source}")]
pub struct WildcardError {
    pattern: String,
    #[source]
    source: regex::Error,
}

/// Reported when keys that no glob allows were changed between two maps.
#[derive(Debug)]
pub struct ChangedKeysError {
    pub keys: Vec<String>,
    allowed: Vec<String>,
    old: BTreeMap<String, String>,
    new: BTreeMap<String, String>,
}

// === impl Wildcard ===

impl Wildcard {
    pub fn new(pattern: impl Into<String>) -> Result<Self, WildcardError> {
        let pattern = pattern.into();
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|source| WildcardError {
            pattern: pattern.clone(),
            source,
        })?;
        Ok(Self { pattern, regex })
    }

    #[inline]
    pub fn matches(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Display for Wildcard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pattern.fmt(f)
    }
}

// === impl WildcardList ===

impl WildcardList {
    pub fn new<I, S>(patterns: I) -> Result<Self, WildcardError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        patterns
            .into_iter()
            .map(Wildcard::new)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, s: &str) -> bool {
        self.0.iter().any(|w| w.matches(s))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(Wildcard::as_str)
    }

    /// Checks that every key which differs between `old` and `new` matches at
    /// least one glob in this list.
    ///
    /// A key has changed if it is present on only one side or if its value
    /// differs. All offending keys are reported at once.
    pub fn validate_changed_keys(
        &self,
        old: &BTreeMap<String, String>,
        new: &BTreeMap<String, String>,
    ) -> Result<(), ChangedKeysError> {
        let keys = changed_keys(old, new)
            .into_iter()
            .filter(|k| !self.matches(k))
            .map(str::to_string)
            .collect::<Vec<_>>();
        if keys.is_empty() {
            return Ok(());
        }

        Err(ChangedKeysError {
            keys,
            allowed: self.patterns().map(str::to_string).collect(),
            old: old.clone(),
            new: new.clone(),
        })
    }
}

/// Returns the sorted set of keys that were added, removed or modified.
pub fn changed_keys<'m>(
    old: &'m BTreeMap<String, String>,
    new: &'m BTreeMap<String, String>,
) -> BTreeSet<&'m str> {
    let mut changed = BTreeSet::new();
    for (k, v) in old {
        if new.get(k) != Some(v) {
            changed.insert(k.as_str());
        }
    }
    for k in new.keys() {
        if !old.contains_key(k) {
            changed.insert(k.as_str());
        }
    }
    changed
}

// === impl ChangedKeysError ===

impl fmt::Display for ChangedKeysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the following keys are not allowed to be changed: {}; allowed keys: [{}]; old: {:?}, new: {:?}",
            self.keys.join(", "),
            self.allowed.join(", "),
            self.old,
            self.new,
        )
    }
}

impl std::error::Error for ChangedKeysError {}
