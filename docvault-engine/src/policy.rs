//! Namespace exclusion.
//!
//! A pattern is written `database.collection` and split at the first dot, so
//! `admin.system.version` names collection `system.version` of database
//! `admin`. Both halves accept `*` and `?` wildcards; a bare `local` is the
//! same as `local.*`.

use crate::source::CollectionRef;
use crate::utils::ConfigError;
use regex::Regex;
use std::fmt;

pub const DEFAULT_EXCLUDES: &[&str] = &["admin.system.version", "local.*"];

#[derive(Debug, Clone)]
pub struct NamespacePattern {
    raw: String,
    database: Regex,
    collection: Regex,
    whole_database: bool,
}

fn wildcard(part: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(part.len() + 8);
    pattern.push('^');
    for c in part.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

impl NamespacePattern {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let (db, coll) = raw.split_once('.').unwrap_or((raw, "*"));
        if db.is_empty() || coll.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "exclusion pattern {raw:?} must look like <database>.<collection>"
            )));
        }
        let invalid = |e: regex::Error| ConfigError::Invalid(format!("exclusion pattern {raw:?}: {e}"));
        Ok(Self {
            raw: raw.to_string(),
            database: wildcard(db).map_err(invalid)?,
            collection: wildcard(coll).map_err(invalid)?,
            whole_database: coll.chars().all(|c| c == '*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, collection: &CollectionRef) -> bool {
        self.database.is_match(collection.database()) && self.collection.is_match(collection.collection())
    }

    /// True when every collection of `database` matches.
    pub fn covers_database(&self, database: &str) -> bool {
        self.whole_database && self.database.is_match(database)
    }
}

impl PartialEq for NamespacePattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl fmt::Display for NamespacePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Set of namespaces left out of backups and restores.
#[derive(Debug, Clone, PartialEq)]
pub struct ExclusionPolicy {
    patterns: Vec<NamespacePattern>,
}

impl Default for ExclusionPolicy {
    /// Excludes `admin.system.version` and the whole `local` database.
    fn default() -> Self {
        let patterns = DEFAULT_EXCLUDES
            .iter()
            .filter_map(|p| NamespacePattern::parse(p).ok())
            .collect();
        Self { patterns }
    }
}

impl ExclusionPolicy {
    pub fn none() -> Self {
        Self { patterns: Vec::new() }
    }

    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| NamespacePattern::parse(p.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    pub fn patterns(&self) -> &[NamespacePattern] {
        &self.patterns
    }

    pub fn is_excluded(&self, collection: &CollectionRef) -> bool {
        self.patterns.iter().any(|p| p.matches(collection))
    }

    pub fn excludes_database(&self, database: &str) -> bool {
        self.patterns.iter().any(|p| p.covers_database(database))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ExclusionPolicy::default();
        assert!(policy.is_excluded(&CollectionRef::new("admin", "system.version")));
        assert!(policy.is_excluded(&CollectionRef::new("local", "startup_log")));
        assert!(policy.excludes_database("local"));
        assert!(!policy.excludes_database("admin"));
        assert!(!policy.is_excluded(&CollectionRef::new("admin", "system.users")));
        assert!(!policy.is_excluded(&CollectionRef::new("shop", "orders")));
    }

    #[test]
    fn test_wildcards() {
        let policy = ExclusionPolicy::from_patterns(&["shop.tmp_*", "logs?.events"]).unwrap();
        assert!(policy.is_excluded(&CollectionRef::new("shop", "tmp_carts")));
        assert!(!policy.is_excluded(&CollectionRef::new("shop", "carts")));
        assert!(policy.is_excluded(&CollectionRef::new("logs1", "events")));
        assert!(!policy.is_excluded(&CollectionRef::new("logs12", "events")));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let policy = ExclusionPolicy::from_patterns(&["a+b.(c)"]).unwrap();
        assert!(policy.is_excluded(&CollectionRef::new("a+b", "(c)")));
        assert!(!policy.is_excluded(&CollectionRef::new("aab", "c")));
    }

    #[test]
    fn test_bare_database_pattern() {
        let policy = ExclusionPolicy::from_patterns(&["scratch"]).unwrap();
        assert!(policy.excludes_database("scratch"));
        assert!(policy.is_excluded(&CollectionRef::new("scratch", "anything")));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(NamespacePattern::parse(".orders").is_err());
        assert!(NamespacePattern::parse("shop.").is_err());
        assert!(ExclusionPolicy::none().patterns().is_empty());
    }
}
