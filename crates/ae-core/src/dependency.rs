//! Sensor dependencies and event-to-dependency matching

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named binding to one (event source, event name) stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Name used in dependency expressions
    pub name: String,

    /// Event source name (may contain `*` wildcards)
    pub event_source_name: String,

    /// Event name within the source (may contain `*` wildcards)
    pub event_name: String,
}

impl Dependency {
    /// Create a new dependency
    pub fn new(
        name: impl Into<String>,
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
        }
    }

    /// Key identifying the stream this dependency listens to
    pub fn source_key(&self) -> String {
        source_key(&self.event_source_name, &self.event_name)
    }
}

fn source_key(source: &str, subject: &str) -> String {
    format!("{}__{}", source, subject)
}

/// Errors building a [`DependencyMatcher`]
#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("invalid pattern for dependency '{dependency}': {source}")]
    InvalidPattern {
        dependency: String,
        #[source]
        source: regex::Error,
    },
}

/// Resolves an incoming event's `(source, subject)` to dependency names
///
/// Each dependency compiles to an anchored pattern over
/// `{eventSourceName}__{eventName}` where `*` matches any run of characters.
/// Several dependencies may share a stream, so resolution yields every match
/// in declaration order.
#[derive(Debug, Clone)]
pub struct DependencyMatcher {
    patterns: Vec<(Regex, String)>,
}

impl DependencyMatcher {
    /// Compile matchers for the given dependencies
    pub fn new(dependencies: &[Dependency]) -> Result<Self, MatcherError> {
        let patterns = dependencies
            .iter()
            .map(|dep| {
                let pattern = glob_to_regex(&dep.source_key());
                Regex::new(&pattern)
                    .map(|re| (re, dep.name.clone()))
                    .map_err(|source| MatcherError::InvalidPattern {
                        dependency: dep.name.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    /// Names of all dependencies satisfied by an event from `source`/`subject`
    pub fn resolve(&self, source: &str, subject: &str) -> Vec<&str> {
        let key = source_key(source, subject);
        self.patterns
            .iter()
            .filter(|(re, _)| re.is_match(&key))
            .map(|(_, name)| name.as_str())
            .collect()
    }

    /// Number of compiled dependencies
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no dependencies were compiled
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn glob_to_regex(glob: &str) -> String {
    let escaped: Vec<String> = glob.split('*').map(regex::escape).collect();
    format!("^{}$", escaped.join(".*"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let deps = vec![
            Dependency::new("dep-a", "webhook", "push"),
            Dependency::new("dep-b", "calendar", "tick"),
        ];
        let matcher = DependencyMatcher::new(&deps).unwrap();

        assert_eq!(matcher.resolve("webhook", "push"), vec!["dep-a"]);
        assert_eq!(matcher.resolve("calendar", "tick"), vec!["dep-b"]);
        assert!(matcher.resolve("webhook", "pull").is_empty());
    }

    #[test]
    fn test_wildcard_match() {
        let deps = vec![Dependency::new("any-hook", "webhook", "*")];
        let matcher = DependencyMatcher::new(&deps).unwrap();

        assert_eq!(matcher.resolve("webhook", "push"), vec!["any-hook"]);
        assert_eq!(matcher.resolve("webhook", "release"), vec!["any-hook"]);
        assert!(matcher.resolve("calendar", "push").is_empty());
    }

    #[test]
    fn test_shared_stream_resolves_all_dependencies() {
        let deps = vec![
            Dependency::new("first", "webhook", "push"),
            Dependency::new("second", "webhook", "push"),
        ];
        let matcher = DependencyMatcher::new(&deps).unwrap();

        assert_eq!(matcher.resolve("webhook", "push"), vec!["first", "second"]);
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let deps = vec![Dependency::new("dotted", "a.b", "c+d")];
        let matcher = DependencyMatcher::new(&deps).unwrap();

        assert_eq!(matcher.resolve("a.b", "c+d"), vec!["dotted"]);
        assert!(matcher.resolve("axb", "ccd").is_empty());
    }

    #[test]
    fn test_camel_case_serde() {
        let yaml = r#"{"name": "d", "eventSourceName": "s", "eventName": "e"}"#;
        let dep: Dependency = serde_json::from_str(yaml).unwrap();
        assert_eq!(dep, Dependency::new("d", "s", "e"));
        assert_eq!(dep.source_key(), "s__e");
    }
}
