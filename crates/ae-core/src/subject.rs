//! Subject naming shared by publishers and subscribers
//!
//! Subjects are derived deterministically from dependency entries so that no
//! registry is needed: an event source publishes `{prefix}.{source}.{event}`
//! and a sensor subscribes to exactly the subjects its dependencies name.

use crate::Dependency;

/// Subject for a single (event source, event name) stream
pub fn event_subject(prefix: &str, event_source_name: &str, event_name: &str) -> String {
    format!("{}.{}.{}", prefix, event_source_name, event_name)
}

/// Subject a dependency subscribes to
pub fn dependency_subject(prefix: &str, dependency: &Dependency) -> String {
    event_subject(prefix, &dependency.event_source_name, &dependency.event_name)
}

/// Wildcard subject filter covering every event under `prefix`
pub fn stream_subjects(prefix: &str) -> String {
    format!("{}.*.*", prefix)
}

/// Match a subject against a filter with NATS-style wildcards
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (filter_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(f), Some(s)) if f == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
