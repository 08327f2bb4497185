//! Helper function to match MQTT topics against subscription filters
use std::str::Split;

/// Match a `/` separated topic against a filter - implements as MQTT:
///   + - match exactly one level
///   # - match zero or more trailing levels (last level of the filter only)
pub fn match_topic(filter: &str, topic: &str) -> bool {
    match_levels(filter.split('/'), topic.split('/'))
}

fn match_levels(mut filter: Split<char>, mut topic: Split<char>) -> bool {
    loop {
        match (filter.next(), topic.next()) {
            // # swallows the rest, including the parent level itself
            (Some("#"), _) => return filter.next().is_none(),

            // + matches any single level, even an empty one
            (Some("+"), Some(_)) => {}

            // Literal level
            (Some(f), Some(t)) if f == t => {}

            // Both exhausted together
            (None, None) => return true,

            _ => return false,
        }
    }
}
