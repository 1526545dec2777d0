pub const TOPIC_SEPARATOR: char = '/';
pub const MULTI_LEVEL_WILDCARD: &str = "#";
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Join a prefix and segments with '/'.
///
/// Empty prefixes and segments are skipped so callers never produce `//`.
///
/// # Examples
/// ```
/// use common::bus::build_topic;
///
/// assert_eq!(build_topic("edgex/response", &["core-command", "r1"]), "edgex/response/core-command/r1");
/// ```
pub fn build_topic(prefix: &str, segments: &[&str]) -> String {
    let mut topic = prefix.trim_end_matches(TOPIC_SEPARATOR).to_string();
    for segment in segments.iter().filter(|s| !s.is_empty()) {
        if !topic.is_empty() {
            topic.push(TOPIC_SEPARATOR);
        }
        topic.push_str(segment);
    }
    topic
}

/// Number of literal segments before a trailing `#` wildcard.
///
/// `edgex/core/command/request/#` has a prefix length of 4. A pattern without a
/// trailing wildcard counts all of its segments.
pub fn topic_prefix_len(pattern: &str) -> usize {
    let segments: Vec<&str> = pattern.split(TOPIC_SEPARATOR).collect();
    match segments.last() {
        Some(&MULTI_LEVEL_WILDCARD) => segments.len() - 1,
        _ => segments.len(),
    }
}

/// MQTT style matching of a concrete topic against a subscription pattern
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split(TOPIC_SEPARATOR);
    let mut topic_segments = topic.split(TOPIC_SEPARATOR);

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Translate a '/' topic into a NATS subject (`/`→`.`, `+`→`*`, `#`→`>`)
pub fn topic_to_subject(topic: &str) -> String {
    topic
        .split(TOPIC_SEPARATOR)
        .map(|segment| match segment {
            MULTI_LEVEL_WILDCARD => ">",
            SINGLE_LEVEL_WILDCARD => "*",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Translate a NATS subject back into a '/' topic
pub fn subject_to_topic(subject: &str) -> String {
    subject.replace('.', "/")
}
