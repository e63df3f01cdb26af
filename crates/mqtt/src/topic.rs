//! MQTT topic filter matching.
//!
//! Filters use the broker's wildcard rules:
//! - `+` matches exactly one level
//! - `#` matches any number of levels and must be the last level
//! - topics starting with `$` are not matched by a leading wildcard

/// Returns true if `filter` is a well-formed subscription filter.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(idx, level)| {
        if level.contains('#') {
            *level == "#" && idx == last
        } else if level.contains('+') {
            *level == "+"
        } else {
            true
        }
    })
}

/// Checks if a published topic matches a subscription filter.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic == filter {
        return true;
    }

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}
