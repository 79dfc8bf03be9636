//! Topic name and filter rules
//!
//! - Topic names (PUBLISH) must not contain wildcards
//! - Topic filters (SUBSCRIBE) may use `+` for one whole level and `#` as the
//!   whole last level
//! - Topics starting with `$` are not matched by filters starting with a wildcard

const MAX_TOPIC_LEN: usize = 65535;

fn validate_common(topic: &str, empty: &'static str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err(empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic cannot contain null character");
    }
    Ok(())
}

/// Validate a topic name (used in PUBLISH)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    validate_common(topic, "topic name cannot be empty")?;
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    validate_common(filter, "topic filter cannot be empty")?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}
