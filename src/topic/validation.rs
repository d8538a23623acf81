//! Topic name validation
//!
//! Topics built by the bridge are MQTT topic names, never filters:
//! - Must be at least 1 character
//! - Must not exceed 65535 bytes
//! - Must not contain null character or wildcards (+ or #)
//! - Must not contain empty levels
//!
//! Point identifiers occupy exactly one level, so they additionally must not
//! contain the level separator.

/// Validate a full topic name or topic prefix
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    if topic.split('/').any(str::is_empty) {
        return Err("topic name cannot contain empty levels");
    }

    Ok(())
}

/// Validate a value used as a single topic level
pub fn validate_topic_level(level: &str) -> Result<(), &'static str> {
    if level.contains('/') {
        return Err("topic level cannot contain '/'");
    }
    validate_topic_name(level)
}
