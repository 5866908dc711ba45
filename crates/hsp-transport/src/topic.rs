//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Transport implementations for the messaging bridge."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---

/// MQTT style filter matching: `+` matches one level, a trailing `#` matches
/// the parent level and everything beneath it.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
