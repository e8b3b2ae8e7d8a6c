//! Channel naming grammar and the deterministic pattern resolver.
//!
//! Channel names are `:`-separated segments. A subscription pattern may use
//! `*` for any single segment; matching is segment-wise and total, so two
//! observers replaying the same pattern over the same publishes always see
//! the same messages.

/// Direct inbox queue for an agent.
pub fn agent_inbox(agent_id: &str) -> String {
    format!("agent:{agent_id}:inbox")
}

/// Pub/sub channel for a squad cohort.
pub fn squad_channel(squad_id: &str) -> String {
    format!("squad:{squad_id}")
}

/// Liveness channel for a daemon's heartbeat.
pub fn heartbeat_channel(agent_id: &str) -> String {
    format!("heartbeat:{agent_id}")
}

/// Dead-letter companion of a direct queue.
///
/// `agent:<id>:inbox` dead-letters to `dlq:agent:<id>`; any other queue
/// dead-letters to `dlq:<queue>`.
pub fn dlq_channel(queue: &str) -> String {
    let stem = queue.strip_suffix(":inbox").unwrap_or(queue);
    format!("dlq:{stem}")
}

/// Segment-wise pattern match; `*` matches exactly one segment.
pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split(':').collect();
    let channel_segments: Vec<&str> = channel.split(':').collect();
    if pattern_segments.len() != channel_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(&channel_segments)
        .all(|(p, c)| *p == "*" || p == c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_grammar() {
        assert_eq!(agent_inbox("kasra"), "agent:kasra:inbox");
        assert_eq!(squad_channel("alpha"), "squad:alpha");
        assert_eq!(heartbeat_channel("kasra"), "heartbeat:kasra");
        assert_eq!(dlq_channel("agent:kasra:inbox"), "dlq:agent:kasra");
        assert_eq!(dlq_channel("squad:alpha"), "dlq:squad:alpha");
    }

    #[test]
    fn wildcards_bind_one_segment() {
        assert!(channel_matches("squad:*", "squad:alpha"));
        assert!(!channel_matches("squad:*", "squad:alpha:sub"));
        assert!(channel_matches("agent:*:events", "agent:kasra:events"));
        assert!(!channel_matches("agent:*:events", "agent:kasra:inbox"));
        assert!(channel_matches("heartbeat:kasra", "heartbeat:kasra"));
        assert!(!channel_matches("heartbeat:kasra", "heartbeat:mira"));
    }
}
