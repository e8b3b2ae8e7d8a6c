//! The auto-task heuristic.
//!
//! A chat spawns a task when the caller asks explicitly, when the message
//! is long enough to suggest real work, or when it opens with imperative
//! project verbs. An empty message never spawns.

use crate::ChatRequest;

/// Default length threshold in characters.
pub const DEFAULT_LENGTH_THRESHOLD: usize = 400;

/// Default imperative verb set.
pub const DEFAULT_VERBS: &[&str] = &[
    "build", "implement", "deploy", "refactor", "create", "write", "fix", "automate", "migrate",
];

/// Decides "answer now" vs "spawn task".
#[derive(Debug, Clone)]
pub struct TaskHeuristic {
    length_threshold: usize,
    verbs: Vec<String>,
}

impl Default for TaskHeuristic {
    fn default() -> Self {
        Self {
            length_threshold: DEFAULT_LENGTH_THRESHOLD,
            verbs: DEFAULT_VERBS.iter().map(|v| (*v).to_string()).collect(),
        }
    }
}

impl TaskHeuristic {
    /// Heuristic with custom tuning.
    pub fn new(length_threshold: usize, verbs: &[&str]) -> Self {
        Self {
            length_threshold,
            verbs: verbs.iter().map(|v| v.to_lowercase()).collect(),
        }
    }

    /// Whether this chat should become a task.
    pub fn should_spawn(&self, request: &ChatRequest) -> bool {
        if request.message.trim().is_empty() {
            return false;
        }
        if request.task == Some(true) {
            return true;
        }
        if request.message.len() > self.length_threshold {
            return true;
        }
        request
            .message
            .split_whitespace()
            .any(|word| {
                let word = word
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase();
                self.verbs.iter().any(|v| v == &word)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.into(),
            agent_id: None,
            conversation_id: None,
            task: None,
            capability: None,
        }
    }

    #[test]
    fn greetings_do_not_spawn() {
        let heuristic = TaskHeuristic::default();
        assert!(!heuristic.should_spawn(&chat("hello")));
        assert!(!heuristic.should_spawn(&chat("what time is it?")));
    }

    #[test]
    fn imperative_verbs_spawn() {
        let heuristic = TaskHeuristic::default();
        assert!(heuristic.should_spawn(&chat("Build a Python script that lists files")));
        assert!(heuristic.should_spawn(&chat("please refactor the parser module")));
        assert!(heuristic.should_spawn(&chat("Deploy, then tell me.")));
        // Substrings of verbs do not count.
        assert!(!heuristic.should_spawn(&chat("the builder pattern is nice")));
    }

    #[test]
    fn long_messages_spawn() {
        let heuristic = TaskHeuristic::default();
        let long = "a ".repeat(201);
        assert!(long.len() > DEFAULT_LENGTH_THRESHOLD);
        assert!(heuristic.should_spawn(&chat(&long)));
    }

    #[test]
    fn explicit_flag_wins() {
        let heuristic = TaskHeuristic::default();
        let mut request = chat("short and calm");
        request.task = Some(true);
        assert!(heuristic.should_spawn(&request));
    }

    #[test]
    fn empty_message_never_spawns() {
        let heuristic = TaskHeuristic::default();
        let mut request = chat("   ");
        request.task = Some(true);
        assert!(!heuristic.should_spawn(&request));
    }
}
