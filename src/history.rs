use std::collections::VecDeque;

pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// In-memory command history for one tab. Nothing is persisted.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    limit: usize,
    cursor: Option<usize>,
    draft: String,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl CommandHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
            cursor: None,
            draft: String::new(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
        self.reset();
    }

    pub fn push(&mut self, command: &str) {
        let command = command.trim();
        self.reset();
        if command.is_empty() || self.entries.back().is_some_and(|last| last == command) {
            return;
        }
        self.entries.push_back(command.to_string());
        if self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    /// Steps back in time. `current` is the text being edited, restored when
    /// stepping forward past the newest entry.
    pub fn previous(&mut self, current: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let next = match self.cursor {
            None => {
                self.draft = current.to_string();
                self.entries.len() - 1
            }
            Some(0) => 0,
            Some(cursor) => cursor - 1,
        };
        self.cursor = Some(next);
        self.entries.get(next).map(String::as_str)
    }

    pub fn next(&mut self) -> Option<&str> {
        let cursor = self.cursor?;
        if cursor + 1 >= self.entries.len() {
            self.cursor = None;
            return Some(self.draft.as_str());
        }
        self.cursor = Some(cursor + 1);
        self.entries.get(cursor + 1).map(String::as_str)
    }

    pub fn reset(&mut self) {
        self.cursor = None;
        self.draft.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::CommandHistory;

    #[test]
    fn walks_back_and_restores_draft() {
        let mut history = CommandHistory::new(10);
        history.push("kubectl get pods");
        history.push("kubectl get svc");

        assert_eq!(history.previous("kub"), Some("kubectl get svc"));
        assert_eq!(history.previous("ignored"), Some("kubectl get pods"));
        assert_eq!(history.previous("ignored"), Some("kubectl get pods"));
        assert_eq!(history.next(), Some("kubectl get svc"));
        assert_eq!(history.next(), Some("kub"));
        assert_eq!(history.next(), None);
    }

    #[test]
    fn skips_blank_and_repeated_commands() {
        let mut history = CommandHistory::new(10);
        history.push("ls");
        history.push("ls");
        history.push("   ");
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn evicts_oldest_beyond_limit() {
        let mut history = CommandHistory::new(2);
        history.push("a");
        history.push("b");
        history.push("c");
        assert_eq!(history.len(), 2);
        assert_eq!(history.previous(""), Some("c"));
        assert_eq!(history.previous(""), Some("b"));
        assert_eq!(history.previous(""), Some("b"));
    }
}
