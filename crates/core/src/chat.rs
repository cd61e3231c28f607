use crate::error::StoreError;
use crate::models::Turn;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_HISTORY_WINDOW: usize = 10;

// FIFO-bounded turn record. File-backed histories persist on every append so
// a crashed session loses at most the in-flight turn.
#[derive(Debug)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
    window: usize,
    path: Option<PathBuf>,
}

impl ConversationHistory {
    pub fn in_memory(window: usize) -> Self {
        Self {
            turns: Vec::new(),
            window: window.max(1),
            path: None,
        }
    }

    /// A missing file starts empty; a corrupt file starts empty with a
    /// warning rather than failing the session.
    pub fn open(path: impl Into<PathBuf>, window: usize) -> Self {
        let path = path.into();
        let window = window.max(1);
        let turns = load_turns(&path, window);
        Self {
            turns,
            window,
            path: Some(path),
        }
    }

    pub fn append(&mut self, turn: Turn) -> Result<(), StoreError> {
        self.turns.push(turn);
        let excess = self.turns.len().saturating_sub(self.window);
        if excess > 0 {
            self.turns.drain(..excess);
        }
        self.save()
    }

    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            let serialized = serde_json::to_string_pretty(&self.turns)?;
            std::fs::write(path, serialized)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.turns.clear();
        self.save()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The most recent `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> &[Turn] {
        &self.turns[self.turns.len().saturating_sub(n)..]
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

fn load_turns(path: &Path, window: usize) -> Vec<Turn> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(error) => {
            warn!(path = %path.display(), %error, "unable to read conversation history, starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<Turn>>(&raw) {
        Ok(mut turns) => {
            let excess = turns.len().saturating_sub(window);
            if excess > 0 {
                turns.drain(..excess);
            }
            turns
        }
        Err(error) => {
            warn!(path = %path.display(), %error, "conversation history is corrupt, starting empty");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn window_evicts_oldest_turns_first() -> Result<(), Box<dyn std::error::Error>> {
        let mut history = ConversationHistory::in_memory(3);

        for index in 0..4 {
            history.append(Turn::user(format!("question {index}")))?;
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.turns()[0].content, "question 1");
        assert_eq!(history.turns()[2].content, "question 3");
        Ok(())
    }

    #[test]
    fn history_round_trips_through_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("history.json");

        let mut history = ConversationHistory::open(&path, 10);
        history.append(Turn::user("what controls delta shape?"))?;
        history.append(Turn::assistant("river, wave, and tide forcing."))?;

        let reloaded = ConversationHistory::open(&path, 10);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.turns()[0].role, Role::User);
        assert_eq!(reloaded.turns()[1].role, Role::Assistant);
        Ok(())
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let history = ConversationHistory::open(dir.path().join("absent.json"), 5);
        assert!(history.is_empty());
    }

    #[test]
    fn corrupt_file_loads_as_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("history.json");
        fs::write(&path, "{ this is not json ]")?;

        let history = ConversationHistory::open(&path, 5);
        assert!(history.is_empty());
        Ok(())
    }

    #[test]
    fn reload_applies_the_window() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("history.json");

        let mut history = ConversationHistory::open(&path, 10);
        for index in 0..6 {
            history.append(Turn::user(format!("turn {index}")))?;
        }

        let reloaded = ConversationHistory::open(&path, 4);
        assert_eq!(reloaded.len(), 4);
        assert_eq!(reloaded.turns()[0].content, "turn 2");
        Ok(())
    }

    #[test]
    fn recent_returns_newest_turns_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut history = ConversationHistory::in_memory(10);
        for index in 0..5 {
            history.append(Turn::user(format!("turn {index}")))?;
        }

        let recent = history.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "turn 3");
        assert_eq!(recent[1].content, "turn 4");
        Ok(())
    }

    #[test]
    fn clear_persists_an_empty_history() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("history.json");

        let mut history = ConversationHistory::open(&path, 5);
        history.append(Turn::user("hello"))?;
        history.clear()?;

        let reloaded = ConversationHistory::open(&path, 5);
        assert!(reloaded.is_empty());
        Ok(())
    }
}
