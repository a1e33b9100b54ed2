use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Undoable states kept after the pinned initial entry.
pub const MAX_UNDO_STATES: usize = 50;

/// Visible window of the waveform chart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoomState {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub timestamp: DateTime<Utc>,
}

impl ZoomState {
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
            timestamp: Utc::now(),
        }
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    /// Same window, ignoring when it was recorded.
    pub fn same_window(&self, other: &ZoomState) -> bool {
        self.x_min == other.x_min
            && self.x_max == other.x_max
            && self.y_min == other.y_min
            && self.y_max == other.y_max
    }
}

/// Linear undo/redo over viewport states.
///
/// The first entry is the initial full view and is never evicted, so undo
/// always reaches it; the oldest undoable entry goes first once
/// `MAX_UNDO_STATES` is exceeded.
#[derive(Debug, Clone)]
pub struct ZoomHistory {
    entries: Vec<ZoomState>,
    cursor: usize,
}

impl ZoomHistory {
    pub fn new(initial: ZoomState) -> Self {
        Self {
            entries: vec![initial],
            cursor: 0,
        }
    }

    pub fn current(&self) -> ZoomState {
        self.entries[self.cursor]
    }

    pub fn initial(&self) -> ZoomState {
        self.entries[0]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.entries.len()
    }

    /// Drops any redo tail, then appends `state` as the new current entry.
    pub fn push(&mut self, state: ZoomState) {
        self.entries.truncate(self.cursor + 1);
        self.entries.push(state);
        if self.entries.len() > MAX_UNDO_STATES + 1 {
            self.entries.remove(1);
        }
        self.cursor = self.entries.len() - 1;
    }

    pub fn undo(&mut self) -> Option<ZoomState> {
        if !self.can_undo() {
            return None;
        }
        self.cursor -= 1;
        Some(self.current())
    }

    pub fn redo(&mut self) -> Option<ZoomState> {
        if !self.can_redo() {
            return None;
        }
        self.cursor += 1;
        Some(self.current())
    }

    /// Collapses back to the initial entry.
    pub fn reset(&mut self) -> ZoomState {
        self.entries.truncate(1);
        self.cursor = 0;
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(x: f64) -> ZoomState {
        ZoomState::new(x, x + 1.0, 0.0, 1.0)
    }

    #[test]
    fn undo_walks_back_to_initial() {
        let mut history = ZoomHistory::new(state(0.0));
        for i in 1..=MAX_UNDO_STATES {
            history.push(state(i as f64));
        }
        for _ in 0..MAX_UNDO_STATES {
            assert!(history.undo().is_some());
        }
        assert_eq!(history.current().x_min, 0.0);
        assert_eq!(history.undo(), None);
    }

    #[test]
    fn push_after_undo_discards_redo_tail() {
        let mut history = ZoomHistory::new(state(0.0));
        for i in 1..=5 {
            history.push(state(i as f64));
        }
        history.undo();
        history.undo();
        history.push(state(10.0));

        assert_eq!(history.len(), 5);
        assert!(!history.can_redo());
        assert_eq!(history.undo().map(|s| s.x_min), Some(3.0));
        assert_eq!(history.redo().map(|s| s.x_min), Some(10.0));
    }

    #[test]
    fn overflow_keeps_initial_entry() {
        let mut history = ZoomHistory::new(state(0.0));
        for i in 1..=MAX_UNDO_STATES + 10 {
            history.push(state(i as f64));
        }
        assert_eq!(history.len(), MAX_UNDO_STATES + 1);
        assert_eq!(history.initial().x_min, 0.0);
        assert_eq!(history.entries[1].x_min, 11.0);
    }

    #[test]
    fn reset_collapses_to_first_entry() {
        let mut history = ZoomHistory::new(state(0.0));
        history.push(state(1.0));
        history.push(state(2.0));
        history.undo();

        let reset = history.reset();
        assert_eq!(reset.x_min, 0.0);
        assert_eq!(history.len(), 1);
        assert!(!history.can_undo());
        assert!(!history.can_redo());
    }
}
