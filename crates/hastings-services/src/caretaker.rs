//! CareTaker — LIFO history of walk mementos.
//!
//! The caretaker never looks inside a memento. It only stores, returns and
//! drops them. When bounded, the oldest memento is discarded on overflow so
//! rollback always reaches the most recent rounds.

use std::collections::VecDeque;

use crate::memento::Memento;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// Nothing left to roll back to. The walk must re-seed.
    #[error("walk history is empty")]
    EmptyHistory,
}

#[derive(Debug, Default)]
pub struct CareTaker {
    history: VecDeque<Memento>,
    capacity: Option<usize>,
}

impl CareTaker {
    /// Unbounded history.
    pub fn new() -> Self {
        Self::default()
    }

    /// History holding at most `capacity` mementos. 0 = unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            history: VecDeque::new(),
            capacity: (capacity > 0).then_some(capacity),
        }
    }

    /// Push a memento.
    pub fn add(&mut self, memento: Memento) {
        if let Some(cap) = self.capacity {
            while self.history.len() >= cap {
                self.history.pop_front();
            }
        }
        self.history.push_back(memento);
    }

    /// Pop the most recent memento.
    pub fn get(&mut self) -> Result<Memento, HistoryError> {
        self.history.pop_back().ok_or(HistoryError::EmptyHistory)
    }

    /// Most recent memento, left in place.
    pub fn peek(&self) -> Result<&Memento, HistoryError> {
        self.history.back().ok_or(HistoryError::EmptyHistory)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
