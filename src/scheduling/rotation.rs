use crate::queue::QueueItemType;

use super::policy::SchedulingPolicy;

/// Circular cursor over a network's rounds.
#[derive(Debug, Clone)]
pub struct TypeRotation {
    rounds: Vec<Vec<QueueItemType>>,
    cursor: usize,
}

impl TypeRotation {
    pub fn new(policy: SchedulingPolicy, types: &[QueueItemType]) -> Self {
        Self::from_rounds(policy.rounds(types))
    }

    pub fn from_rounds(rounds: Vec<Vec<QueueItemType>>) -> Self {
        let rounds = rounds.into_iter().filter(|r| !r.is_empty()).collect();
        Self { rounds, cursor: 0 }
    }

    /// Returns the current round and moves the cursor to the next one.
    /// `None` only when there are no rounds at all.
    pub fn next(&mut self) -> Option<&[QueueItemType]> {
        if self.rounds.is_empty() {
            return None;
        }
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.rounds.len();
        Some(&self.rounds[index])
    }

    pub fn rounds(&self) -> &[Vec<QueueItemType>] {
        &self.rounds
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}
