use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Logical clock of a log entry.
///
/// Clocks order by `time`, ties are broken by comparing the signer `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    /// Hex public key of the signer.
    pub id: String,
    pub time: u64,
}

impl Clock {
    pub fn new(id: impl Into<String>, time: u64) -> Self {
        Self { id: id.into(), time }
    }

    /// The clock of the next local append.
    pub fn tick(&self) -> Self {
        Self {
            id: self.id.clone(),
            time: self.time + 1,
        }
    }
}

impl Ord for Clock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
