use std::collections::HashMap;

use parking_lot::Mutex;

/// Byte ceiling shared by every capture session.
///
/// Each session reports its own running byte count; the total is always the
/// sum of the latest reported counts.
#[derive(Debug, Default)]
pub struct ByteBudget {
    ceiling: Option<u64>,
    sizes: Mutex<HashMap<String, u64>>,
}

impl ByteBudget {
    /// Create a budget. A missing or zero ceiling means unlimited.
    pub fn new(ceiling: Option<u64>) -> Self {
        Self {
            ceiling: ceiling.filter(|c| *c > 0),
            sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a session with a zero count
    pub fn track(&self, container_id: &str) {
        self.sizes
            .lock()
            .entry(container_id.to_string())
            .or_insert(0);
    }

    /// Record the latest count of a session and return the new total
    pub fn report(&self, container_id: &str, size: u64) -> u64 {
        let mut sizes = self.sizes.lock();
        sizes.insert(container_id.to_string(), size);
        sizes.values().sum()
    }

    pub fn total(&self) -> u64 {
        self.sizes.lock().values().sum()
    }

    /// Whether the total has reached the ceiling
    pub fn is_exceeded(&self) -> bool {
        self.ceiling.is_some_and(|ceiling| self.total() >= ceiling)
    }
}
