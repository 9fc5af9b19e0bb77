//! Bounded store of accumulated execution output.
//!
//! Entries are evicted in insertion order once the capacity is exceeded.
//! Eviction order lives in its own deque so it never depends on map
//! iteration order.

use std::collections::{HashMap, VecDeque};

/// Default number of execution buffers retained.
pub const DEFAULT_CAPACITY: usize = 250;

#[derive(Debug)]
pub struct OutputBuffer {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Append a chunk to an execution's text, creating the entry if needed.
    pub fn append(&mut self, id: &str, chunk: &str) {
        match self.entries.get_mut(id) {
            Some(text) => text.push_str(chunk),
            None => self.insert(id.to_string(), chunk.to_string()),
        }
    }

    /// Prime the buffer for an id only if it has no entry yet.
    pub fn seed(&mut self, id: &str, output: &str) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.insert(id.to_string(), output.to_string());
        true
    }

    /// Full accumulated text to date.
    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    /// Drop an entry, returning its text.
    pub fn clear(&mut self, id: &str) -> Option<String> {
        let text = self.entries.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(text)
    }

    /// Number of executions with buffered text.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, id: String, text: String) {
        self.order.push_back(id.clone());
        self.entries.insert(id, text);

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            tracing::trace!("Evicted output buffer for {}", oldest);
        }
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_concatenate() {
        let mut buffer = OutputBuffer::default();
        buffer.append("e1", "a");
        buffer.append("e1", "b");
        assert_eq!(buffer.get("e1"), Some("ab"));
        assert_eq!(buffer.get("e2"), None);
    }

    #[test]
    fn overflow_evicts_oldest_insertion_only() {
        let mut buffer = OutputBuffer::new(250);
        for i in 0..250 {
            buffer.append(&format!("e{}", i), "x");
        }
        // Touching the oldest entry must not protect it.
        buffer.append("e0", "y");
        assert_eq!(buffer.len(), 250);

        buffer.append("e250", "z");

        assert_eq!(buffer.len(), 250);
        assert_eq!(buffer.get("e0"), None);
        assert_eq!(buffer.get("e1"), Some("x"));
        assert_eq!(buffer.get("e250"), Some("z"));
    }

    #[test]
    fn seed_only_fills_missing_entries() {
        let mut buffer = OutputBuffer::default();
        assert!(buffer.seed("e1", "restored"));
        assert!(!buffer.seed("e1", "other"));
        buffer.append("e1", "+more");
        assert_eq!(buffer.get("e1"), Some("restored+more"));
    }

    #[test]
    fn clear_releases_slot() {
        let mut buffer = OutputBuffer::new(2);
        buffer.append("a", "1");
        buffer.append("b", "2");
        assert_eq!(buffer.clear("a").as_deref(), Some("1"));
        assert_eq!(buffer.clear("a"), None);

        buffer.append("c", "3");
        assert_eq!(buffer.get("b"), Some("2"));
        assert_eq!(buffer.get("c"), Some("3"));
        assert_eq!(buffer.len(), 2);
    }
}
