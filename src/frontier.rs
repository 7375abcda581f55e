use std::collections::VecDeque;
use std::sync::Mutex;

/// FIFO queue of recursion prefixes discovered during a run.
///
/// Each entry is an ordered list of path segments; the head entry is the
/// prefix applied at the recursion position for the current iteration. The
/// queue starts seeded with a single empty segment so the first iteration
/// fuzzes the bare template. During an iteration entries are only appended,
/// which keeps the head stable for every in-flight worker; the dispatcher
/// pops the head once the iteration has fully drained.
#[derive(Debug)]
pub struct Frontier {
    entries: Mutex<VecDeque<Vec<String>>>,
}

impl Frontier {
    pub fn new() -> Self {
        let mut entries = VecDeque::new();
        entries.push_back(vec![String::new()]);
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Clone of the current head entry, if any.
    pub fn head(&self) -> Option<Vec<String>> {
        self.entries.lock().unwrap().front().cloned()
    }

    /// Queues `head ++ [segment]` for a later iteration.
    pub fn push_child(&self, head: &[String], segment: String) {
        let mut entry = head.to_vec();
        entry.push(segment);
        self.entries.lock().unwrap().push_back(entry);
    }

    /// Drops the head entry at the end of an iteration.
    pub fn pop(&self) {
        self.entries.lock().unwrap().pop_front();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Frontier {
    fn default() -> Self {
        Self::new()
    }
}
