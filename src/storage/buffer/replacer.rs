use std::collections::VecDeque;

/// LRU ordering over buffer frames. Every frame stays in the list for the
/// life of the pool; eviction walks it cold-end first and skips frames whose
/// latch cannot be taken.
pub struct LruList {
    /// front = most recently used
    list: VecDeque<usize>,
}

impl LruList {
    pub fn new(pool_size: usize) -> Self {
        Self {
            list: (0..pool_size).collect(),
        }
    }

    /// Move a frame to the hot end.
    pub fn promote(&mut self, frame_id: usize) {
        if let Some(pos) = self.list.iter().position(|&id| id == frame_id) {
            self.list.remove(pos);
        }
        self.list.push_front(frame_id);
    }

    /// Move a frame to the cold end so it is evicted first (freed pages).
    pub fn demote(&mut self, frame_id: usize) {
        if let Some(pos) = self.list.iter().position(|&id| id == frame_id) {
            self.list.remove(pos);
        }
        self.list.push_back(frame_id);
    }

    /// Candidate frames in eviction order (least recently used first).
    pub fn victims(&self) -> impl Iterator<Item = usize> + '_ {
        self.list.iter().rev().copied()
    }
}
