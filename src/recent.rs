//! Bounded memory of recently seen keys.
//!
//! Change feeds are at-least-once and broadcasts can arrive on two channels,
//! so listeners remember what they already reported. A session can run for
//! hours; the oldest keys are forgotten once `capacity` is reached.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub(crate) struct RecentSet<T> {
    order: VecDeque<T>,
    members: HashSet<T>,
    capacity: usize,
}

impl<T: Copy + Eq + Hash> RecentSet<T> {
    /// `capacity` is clamped to at least 1.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `key`. `false` if it was already remembered.
    pub(crate) fn insert(&mut self, key: T) -> bool {
        if !self.members.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub(crate) fn remove(&mut self, key: &T) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        self.order.retain(|candidate| candidate != key);
        true
    }

    pub(crate) fn contains(&self, key: &T) -> bool {
        self.members.contains(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_key_is_forgotten_at_capacity() {
        let mut recent = RecentSet::new(2);
        assert!(recent.insert(1));
        assert!(recent.insert(2));
        assert!(!recent.insert(2));
        assert!(recent.insert(3));
        assert_eq!(recent.len(), 2);
        assert!(!recent.contains(&1));
        assert!(recent.contains(&2) && recent.contains(&3));
    }

    #[test]
    fn removed_keys_free_their_slot() {
        let mut recent = RecentSet::new(2);
        recent.insert(1);
        recent.insert(2);
        assert!(recent.remove(&1));
        assert!(!recent.remove(&1));
        recent.insert(3);
        assert!(recent.contains(&2));
        assert_eq!(recent.len(), 2);
    }
}
