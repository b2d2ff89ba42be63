//! Recency list with O(1) touch, remove and pop-oldest.
//!
//! Keys live in an arena `Vec<Node>` with index links; a `HashMap` maps keys
//! to arena slots. Head is the most recently touched key, tail the oldest.

use std::collections::HashMap;
use std::hash::Hash;

const SENTINEL: usize = usize::MAX;

#[derive(Debug)]
struct Node<K> {
    key: K,
    prev: usize,
    next: usize,
}

/// Ordered set of keys by last touch.
#[derive(Debug)]
pub struct Lru<K> {
    map: HashMap<K, usize>,
    nodes: Vec<Node<K>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Copy + Eq + Hash> Lru<K> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: SENTINEL,
            tail: SENTINEL,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Moves `key` to the front, inserting it if absent.
    pub fn touch(&mut self, key: K) {
        if let Some(&idx) = self.map.get(&key) {
            self.unlink(idx);
            self.push_front(idx);
            return;
        }

        let node = Node {
            key,
            prev: SENTINEL,
            next: SENTINEL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.map.remove(key) {
            Some(idx) => {
                self.unlink(idx);
                self.free.push(idx);
                true
            }
            None => false,
        }
    }

    /// Least recently touched key.
    pub fn back(&self) -> Option<K> {
        (self.tail != SENTINEL).then(|| self.nodes[self.tail].key)
    }

    /// Most recently touched key.
    pub fn front(&self) -> Option<K> {
        (self.head != SENTINEL).then(|| self.nodes[self.head].key)
    }

    pub fn pop_back(&mut self) -> Option<K> {
        let key = self.back()?;
        self.remove(&key);
        Some(key)
    }

    /// Keys from oldest to newest.
    pub fn iter_oldest(&self) -> impl Iterator<Item = K> + '_ {
        let mut cursor = self.tail;
        std::iter::from_fn(move || {
            if cursor == SENTINEL {
                return None;
            }
            let node = &self.nodes[cursor];
            cursor = node.prev;
            Some(node.key)
        })
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == SENTINEL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == SENTINEL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[idx].prev = SENTINEL;
        self.nodes[idx].next = SENTINEL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = SENTINEL;
        self.nodes[idx].next = self.head;
        if self.head != SENTINEL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == SENTINEL {
            self.tail = idx;
        }
    }
}

impl<K: Copy + Eq + Hash> Default for Lru<K> {
    fn default() -> Self {
        Self::new()
    }
}
