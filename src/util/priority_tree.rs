//! Approximate priority tree over 64-bit keys.
//!
//! A binary space partition of `[0, u64::MAX]`. Inserts append to the
//! receiving node and are pushed down lazily on the next pop. `pop_min`
//! always returns the smallest key; `pop_near_max` returns a large key
//! cheaply without guaranteeing it is the largest.

/// Leaves with at least this many keys split before serving `pop_min`.
const SPLIT_THRESHOLD: usize = 10;

/// Node of the partition. The root spans the full key range.
#[derive(Debug)]
pub struct PriorityTree {
    /// Lower bound, inclusive.
    low: u64,
    /// First key owned by the right child.
    mid: u64,
    /// Upper bound, inclusive.
    high: u64,
    elements: Vec<u64>,
    sorted: bool,
    is_leaf: bool,
    size: usize,
    left: Option<Box<PriorityTree>>,
    right: Option<Box<PriorityTree>>,
}

impl PriorityTree {
    /// Creates an empty tree covering every `u64` key.
    pub fn new() -> Self {
        Self::with_range(0, u64::MAX)
    }

    fn with_range(low: u64, high: u64) -> Self {
        Self {
            low,
            mid: (low + (high - low) / 2).saturating_add(1),
            high,
            elements: Vec::new(),
            sorted: true,
            is_leaf: true,
            size: 0,
            left: None,
            right: None,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn insert(&mut self, key: u64) {
        self.elements.push(key);
        self.sorted = false;
        self.size += 1;
    }

    /// Removes and returns the smallest key, or `None` when empty.
    pub fn pop_min(&mut self) -> Option<u64> {
        if self.size == 0 {
            return None;
        }

        if self.is_leaf {
            // A single-key range cannot be split further.
            if self.size < SPLIT_THRESHOLD || self.low == self.high {
                if !self.sorted {
                    self.elements.sort_unstable();
                    self.sorted = true;
                }
                self.size -= 1;
                return Some(self.elements.remove(0));
            }
            self.split();
        }

        self.distribute();

        let popped = match (self.left.as_deref_mut(), self.right.as_deref_mut()) {
            (Some(left), _) if !left.is_empty() => left.pop_min(),
            (_, Some(right)) => right.pop_min(),
            _ => None,
        };
        if popped.is_some() {
            self.size -= 1;
        }
        self.collapse_if_empty();
        popped
    }

    /// Removes and returns a large key, or `None` when empty.
    pub fn pop_near_max(&mut self) -> Option<u64> {
        if self.size == 0 {
            return None;
        }

        if self.is_leaf {
            self.size -= 1;
            return self.elements.pop();
        }

        let right_has_keys = self.right.as_ref().is_some_and(|r| !r.is_empty());
        if !right_has_keys {
            self.distribute();
        }

        let popped = match (self.left.as_deref_mut(), self.right.as_deref_mut()) {
            (_, Some(right)) if !right.is_empty() => right.pop_near_max(),
            (Some(left), _) => left.pop_near_max(),
            _ => None,
        };
        if popped.is_some() {
            self.size -= 1;
        }
        self.collapse_if_empty();
        popped
    }

    /// Number of nodes in the partition, leaves included.
    pub fn node_count(&self) -> usize {
        match (&self.left, &self.right) {
            (Some(l), Some(r)) if !self.is_leaf => 1 + l.node_count() + r.node_count(),
            _ => 1,
        }
    }

    fn split(&mut self) {
        self.left = Some(Box::new(Self::with_range(self.low, self.mid - 1)));
        self.right = Some(Box::new(Self::with_range(self.mid, self.high)));
        self.is_leaf = false;
    }

    fn distribute(&mut self) {
        let (Some(left), Some(right)) = (self.left.as_deref_mut(), self.right.as_deref_mut())
        else {
            return;
        };
        for key in self.elements.drain(..) {
            if key < self.mid {
                left.insert(key);
            } else {
                right.insert(key);
            }
        }
        self.sorted = true;
    }

    fn collapse_if_empty(&mut self) {
        if self.size == 0 {
            self.left = None;
            self.right = None;
            self.is_leaf = true;
            self.sorted = true;
        }
    }
}

impl Default for PriorityTree {
    fn default() -> Self {
        Self::new()
    }
}
