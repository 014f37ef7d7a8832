//! Insertion/usage-ordered list backing eviction scans.
//!
//! A doubly linked list of image paths, oldest at the front. Nodes live in a
//! slotmap so handles stay valid across unrelated insertions and removals,
//! which lets the eviction cursor be a plain [`OrderKey`] instead of an
//! iterator that any mutation would invalidate.

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Stable handle to one node in the eviction order.
    pub struct OrderKey;
}

#[derive(Debug)]
struct OrderNode {
    path: String,
    prev: Option<OrderKey>,
    next: Option<OrderKey>,
}

#[derive(Debug, Default)]
pub struct OrderList {
    nodes: SlotMap<OrderKey, OrderNode>,
    head: Option<OrderKey>,
    tail: Option<OrderKey>,
}

impl OrderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Appends `path` as the most recently used node.
    pub fn push_back(&mut self, path: String) -> OrderKey {
        let key = self.nodes.insert(OrderNode {
            path,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(old_tail) => self.nodes[old_tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        key
    }

    /// Unlinks a node, returning its path. `None` if the key is stale.
    pub fn remove(&mut self, key: OrderKey) -> Option<String> {
        let node = self.nodes.remove(key)?;
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }
        Some(node.path)
    }

    pub fn path(&self, key: OrderKey) -> Option<&str> {
        self.nodes.get(key).map(|node| node.path.as_str())
    }

    pub fn next(&self, key: OrderKey) -> Option<OrderKey> {
        self.nodes.get(key).and_then(|node| node.next)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Paths front-to-back, oldest first.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        std::iter::successors(self.head, move |&key| self.nodes[key].next)
            .map(move |key| self.nodes[key].path.as_str())
    }
}
