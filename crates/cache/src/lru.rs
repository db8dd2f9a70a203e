//! O(1) LRU list
//!
//! A doubly-linked recency list keyed by an opaque tag, with the links kept
//! in a hash table. Removal never frees the tracked object; owners keep
//! their data and only fall out of the recency order.

use rustc_hash::FxHashMap;

/// Identity of an entry inside an [`Lru`].
pub type EntryTag = u64;

struct Node<V> {
    prev: Option<EntryTag>,
    next: Option<EntryTag>,
    value: V,
}

/// A least-recently-used list with O(1) touch, insert and removal.
pub struct Lru<V> {
    nodes: FxHashMap<EntryTag, Node<V>>,
    head: Option<EntryTag>,
    tail: Option<EntryTag>,
}

impl<V> Default for Lru<V> {
    fn default() -> Self {
        Lru {
            nodes: FxHashMap::default(),
            head: None,
            tail: None,
        }
    }
}

impl<V> Lru<V> {
    /// An empty list.
    pub fn new() -> Self {
        Lru::default()
    }

    /// Whether the list holds nothing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of linked entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tag is linked.
    pub fn contains(&self, tag: EntryTag) -> bool {
        self.nodes.contains_key(&tag)
    }

    /// Links a new entry at the most-recent end.
    pub fn push_front(&mut self, tag: EntryTag, value: V) {
        debug_assert!(!self.nodes.contains_key(&tag));
        let node = Node {
            prev: None,
            next: self.head,
            value,
        };
        if let Some(h) = self.head {
            self.nodes.get_mut(&h).expect("head exists").prev = Some(tag);
        }
        self.head = Some(tag);
        if self.tail.is_none() {
            self.tail = Some(tag);
        }
        self.nodes.insert(tag, node);
    }

    /// Moves an entry to the most-recent end. No-op if not linked.
    pub fn touch(&mut self, tag: EntryTag) {
        if !self.nodes.contains_key(&tag) || self.head == Some(tag) {
            return;
        }
        let value = self.unlink(tag).expect("checked");
        self.push_front(tag, value);
    }

    /// Unlinks an entry, returning its payload.
    pub fn unlink(&mut self, tag: EntryTag) -> Option<V> {
        let node = self.nodes.remove(&tag)?;
        match node.prev {
            Some(p) => self.nodes.get_mut(&p).expect("linked").next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.nodes.get_mut(&n).expect("linked").prev = node.prev,
            None => self.tail = node.prev,
        }
        Some(node.value)
    }

    /// Unlinks and returns the least-recently-used entry.
    pub fn pop_back(&mut self) -> Option<(EntryTag, V)> {
        let tag = self.tail?;
        let value = self.unlink(tag).expect("tail is linked");
        Some((tag, value))
    }

    /// Tags from most to least recently used, for tests.
    pub fn iter_tags(&self) -> Vec<EntryTag> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cur = self.head;
        while let Some(tag) = cur {
            out.push(tag);
            cur = self.nodes.get(&tag).expect("linked").next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_order() {
        let mut lru = Lru::new();
        lru.push_front(1, ());
        lru.push_front(2, ());
        lru.push_front(3, ());
        assert_eq!(lru.iter_tags(), vec![3, 2, 1]);

        lru.touch(1);
        assert_eq!(lru.iter_tags(), vec![1, 3, 2]);

        assert_eq!(lru.pop_back().map(|(t, _)| t), Some(2));
        assert_eq!(lru.pop_back().map(|(t, _)| t), Some(3));
        assert_eq!(lru.pop_back().map(|(t, _)| t), Some(1));
        assert!(lru.pop_back().is_none());
        assert!(lru.is_empty());
    }

    #[test]
    fn unlink_middle() {
        let mut lru = Lru::new();
        for t in 1..=4 {
            lru.push_front(t, t * 10);
        }
        assert_eq!(lru.unlink(3), Some(30));
        assert_eq!(lru.iter_tags(), vec![4, 2, 1]);
        assert_eq!(lru.unlink(3), None);
    }
}
