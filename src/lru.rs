//! A doubly-linked LRU list with detachable elements.
//!
//! Links are slab indices rather than raw pointers; an element's slot
//! stays stable for as long as it is attached, so holders of a slot can
//! detach or touch it in O(1).

use slab::Slab;

struct Node<T> {
    item: T,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) struct Lru<T> {
    nodes: Slab<Node<T>>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used; next eviction victim.
    tail: Option<usize>,
}

impl<T: Clone> Lru<T> {
    pub fn new() -> Self {
        Lru {
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Insert at the front, returning the element's slot.
    pub fn push_front(&mut self, item: T) -> usize {
        let slot = self.nodes.insert(Node {
            item,
            prev: None,
            next: self.head,
        });
        match self.head {
            Some(old) => self.nodes[old].prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        slot
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = &self.nodes[slot];
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
    }

    /// Remove the element in `slot` and return it.
    pub fn detach(&mut self, slot: usize) -> T {
        self.unlink(slot);
        self.nodes.remove(slot).item
    }

    /// Move the element in `slot` to the front.
    pub fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        let node = &mut self.nodes[slot];
        node.prev = None;
        node.next = self.head;
        // UNWRAP: the list is non-empty, `slot` was not the head.
        let old_head = self.head.unwrap();
        self.nodes[old_head].prev = Some(slot);
        self.head = Some(slot);
    }

    /// The least-recently-used element, without removing it.
    pub fn peek_back(&self) -> Option<T> {
        self.tail.map(|slot| self.nodes[slot].item.clone())
    }

    /// Remove and return the least-recently-used element.
    pub fn pop_back(&mut self) -> Option<T> {
        let slot = self.tail?;
        Some(self.detach(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T: Clone>(lru: &mut Lru<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = lru.pop_back() {
            out.push(item);
        }
        out
    }

    #[test]
    fn pops_in_lru_order() {
        let mut lru = Lru::new();
        lru.push_front(1);
        lru.push_front(2);
        lru.push_front(3);
        assert_eq!(drain(&mut lru), vec![1, 2, 3]);
    }

    #[test]
    fn touch_moves_to_front() {
        let mut lru = Lru::new();
        let a = lru.push_front('a');
        lru.push_front('b');
        lru.push_front('c');
        lru.touch(a);
        assert_eq!(lru.peek_back(), Some('b'));
        assert_eq!(drain(&mut lru), vec!['b', 'c', 'a']);
    }

    #[test]
    fn detach_from_the_middle() {
        let mut lru = Lru::new();
        lru.push_front(1);
        let mid = lru.push_front(2);
        lru.push_front(3);
        assert_eq!(lru.detach(mid), 2);
        assert_eq!(lru.len(), 2);
        assert_eq!(drain(&mut lru), vec![1, 3]);
    }

    #[test]
    fn detach_head_and_tail() {
        let mut lru = Lru::new();
        let a = lru.push_front(1);
        lru.push_front(2);
        let c = lru.push_front(3);
        lru.detach(c);
        lru.detach(a);
        assert_eq!(lru.peek_back(), Some(2));
        lru.pop_back();
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.peek_back(), None);
    }

    #[test]
    fn slots_are_reusable_after_detach() {
        let mut lru = Lru::new();
        for round in 0..3 {
            let slots: Vec<_> = (0..4).map(|i| lru.push_front(round * 10 + i)).collect();
            for slot in slots {
                lru.detach(slot);
            }
            assert_eq!(lru.len(), 0);
        }
    }
}
