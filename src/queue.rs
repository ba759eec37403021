//! # Intrusive Queue Module
//!
//! Index linked circular doubly-linked lists over the slots of an [crate::arena::Arena].
//!
//! A [QueueSet] owns one link record per arena slot and the head of each of its `Q` queues.
//! Every slot is a member of at most one queue at any time: inserting a slot into a queue first
//! unlinks it from the queue it is currently in, so moving between queues is a single O(1)
//! operation and the queue sizes always add up to the number of linked slots.
use alloc::vec::Vec;

const NIL: u16 = u16::MAX;
const NO_QUEUE: u8 = u8::MAX;

#[derive(Debug, Copy, Clone)]
struct Link {
    prev: u16,
    next: u16,
    queue: u8,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
            queue: NO_QUEUE,
        }
    }
}

#[derive(Debug)]
pub struct QueueSet<const Q: usize> {
    links: Vec<Link>,
    heads: [u16; Q],
    sizes: [u32; Q],
}

impl<const Q: usize> QueueSet<Q> {
    pub fn new(num_nodes: usize) -> Self {
        debug_assert!(num_nodes < NIL as usize);
        Self {
            links: alloc::vec![Link::default(); num_nodes],
            heads: [NIL; Q],
            sizes: [0; Q],
        }
    }

    #[inline]
    pub fn len(&self, queue: usize) -> u32 {
        self.sizes[queue]
    }

    #[inline]
    pub fn is_empty(&self, queue: usize) -> bool {
        self.heads[queue] == NIL
    }

    pub fn sizes(&self) -> [u32; Q] {
        self.sizes
    }

    /// Queue the node is linked into.
    pub fn queue_of(&self, node: usize) -> Option<usize> {
        self.links
            .get(node)
            .filter(|link| link.queue != NO_QUEUE)
            .map(|link| link.queue as usize)
    }

    pub fn front(&self, queue: usize) -> Option<usize> {
        let head = self.heads[queue];
        (head != NIL).then_some(head as usize)
    }

    pub fn back(&self, queue: usize) -> Option<usize> {
        let head = self.heads[queue];
        (head != NIL).then(|| self.links[head as usize].prev as usize)
    }

    /// Successor of the node inside its queue, [None] at the end of the queue.
    pub fn next(&self, node: usize) -> Option<usize> {
        let link = self.links.get(node)?;
        if link.queue == NO_QUEUE {
            return None;
        }
        let next = link.next;
        (next != self.heads[link.queue as usize]).then_some(next as usize)
    }

    /// Unlink the node from its queue and return that queue.
    pub fn remove(&mut self, node: usize) -> Option<usize> {
        let link = *self.links.get(node)?;
        if link.queue == NO_QUEUE {
            return None;
        }
        let queue = link.queue as usize;
        if link.next as usize == node {
            self.heads[queue] = NIL;
        } else {
            self.links[link.prev as usize].next = link.next;
            self.links[link.next as usize].prev = link.prev;
            if self.heads[queue] as usize == node {
                self.heads[queue] = link.next;
            }
        }
        self.links[node] = Link::default();
        self.sizes[queue] -= 1;
        Some(queue)
    }

    /// Link `node` in front of `before` which must be a member of `queue`, or make it the only
    /// member of an empty queue.
    fn link_before(&mut self, queue: usize, node: usize, before: Option<usize>) {
        self.remove(node);
        match before {
            None => {
                self.links[node] = Link {
                    prev: node as u16,
                    next: node as u16,
                    queue: queue as u8,
                };
                self.heads[queue] = node as u16;
            }
            Some(before) => {
                let prev = self.links[before].prev;
                self.links[node] = Link {
                    prev,
                    next: before as u16,
                    queue: queue as u8,
                };
                self.links[prev as usize].next = node as u16;
                self.links[before].prev = node as u16;
            }
        }
        self.sizes[queue] += 1;
    }

    pub fn push_back(&mut self, queue: usize, node: usize) {
        if node >= self.links.len() {
            return;
        }
        // Self insertion would corrupt the ring when the node is currently the head.
        if self.queue_of(node) == Some(queue) {
            self.remove(node);
        }
        let head = self.front(queue);
        self.link_before(queue, node, head);
    }

    pub fn push_front(&mut self, queue: usize, node: usize) {
        self.push_back(queue, node);
        self.heads[queue] = node as u16;
    }

    /// Insert behind the last member for which `goes_before` holds, starting the search at the
    /// back. Used for priority ordering where equal priorities keep their FIFO order.
    pub fn insert_sorted(&mut self, queue: usize, node: usize, goes_before: impl Fn(usize) -> bool) {
        if node >= self.links.len() {
            return;
        }
        if self.queue_of(node).is_some() {
            self.remove(node);
        }
        let mut cursor = self.back(queue);
        while let Some(member) = cursor {
            if goes_before(member) {
                let after = self.next(member);
                match after {
                    Some(after) => self.link_before(queue, node, Some(after)),
                    None => self.push_back(queue, node),
                }
                return;
            }
            cursor = self.prev(member);
        }
        self.push_front(queue, node);
    }

    /// Predecessor of the node inside its queue, [None] at the start of the queue.
    pub fn prev(&self, node: usize) -> Option<usize> {
        let link = self.links.get(node)?;
        if link.queue == NO_QUEUE || self.heads[link.queue as usize] as usize == node {
            return None;
        }
        Some(link.prev as usize)
    }

    pub fn pop_front(&mut self, queue: usize) -> Option<usize> {
        let front = self.front(queue)?;
        self.remove(front);
        Some(front)
    }

    pub fn iter(&self, queue: usize) -> QueueIter<'_, Q> {
        QueueIter {
            set: self,
            next: self.front(queue),
        }
    }
}

pub struct QueueIter<'a, const Q: usize> {
    set: &'a QueueSet<Q>,
    next: Option<usize>,
}

impl<const Q: usize> Iterator for QueueIter<'_, Q> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = self.set.next(current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    const A: usize = 0;
    const B: usize = 1;
    const C: usize = 2;

    fn members(set: &QueueSet<3>, queue: usize) -> Vec<usize> {
        set.iter(queue).collect()
    }

    fn assert_sizes_consistent(set: &QueueSet<3>, nodes: usize) {
        let mut total = 0;
        for queue in [A, B, C] {
            assert_eq!(set.iter(queue).count() as u32, set.len(queue));
            total += set.len(queue);
        }
        let linked = (0..nodes).filter(|n| set.queue_of(*n).is_some()).count();
        assert_eq!(total as usize, linked);
    }

    #[test]
    fn test_push_and_pop() {
        let mut set: QueueSet<3> = QueueSet::new(4);
        for node in 0..4 {
            set.push_back(A, node);
        }
        assert_eq!(members(&set, A), [0, 1, 2, 3]);
        assert_eq!(set.back(A), Some(3));
        assert_eq!(set.pop_front(A), Some(0));
        assert_eq!(members(&set, A), [1, 2, 3]);
        assert_eq!(set.queue_of(0), None);
        assert_sizes_consistent(&set, 4);
    }

    #[test]
    fn test_move_between_queues() {
        let mut set: QueueSet<3> = QueueSet::new(4);
        for node in 0..4 {
            set.push_back(A, node);
        }
        set.push_back(B, 2);
        set.push_back(C, 0);
        assert_eq!(members(&set, A), [1, 3]);
        assert_eq!(members(&set, B), [2]);
        assert_eq!(members(&set, C), [0]);
        assert_eq!(set.queue_of(2), Some(B));
        assert_sizes_consistent(&set, 4);
    }

    #[test]
    fn test_remove_head_and_only() {
        let mut set: QueueSet<3> = QueueSet::new(3);
        set.push_back(A, 0);
        set.push_back(A, 1);
        assert_eq!(set.remove(0), Some(A));
        assert_eq!(members(&set, A), [1]);
        assert_eq!(set.remove(1), Some(A));
        assert!(set.is_empty(A));
        assert_eq!(set.remove(1), None);
        assert_sizes_consistent(&set, 3);
    }

    #[test]
    fn test_push_back_same_queue_moves_to_back() {
        let mut set: QueueSet<3> = QueueSet::new(3);
        for node in 0..3 {
            set.push_back(A, node);
        }
        set.push_back(A, 0);
        assert_eq!(members(&set, A), [1, 2, 0]);
        set.push_front(A, 0);
        assert_eq!(members(&set, A), [0, 1, 2]);
        assert_sizes_consistent(&set, 3);
    }

    #[test]
    fn test_insert_sorted_keeps_fifo_for_equal_keys() {
        let priorities = [5u8, 1, 5, 3, 0, 5];
        let mut set: QueueSet<3> = QueueSet::new(priorities.len());
        for node in 0..priorities.len() {
            set.insert_sorted(A, node, |member| priorities[member] <= priorities[node]);
        }
        assert_eq!(members(&set, A), [4, 1, 3, 0, 2, 5]);
        assert_sizes_consistent(&set, priorities.len());
    }

    #[test]
    fn test_traversal_safe_under_removal() {
        let mut set: QueueSet<3> = QueueSet::new(5);
        for node in 0..5 {
            set.push_back(A, node);
        }
        let mut cursor = set.front(A);
        while let Some(node) = cursor {
            cursor = set.next(node);
            if node % 2 == 0 {
                set.push_back(B, node);
            }
        }
        assert_eq!(members(&set, A), [1, 3]);
        assert_eq!(members(&set, B), [0, 2, 4]);
    }
}
