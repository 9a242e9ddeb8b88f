//! In-memory ordered multiset of fixed-width records.
//!
//! Nodes live in a `Vec` arena addressed by index rather than behind
//! `Rc<RefCell<_>>` — there is no parent/child/sibling cycle to manage,
//! levels are just parallel forward-link rows per node, matching how the
//! original's skip table links towers without needing owning pointers at
//! every rung.

use rand::Rng;

const MAX_LEVEL: usize = 24;

struct Node {
    value: Vec<u8>,
    forward: Vec<usize>, // index into `nodes`, or NIL
}

const NIL: usize = usize::MAX;

/// Arena-based skip list ordered by a comparator applied to each stored
/// value's full byte buffer (callers slice out the key portion
/// themselves via `key_offset`/`key_len` when comparing, matching how
/// views build `(indexed ∥ primary)` composite keys).
pub struct SkipList {
    nodes: Vec<Node>,
    head: Vec<usize>, // forward pointers out of the (virtual) head
    level: usize,
    len: usize,
    key_offset: usize,
    key_len: usize,
}

impl SkipList {
    pub fn new(key_offset: usize, key_len: usize) -> Self {
        SkipList {
            nodes: Vec::new(),
            head: vec![NIL; MAX_LEVEL],
            level: 1,
            len: 0,
            key_offset,
            key_len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn key_of<'a>(&self, value: &'a [u8]) -> &'a [u8] {
        &value[self.key_offset..self.key_offset + self.key_len]
    }

    fn random_level(&self) -> usize {
        let mut level = 1;
        let mut rng = rand::thread_rng();
        while level < MAX_LEVEL && rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    /// Finds, for each level, the index of the last node whose key is
    /// strictly less than `key` (or `NIL` meaning "the head").
    fn find_predecessors(&self, key: &[u8]) -> Vec<usize> {
        let mut update = vec![NIL; MAX_LEVEL];
        let mut current = NIL;
        for lvl in (0..self.level).rev() {
            loop {
                let next = if current == NIL {
                    self.head[lvl]
                } else {
                    self.nodes[current].forward[lvl]
                };
                if next != NIL && self.key_of(&self.nodes[next].value) < key {
                    current = next;
                } else {
                    break;
                }
            }
            update[lvl] = current;
        }
        update
    }

    /// Inserts `value`, returning the index of the node (new, or the
    /// existing node if an equal key is already present — this is a
    /// multiset over distinct keys at the `key_offset..key_offset+key_len`
    /// slice, mirroring how secondary-index composite keys are unique by
    /// construction).
    pub fn insert(&mut self, value: Vec<u8>) -> usize {
        let key = self.key_of(&value).to_vec();
        let update = self.find_predecessors(&key);

        let successor = if update[0] == NIL {
            self.head[0]
        } else {
            self.nodes[update[0]].forward[0]
        };
        if successor != NIL && self.key_of(&self.nodes[successor].value) == key.as_slice() {
            return successor;
        }

        let new_level = self.random_level();
        if new_level > self.level {
            self.level = new_level;
        }

        let new_index = self.nodes.len();
        self.nodes.push(Node {
            value,
            forward: vec![NIL; new_level],
        });

        for lvl in 0..new_level {
            let pred = update[lvl];
            if pred == NIL {
                self.nodes[new_index].forward[lvl] = self.head[lvl];
                self.head[lvl] = new_index;
            } else {
                self.nodes[new_index].forward[lvl] = self.nodes[pred].forward[lvl];
                self.nodes[pred].forward[lvl] = new_index;
            }
        }

        self.len += 1;
        new_index
    }

    pub fn erase(&mut self, key: &[u8]) -> bool {
        let update = self.find_predecessors(key);
        let target = if update[0] == NIL {
            self.head[0]
        } else {
            self.nodes[update[0]].forward[0]
        };
        if target == NIL || self.key_of(&self.nodes[target].value) != key {
            return false;
        }

        let target_levels = self.nodes[target].forward.len();
        for lvl in 0..target_levels {
            let pred = update[lvl];
            let next = self.nodes[target].forward[lvl];
            if pred == NIL {
                self.head[lvl] = next;
            } else {
                self.nodes[pred].forward[lvl] = next;
            }
        }
        self.len -= 1;
        true
    }

    pub fn lower_bound(&self, key: &[u8]) -> SkipIter {
        let update = self.find_predecessors(key);
        let start = if update[0] == NIL { self.head[0] } else { self.nodes[update[0]].forward[0] };
        SkipIter { list: self, current: start }
    }

    pub fn upper_bound(&self, key: &[u8]) -> SkipIter {
        let mut it = self.lower_bound(key);
        if let Some(v) = it.peek() {
            if self.key_of(v) == key {
                it.advance();
            }
        }
        it
    }

    pub fn begin(&self) -> SkipIter {
        SkipIter { list: self, current: self.head[0] }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = vec![NIL; MAX_LEVEL];
        self.level = 1;
        self.len = 0;
    }
}

pub struct SkipIter<'a> {
    list: &'a SkipList,
    current: usize,
}

impl<'a> SkipIter<'a> {
    pub fn peek(&self) -> Option<&'a [u8]> {
        if self.current == NIL {
            None
        } else {
            Some(&self.list.nodes[self.current].value)
        }
    }

    pub fn advance(&mut self) {
        if self.current != NIL {
            self.current = self.list.nodes[self.current].forward[0];
        }
    }
}

impl<'a> Iterator for SkipIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.peek();
        if item.is_some() {
            self.advance();
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key: u32, payload: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&key.to_be_bytes());
        v.extend_from_slice(&payload.to_be_bytes());
        v
    }

    #[test]
    fn insert_keeps_order_and_dedupes_keys() {
        let mut list = SkipList::new(0, 4);
        for k in [5u32, 1, 3, 2, 4] {
            list.insert(rec(k, k));
        }
        list.insert(rec(3, 999)); // duplicate key: no-op
        assert_eq!(list.len(), 5);
        let keys: Vec<u32> = list.begin().map(|v| u32::from_be_bytes(v[0..4].try_into().unwrap())).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn erase_removes_and_relinks() {
        let mut list = SkipList::new(0, 4);
        for k in 0..20u32 {
            list.insert(rec(k, k));
        }
        assert!(list.erase(&10u32.to_be_bytes()));
        assert_eq!(list.len(), 19);
        assert!(!list.erase(&10u32.to_be_bytes()));
    }

    #[test]
    fn lower_bound_finds_first_not_less() {
        let mut list = SkipList::new(0, 4);
        for k in [0u32, 10, 20, 30] {
            list.insert(rec(k, 0));
        }
        let found = list.lower_bound(&15u32.to_be_bytes()).peek().unwrap();
        assert_eq!(u32::from_be_bytes(found[0..4].try_into().unwrap()), 20);
    }
}
