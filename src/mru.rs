//! Most-recently-used index
//!
//! A bounded recency ranking over live keys. The list is an arena of slots
//! linked by index, with a `key → slot` map on the side, so promote, remove
//! and evict are all O(1).

use parking_lot::Mutex;
use std::collections::HashMap;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Slot {
    key: String,
    prev: usize,
    next: usize,
}

/// Doubly linked recency list. `head` is the most recent key.
#[derive(Debug)]
pub struct RecencyList {
    capacity: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: usize,
    tail: usize,
}

impl RecencyList {
    /// `capacity` is clamped to at least one entry
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Make `key` the most recent entry, adding it if absent.
    /// Returns the least recent key if adding pushed the list past capacity.
    pub fn touch(&mut self, key: &str) -> Option<String> {
        if let Some(&slot) = self.index.get(key) {
            self.unlink(slot);
            self.push_front(slot);
            return None;
        }

        let slot = self.allocate(key.to_string());
        self.index.insert(key.to_string(), slot);
        self.push_front(slot);

        if self.index.len() > self.capacity {
            self.pop_back()
        } else {
            None
        }
    }

    /// Drop `key` from the ranking. Returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.unlink(slot);
                self.release(slot);
                true
            }
            None => false,
        }
    }

    /// Keys from most to least recent
    pub fn ranking(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while cursor != NIL {
            let slot = &self.slots[cursor];
            keys.push(slot.key.clone());
            cursor = slot.next;
        }
        keys
    }

    fn allocate(&mut self, key: String) -> usize {
        let slot = Slot {
            key,
            prev: NIL,
            next: NIL,
        };
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = slot;
                i
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot].key.clear();
        self.free.push(slot);
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].prev = NIL;
        self.slots[slot].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[slot].prev = NIL;
        self.slots[slot].next = NIL;
    }

    fn pop_back(&mut self) -> Option<String> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.unlink(slot);
        let key = std::mem::take(&mut self.slots[slot].key);
        self.index.remove(&key);
        self.free.push(slot);
        Some(key)
    }
}

/// Shared handle around [`RecencyList`]
#[derive(Debug)]
pub struct MruIndex {
    list: Mutex<RecencyList>,
}

impl MruIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            list: Mutex::new(RecencyList::new(capacity)),
        }
    }

    pub fn touch(&self, key: &str) -> Option<String> {
        self.list.lock().touch(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.list.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.list.lock().contains(key)
    }

    pub fn ranking(&self) -> Vec<String> {
        self.list.lock().ranking()
    }

    pub fn capacity(&self) -> usize {
        self.list.lock().capacity()
    }
}
