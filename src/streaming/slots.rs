//! GPU page slot arena
//!
//! Slots have a fixed identity (their index doubles as the GPU page
//! index) and move between an intrusive free list and an LRU-ordered
//! used list. Links are indices into the arena, not pointers.

use crate::core::types::INVALID_INDEX;

/// Identifies one page of one registered geometry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub resource: u32,
    pub page: u32,
}

pub type SlotId = u32;

#[derive(Clone, Debug)]
struct Slot {
    prev: u32,
    next: u32,
    resident: Option<PageKey>,
    pending: Option<PageKey>,
    ref_count: u32,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            prev: INVALID_INDEX,
            next: INVALID_INDEX,
            resident: None,
            pending: None,
            ref_count: 0,
        }
    }
}

/// Arena of page slots with a free list and an LRU used list. Slot ids
/// are offset by `base` so several pools share one GPU index space.
#[derive(Debug, Default)]
pub struct PageSlotList {
    base: u32,
    slots: Vec<Slot>,
    free_head: u32,
    used_head: u32,
    used_tail: u32,
}

impl PageSlotList {
    pub fn new(base: u32, count: u32) -> Self {
        let mut list = Self {
            base,
            slots: Vec::with_capacity(count as usize),
            free_head: INVALID_INDEX,
            used_head: INVALID_INDEX,
            used_tail: INVALID_INDEX,
        };
        list.grow(count);
        list
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: SlotId) -> bool {
        id >= self.base && ((id - self.base) as usize) < self.slots.len()
    }

    /// Append `added` fresh slots to the free list
    pub fn grow(&mut self, added: u32) {
        for _ in 0..added {
            let local = self.slots.len() as u32;
            self.slots.push(Slot::default());
            self.push_free(local);
        }
    }

    fn push_free(&mut self, local: u32) {
        self.slots[local as usize].prev = INVALID_INDEX;
        self.slots[local as usize].next = self.free_head;
        if self.free_head != INVALID_INDEX {
            self.slots[self.free_head as usize].prev = local;
        }
        self.free_head = local;
    }

    fn unlink_used(&mut self, local: u32) {
        let (prev, next) = {
            let slot = &self.slots[local as usize];
            (slot.prev, slot.next)
        };
        if prev != INVALID_INDEX {
            self.slots[prev as usize].next = next;
        } else {
            self.used_head = next;
        }
        if next != INVALID_INDEX {
            self.slots[next as usize].prev = prev;
        } else {
            self.used_tail = prev;
        }
    }

    fn push_used_front(&mut self, local: u32) {
        self.slots[local as usize].prev = INVALID_INDEX;
        self.slots[local as usize].next = self.used_head;
        if self.used_head != INVALID_INDEX {
            self.slots[self.used_head as usize].prev = local;
        } else {
            self.used_tail = local;
        }
        self.used_head = local;
    }

    /// Take a free slot and place it at the recent end of the used
    /// list; `None` when the pool is exhausted
    pub fn acquire(&mut self) -> Option<SlotId> {
        if self.free_head == INVALID_INDEX {
            return None;
        }
        let local = self.free_head;
        self.free_head = self.slots[local as usize].next;
        if self.free_head != INVALID_INDEX {
            self.slots[self.free_head as usize].prev = INVALID_INDEX;
        }
        self.push_used_front(local);
        Some(self.base + local)
    }

    /// Return a used slot to the free list, clearing its bindings
    pub fn release(&mut self, id: SlotId) {
        debug_assert!(self.contains(id));
        let local = id - self.base;
        self.unlink_used(local);
        let slot = &mut self.slots[local as usize];
        slot.resident = None;
        slot.pending = None;
        slot.ref_count = 0;
        self.push_free(local);
    }

    /// Mark a used slot as most recently used
    pub fn touch(&mut self, id: SlotId) {
        debug_assert!(self.contains(id));
        let local = id - self.base;
        if self.used_head == local {
            return;
        }
        self.unlink_used(local);
        self.push_used_front(local);
    }

    /// Used slots from least to most recently used
    pub fn iter_lru(&self) -> impl Iterator<Item = SlotId> + '_ {
        let mut cursor = self.used_tail;
        std::iter::from_fn(move || {
            if cursor == INVALID_INDEX {
                return None;
            }
            let id = self.base + cursor;
            cursor = self.slots[cursor as usize].prev;
            Some(id)
        })
    }

    pub fn resident(&self, id: SlotId) -> Option<PageKey> {
        self.slots[(id - self.base) as usize].resident
    }

    pub fn set_resident(&mut self, id: SlotId, key: Option<PageKey>) {
        self.slots[(id - self.base) as usize].resident = key;
    }

    pub fn pending(&self, id: SlotId) -> Option<PageKey> {
        self.slots[(id - self.base) as usize].pending
    }

    pub fn set_pending(&mut self, id: SlotId, key: Option<PageKey>) {
        self.slots[(id - self.base) as usize].pending = key;
    }

    pub fn ref_count(&self, id: SlotId) -> u32 {
        self.slots[(id - self.base) as usize].ref_count
    }

    pub fn add_ref(&mut self, id: SlotId) {
        self.slots[(id - self.base) as usize].ref_count += 1;
    }

    pub fn remove_ref(&mut self, id: SlotId) {
        let slot = &mut self.slots[(id - self.base) as usize];
        debug_assert!(slot.ref_count > 0);
        slot.ref_count = slot.ref_count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(page: u32) -> PageKey {
        PageKey { resource: 0, page }
    }

    #[test]
    fn test_acquire_exhausts_pool() {
        let mut slots = PageSlotList::new(0, 2);
        assert!(slots.acquire().is_some());
        assert!(slots.acquire().is_some());
        assert!(slots.acquire().is_none());
    }

    #[test]
    fn test_release_recycles() {
        let mut slots = PageSlotList::new(0, 1);
        let id = slots.acquire().unwrap();
        slots.set_resident(id, Some(key(7)));
        slots.release(id);
        let again = slots.acquire().unwrap();
        assert_eq!(again, id);
        assert!(slots.resident(again).is_none());
    }

    #[test]
    fn test_lru_order_and_touch() {
        let mut slots = PageSlotList::new(0, 3);
        let a = slots.acquire().unwrap();
        let b = slots.acquire().unwrap();
        let c = slots.acquire().unwrap();

        // a was acquired first, so it is least recently used
        let order: Vec<SlotId> = slots.iter_lru().collect();
        assert_eq!(order, vec![a, b, c]);

        slots.touch(a);
        let order: Vec<SlotId> = slots.iter_lru().collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn test_base_offsets_ids() {
        let mut slots = PageSlotList::new(100, 2);
        let id = slots.acquire().unwrap();
        assert!(id >= 100);
        assert!(slots.contains(id));
        assert!(!slots.contains(0));
    }

    #[test]
    fn test_grow_adds_free_slots() {
        let mut slots = PageSlotList::new(0, 1);
        assert!(slots.acquire().is_some());
        assert!(slots.acquire().is_none());
        slots.grow(2);
        assert_eq!(slots.len(), 3);
        assert!(slots.acquire().is_some());
        assert!(slots.acquire().is_some());
    }

    #[test]
    fn test_ref_count_tracking() {
        let mut slots = PageSlotList::new(0, 1);
        let id = slots.acquire().unwrap();
        slots.add_ref(id);
        slots.add_ref(id);
        assert_eq!(slots.ref_count(id), 2);
        slots.remove_ref(id);
        assert_eq!(slots.ref_count(id), 1);
    }
}
