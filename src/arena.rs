//! # Slot Arena Module
//!
//! Fixed size object pools for transactions, histories and chunk lists. All memory is allocated
//! once on construction. Slots are referred to by a [Handle] which combines the slot index with
//! a generation counter, so a stale handle to a recycled slot is detected instead of silently
//! aliasing the new occupant.
use alloc::vec::Vec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Handle {
    index: u16,
    generation: u32,
}

impl Handle {
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: T,
}

/// Pool of `T` with an optional internal free list.
///
/// Arenas whose slots are tracked by external queues use the index accessors together with
/// [Arena::retire]. Plain pools use [Arena::alloc] and [Arena::release].
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
}

impl<T> Arena<T> {
    /// Create an arena with `capacity` slots, all initially free.
    pub fn new(capacity: usize, mut init: impl FnMut(usize) -> T) -> Self {
        debug_assert!(capacity <= u16::MAX as usize);
        let slots = (0..capacity)
            .map(|idx| Slot {
                generation: 0,
                value: init(idx),
            })
            .collect();
        // Reversed, so allocation hands out the lowest index first.
        let free = (0..capacity as u16).rev().collect();
        Self { slots, free }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Handle for the current occupant of the slot.
    pub fn handle(&self, index: usize) -> Option<Handle> {
        self.slots.get(index).map(|slot| Handle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index())
            .is_some_and(|slot| slot.generation == handle.generation)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &mut slot.value)
    }

    pub fn at(&self, index: usize) -> Option<&T> {
        self.slots.get(index).map(|slot| &slot.value)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).map(|slot| &mut slot.value)
    }

    /// Invalidate all handles to the slot.
    pub fn retire(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    /// Pop a slot from the free list.
    pub fn alloc(&mut self) -> Option<Handle> {
        let index = self.free.pop()?;
        self.handle(index as usize)
    }

    /// Return a slot to the free list. Stale handles are ignored.
    pub fn release(&mut self, handle: Handle) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        self.retire(handle.index());
        self.free.push(handle.index);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().map(|(idx, slot)| (idx, &slot.value))
    }
}
