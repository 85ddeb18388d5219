use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::{AshError, Result};

const INVALID_INDEX: u32 = u32::MAX;

/// Opaque, copyable reference to a slot in a [`ResourcePool`].
///
/// A handle carries the slot index plus the slot generation at the time it was
/// obtained. Releasing the slot bumps the generation, so stale copies are
/// rejected instead of aliasing the next occupant.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub const INVALID: Self = Self {
        index: INVALID_INDEX,
        generation: 0,
        _marker: PhantomData,
    };

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// True unless this is the [`Handle::INVALID`] sentinel. Says nothing about liveness;
    /// use [`ResourcePool::contains`] for that.
    pub fn is_valid(&self) -> bool {
        self.index != INVALID_INDEX
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({}v{})", self.index, self.generation)
        } else {
            f.write_str("Handle(invalid)")
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity slot allocator with a free-list stack and per-slot generations.
///
/// Capacity is fixed at construction; `obtain` is O(1) and fails once every slot
/// is live. Slots are never compacted.
pub struct ResourcePool<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
}

impl<T> ResourcePool<T> {
    pub fn new(name: &'static str, capacity: u32) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        // Reverse so the first obtain hands out slot 0.
        let free_list = (0..capacity).rev().collect();
        Self {
            name,
            slots,
            free_list,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `value` in a free slot and returns its handle.
    pub fn obtain(&mut self, value: T) -> Result<Handle<T>> {
        let Some(index) = self.free_list.pop() else {
            log::error!(
                "{} pool exhausted ({} slots in use)",
                self.name,
                self.slots.len()
            );
            return Err(AshError::PoolExhausted {
                pool: self.name,
                capacity: self.capacity(),
            });
        };

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        Ok(Handle::new(index, slot.generation))
    }

    /// Returns the slot to the free list and hands back its value.
    pub fn release(&mut self, handle: Handle<T>) -> Result<T> {
        let pool = self.name;
        let slot = self.live_slot_mut(handle)?;
        let value = slot.value.take().ok_or_else(|| invalid(pool, handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        Ok(value)
    }

    pub fn get(&self, handle: Handle<T>) -> Result<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| {
                log::error!("Access through invalid {} handle {handle:?}", self.name);
                invalid(self.name, handle)
            })
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        let pool = self.name;
        self.live_slot_mut(handle)?
            .value
            .as_mut()
            .ok_or_else(|| invalid(pool, handle))
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    /// Iterates live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Releases every live slot, handing each value to `f`.
    pub fn drain_with(&mut self, mut f: impl FnMut(T)) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
                f(value);
            }
        }
    }

    fn live_slot_mut(&mut self, handle: Handle<T>) -> Result<&mut Slot<T>> {
        let name = self.name;
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.value.is_some() => Ok(slot),
            _ => {
                log::error!("Invalid or stale {name} handle {handle:?}");
                Err(invalid(name, handle))
            }
        }
    }
}

fn invalid<T>(pool: &'static str, handle: Handle<T>) -> AshError {
    AshError::InvalidHandle {
        pool,
        index: handle.index,
        generation: handle.generation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn obtained_handles_are_unique_and_readable() {
        let mut pool = ResourcePool::new("test", 8);
        let handles: Vec<_> = (0..8).map(|i| pool.obtain(i * 10).unwrap()).collect();

        let unique: HashSet<_> = handles.iter().copied().collect();
        assert_eq!(unique.len(), handles.len());
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(*pool.get(*handle).unwrap(), i * 10);
        }
        assert_eq!(pool.len(), 8);
    }

    #[test]
    fn exhaustion_fails_without_touching_live_entries() {
        let mut pool = ResourcePool::new("test", 2);
        let a = pool.obtain("a").unwrap();
        let b = pool.obtain("b").unwrap();

        for _ in 0..3 {
            assert!(matches!(
                pool.obtain("c"),
                Err(AshError::PoolExhausted { capacity: 2, .. })
            ));
        }
        assert_eq!(*pool.get(a).unwrap(), "a");
        assert_eq!(*pool.get(b).unwrap(), "b");
    }

    #[test]
    fn released_slot_is_reused_with_new_generation() {
        let mut pool = ResourcePool::new("test", 1);
        let first = pool.obtain(1u32).unwrap();
        assert_eq!(pool.release(first).unwrap(), 1);

        let second = pool.obtain(2u32).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(pool.get(first).is_err());
        assert_eq!(*pool.get(second).unwrap(), 2);
    }

    #[test]
    fn double_release_is_reported() {
        let mut pool = ResourcePool::new("test", 2);
        let handle = pool.obtain(()).unwrap();
        pool.release(handle).unwrap();
        assert!(matches!(
            pool.release(handle),
            Err(AshError::InvalidHandle { .. })
        ));
        // The slot was pushed to the free list only once.
        assert_eq!(pool.len(), 0);
        pool.obtain(()).unwrap();
        pool.obtain(()).unwrap();
        assert!(pool.obtain(()).is_err());
    }

    #[test]
    fn invalid_sentinel_is_rejected() {
        let mut pool: ResourcePool<u8> = ResourcePool::new("test", 4);
        assert!(!Handle::<u8>::INVALID.is_valid());
        assert!(pool.get(Handle::INVALID).is_err());
        assert!(pool.get_mut(Handle::INVALID).is_err());
        assert!(pool.release(Handle::INVALID).is_err());
    }

    #[test]
    fn interleaved_obtain_release_keeps_live_handles_intact() {
        let mut pool = ResourcePool::new("test", 4);
        let mut live = Vec::new();
        for round in 0..32u32 {
            if live.len() == 4 || (round % 3 == 2 && !live.is_empty()) {
                let handle = live.remove(0);
                pool.release(handle).unwrap();
            } else {
                let handle = pool.obtain(round).unwrap();
                *pool.get_mut(handle).unwrap() += 1000;
                live.push(handle);
            }

            let unique: HashSet<_> = live.iter().map(|h| h.index()).collect();
            assert_eq!(unique.len(), live.len());
            for handle in &live {
                assert!(*pool.get(*handle).unwrap() >= 1000);
            }
        }
    }

    #[test]
    fn drain_releases_everything() {
        let mut pool = ResourcePool::new("test", 3);
        let a = pool.obtain(1).unwrap();
        pool.obtain(2).unwrap();
        let mut drained = Vec::new();
        pool.drain_with(|v| drained.push(v));
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(pool.is_empty());
        assert!(!pool.contains(a));
    }
}
