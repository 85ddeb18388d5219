//! N-deep rotation of per-frame GPU buffers.

use super::device::Device;
use super::resource_pool::Handle;
use super::resources::{Buffer, BufferCI};
use crate::{AshError, Result};

/// Fixed-size rotation over `N` values with a current index.
#[derive(Clone, Debug)]
pub struct Ring<T> {
    items: Vec<T>,
    current: usize,
}

impl<T> Ring<T> {
    /// Fails on an empty ring, which could never be rotated.
    pub fn new(items: Vec<T>) -> Result<Self> {
        if items.is_empty() {
            return Err(AshError::InvalidConfig("ring needs at least one slot".into()));
        }
        Ok(Self { items, current: 0 })
    }

    /// Advances to the next slot. Call exactly once per frame.
    pub fn move_to_next(&mut self) {
        self.current = (self.current + 1) % self.items.len();
    }

    pub fn current(&self) -> &T {
        &self.items[self.current]
    }

    pub fn current_mut(&mut self) -> &mut T {
        &mut self.items[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

/// `ring_size` buffers built from one creation template.
///
/// Convention: rotate, then write the current slot, then record work that reads
/// it. With `ring_size >= frames_in_flight` the slot being written was last read
/// `ring_size` frames ago.
pub struct RingBuffer {
    ring: Ring<Handle<Buffer>>,
    ci: BufferCI,
}

impl RingBuffer {
    pub fn new(device: &mut Device, ring_size: usize, ci: &BufferCI) -> Result<Self> {
        if ring_size == 0 {
            return Err(AshError::InvalidConfig(format!(
                "ring '{}' needs at least one buffer",
                ci.debug_name
            )));
        }
        let mut handles = Vec::with_capacity(ring_size);
        for slot in 0..ring_size {
            let slot_ci = BufferCI {
                debug_name: format!("{}[{slot}]", ci.debug_name),
                ..ci.clone()
            };
            match device.create_buffer(&slot_ci) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        let _ = device.destroy_buffer(handle);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            ring: Ring::new(handles)?,
            ci: ci.clone(),
        })
    }

    /// Ring depth for per-frame data on this device.
    pub fn per_frame(device: &mut Device, ci: &BufferCI) -> Result<Self> {
        let depth = device.frames_in_flight();
        Self::new(device, depth, ci)
    }

    pub fn move_to_next_buffer(&mut self) {
        self.ring.move_to_next();
    }

    pub fn buffer(&self) -> Handle<Buffer> {
        *self.ring.current()
    }

    pub fn current_index(&self) -> usize {
        self.ring.current_index()
    }

    pub fn buffer_at(&self, index: usize) -> Option<Handle<Buffer>> {
        self.ring.get(index).copied()
    }

    pub fn ring_size(&self) -> usize {
        self.ring.len()
    }

    /// Size of each buffer in the ring.
    pub fn capacity(&self) -> u64 {
        self.ci.size
    }

    /// Writes into the current slot; the ring must be host mapped.
    pub fn write(&self, device: &Device, data: &[u8]) -> Result<()> {
        device.write_buffer(self.buffer(), 0, data)
    }

    /// Recreates every slot with at least `size` bytes. Never shrinks. Old buffers
    /// go through the device's deferred destruction, so in-flight frames keep theirs.
    pub fn ensure_capacity(&mut self, device: &mut Device, size: u64) -> Result<bool> {
        if size <= self.ci.size {
            return Ok(false);
        }
        let mut ci = self.ci.clone();
        ci.size = size.next_power_of_two();
        let current = self.ring.current_index();
        let grown = RingBuffer::new(device, self.ring.len(), &ci)?;
        let old = std::mem::replace(self, grown);
        for _ in 0..current {
            self.ring.move_to_next();
        }
        old.destroy(device);
        log::debug!("Grew ring '{}' to {} bytes", self.ci.debug_name, self.ci.size);
        Ok(true)
    }

    pub fn destroy(mut self, device: &mut Device) {
        self.release(device);
    }

    /// Destroys every slot in place, leaving invalid handles behind. Safe to call twice.
    pub fn release(&mut self, device: &mut Device) {
        for slot in &mut self.ring.items {
            let handle = std::mem::replace(slot, Handle::INVALID);
            if !handle.is_valid() {
                continue;
            }
            if let Err(e) = device.destroy_buffer(handle) {
                log::warn!("Failed to destroy ring buffer slot: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_returns_to_start() {
        for size in 1..=4 {
            let mut ring = Ring::new((0..size).collect::<Vec<_>>()).unwrap();
            let start = *ring.current();
            for _ in 0..size {
                ring.move_to_next();
            }
            assert_eq!(*ring.current(), start);
        }
    }

    #[test]
    fn rotation_visits_every_slot_once() {
        let mut ring = Ring::new(vec!['a', 'b', 'c']).unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(*ring.current());
            ring.move_to_next();
        }
        assert_eq!(seen, vec!['a', 'b', 'c']);
        assert_eq!(ring.get(2), Some(&'c'));
        assert_eq!(ring.get(3), None);
    }

    #[test]
    fn empty_ring_is_rejected() {
        assert!(matches!(
            Ring::<u32>::new(Vec::new()),
            Err(AshError::InvalidConfig(_))
        ));
    }
}
