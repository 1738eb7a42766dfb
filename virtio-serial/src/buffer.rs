//! Buffer descriptors and the per-port recycling pool.
//!
//! Descriptors live in a fixed arena and are referenced by [`BufferId`].
//! Each one is always in exactly one [`BufferState`]; moving between states
//! is O(1) and only happens under the device lock.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use crate::{Result, SerialError};

/// Arena index of a buffer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u16);

impl BufferId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a descriptor currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// On the free list.
    Free,
    /// Held by the driver in flight: a send awaiting completion, or a
    /// received buffer being consumed by a reader.
    InUse,
    /// Receive buffer available to the device.
    Posted,
}

/// A transfer buffer.
#[derive(Debug)]
pub struct BufferDescriptor {
    /// Valid bytes (send) or bytes the device may write (receive).
    size: usize,
    /// Backing data region.
    data: Vec<u8>,
}

impl BufferDescriptor {
    /// Create a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        BufferDescriptor {
            size: capacity,
            data: vec![0; capacity],
        }
    }

    /// Full capacity of the data region.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Set the current size (clamped to capacity).
    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(self.data.len());
    }

    /// Restore the size to full capacity before reposting.
    pub fn reset_size(&mut self) {
        self.size = self.data.len();
    }

    /// Bytes up to the current size.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// The whole data region.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The whole data region, mutable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Address of the data region as handed to the device.
    pub fn addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }
}

/// Fixed pool of descriptors for one port direction.
pub struct BufferPool {
    /// Descriptor arena.
    slots: Vec<BufferDescriptor>,
    /// State of each slot.
    states: Vec<BufferState>,
    /// Free list, allocated from the head and released to the tail.
    free: VecDeque<BufferId>,
    /// Number of `InUse` slots.
    in_use: usize,
    /// Number of `Posted` slots.
    posted: usize,
}

impl BufferPool {
    /// Create `count` free buffers of `capacity` bytes each.
    pub fn new(count: usize, capacity: usize) -> Self {
        let count = count.min(u16::MAX as usize);
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            slots.push(BufferDescriptor::new(capacity));
        }

        BufferPool {
            slots,
            states: vec![BufferState::Free; count],
            free: (0..count as u16).map(BufferId).collect(),
            in_use: 0,
            posted: 0,
        }
    }

    /// Total number of descriptors.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no descriptors at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of descriptors in `state`.
    pub fn count(&self, state: BufferState) -> usize {
        match state {
            BufferState::Free => self.free.len(),
            BufferState::InUse => self.in_use,
            BufferState::Posted => self.posted,
        }
    }

    /// Current state of `id`.
    pub fn state(&self, id: BufferId) -> Option<BufferState> {
        self.states.get(id.index()).copied()
    }

    /// Borrow a descriptor.
    pub fn get(&self, id: BufferId) -> Option<&BufferDescriptor> {
        self.slots.get(id.index())
    }

    /// Borrow a descriptor mutably.
    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut BufferDescriptor> {
        self.slots.get_mut(id.index())
    }

    /// Take the head of the free list. The buffer becomes `InUse`.
    pub fn pop_free(&mut self) -> Option<BufferId> {
        let id = self.free.pop_front()?;
        self.states[id.index()] = BufferState::InUse;
        self.in_use += 1;
        Some(id)
    }

    /// Return an in-use buffer to the tail of the free list.
    pub fn release(&mut self, id: BufferId) -> Result<()> {
        self.transition(id, BufferState::InUse, BufferState::Free)?;
        self.free.push_back(id);
        Ok(())
    }

    /// Hand an in-use buffer to the device.
    pub fn mark_posted(&mut self, id: BufferId) -> Result<()> {
        self.transition(id, BufferState::InUse, BufferState::Posted)
    }

    /// Take back a buffer the device completed.
    pub fn claim_posted(&mut self, id: BufferId) -> Result<()> {
        self.transition(id, BufferState::Posted, BufferState::InUse)
    }

    fn transition(&mut self, id: BufferId, from: BufferState, to: BufferState) -> Result<()> {
        let state = self
            .states
            .get_mut(id.index())
            .ok_or(SerialError::InvalidBuffer)?;
        if *state != from {
            return Err(SerialError::BufferState);
        }
        *state = to;

        match from {
            BufferState::InUse => self.in_use -= 1,
            BufferState::Posted => self.posted -= 1,
            BufferState::Free => {}
        }
        match to {
            BufferState::InUse => self.in_use += 1,
            BufferState::Posted => self.posted += 1,
            BufferState::Free => {}
        }
        Ok(())
    }
}
