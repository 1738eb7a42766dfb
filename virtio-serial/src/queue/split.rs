//! Heap-backed split virtqueue.
//!
//! Descriptor table, available ring and used ring kept in driver memory,
//! with the device side exposed through `device_*` methods. Used for hosted
//! testing and for loopback bring-up before a transport is attached.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use super::VirtQueue;
use crate::buffer::{BufferDescriptor, BufferId};
use crate::{Result, SerialError};

/// VirtQueue descriptor flags.
pub mod desc_flags {
    /// Buffer continues via the next field.
    pub const NEXT: u16 = 1;
    /// Buffer is write-only (device writes, driver reads).
    pub const WRITE: u16 = 2;
}

/// Available ring flag: driver does not want used-buffer interrupts.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Which way data moves through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    /// Device writes into posted buffers.
    Receive,
    /// Device reads from posted buffers.
    Transmit,
}

/// A virtqueue descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    /// Physical address of buffer.
    pub addr: u64,
    /// Length of buffer.
    pub len: u32,
    /// Descriptor flags.
    pub flags: u16,
    /// Next descriptor index if NEXT flag is set.
    pub next: u16,
}

/// Used ring element.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    /// Index of the descriptor chain head.
    pub id: u32,
    /// Total bytes written to buffer.
    pub len: u32,
}

/// Split virtqueue.
pub struct SplitQueue {
    /// Queue index on the device.
    index: u16,
    /// Queue size (number of descriptors).
    queue_size: u16,
    /// Data direction.
    direction: QueueDirection,
    /// Descriptor table.
    desc: Vec<VirtqDesc>,
    /// Token stored for each descriptor head.
    tokens: Vec<Option<BufferId>>,
    /// Available ring flags.
    avail_flags: u16,
    /// Available ring index.
    avail_idx: u16,
    /// Available ring.
    avail_ring: Vec<u16>,
    /// Used ring index.
    used_idx: u16,
    /// Used ring.
    used_ring: Vec<VirtqUsedElem>,
    /// Last seen used index.
    last_used_idx: u16,
    /// Next available entry the device will consume.
    device_avail_idx: u16,
    /// Free descriptor list.
    free_list: Vec<u16>,
    /// Number of notifications sent to the device.
    kicks: u64,
}

impl SplitQueue {
    /// Create an empty queue. `queue_size` must be a power of two.
    pub fn new(index: u16, queue_size: u16, direction: QueueDirection) -> Self {
        SplitQueue {
            index,
            queue_size,
            direction,
            desc: vec![VirtqDesc::default(); queue_size as usize],
            tokens: vec![None; queue_size as usize],
            avail_flags: 0,
            avail_idx: 0,
            avail_ring: vec![0; queue_size as usize],
            used_idx: 0,
            used_ring: vec![VirtqUsedElem::default(); queue_size as usize],
            last_used_idx: 0,
            device_avail_idx: 0,
            free_list: (0..queue_size).rev().collect(),
            kicks: 0,
        }
    }

    /// Queue index on the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Data direction.
    pub fn direction(&self) -> QueueDirection {
        self.direction
    }

    /// Get the number of free descriptors.
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Whether used-buffer interrupts are currently wanted.
    pub fn interrupts_enabled(&self) -> bool {
        self.avail_flags & VRING_AVAIL_F_NO_INTERRUPT == 0
    }

    /// Number of kicks so far.
    pub fn kick_count(&self) -> u64 {
        self.kicks
    }

    /// Check if the queue has pending completions.
    pub fn has_pending(&self) -> bool {
        fence(Ordering::SeqCst);
        self.last_used_idx != self.used_idx
    }

    /// Buffers posted but not yet taken by the device.
    pub fn available_len(&self) -> usize {
        self.avail_idx.wrapping_sub(self.device_avail_idx) as usize
    }

    /// Device side: take the next available buffer and mark it used with
    /// `written` bytes. Returns the driver's token for that buffer.
    pub fn device_complete_next(&mut self, written: u32) -> Option<BufferId> {
        let head = self.device_pop_avail()?;
        self.device_push_used(head, written);
        self.tokens[head as usize]
    }

    /// Device side: take the next available descriptor head.
    pub fn device_pop_avail(&mut self) -> Option<u16> {
        fence(Ordering::SeqCst);
        if self.device_avail_idx == self.avail_idx {
            return None;
        }
        let head = self.avail_ring[(self.device_avail_idx % self.queue_size) as usize];
        self.device_avail_idx = self.device_avail_idx.wrapping_add(1);
        Some(head)
    }

    /// Device side: publish a used element.
    pub fn device_push_used(&mut self, head: u16, written: u32) {
        let slot = (self.used_idx % self.queue_size) as usize;
        self.used_ring[slot] = VirtqUsedElem {
            id: head as u32,
            len: written,
        };
        fence(Ordering::SeqCst);
        self.used_idx = self.used_idx.wrapping_add(1);
    }

    /// Descriptor at `head`, as the device would read it.
    pub fn descriptor(&self, head: u16) -> Option<&VirtqDesc> {
        self.desc.get(head as usize)
    }

    fn alloc_desc(&mut self) -> Option<u16> {
        self.free_list.pop()
    }

    fn free_desc_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            let desc = self.desc[idx as usize];
            self.tokens[idx as usize] = None;
            self.free_list.push(idx);

            if desc.flags & desc_flags::NEXT != 0 {
                idx = desc.next;
            } else {
                break;
            }
        }
    }
}

impl VirtQueue for SplitQueue {
    fn get_buf(&mut self) -> Option<(BufferId, u32)> {
        loop {
            fence(Ordering::SeqCst);

            if self.last_used_idx == self.used_idx {
                return None;
            }

            let elem = self.used_ring[(self.last_used_idx % self.queue_size) as usize];
            self.last_used_idx = self.last_used_idx.wrapping_add(1);

            let head = elem.id as u16;
            match self.tokens.get(head as usize).copied().flatten() {
                Some(token) => {
                    self.free_desc_chain(head);
                    return Some((token, elem.len));
                }
                // Descriptor is not ours to free; skip the element.
                None => log::warn!(
                    "[VIOSerial] queue {}: used element {} has no token",
                    self.index,
                    head
                ),
            }
        }
    }

    fn add_buf(&mut self, token: BufferId, buffer: &BufferDescriptor) -> Result<()> {
        let len = u32::try_from(buffer.size()).map_err(|_| SerialError::InvalidLength)?;
        let desc_idx = self.alloc_desc().ok_or(SerialError::QueueFull)?;

        self.desc[desc_idx as usize] = VirtqDesc {
            addr: buffer.addr(),
            len,
            flags: match self.direction {
                QueueDirection::Receive => desc_flags::WRITE,
                QueueDirection::Transmit => 0,
            },
            next: 0,
        };
        self.tokens[desc_idx as usize] = Some(token);

        let slot = (self.avail_idx % self.queue_size) as usize;
        self.avail_ring[slot] = desc_idx;

        // Memory barrier before updating index
        fence(Ordering::SeqCst);

        self.avail_idx = self.avail_idx.wrapping_add(1);
        Ok(())
    }

    fn enable_interrupt(&mut self, enable: bool) {
        if enable {
            self.avail_flags &= !VRING_AVAIL_F_NO_INTERRUPT;
        } else {
            self.avail_flags |= VRING_AVAIL_F_NO_INTERRUPT;
        }
        fence(Ordering::SeqCst);
    }

    fn kick(&mut self) {
        fence(Ordering::SeqCst);
        self.kicks += 1;
        log::trace!("[VIOSerial] kick queue {}", self.index);
    }
}
