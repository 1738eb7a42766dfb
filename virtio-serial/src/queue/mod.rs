//! Virtqueue capability.
//!
//! The bus layer allocates and negotiates the queues; the completion path
//! only needs the four operations below. Receive and send queues share the
//! same trait.

pub mod split;

use crate::buffer::{BufferDescriptor, BufferId};
use crate::Result;

/// Operations the completion path performs on a virtqueue.
pub trait VirtQueue: Send {
    /// Pop the next buffer the device finished with.
    ///
    /// Returns the buffer token and the number of bytes the device wrote.
    fn get_buf(&mut self) -> Option<(BufferId, u32)>;

    /// Make `buffer` available to the device under `token`.
    fn add_buf(&mut self, token: BufferId, buffer: &BufferDescriptor) -> Result<()>;

    /// Suppress (`false`) or resume (`true`) used-buffer interrupts.
    fn enable_interrupt(&mut self, enable: bool);

    /// Notify the device that new buffers are available.
    fn kick(&mut self);
}
