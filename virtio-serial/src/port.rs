//! Per-port state.
//!
//! Every field here is protected by the device lock. Nothing in this module
//! completes a request or calls out of the crate; the device context does that
//! after dropping the lock.

use alloc::sync::Arc;

use crate::buffer::{BufferId, BufferPool, BufferState};
use crate::config::SerialConfig;
use crate::control::ControlMessage;
use crate::queue::VirtQueue;
use crate::request::{IoRequest, MemoryRegion, RequestId};
use crate::{Result, SerialError};

/// Received buffer a reader has started consuming.
#[derive(Debug, Clone, Copy)]
struct InBuffer {
    id: BufferId,
    offset: usize,
    len: usize,
}

/// One serial channel, or the control channel.
pub struct SerialPort<Q: VirtQueue> {
    /// Port slot index.
    index: usize,
    /// Device-to-driver queue.
    receive_queue: Option<Q>,
    /// Driver-to-device queue.
    send_queue: Option<Q>,
    /// Buffers for the receive queue.
    receive_buffers: BufferPool,
    /// Send free list and in-use list.
    send_buffers: BufferPool,
    /// Partially consumed received buffer.
    inbuf: Option<InBuffer>,
    /// Outstanding blocking read.
    pending_read: Option<Arc<dyn IoRequest>>,
}

impl<Q: VirtQueue> SerialPort<Q> {
    /// Create a port with buffer pools sized from `config`.
    pub fn new(
        index: usize,
        receive_queue: Option<Q>,
        send_queue: Option<Q>,
        config: &SerialConfig,
    ) -> Self {
        let buffer_size = if config.is_control_port(index) {
            config.control_buffer_size
        } else {
            config.port_buffer_size
        };
        let rx_count = if receive_queue.is_some() { config.rx_buffers } else { 0 };
        let tx_count = if send_queue.is_some() { config.tx_buffers } else { 0 };

        SerialPort {
            index,
            receive_queue,
            send_queue,
            receive_buffers: BufferPool::new(rx_count, buffer_size),
            send_buffers: BufferPool::new(tx_count, buffer_size),
            inbuf: None,
            pending_read: None,
        }
    }

    /// Port slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn receive_queue(&self) -> Option<&Q> {
        self.receive_queue.as_ref()
    }

    pub fn receive_queue_mut(&mut self) -> Option<&mut Q> {
        self.receive_queue.as_mut()
    }

    pub fn send_queue(&self) -> Option<&Q> {
        self.send_queue.as_ref()
    }

    pub fn send_queue_mut(&mut self) -> Option<&mut Q> {
        self.send_queue.as_mut()
    }

    pub fn receive_buffers(&self) -> &BufferPool {
        &self.receive_buffers
    }

    /// Receive pool, mutable. The device model writes payloads through this.
    pub fn receive_buffers_mut(&mut self) -> &mut BufferPool {
        &mut self.receive_buffers
    }

    pub fn send_buffers(&self) -> &BufferPool {
        &self.send_buffers
    }

    /// Whether a reader is parked on this port.
    pub fn has_pending_read(&self) -> bool {
        self.pending_read.is_some()
    }

    /// Identity of the parked reader.
    pub fn pending_read_id(&self) -> Option<RequestId> {
        self.pending_read.as_ref().map(|request| request.id())
    }

    pub(crate) fn pending_read(&self) -> Option<Arc<dyn IoRequest>> {
        self.pending_read.clone()
    }

    pub(crate) fn set_pending_read(&mut self, request: Arc<dyn IoRequest>) {
        self.pending_read = Some(request);
    }

    pub(crate) fn take_pending_read(&mut self) -> Option<Arc<dyn IoRequest>> {
        self.pending_read.take()
    }

    /// Clear the slot only if it still holds `request` itself.
    pub(crate) fn take_pending_read_if(
        &mut self,
        request: &Arc<dyn IoRequest>,
    ) -> Option<Arc<dyn IoRequest>> {
        let parked = self.pending_read.as_ref()?;
        // Compare data pointers; vtables are not unique.
        if Arc::as_ptr(parked) as *const () != Arc::as_ptr(request) as *const () {
            return None;
        }
        self.pending_read.take()
    }

    /// Toggle notifications on both queues.
    pub(crate) fn enable_interrupts(&mut self, enable: bool) {
        if let Some(queue) = self.receive_queue.as_mut() {
            queue.enable_interrupt(enable);
        }
        if let Some(queue) = self.send_queue.as_mut() {
            queue.enable_interrupt(enable);
        }
    }

    /// Kick both queues.
    pub(crate) fn kick_all(&mut self) {
        if let Some(queue) = self.receive_queue.as_mut() {
            queue.kick();
        }
        if let Some(queue) = self.send_queue.as_mut() {
            queue.kick();
        }
    }

    /// Post every free receive buffer to the device.
    ///
    /// Returns the number of buffers posted.
    pub fn fill_receive_queue(&mut self) -> Result<usize> {
        if self.receive_queue.is_none() {
            return Err(SerialError::NoQueue);
        }

        let mut posted = 0;
        while let Some(id) = self.receive_buffers.pop_free() {
            if let Err(e) = self.add_rx_buffer(id) {
                if posted == 0 {
                    return Err(e);
                }
                break;
            }
            posted += 1;
        }

        if posted > 0 {
            if let Some(queue) = self.receive_queue.as_mut() {
                queue.kick();
            }
        }
        Ok(posted)
    }

    /// Reset an in-use receive buffer to full capacity and post it.
    ///
    /// If the queue refuses it, the buffer goes back on the free list.
    pub fn add_rx_buffer(&mut self, id: BufferId) -> Result<()> {
        if self.receive_buffers.state(id) != Some(BufferState::InUse) {
            return Err(SerialError::BufferState);
        }
        let queue = self.receive_queue.as_mut().ok_or(SerialError::NoQueue)?;
        let buffer = self
            .receive_buffers
            .get_mut(id)
            .ok_or(SerialError::InvalidBuffer)?;
        buffer.reset_size();

        if let Err(e) = queue.add_buf(id, buffer) {
            self.receive_buffers.release(id)?;
            return Err(e);
        }
        self.receive_buffers.mark_posted(id)
    }

    /// Queue `data` for transmission.
    ///
    /// Sends at most one buffer's worth and returns the bytes queued.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.send_queue.is_none() {
            return Err(SerialError::NoQueue);
        }
        if data.is_empty() {
            return Ok(0);
        }

        self.reclaim_sent();

        let id = self.send_buffers.pop_free().ok_or(SerialError::WouldBlock)?;
        let queue = self.send_queue.as_mut().ok_or(SerialError::NoQueue)?;
        let buffer = self
            .send_buffers
            .get_mut(id)
            .ok_or(SerialError::InvalidBuffer)?;

        let count = data.len().min(buffer.capacity());
        buffer.data_mut()[..count].copy_from_slice(&data[..count]);
        buffer.set_size(count);

        if let Err(e) = queue.add_buf(id, buffer) {
            self.send_buffers.release(id)?;
            return Err(e);
        }
        queue.kick();
        Ok(count)
    }

    /// Move every completed send from the in-use list to the free list.
    ///
    /// Returns the number of buffers reclaimed.
    pub fn reclaim_sent(&mut self) -> usize {
        let Some(queue) = self.send_queue.as_mut() else {
            return 0;
        };

        let mut reclaimed = 0;
        while let Some((id, _len)) = queue.get_buf() {
            match self.send_buffers.release(id) {
                Ok(()) => reclaimed += 1,
                Err(e) => log::warn!(
                    "[VIOSerial] port {}: dropping send completion {:?}: {}",
                    self.index,
                    id,
                    e
                ),
            }
        }
        reclaimed
    }

    /// Copy received data into `region`.
    ///
    /// Consumed buffers are reposted to the receive queue. With
    /// `allow_partial` the copy stops after the first chunk; otherwise it
    /// continues until `region` is full or no data is left. Returns
    /// `WouldBlock` if nothing was copied.
    pub fn copy_into(&mut self, region: &MemoryRegion, allow_partial: bool) -> Result<usize> {
        if self.receive_queue.is_none() {
            return Err(SerialError::NoQueue);
        }

        let capacity = region.len();
        if capacity == 0 {
            return Ok(0);
        }

        let mut copied = 0;
        let mut reposted = 0;
        let mut failure = None;

        while copied < capacity {
            let current = match self.inbuf.take() {
                Some(current) => current,
                None => match self.next_received(&mut reposted) {
                    Ok(Some(current)) => current,
                    Ok(None) => break,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                },
            };

            let chunk = match self.receive_buffers.get(current.id) {
                Some(buffer) => &buffer.data()[current.offset..current.len],
                None => {
                    failure = Some(SerialError::InvalidBuffer);
                    break;
                }
            };
            let written = region.write_at(copied, chunk);
            copied += written;

            if current.offset + written < current.len {
                self.inbuf = Some(InBuffer {
                    offset: current.offset + written,
                    ..current
                });
            } else if self.recycle_rx(current.id) {
                reposted += 1;
            }

            if allow_partial {
                break;
            }
        }

        if reposted > 0 {
            if let Some(queue) = self.receive_queue.as_mut() {
                queue.kick();
            }
        }

        match (copied, failure) {
            (0, Some(e)) => Err(e),
            (0, None) => Err(SerialError::WouldBlock),
            (copied, _) => Ok(copied),
        }
    }

    /// Whether received data is waiting to be read.
    pub fn has_received_data(&self) -> bool {
        self.inbuf.is_some()
    }

    /// Pop the next non-empty completed receive buffer.
    fn next_received(&mut self, reposted: &mut usize) -> Result<Option<InBuffer>> {
        loop {
            let Some(queue) = self.receive_queue.as_mut() else {
                return Ok(None);
            };
            let Some((id, len)) = queue.get_buf() else {
                return Ok(None);
            };

            if let Err(e) = self.receive_buffers.claim_posted(id) {
                log::warn!(
                    "[VIOSerial] port {}: dropping receive completion {:?}: {}",
                    self.index,
                    id,
                    e
                );
                continue;
            }

            let len = len as usize;
            let capacity = self
                .receive_buffers
                .get(id)
                .map(|buffer| buffer.capacity())
                .unwrap_or(0);

            if len > capacity {
                log::warn!(
                    "[VIOSerial] port {}: device wrote {} bytes into {}-byte buffer",
                    self.index,
                    len,
                    capacity
                );
                if self.recycle_rx(id) {
                    *reposted += 1;
                }
                return Err(SerialError::InvalidLength);
            }

            if len == 0 {
                if self.recycle_rx(id) {
                    *reposted += 1;
                }
                continue;
            }

            if let Some(buffer) = self.receive_buffers.get_mut(id) {
                buffer.set_size(len);
            }
            return Ok(Some(InBuffer { id, offset: 0, len }));
        }
    }

    fn recycle_rx(&mut self, id: BufferId) -> bool {
        match self.add_rx_buffer(id) {
            Ok(()) => true,
            Err(e) => {
                log::error!(
                    "[VIOSerial] port {}: cannot repost receive buffer {:?}: {}",
                    self.index,
                    id,
                    e
                );
                false
            }
        }
    }

    /// Take one control message off the receive queue.
    ///
    /// The buffer is reset to full capacity, reposted and the queue kicked
    /// before this returns.
    pub(crate) fn take_control_message(&mut self) -> Option<ControlMessage> {
        let (id, len) = self.receive_queue.as_mut()?.get_buf()?;

        if let Err(e) = self.receive_buffers.claim_posted(id) {
            log::warn!(
                "[VIOSerial] control: dropping completion {:?}: {}",
                id,
                e
            );
            return None;
        }

        let len = len as usize;
        let message = self.receive_buffers.get(id).and_then(|buffer| {
            if len > buffer.capacity() {
                log::warn!(
                    "[VIOSerial] control: device wrote {} bytes into {}-byte buffer, dropping",
                    len,
                    buffer.capacity()
                );
                return None;
            }
            Some(ControlMessage::new(buffer.data()[..len].to_vec()))
        });

        self.recycle_rx(id);
        if let Some(queue) = self.receive_queue.as_mut() {
            queue.kick();
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::split::{QueueDirection, SplitQueue};
    use crate::request::ReadRequest;
    use crate::testing::deliver_rx as write_and_complete;

    fn config() -> SerialConfig {
        SerialConfig {
            rx_buffers: 4,
            tx_buffers: 3,
            port_buffer_size: 8,
            queue_size: 8,
            ..SerialConfig::default()
        }
    }

    fn data_port() -> SerialPort<SplitQueue> {
        let mut port = SerialPort::new(
            0,
            Some(SplitQueue::new(0, 8, QueueDirection::Receive)),
            Some(SplitQueue::new(1, 8, QueueDirection::Transmit)),
            &config(),
        );
        port.fill_receive_queue().unwrap();
        port
    }

    #[test]
    fn test_fill_posts_all_receive_buffers() {
        let port = data_port();
        assert_eq!(port.receive_buffers().count(BufferState::Posted), 4);
        assert_eq!(port.receive_queue().unwrap().available_len(), 4);
        assert_eq!(port.receive_queue().unwrap().kick_count(), 1);
    }

    #[test]
    fn test_send_and_reclaim() {
        let mut port = data_port();
        assert_eq!(port.send(b"hello world"), Ok(8));
        assert_eq!(port.send(b"x"), Ok(1));
        assert_eq!(port.send_buffers().count(BufferState::InUse), 2);
        assert_eq!(port.send_queue().unwrap().kick_count(), 2);

        let queue = port.send_queue_mut().unwrap();
        assert!(queue.device_complete_next(0).is_some());
        assert!(queue.device_complete_next(0).is_some());

        assert_eq!(port.reclaim_sent(), 2);
        assert_eq!(port.send_buffers().count(BufferState::Free), 3);
        assert_eq!(port.reclaim_sent(), 0);
    }

    #[test]
    fn test_send_without_free_buffer_would_block() {
        let mut port = data_port();
        for _ in 0..3 {
            port.send(b"a").unwrap();
        }
        assert_eq!(port.send(b"a"), Err(SerialError::WouldBlock));
        assert_eq!(port.send(b""), Ok(0));
    }

    #[test]
    fn test_copy_without_data_would_block() {
        let mut port = data_port();
        let region = MemoryRegion::new(4);
        assert_eq!(port.copy_into(&region, true), Err(SerialError::WouldBlock));
    }

    #[test]
    fn test_copy_consumes_and_reposts() {
        let mut port = data_port();
        write_and_complete(&mut port, b"abcdef");

        let region = MemoryRegion::new(4);
        assert_eq!(port.copy_into(&region, true), Ok(4));
        assert_eq!(region.to_vec(), b"abcd".to_vec());
        assert!(port.has_received_data());
        assert_eq!(port.receive_buffers().count(BufferState::InUse), 1);

        let region = MemoryRegion::new(4);
        assert_eq!(port.copy_into(&region, true), Ok(2));
        assert_eq!(&region.to_vec()[..2], b"ef");
        assert!(!port.has_received_data());
        assert_eq!(port.receive_buffers().count(BufferState::Posted), 4);
    }

    #[test]
    fn test_copy_without_partial_spans_buffers() {
        let mut port = data_port();
        write_and_complete(&mut port, b"abc");
        write_and_complete(&mut port, b"defgh");

        let region = MemoryRegion::new(16);
        assert_eq!(port.copy_into(&region, false), Ok(8));
        assert_eq!(&region.to_vec()[..8], b"abcdefgh");
        assert_eq!(port.receive_buffers().count(BufferState::Posted), 4);
    }

    #[test]
    fn test_oversized_completion_is_rejected_and_reposted() {
        let mut port = data_port();
        let queue = port.receive_queue_mut().unwrap();
        let head = queue.device_pop_avail().unwrap();
        queue.device_push_used(head, 64);

        let region = MemoryRegion::new(4);
        assert_eq!(
            port.copy_into(&region, true),
            Err(SerialError::InvalidLength)
        );
        assert_eq!(port.receive_buffers().count(BufferState::Posted), 4);
    }

    #[test]
    fn test_empty_completion_is_skipped() {
        let mut port = data_port();
        write_and_complete(&mut port, b"");
        write_and_complete(&mut port, b"z");

        let region = MemoryRegion::new(4);
        assert_eq!(port.copy_into(&region, true), Ok(1));
        assert_eq!(region.to_vec()[0], b'z');
    }

    #[test]
    fn test_take_pending_read_if_matches_identity_not_id() {
        let mut port = data_port();
        let first: Arc<dyn IoRequest> = Arc::new(ReadRequest::new(RequestId(9), 4));
        let second: Arc<dyn IoRequest> = Arc::new(ReadRequest::new(RequestId(9), 4));

        port.set_pending_read(second.clone());
        assert!(port.take_pending_read_if(&first).is_none());
        assert_eq!(port.pending_read_id(), Some(RequestId(9)));

        assert!(port.take_pending_read_if(&second).is_some());
        assert!(!port.has_pending_read());
        assert!(port.take_pending_read_if(&second).is_none());
    }
}
