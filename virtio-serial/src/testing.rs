//! Device model helpers shared by the unit tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::buffer::BufferId;
use crate::config::SerialConfig;
use crate::control::{ControlHandler, ControlMessage};
use crate::device::DeviceContext;
use crate::port::SerialPort;
use crate::queue::split::{QueueDirection, SplitQueue};

/// Small configuration with `nr_ports` ports.
pub fn config(nr_ports: usize) -> SerialConfig {
    SerialConfig {
        nr_ports,
        control_buffer_size: 64,
        port_buffer_size: 16,
        rx_buffers: 4,
        tx_buffers: 4,
        queue_size: 8,
        ..SerialConfig::default()
    }
}

/// Initialized device whose ports all have both queues, receive queues
/// filled.
pub fn device(nr_ports: usize) -> DeviceContext<SplitQueue> {
    let config = config(nr_ports);
    let ports = (0..nr_ports)
        .map(|index| {
            let rx = SplitQueue::new((index * 2) as u16, config.queue_size, QueueDirection::Receive);
            let tx = SplitQueue::new(
                (index * 2 + 1) as u16,
                config.queue_size,
                QueueDirection::Transmit,
            );
            let mut port = SerialPort::new(index, Some(rx), Some(tx), &config);
            port.fill_receive_queue().unwrap();
            port
        })
        .collect();

    let device = DeviceContext::new(config, ports).unwrap();
    device.mark_initialized();
    device
}

/// Act as the device: write `payload` into the next posted receive buffer
/// and mark it used. Returns the buffer that received it.
pub fn deliver_rx(port: &mut SerialPort<SplitQueue>, payload: &[u8]) -> BufferId {
    let queue = port.receive_queue_mut().unwrap();
    let head = queue.device_pop_avail().unwrap();
    let addr = queue.descriptor(head).unwrap().addr;

    let pool = port.receive_buffers_mut();
    let id = (0..pool.len() as u16)
        .map(BufferId)
        .find(|id| pool.get(*id).unwrap().addr() == addr)
        .unwrap();
    pool.get_mut(id).unwrap().data_mut()[..payload.len()].copy_from_slice(payload);

    port.receive_queue_mut()
        .unwrap()
        .device_push_used(head, payload.len() as u32);
    id
}

/// Control handler that keeps every message.
#[derive(Default)]
pub struct RecordingHandler {
    messages: Arc<Mutex<Vec<ControlMessage>>>,
}

impl RecordingHandler {
    pub fn messages(&self) -> Arc<Mutex<Vec<ControlMessage>>> {
        Arc::clone(&self.messages)
    }
}

impl ControlHandler for RecordingHandler {
    fn handle_control_message(&self, message: &ControlMessage) {
        self.messages.lock().push(message.clone());
    }
}
