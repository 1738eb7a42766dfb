//! VirtIO serial configuration.
//!
//! Compile-time constants shared with the bus layer, plus the per-device
//! values negotiated at probe time.

use crate::{Result, SerialError};

/// Page size (4 KB). Control buffers are one page.
pub const PAGE_SIZE: usize = 4096;

/// Port slot reserved for the control receive/transmit queue pair.
pub const CONTROL_PORT_INDEX: usize = 1;

/// ISR value the transport returns when no interrupt is latched.
pub const INVALID_INTERRUPT_STATUS: u8 = 0xFF;

/// Maximum number of ports (including the control slot).
pub const MAX_PORTS: usize = 32;

/// Default virtqueue size.
pub const DEFAULT_QUEUE_SIZE: u16 = 64;

/// Default data port buffer size.
pub const DEFAULT_PORT_BUFFER_SIZE: usize = PAGE_SIZE;

/// Default receive buffers posted per port.
pub const DEFAULT_RX_BUFFERS: usize = 16;

/// Default transmit buffers per port.
pub const DEFAULT_TX_BUFFERS: usize = 16;

/// Per-device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    /// Negotiated port count (`nr_ports`), control slot included.
    pub nr_ports: usize,
    /// Index of the control port.
    pub control_port_index: usize,
    /// Full capacity of a control buffer.
    pub control_buffer_size: usize,
    /// Full capacity of a data port buffer.
    pub port_buffer_size: usize,
    /// Receive buffers per port.
    pub rx_buffers: usize,
    /// Transmit buffers per port.
    pub tx_buffers: usize,
    /// Virtqueue size.
    pub queue_size: u16,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            nr_ports: 2,
            control_port_index: CONTROL_PORT_INDEX,
            control_buffer_size: PAGE_SIZE,
            port_buffer_size: DEFAULT_PORT_BUFFER_SIZE,
            rx_buffers: DEFAULT_RX_BUFFERS,
            tx_buffers: DEFAULT_TX_BUFFERS,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl SerialConfig {
    /// Configuration for `nr_ports` ports with default sizes.
    pub fn with_ports(nr_ports: usize) -> Self {
        SerialConfig {
            nr_ports,
            ..Self::default()
        }
    }

    /// Check the values against device limits.
    pub fn validate(&self) -> Result<()> {
        if self.nr_ports == 0 || self.nr_ports > MAX_PORTS {
            return Err(SerialError::InvalidConfig);
        }
        if self.control_port_index >= self.nr_ports {
            return Err(SerialError::InvalidConfig);
        }
        if self.control_buffer_size == 0 || self.port_buffer_size == 0 {
            return Err(SerialError::InvalidConfig);
        }
        if u32::try_from(self.control_buffer_size.max(self.port_buffer_size)).is_err() {
            return Err(SerialError::InvalidConfig);
        }
        if self.queue_size == 0 || !self.queue_size.is_power_of_two() {
            return Err(SerialError::InvalidConfig);
        }
        // Every receive buffer must fit on the ring at once.
        if self.rx_buffers > self.queue_size as usize || self.tx_buffers > self.queue_size as usize
        {
            return Err(SerialError::InvalidConfig);
        }
        Ok(())
    }

    /// Whether `index` is the control port.
    pub fn is_control_port(&self, index: usize) -> bool {
        index == self.control_port_index
    }
}
