//! KPIO VirtIO Serial
//!
//! Interrupt-driven completion path for the VirtIO console device in
//! multiport mode. The device signals that a queue made progress; this crate
//! reclaims transmit buffers, hands received data to a waiting reader and
//! forwards control messages, while the top half, the deferred bottom half and
//! reader cancellation race on the same per-port state.
//!
//! # Architecture
//!
//! - `buffer`: Buffer descriptors and the per-port recycling pool
//! - `queue`: Virtqueue capability trait and a heap-backed split ring
//! - `request`: Reader requests and the cancel/complete state machine
//! - `port`: Per-port state (queues, pools, pending read)
//! - `control`: Control channel messages and dispatch
//! - `device`: Device context, bottom-half drainer, interrupt enable/disable
//! - `interrupt`: Top-half handler and deferred work entry point
//! - `config`: Constants and device configuration
//!
//! Device enumeration, feature negotiation and queue allocation live in the
//! bus layer. This crate only consumes the queues it is handed.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod buffer;
pub mod config;
pub mod control;
pub mod device;
pub mod interrupt;
pub mod port;
pub mod queue;
pub mod request;

#[cfg(test)]
mod testing;

use core::fmt;

pub use buffer::{BufferDescriptor, BufferId, BufferPool, BufferState};
pub use config::SerialConfig;
pub use control::{ControlHandler, ControlHeader, ControlMessage};
pub use device::{DeviceContext, DrainReport, ReadDisposition};
pub use interrupt::{
    run_deferred_work, set_interrupt_state, try_set_interrupt_state, DeferredScheduler, Interrupt,
    InterruptStats, IsrRegister, IsrStatus,
};
pub use port::SerialPort;
pub use queue::split::SplitQueue;
pub use queue::VirtQueue;
pub use request::{
    CancelStatus, Completion, IoRequest, MemoryRegion, ReadRequest, RequestId, RequestStatus,
};

/// VirtIO serial error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    /// Port index out of range.
    InvalidPort,
    /// Port has no queue for the requested direction.
    NoQueue,
    /// Operation not allowed on the control port.
    ControlPort,
    /// A read is already outstanding on the port.
    Busy,
    /// No data or no free buffer yet.
    WouldBlock,
    /// Request has no destination memory.
    NoOutputMemory,
    /// Device reported a length larger than the buffer.
    InvalidLength,
    /// Buffer id does not belong to the pool.
    InvalidBuffer,
    /// Buffer is not in the state the transition expects.
    BufferState,
    /// Virtqueue has no free descriptors.
    QueueFull,
    /// Device is not initialized.
    NotReady,
    /// Invalid configuration value.
    InvalidConfig,
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialError::InvalidPort => write!(f, "invalid port index"),
            SerialError::NoQueue => write!(f, "port has no queue for this direction"),
            SerialError::ControlPort => write!(f, "operation not allowed on the control port"),
            SerialError::Busy => write!(f, "read already pending on port"),
            SerialError::WouldBlock => write!(f, "operation would block"),
            SerialError::NoOutputMemory => write!(f, "request has no output memory"),
            SerialError::InvalidLength => write!(f, "device reported invalid length"),
            SerialError::InvalidBuffer => write!(f, "unknown buffer descriptor"),
            SerialError::BufferState => write!(f, "buffer descriptor in unexpected state"),
            SerialError::QueueFull => write!(f, "virtqueue full"),
            SerialError::NotReady => write!(f, "device not initialized"),
            SerialError::InvalidConfig => write!(f, "invalid configuration"),
        }
    }
}

/// Result type for VirtIO serial operations.
pub type Result<T> = core::result::Result<T, SerialError>;
