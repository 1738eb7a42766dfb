//! Control channel messages.
//!
//! The device reports port hot-plug, open/close and naming events on the
//! control receive queue. The completion path does not interpret them; it
//! copies each message out, recycles the buffer and hands the copy to a
//! [`ControlHandler`].

use alloc::vec::Vec;

/// `struct virtio_console_control` header size.
pub const CONTROL_HEADER_SIZE: usize = 8;

/// Little-endian control header view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Port the event refers to.
    pub id: u32,
    /// Event code.
    pub event: u16,
    /// Event argument.
    pub value: u16,
}

impl ControlHeader {
    /// Encode as the device expects it.
    pub fn to_bytes(&self) -> [u8; CONTROL_HEADER_SIZE] {
        let mut raw = [0u8; CONTROL_HEADER_SIZE];
        raw[..4].copy_from_slice(&self.id.to_le_bytes());
        raw[4..6].copy_from_slice(&self.event.to_le_bytes());
        raw[6..].copy_from_slice(&self.value.to_le_bytes());
        raw
    }
}

/// A control message copied out of a control buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    bytes: Vec<u8>,
}

impl ControlMessage {
    /// Wrap the bytes the device wrote.
    pub fn new(bytes: Vec<u8>) -> Self {
        ControlMessage { bytes }
    }

    /// Raw message bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Header, if the message is long enough to carry one.
    pub fn header(&self) -> Option<ControlHeader> {
        let raw = self.bytes.get(..CONTROL_HEADER_SIZE)?;
        Some(ControlHeader {
            id: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            event: u16::from_le_bytes([raw[4], raw[5]]),
            value: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }

    /// Bytes after the header (port name for `PORT_NAME` events).
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(CONTROL_HEADER_SIZE..).unwrap_or(&[])
    }
}

/// Receiver of device control messages.
pub trait ControlHandler: Send + Sync {
    /// Handle one message. Called without the device lock held.
    fn handle_control_message(&self, message: &ControlMessage);
}
