//! Device context and completion drainer.
//!
//! All port state sits behind one `spin::Mutex`. Request completion and
//! control dispatch can re-enter the driver, so they only ever run after the
//! guard has been dropped; the drainer re-locks before moving to the next
//! port.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::config::SerialConfig;
use crate::control::{ControlHandler, ControlMessage};
use crate::port::SerialPort;
use crate::queue::VirtQueue;
use crate::request::{CancelStatus, IoRequest, RequestStatus};
use crate::{Result, SerialError};

/// Outcome of [`DeviceContext::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDisposition {
    /// Data was waiting; the request completed with this many bytes.
    Completed(usize),
    /// The request is parked until data arrives or it is canceled.
    Pending,
    /// The request was canceled before it could be completed.
    Canceled,
}

/// What one bottom-half pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Send buffers moved back to the free list.
    pub sends_reclaimed: usize,
    /// Pending reads completed with data.
    pub reads_completed: usize,
    /// Pending reads completed with an error.
    pub reads_failed: usize,
    /// Pending reads the cancel path already owned.
    pub reads_skipped: usize,
    /// Control messages dispatched.
    pub control_messages: usize,
}

/// Shared state of one VirtIO serial device.
pub struct DeviceContext<Q: VirtQueue> {
    /// Every port, indexed by slot. The lock also serializes pending-read
    /// hand-off across ports and the control channel.
    ports: Mutex<Vec<SerialPort<Q>>>,
    /// Gates the top half.
    initialized: AtomicBool,
    /// Negotiated configuration.
    config: SerialConfig,
    /// Receiver of control messages.
    control_handler: Option<Box<dyn ControlHandler>>,
}

impl<Q: VirtQueue> DeviceContext<Q> {
    /// Wrap ports built by the bus layer.
    ///
    /// `ports[i]` must be slot `i`, one per negotiated port. The device
    /// starts uninitialized.
    pub fn new(config: SerialConfig, ports: Vec<SerialPort<Q>>) -> Result<Self> {
        config.validate()?;
        if ports.len() != config.nr_ports {
            return Err(SerialError::InvalidConfig);
        }
        if ports.iter().enumerate().any(|(i, port)| port.index() != i) {
            return Err(SerialError::InvalidConfig);
        }

        Ok(DeviceContext {
            ports: Mutex::new(ports),
            initialized: AtomicBool::new(false),
            config,
            control_handler: None,
        })
    }

    /// Route control messages to `handler`.
    pub fn with_control_handler(mut self, handler: impl ControlHandler + 'static) -> Self {
        self.control_handler = Some(Box::new(handler));
        self
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Negotiated port count.
    pub fn port_count(&self) -> usize {
        self.config.nr_ports
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Allow the top half to claim interrupts.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
        log::info!("[VIOSerial] device ready, {} ports", self.config.nr_ports);
    }

    /// Stop claiming interrupts and fail every parked read.
    ///
    /// Returns the number of reads failed.
    pub fn mark_uninitialized(&self) -> usize {
        self.initialized.store(false, Ordering::Release);

        let parked: Vec<Arc<dyn IoRequest>> = {
            let mut ports = self.ports.lock();
            ports
                .iter_mut()
                .filter_map(|port| port.take_pending_read())
                .collect()
        };

        for request in &parked {
            complete_claimed(request, RequestStatus::DeviceNotReady, 0);
        }
        log::info!(
            "[VIOSerial] device stopped, {} pending reads failed",
            parked.len()
        );
        parked.len()
    }

    /// Run `f` on port `index` under the device lock.
    pub fn with_port<R>(&self, index: usize, f: impl FnOnce(&mut SerialPort<Q>) -> R) -> Option<R> {
        let mut ports = self.ports.lock();
        ports.get_mut(index).map(f)
    }

    /// Whether the device lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.ports.is_locked()
    }

    /// Bottom-half body: reclaim sends, satisfy pending reads, recycle one
    /// control buffer.
    pub fn drain_completions(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut ports = self.ports.lock();

        for index in 0..ports.len() {
            let port = &mut ports[index];
            report.sends_reclaimed += port.reclaim_sent();

            if port.receive_queue().is_none() {
                continue;
            }
            let Some(request) = port.pending_read() else {
                continue;
            };

            let outcome = match request.output_memory() {
                Ok(region) => match port.copy_into(&region, true) {
                    Err(SerialError::WouldBlock) => continue,
                    outcome => outcome,
                },
                Err(e) => Err(e),
            };
            port.take_pending_read();

            drop(ports);
            let (status, information) = match outcome {
                Ok(count) => {
                    log::debug!(
                        "[VIOSerial] port {}: complete pending read {:?}, {} bytes",
                        index,
                        request.id(),
                        count
                    );
                    (RequestStatus::Success, count)
                }
                Err(e) => {
                    log::warn!(
                        "[VIOSerial] port {}: failing pending read {:?}: {}",
                        index,
                        request.id(),
                        e
                    );
                    (RequestStatus::from(e), 0)
                }
            };
            if !complete_claimed(&request, status, information) {
                report.reads_skipped += 1;
            } else if status == RequestStatus::Success {
                report.reads_completed += 1;
            } else {
                report.reads_failed += 1;
            }
            ports = self.ports.lock();
        }

        let message = ports
            .get_mut(self.config.control_port_index)
            .and_then(|port| port.take_control_message());
        drop(ports);

        if let Some(message) = message {
            report.control_messages += 1;
            self.dispatch_control(&message);
        }

        report
    }

    fn dispatch_control(&self, message: &ControlMessage) {
        log::debug!(
            "[VIOSerial] control message, {} bytes, header {:?}",
            message.as_bytes().len(),
            message.header()
        );
        match &self.control_handler {
            Some(handler) => handler.handle_control_message(message),
            None => log::debug!("[VIOSerial] no control handler, message dropped"),
        }
    }

    /// Toggle used-buffer notifications on every queue.
    ///
    /// Enabling also kicks every queue, so buffers posted while
    /// notifications were off get announced.
    pub fn set_interrupt_state(&self, enable: bool) {
        let mut ports = self.ports.lock();

        for port in ports.iter_mut() {
            port.enable_interrupts(enable);
        }

        if enable {
            for port in ports.iter_mut() {
                port.kick_all();
            }
        }
        log::debug!(
            "[VIOSerial] interrupts {}",
            if enable { "enabled" } else { "disabled" }
        );
    }

    /// Start a blocking read on data port `index`.
    ///
    /// On `Err` the request was not parked and the caller completes it.
    pub fn read(&self, index: usize, request: Arc<dyn IoRequest>) -> Result<ReadDisposition> {
        if self.config.is_control_port(index) {
            return Err(SerialError::ControlPort);
        }
        if !self.is_initialized() {
            return Err(SerialError::NotReady);
        }
        let region = request.output_memory()?;

        let mut ports = self.ports.lock();
        // `mark_uninitialized` clears the flag before it sweeps the slots.
        if !self.is_initialized() {
            return Err(SerialError::NotReady);
        }
        let port = ports.get_mut(index).ok_or(SerialError::InvalidPort)?;
        if port.receive_queue().is_none() {
            return Err(SerialError::NoQueue);
        }
        if port.has_pending_read() {
            return Err(SerialError::Busy);
        }

        match port.copy_into(&region, true) {
            Ok(count) => {
                drop(ports);
                if complete_claimed(&request, RequestStatus::Success, count) {
                    Ok(ReadDisposition::Completed(count))
                } else {
                    Ok(ReadDisposition::Canceled)
                }
            }
            Err(SerialError::WouldBlock) => {
                log::trace!(
                    "[VIOSerial] port {}: parking read {:?}",
                    index,
                    request.id()
                );
                port.set_pending_read(request);
                Ok(ReadDisposition::Pending)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel the read parked on port `index`.
    ///
    /// Returns `true` if this call canceled and completed it; `false` if
    /// nothing was parked or completion got there first.
    pub fn cancel_read(&self, index: usize) -> bool {
        let Some(request) = self.with_port(index, |port| port.pending_read()).flatten() else {
            return false;
        };
        if !request.cancel() {
            return false;
        }
        self.finish_cancel(index, &request);
        true
    }

    /// Unpark `request` if it is still in the slot, then complete it.
    /// The caller has won the cancel transition.
    fn finish_cancel(&self, index: usize, request: &Arc<dyn IoRequest>) {
        self.with_port(index, |port| port.take_pending_read_if(request));

        log::debug!(
            "[VIOSerial] port {}: read {:?} canceled",
            index,
            request.id()
        );
        request.complete(RequestStatus::Cancelled, 0);
    }

    /// Queue `data` on data port `index`.
    ///
    /// Returns the bytes queued, at most one buffer's worth.
    pub fn write(&self, index: usize, data: &[u8]) -> Result<usize> {
        if self.config.is_control_port(index) {
            return Err(SerialError::ControlPort);
        }
        self.send_on(index, data)
    }

    /// Send a message on the control transmit queue.
    pub fn send_control(&self, message: &ControlMessage) -> Result<usize> {
        self.send_on(self.config.control_port_index, message.as_bytes())
    }

    fn send_on(&self, index: usize, data: &[u8]) -> Result<usize> {
        if !self.is_initialized() {
            return Err(SerialError::NotReady);
        }
        let mut ports = self.ports.lock();
        let port = ports.get_mut(index).ok_or(SerialError::InvalidPort)?;
        port.send(data)
    }
}

/// Complete `request` if the cancel path does not own it.
fn complete_claimed(request: &Arc<dyn IoRequest>, status: RequestStatus, information: usize) -> bool {
    match request.unmark_cancelable() {
        CancelStatus::Unmarked => {
            request.complete(status, information);
            true
        }
        CancelStatus::AlreadyCanceled => {
            log::debug!(
                "[VIOSerial] read {:?} already canceled, skipping completion",
                request.id()
            );
            false
        }
        CancelStatus::AlreadyClaimed => {
            log::warn!("[VIOSerial] read {:?} already claimed", request.id());
            false
        }
    }
}
