//! Reader requests.
//!
//! A blocked read is parked on its port until data arrives, the reader
//! cancels, or the device goes away. Completion and cancellation race; the
//! request's state word decides the winner:
//!
//! ```text
//!            unmark_cancelable()
//!   Pending ---------------------> Completed   (completion path owns it)
//!      |
//!      |     cancel()
//!      +-------------------------> Canceling   (cancel path owns it)
//! ```
//!
//! Only the owner calls [`IoRequest::complete`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

use crate::{Result, SerialError};

/// Caller-visible request identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Final status delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Data was copied.
    Success,
    /// Generic failure.
    Unsuccessful,
    /// The reader canceled the request.
    Cancelled,
    /// The device was shut down while the read was pending.
    DeviceNotReady,
    /// The request had no usable output buffer.
    InvalidUserBuffer,
    /// The device returned malformed data.
    DeviceDataError,
}

impl From<SerialError> for RequestStatus {
    fn from(error: SerialError) -> Self {
        match error {
            SerialError::NoOutputMemory => RequestStatus::InvalidUserBuffer,
            SerialError::InvalidLength => RequestStatus::DeviceDataError,
            SerialError::NotReady => RequestStatus::DeviceNotReady,
            _ => RequestStatus::Unsuccessful,
        }
    }
}

/// Status and byte count a request completed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Final status.
    pub status: RequestStatus,
    /// Bytes transferred.
    pub information: usize,
}

/// Result of trying to take a request out of the cancelable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// The caller now owns completion.
    Unmarked,
    /// The cancel path won; it completes the request.
    AlreadyCanceled,
    /// Another completion path already claimed the request.
    AlreadyClaimed,
}

/// Destination memory of a read.
#[derive(Clone)]
pub struct MemoryRegion {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl MemoryRegion {
    /// Zeroed region of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Wrap an existing buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        MemoryRegion {
            inner: Arc::new(Mutex::new(data)),
        }
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the region is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `src` to `offset`. Returns bytes written.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let mut data = self.inner.lock();
        if offset >= data.len() {
            return 0;
        }
        let count = src.len().min(data.len() - offset);
        data[offset..offset + count].copy_from_slice(&src[..count]);
        count
    }

    /// Snapshot of the region contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }
}

/// Request lifecycle operations the completion path relies on.
pub trait IoRequest: Send + Sync {
    /// Request identity.
    fn id(&self) -> RequestId;

    /// Destination memory for received data.
    fn output_memory(&self) -> Result<MemoryRegion>;

    /// Claim the request for completion.
    fn unmark_cancelable(&self) -> CancelStatus;

    /// Claim the request for cancellation. Returns `false` if completion
    /// already owns it.
    fn cancel(&self) -> bool;

    /// Deliver the final status. Called once, by the owner.
    fn complete(&self, status: RequestStatus, information: usize);
}

const PENDING: u8 = 0;
const CANCELING: u8 = 1;
const COMPLETED: u8 = 2;

/// Ownership state of a [`ReadRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Cancelable, nobody owns completion.
    Pending,
    /// The cancel path owns completion.
    Canceling,
    /// A completion path owns completion.
    Completed,
}

type CompletionHook = Box<dyn Fn(&Completion) + Send + Sync>;

/// A blocking read issued by a port client.
pub struct ReadRequest {
    id: RequestId,
    state: AtomicU8,
    output: Option<MemoryRegion>,
    completion: Mutex<Option<Completion>>,
    completions: AtomicUsize,
    on_complete: Option<CompletionHook>,
}

impl ReadRequest {
    /// Read into a fresh `len`-byte region.
    pub fn new(id: RequestId, len: usize) -> Self {
        Self::with_output(id, Some(MemoryRegion::new(len)))
    }

    /// Read with an explicit (possibly missing) output region.
    pub fn with_output(id: RequestId, output: Option<MemoryRegion>) -> Self {
        ReadRequest {
            id,
            state: AtomicU8::new(PENDING),
            output,
            completion: Mutex::new(None),
            completions: AtomicUsize::new(0),
            on_complete: None,
        }
    }

    /// Run `hook` when the request completes.
    pub fn on_complete(mut self, hook: impl Fn(&Completion) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Current ownership state.
    pub fn state(&self) -> RequestState {
        match self.state.load(Ordering::Acquire) {
            PENDING => RequestState::Pending,
            CANCELING => RequestState::Canceling,
            _ => RequestState::Completed,
        }
    }

    /// Final status, once completed.
    pub fn completion(&self) -> Option<Completion> {
        *self.completion.lock()
    }

    /// Number of times `complete` was called.
    pub fn completion_count(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }

    /// Received bytes, if the request completed successfully.
    pub fn received(&self) -> Option<Vec<u8>> {
        let completion = self.completion()?;
        if completion.status != RequestStatus::Success {
            return None;
        }
        let mut data = self.output.as_ref()?.to_vec();
        data.truncate(completion.information);
        Some(data)
    }
}

impl IoRequest for ReadRequest {
    fn id(&self) -> RequestId {
        self.id
    }

    fn output_memory(&self) -> Result<MemoryRegion> {
        self.output.clone().ok_or(SerialError::NoOutputMemory)
    }

    fn unmark_cancelable(&self) -> CancelStatus {
        match self
            .state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => CancelStatus::Unmarked,
            Err(CANCELING) => CancelStatus::AlreadyCanceled,
            Err(_) => CancelStatus::AlreadyClaimed,
        }
    }

    fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn complete(&self, status: RequestStatus, information: usize) {
        if self.completions.fetch_add(1, Ordering::AcqRel) != 0 {
            log::error!("[VIOSerial] request {:?} completed twice", self.id);
            return;
        }

        let completion = Completion {
            status,
            information,
        };
        *self.completion.lock() = Some(completion);

        if let Some(hook) = &self.on_complete {
            hook(&completion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unmark_then_cancel_loses() {
        let request = ReadRequest::new(RequestId(1), 8);
        assert_eq!(request.unmark_cancelable(), CancelStatus::Unmarked);
        assert!(!request.cancel());
        assert_eq!(request.state(), RequestState::Completed);
        assert_eq!(request.unmark_cancelable(), CancelStatus::AlreadyClaimed);
    }

    #[test]
    fn test_cancel_then_unmark_loses() {
        let request = ReadRequest::new(RequestId(2), 8);
        assert!(request.cancel());
        assert_eq!(request.unmark_cancelable(), CancelStatus::AlreadyCanceled);
        assert!(!request.cancel());
        assert_eq!(request.state(), RequestState::Canceling);
    }

    #[test]
    fn test_second_complete_is_ignored() {
        let request = ReadRequest::new(RequestId(3), 8);
        request.complete(RequestStatus::Success, 4);
        request.complete(RequestStatus::Cancelled, 0);
        assert_eq!(request.completion_count(), 2);
        assert_eq!(
            request.completion(),
            Some(Completion {
                status: RequestStatus::Success,
                information: 4
            })
        );
    }

    #[test]
    fn test_missing_output_memory() {
        let request = ReadRequest::with_output(RequestId(4), None);
        assert_eq!(
            request.output_memory().err(),
            Some(SerialError::NoOutputMemory)
        );
        assert_eq!(
            RequestStatus::from(SerialError::NoOutputMemory),
            RequestStatus::InvalidUserBuffer
        );
    }

    #[test]
    fn test_region_write_is_bounded() {
        let region = MemoryRegion::new(4);
        assert_eq!(region.write_at(2, b"abcdef"), 2);
        assert_eq!(region.write_at(4, b"x"), 0);
        assert_eq!(region.to_vec(), vec![0, 0, b'a', b'b']);
    }

    #[test]
    fn test_racing_claims_have_one_winner() {
        for _ in 0..500 {
            let request = Arc::new(ReadRequest::new(RequestId(5), 1));
            let a = Arc::clone(&request);
            let b = Arc::clone(&request);

            let unmark = thread::spawn(move || a.unmark_cancelable() == CancelStatus::Unmarked);
            let cancel = thread::spawn(move || b.cancel());

            let unmarked = unmark.join().unwrap();
            let canceled = cancel.join().unwrap();
            assert!(unmarked ^ canceled);
        }
    }
}
