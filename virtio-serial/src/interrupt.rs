//! Top-half interrupt handler and deferred work entry point.
//!
//! The top half runs at interrupt level: it checks the readiness flag, reads
//! the ISR register and schedules the bottom half. It never takes the device
//! lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::INVALID_INTERRUPT_STATUS;
use crate::device::{DeviceContext, DrainReport};
use crate::queue::VirtQueue;
use crate::{Result, SerialError};

bitflags! {
    /// ISR status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IsrStatus: u8 {
        /// A virtqueue made progress.
        const QUEUE = 0b01;
        /// Device configuration changed.
        const CONFIG_CHANGED = 0b10;
    }
}

impl IsrStatus {
    /// Decode a raw register value. The all-ones value means "not ours".
    pub fn from_register(raw: u8) -> Self {
        if raw == INVALID_INTERRUPT_STATUS {
            return IsrStatus::empty();
        }
        IsrStatus::from_bits_retain(raw)
    }
}

/// Read-to-clear ISR status register.
pub trait IsrRegister: Send + Sync {
    /// Read the status byte. Reading acknowledges the interrupt.
    fn read_and_clear(&self) -> u8;
}

/// Queues the bottom half to run outside interrupt context.
pub trait DeferredScheduler: Send + Sync {
    fn schedule(&self);
}

/// Interrupt counters.
#[derive(Debug, Default)]
pub struct InterruptStats {
    claimed: AtomicU64,
    spurious: AtomicU64,
    not_ready: AtomicU64,
    config_changes: AtomicU64,
    deferred_runs: AtomicU64,
}

impl InterruptStats {
    /// Interrupts claimed and scheduled.
    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Interrupts with a zero (or invalid) status.
    pub fn spurious(&self) -> u64 {
        self.spurious.load(Ordering::Relaxed)
    }

    /// Interrupts refused because the device was not initialized.
    pub fn not_ready(&self) -> u64 {
        self.not_ready.load(Ordering::Relaxed)
    }

    pub fn config_changes(&self) -> u64 {
        self.config_changes.load(Ordering::Relaxed)
    }

    /// Bottom-half passes run.
    pub fn deferred_runs(&self) -> u64 {
        self.deferred_runs.load(Ordering::Relaxed)
    }
}

/// Interrupt object bound to one device.
pub struct Interrupt<Q: VirtQueue> {
    device: Arc<DeviceContext<Q>>,
    isr: Box<dyn IsrRegister>,
    scheduler: Box<dyn DeferredScheduler>,
    stats: InterruptStats,
}

impl<Q: VirtQueue> Interrupt<Q> {
    pub fn new(
        device: Arc<DeviceContext<Q>>,
        isr: impl IsrRegister + 'static,
        scheduler: impl DeferredScheduler + 'static,
    ) -> Self {
        Interrupt {
            device,
            isr: Box::new(isr),
            scheduler: Box::new(scheduler),
            stats: InterruptStats::default(),
        }
    }

    pub fn device(&self) -> &Arc<DeviceContext<Q>> {
        &self.device
    }

    pub fn stats(&self) -> &InterruptStats {
        &self.stats
    }

    /// Top half.
    ///
    /// Returns `true` if the interrupt belonged to this device and the
    /// bottom half was scheduled.
    pub fn handle_interrupt(&self, message_id: u32) -> bool {
        if !self.device.is_initialized() {
            self.stats.not_ready.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let status = IsrStatus::from_register(self.isr.read_and_clear());
        if status.is_empty() {
            self.stats.spurious.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if status.contains(IsrStatus::CONFIG_CHANGED) {
            self.stats.config_changes.fetch_add(1, Ordering::Relaxed);
            log::trace!("[VIOSerial] msg {}: config change", message_id);
        }
        log::trace!("[VIOSerial] msg {}: isr {:?}", message_id, status);

        self.stats.claimed.fetch_add(1, Ordering::Relaxed);
        self.scheduler.schedule();
        true
    }

    /// Turn queue notifications on and kick every queue.
    pub fn enable(&self) -> Result<()> {
        self.device.set_interrupt_state(true);
        Ok(())
    }

    /// Turn queue notifications off.
    pub fn disable(&self) -> Result<()> {
        self.device.set_interrupt_state(false);
        Ok(())
    }
}

/// Bottom-half entry point, run by the deferred scheduler.
pub fn run_deferred_work<Q: VirtQueue>(interrupt: Option<&Interrupt<Q>>) -> Option<DrainReport> {
    let Some(interrupt) = interrupt else {
        log::error!("[VIOSerial] deferred work without an interrupt handle");
        return None;
    };

    interrupt.stats.deferred_runs.fetch_add(1, Ordering::Relaxed);
    let report = interrupt.device.drain_completions();
    log::trace!("[VIOSerial] deferred pass: {:?}", report);
    Some(report)
}

/// Enable or disable notifications on every queue of `device`.
///
/// A missing device is a no-op.
pub fn set_interrupt_state<Q: VirtQueue>(device: Option<&DeviceContext<Q>>, enable: bool) {
    match device {
        Some(device) => device.set_interrupt_state(enable),
        None => log::debug!("[VIOSerial] interrupt state change without a device"),
    }
}

/// Fallible variant used by bus glue that must report a missing device.
pub fn try_set_interrupt_state<Q: VirtQueue>(
    device: Option<&DeviceContext<Q>>,
    enable: bool,
) -> Result<()> {
    let device = device.ok_or(SerialError::NotReady)?;
    device.set_interrupt_state(enable);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::split::SplitQueue;
    use crate::testing::{self, deliver_rx};
    use core::sync::atomic::{AtomicU8, AtomicUsize};

    #[derive(Clone)]
    struct FakeIsr {
        value: Arc<AtomicU8>,
        reads: Arc<AtomicUsize>,
    }

    impl FakeIsr {
        fn new(value: u8) -> Self {
            FakeIsr {
                value: Arc::new(AtomicU8::new(value)),
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn set(&self, value: u8) {
            self.value.store(value, Ordering::SeqCst);
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl IsrRegister for FakeIsr {
        fn read_and_clear(&self) -> u8 {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.value.swap(0, Ordering::SeqCst)
        }
    }

    #[derive(Clone, Default)]
    struct CountingScheduler {
        scheduled: Arc<AtomicUsize>,
    }

    impl CountingScheduler {
        fn count(&self) -> usize {
            self.scheduled.load(Ordering::SeqCst)
        }
    }

    impl DeferredScheduler for CountingScheduler {
        fn schedule(&self) {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn interrupt(isr: &FakeIsr, scheduler: &CountingScheduler) -> Interrupt<SplitQueue> {
        Interrupt::new(
            Arc::new(testing::device(3)),
            isr.clone(),
            scheduler.clone(),
        )
    }

    #[test]
    fn test_isr_status_decoding() {
        assert_eq!(IsrStatus::from_register(0xFF), IsrStatus::empty());
        assert_eq!(IsrStatus::from_register(0), IsrStatus::empty());
        assert_eq!(IsrStatus::from_register(1), IsrStatus::QUEUE);
        assert_eq!(
            IsrStatus::from_register(3),
            IsrStatus::QUEUE | IsrStatus::CONFIG_CHANGED
        );
    }

    #[test]
    fn test_uninitialized_device_is_not_touched() {
        let isr = FakeIsr::new(1);
        let scheduler = CountingScheduler::default();
        let interrupt = interrupt(&isr, &scheduler);
        interrupt.device().mark_uninitialized();

        assert!(!interrupt.handle_interrupt(0));
        assert_eq!(isr.reads(), 0);
        assert_eq!(scheduler.count(), 0);
        assert_eq!(interrupt.stats().not_ready(), 1);
        // The status stays latched for the device to re-raise.
        assert_eq!(isr.value.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_status_is_not_ours() {
        let isr = FakeIsr::new(INVALID_INTERRUPT_STATUS);
        let scheduler = CountingScheduler::default();
        let interrupt = interrupt(&isr, &scheduler);

        assert!(!interrupt.handle_interrupt(0));
        assert_eq!(isr.reads(), 1);
        assert_eq!(scheduler.count(), 0);
        assert_eq!(interrupt.stats().spurious(), 1);
    }

    #[test]
    fn test_zero_status_is_not_ours() {
        let isr = FakeIsr::new(0);
        let scheduler = CountingScheduler::default();
        let interrupt = interrupt(&isr, &scheduler);

        assert!(!interrupt.handle_interrupt(0));
        assert_eq!(scheduler.count(), 0);
    }

    #[test]
    fn test_claimed_interrupt_schedules_bottom_half() {
        let isr = FakeIsr::new(IsrStatus::QUEUE.bits());
        let scheduler = CountingScheduler::default();
        let interrupt = interrupt(&isr, &scheduler);

        assert!(interrupt.handle_interrupt(2));
        assert_eq!(scheduler.count(), 1);
        assert_eq!(interrupt.stats().claimed(), 1);

        // Read cleared the register.
        assert!(!interrupt.handle_interrupt(2));

        isr.set((IsrStatus::QUEUE | IsrStatus::CONFIG_CHANGED).bits());
        assert!(interrupt.handle_interrupt(2));
        assert_eq!(scheduler.count(), 2);
        assert_eq!(interrupt.stats().config_changes(), 1);
    }

    #[test]
    fn test_top_half_does_not_take_device_lock() {
        let isr = FakeIsr::new(1);
        let scheduler = CountingScheduler::default();
        let interrupt = interrupt(&isr, &scheduler);

        let claimed = interrupt
            .device()
            .with_port(0, |_| interrupt.handle_interrupt(0));
        assert_eq!(claimed, Some(true));
    }

    #[test]
    fn test_deferred_work_drains_device() {
        let isr = FakeIsr::new(1);
        let scheduler = CountingScheduler::default();
        let interrupt = interrupt(&isr, &scheduler);
        interrupt.device().write(0, b"out").unwrap();
        interrupt.device().with_port(0, |port| {
            port.send_queue_mut().unwrap().device_complete_next(0);
            deliver_rx(port, b"in");
        });

        let report = run_deferred_work(Some(&interrupt)).unwrap();
        assert_eq!(report.sends_reclaimed, 1);
        assert_eq!(interrupt.stats().deferred_runs(), 1);
    }

    #[test]
    fn test_deferred_work_without_handle() {
        assert_eq!(run_deferred_work::<SplitQueue>(None), None);
    }

    #[test]
    fn test_enable_disable_wrappers() {
        let isr = FakeIsr::new(0);
        let scheduler = CountingScheduler::default();
        let interrupt = interrupt(&isr, &scheduler);

        assert_eq!(interrupt.disable(), Ok(()));
        interrupt.device().with_port(0, |port| {
            assert!(!port.receive_queue().unwrap().interrupts_enabled());
        });
        assert_eq!(interrupt.enable(), Ok(()));
        interrupt.device().with_port(0, |port| {
            assert!(port.receive_queue().unwrap().interrupts_enabled());
        });

        set_interrupt_state::<SplitQueue>(None, true);
        assert_eq!(
            try_set_interrupt_state::<SplitQueue>(None, true),
            Err(SerialError::NotReady)
        );
        assert_eq!(
            try_set_interrupt_state(Some(interrupt.device().as_ref()), false),
            Ok(())
        );
    }
}
