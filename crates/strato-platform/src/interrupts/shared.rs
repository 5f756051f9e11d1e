//! Thread-safe controller handles.
//!
//! The CPU thread, peripheral threads and the timer thread all call into the
//! same controller. Every operation runs mutate → re-arbitrate → publish
//! under one lock; the externally visible request/wake lines are stored
//! while the lock is still held, so no observer can read a signal older than
//! the state that produced it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use strato_interrupts::{LineId, MemoryMap, NestingError, Nvic};
use strato_io_snapshot::SnapshotResult;
use strato_timers::Clock;

use super::router::ApicPair;
use super::InterruptController;

/// Shared handle to a nested-vector controller.
pub struct SharedNvic<C: Clock> {
    inner: Arc<Mutex<Nvic<C>>>,
    mem: Arc<dyn MemoryMap + Send + Sync>,
    irq: Arc<AtomicBool>,
    wake: Arc<AtomicBool>,
}

impl<C: Clock> Clone for SharedNvic<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            mem: self.mem.clone(),
            irq: self.irq.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<C: Clock + Send> SharedNvic<C> {
    pub fn new(nvic: Nvic<C>, mem: Arc<dyn MemoryMap + Send + Sync>) -> Self {
        let irq = Arc::new(AtomicBool::new(nvic.irq_asserted()));
        let wake = Arc::new(AtomicBool::new(nvic.pending_interrupt_present()));
        Self {
            inner: Arc::new(Mutex::new(nvic)),
            mem,
            irq,
            wake,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Nvic<C>) -> R) -> R {
        let mut nvic = self.inner.lock().unwrap();
        let result = f(&mut nvic);
        self.irq.store(nvic.irq_asserted(), Ordering::SeqCst);
        self.wake
            .store(nvic.pending_interrupt_present(), Ordering::SeqCst);
        result
    }

    pub fn set_pending_irq(&self, line: LineId) {
        self.with(|nvic| nvic.set_pending_irq(line));
    }

    pub fn on_gpio(&self, number: usize, asserted: bool) {
        self.with(|nvic| nvic.on_gpio(number, asserted));
    }

    pub fn acknowledge_irq(&self) -> Option<LineId> {
        self.with(|nvic| nvic.acknowledge_irq())
    }

    pub fn complete_irq(&self, line: LineId) -> Result<(), NestingError> {
        self.with(|nvic| nvic.complete_irq(line))
    }

    pub fn priority_floor(&self) -> u8 {
        self.with(|nvic| nvic.priority_floor())
    }

    pub fn write_priority_floor(&self, floor: u8) {
        self.with(|nvic| nvic.write_priority_floor(floor));
    }

    pub fn global_mask(&self) -> bool {
        self.with(|nvic| nvic.global_mask())
    }

    pub fn write_global_mask(&self, masked: bool) {
        self.with(|nvic| nvic.write_global_mask(masked));
    }

    pub fn vector_table_base(&self) -> u32 {
        self.with(|nvic| nvic.vector_table_base())
    }

    /// Drives the tick timer; meant for the timer thread.
    pub fn poll(&self) {
        self.with(|nvic| nvic.poll());
    }

    pub fn mmio_read(&self, offset: u64) -> u32 {
        self.with(|nvic| nvic.mmio_read(offset))
    }

    pub fn mmio_write(&self, offset: u64, value: u32) {
        let mem = self.mem.clone();
        self.with(move |nvic| nvic.mmio_write(offset, value, mem.as_ref()));
    }

    pub fn reset(&self) {
        self.with(|nvic| nvic.reset());
    }

    pub fn save_state(&self) -> Vec<u8> {
        use strato_io_snapshot::IoSnapshot;
        self.with(|nvic| nvic.save_state())
    }

    pub fn load_state(&self, bytes: &[u8]) -> SnapshotResult<()> {
        use strato_io_snapshot::IoSnapshot;
        self.with(|nvic| nvic.load_state(bytes))
    }

    /// Lock-free view of the request line; published by the most recent
    /// arbitration pass.
    pub fn irq_asserted(&self) -> bool {
        self.irq.load(Ordering::SeqCst)
    }

    /// Lock-free wake line for the CPU idle primitive; ignores the global
    /// mask by construction.
    pub fn pending_interrupt_present(&self) -> bool {
        self.wake.load(Ordering::SeqCst)
    }
}

impl<C: Clock + Send> InterruptController for SharedNvic<C> {
    fn pending_interrupt(&self) -> Option<u16> {
        self.with(|nvic| nvic.arbiter().best_candidate())
    }

    fn acknowledge(&mut self) -> Option<u16> {
        self.acknowledge_irq()
    }

    fn complete(&mut self, source: u16) -> Result<(), NestingError> {
        self.complete_irq(source)
    }
}

/// Shared handle to an I/O + local controller pair.
pub struct SharedApicPair<C: Clock> {
    inner: Arc<Mutex<ApicPair<C>>>,
    irq: Arc<AtomicBool>,
    wake: Arc<AtomicBool>,
}

impl<C: Clock> Clone for SharedApicPair<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            irq: self.irq.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<C: Clock + Send> SharedApicPair<C> {
    pub fn new(pair: ApicPair<C>) -> Self {
        let irq = Arc::new(AtomicBool::new(pair.irq_asserted()));
        let wake = Arc::new(AtomicBool::new(pair.pending_interrupt_present()));
        Self {
            inner: Arc::new(Mutex::new(pair)),
            irq,
            wake,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut ApicPair<C>) -> R) -> R {
        let mut pair = self.inner.lock().unwrap();
        let result = f(&mut pair);
        self.irq.store(pair.irq_asserted(), Ordering::SeqCst);
        self.wake
            .store(pair.pending_interrupt_present(), Ordering::SeqCst);
        result
    }

    pub fn raise_gsi(&self, gsi: u32) {
        self.with(|pair| pair.raise_gsi(gsi));
    }

    pub fn lower_gsi(&self, gsi: u32) {
        self.with(|pair| pair.lower_gsi(gsi));
    }

    pub fn pulse_gsi(&self, gsi: u32) {
        self.with(|pair| pair.pulse_gsi(gsi));
    }

    pub fn acknowledge_vector(&self) -> Option<u8> {
        self.with(|pair| pair.acknowledge())
    }

    pub fn eoi(&self) -> Option<u8> {
        self.with(|pair| pair.eoi())
    }

    pub fn poll(&self) {
        self.with(|pair| pair.poll());
    }

    pub fn lapic_mmio_read(&self, offset: u64) -> u32 {
        self.with(|pair| pair.lapic_mmio_read(offset))
    }

    pub fn lapic_mmio_write(&self, offset: u64, value: u32) {
        self.with(|pair| pair.lapic_mmio_write(offset, value));
    }

    pub fn ioapic_mmio_read(&self, offset: u64) -> u32 {
        self.with(|pair| pair.ioapic_mmio_read(offset))
    }

    pub fn ioapic_mmio_write(&self, offset: u64, value: u32) {
        self.with(|pair| pair.ioapic_mmio_write(offset, value));
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq.load(Ordering::SeqCst)
    }

    pub fn pending_interrupt_present(&self) -> bool {
        self.wake.load(Ordering::SeqCst)
    }
}

impl<C: Clock + Send> InterruptController for SharedApicPair<C> {
    fn pending_interrupt(&self) -> Option<u16> {
        self.with(|pair| pair.pending_vector().map(u16::from))
    }

    fn acknowledge(&mut self) -> Option<u16> {
        self.acknowledge_vector().map(u16::from)
    }

    /// End-of-interrupt on this family carries no source operand; the
    /// innermost in-service vector is always the one retired.
    fn complete(&mut self, _source: u16) -> Result<(), NestingError> {
        self.eoi();
        Ok(())
    }
}
