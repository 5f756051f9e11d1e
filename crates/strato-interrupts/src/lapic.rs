//! Per-CPU local interrupt controller: 256 vectors, highest vector number
//! wins, nested service tracked through the shared line table and stack.
//!
//! Registers sit on 16-byte strides and are 32 bits wide. The in-service,
//! trigger-mode and request bitmaps are read back one 32-bit word per
//! register, the way guests scan them.

use strato_io_snapshot::codec::{Decoder, Encoder};
use strato_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use strato_timers::{Clock, CountdownTimer};

use crate::arbiter::{Arbiter, VectorOrder};
use crate::ioapic::TriggerMode;
use crate::line::{LineFlags, LineId};

pub const VECTOR_COUNT: usize = 256;
/// Vectors below 16 are architectural exceptions and cannot be injected.
pub const FIRST_VALID_VECTOR: u8 = 16;

pub const REG_ID: u64 = 0x020;
pub const REG_VERSION: u64 = 0x030;
pub const REG_TPR: u64 = 0x080;
pub const REG_EOI: u64 = 0x0B0;
pub const REG_SVR: u64 = 0x0F0;
pub const REG_ISR_BASE: u64 = 0x100;
pub const REG_TMR_BASE: u64 = 0x180;
pub const REG_IRR_BASE: u64 = 0x200;
pub const REG_LVT_TIMER: u64 = 0x320;
pub const REG_TIMER_INITIAL: u64 = 0x380;
pub const REG_TIMER_CURRENT: u64 = 0x390;
pub const REG_TIMER_DIVIDE: u64 = 0x3E0;

const BITMAP_WORDS: u64 = (VECTOR_COUNT / 32) as u64;
pub const BITMAP_STRIDE: u64 = 0x10;

// Version register: APIC version 0x14, max LVT entry index in bits [23:16].
const VERSION_VALUE: u32 = 0x14 | (5 << 16);

pub const SVR_SOFTWARE_ENABLE: u32 = 1 << 8;
pub const LVT_VECTOR_MASK: u32 = 0xFF;
pub const LVT_MASKED: u32 = 1 << 16;
pub const LVT_TIMER_PERIODIC: u32 = 1 << 17;

#[derive(Debug, Clone)]
pub struct LocalApicConfig {
    /// Undivided timer input frequency, in Hz.
    pub timer_hz: u64,
}

impl Default for LocalApicConfig {
    fn default() -> Self {
        Self {
            timer_hz: 1_000_000_000,
        }
    }
}

#[derive(Debug)]
pub struct LocalApic<C: Clock> {
    id: u8,
    arbiter: Arbiter<VectorOrder>,
    // Trigger mode latched per vector at injection time; level-triggered
    // vectors are propagated back to the I/O controller on EOI.
    trigger_mode: [u32; VECTOR_COUNT / 32],
    tpr: u32,
    svr: u32,
    timer: CountdownTimer<C>,
    timer_hz: u64,
    lvt_timer: u32,
    timer_divide: u32,
    timer_initial: u32,
}

/// Outcome of an EOI: the retired vector and whether the I/O controller
/// must be notified (level-triggered delivery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EoiNotice {
    pub vector: u8,
    pub level_triggered: bool,
}

impl<C: Clock> LocalApic<C> {
    pub fn new(id: u8, clock: C, config: LocalApicConfig) -> Self {
        let mut arbiter = Arbiter::new(VECTOR_COUNT, VectorOrder);
        for vector in 0..VECTOR_COUNT as LineId {
            arbiter.set_enabled(vector, true);
        }
        // The LVT resets to masked one-shot mode.
        let mut timer = CountdownTimer::new(clock, config.timer_hz);
        timer.set_periodic(false);
        let mut apic = Self {
            id,
            arbiter,
            trigger_mode: [0; VECTOR_COUNT / 32],
            tpr: 0,
            svr: 0,
            timer,
            timer_hz: config.timer_hz,
            lvt_timer: LVT_MASKED,
            timer_divide: 0,
            timer_initial: 0,
        };
        // Out of reset the controller is software-disabled: requests latch
        // but the output stays low until SVR enables it.
        apic.arbiter.set_global_mask(true);
        apic
    }

    pub fn new_default(id: u8, clock: C) -> Self {
        Self::new(id, clock, LocalApicConfig::default())
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn arbiter(&self) -> &Arbiter<VectorOrder> {
        &self.arbiter
    }

    pub fn software_enabled(&self) -> bool {
        self.svr & SVR_SOFTWARE_ENABLE != 0
    }

    /// Latches an interrupt request. Requests latch regardless of the
    /// software-enable bit; delivery is what the bit gates.
    pub fn inject(&mut self, vector: u8, trigger: TriggerMode) {
        if vector < FIRST_VALID_VECTOR {
            tracing::warn!("lapic{}: vector {vector} below 16 rejected", self.id);
            return;
        }
        let (word, bit) = (vector as usize / 32, vector % 32);
        match trigger {
            TriggerMode::Level => self.trigger_mode[word] |= 1 << bit,
            TriggerMode::Edge => self.trigger_mode[word] &= !(1 << bit),
        }
        self.arbiter.set_pending(vector as LineId);
    }

    /// Best deliverable vector, without claiming it.
    pub fn pending_vector(&self) -> Option<u8> {
        if !self.software_enabled() {
            return None;
        }
        self.arbiter.best_candidate().map(|line| line as u8)
    }

    /// Claims the best deliverable vector and marks it in service.
    pub fn acknowledge(&mut self) -> Option<u8> {
        if !self.software_enabled() {
            return None;
        }
        self.arbiter.acknowledge().map(|line| line as u8)
    }

    /// Retires the innermost in-service vector. The highest in-service
    /// vector is always the innermost, so completion never violates the
    /// nesting discipline.
    pub fn eoi(&mut self) -> Option<EoiNotice> {
        let vector = self.arbiter.active_top()?;
        self.arbiter.complete(vector).ok()?;
        let (word, bit) = (vector as usize / 32, vector % 32);
        let level_triggered = self.trigger_mode[word] & (1 << bit) != 0;
        Some(EoiNotice {
            vector: vector as u8,
            level_triggered,
        })
    }

    pub fn irq_asserted(&self) -> bool {
        self.arbiter.irq_asserted()
    }

    pub fn pending_interrupt_present(&self) -> bool {
        self.arbiter.pending_interrupt_present()
    }

    /// Drives the local timer; a fire injects the LVT vector unless masked.
    pub fn poll(&mut self) {
        let fired = self.timer.poll();
        if fired > 0 && self.lvt_timer & LVT_MASKED == 0 {
            let vector = (self.lvt_timer & LVT_VECTOR_MASK) as u8;
            self.inject(vector, TriggerMode::Edge);
        }
    }

    pub fn mmio_read(&mut self, offset: u64) -> u32 {
        let offset = offset & !0xF;
        match offset {
            REG_ID => (self.id as u32) << 24,
            REG_VERSION => VERSION_VALUE,
            REG_TPR => self.tpr,
            REG_SVR => self.svr,
            o if Self::bitmap_index(o, REG_ISR_BASE).is_some() => {
                let word = Self::bitmap_index(o, REG_ISR_BASE).unwrap_or(0);
                self.arbiter
                    .table()
                    .bitmap_word(LineFlags::ACTIVE, word * 32)
            }
            o if Self::bitmap_index(o, REG_TMR_BASE).is_some() => {
                let word = Self::bitmap_index(o, REG_TMR_BASE).unwrap_or(0);
                self.trigger_mode[word]
            }
            o if Self::bitmap_index(o, REG_IRR_BASE).is_some() => {
                let word = Self::bitmap_index(o, REG_IRR_BASE).unwrap_or(0);
                self.arbiter
                    .table()
                    .bitmap_word(LineFlags::PENDING, word * 32)
            }
            REG_LVT_TIMER => self.lvt_timer,
            REG_TIMER_INITIAL => self.timer_initial,
            REG_TIMER_CURRENT => self.timer.value() as u32,
            REG_TIMER_DIVIDE => self.timer_divide,
            _ => {
                tracing::warn!("lapic{}: unhandled register read at {offset:#05x}", self.id);
                0
            }
        }
    }

    pub fn mmio_write(&mut self, offset: u64, value: u32) {
        let offset = offset & !0xF;
        match offset {
            REG_ID => self.id = (value >> 24) as u8,
            REG_TPR => self.tpr = value & 0xFF,
            REG_EOI => {
                // The register write carries no vector; completion always
                // targets the innermost in-service entry.
                let _ = self.eoi();
            }
            REG_SVR => {
                self.svr = value & (SVR_SOFTWARE_ENABLE | 0xFF);
                let enabled = self.software_enabled();
                self.arbiter.set_global_mask(!enabled);
            }
            REG_LVT_TIMER => {
                self.lvt_timer = value & (LVT_VECTOR_MASK | LVT_MASKED | LVT_TIMER_PERIODIC);
                self.timer
                    .set_periodic(self.lvt_timer & LVT_TIMER_PERIODIC != 0);
            }
            REG_TIMER_INITIAL => {
                self.timer_initial = value;
                self.timer.set_reload(value as u64);
                self.timer.set_value(value as u64);
                self.timer.set_enabled(value != 0);
            }
            REG_TIMER_DIVIDE => {
                self.timer_divide = value & 0b1011;
                self.timer.set_hz(self.timer_hz / u64::from(self.divisor()));
            }
            _ => {
                tracing::warn!(
                    "lapic{}: unhandled register write at {offset:#05x} = {value:#010x}",
                    self.id
                );
            }
        }
    }

    /// Divide-configuration encoding: bits [1:0] and [3] select a power of
    /// two from 2 to 128, with 0b1011 meaning divide-by-1.
    fn divisor(&self) -> u32 {
        let select = (self.timer_divide & 0b11) | ((self.timer_divide >> 1) & 0b100);
        1 << ((select + 1) & 0b111)
    }

    fn bitmap_index(offset: u64, base: u64) -> Option<usize> {
        if offset < base {
            return None;
        }
        let index = (offset - base) / BITMAP_STRIDE;
        if offset % BITMAP_STRIDE == 0 && index < BITMAP_WORDS {
            Some(index as usize)
        } else {
            None
        }
    }
}

impl<C: Clock> IoSnapshot for LocalApic<C> {
    const DEVICE_ID: [u8; 4] = *b"LAPC";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_ID: u16 = 1;
        const TAG_PENDING: u16 = 2;
        const TAG_ACTIVE_STACK: u16 = 3;
        const TAG_TRIGGER_MODE: u16 = 4;
        const TAG_TPR: u16 = 5;
        const TAG_SVR: u16 = 6;
        const TAG_LVT_TIMER: u16 = 7;
        const TAG_TIMER_DIVIDE: u16 = 8;
        const TAG_TIMER_INITIAL: u16 = 9;
        const TAG_TIMER_STATE: u16 = 10;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u8(TAG_ID, self.id);
        w.field_bytes(
            TAG_PENDING,
            self.arbiter.table().flag_bits(LineFlags::PENDING),
        );

        let mut stack = Encoder::new().u32(self.arbiter.active_depth() as u32);
        for &vector in self.arbiter.active_stack() {
            stack = stack.u16(vector);
        }
        w.field_bytes(TAG_ACTIVE_STACK, stack.finish());

        let mut tmr = Encoder::new();
        for word in self.trigger_mode {
            tmr = tmr.u32(word);
        }
        w.field_bytes(TAG_TRIGGER_MODE, tmr.finish());

        w.field_u32(TAG_TPR, self.tpr);
        w.field_u32(TAG_SVR, self.svr);
        w.field_u32(TAG_LVT_TIMER, self.lvt_timer);
        w.field_u32(TAG_TIMER_DIVIDE, self.timer_divide);
        w.field_u32(TAG_TIMER_INITIAL, self.timer_initial);

        let timer = Encoder::new()
            .bool(self.timer.is_enabled())
            .u64(self.timer.reload())
            .u64(self.timer.value_unsynced())
            .finish();
        w.field_bytes(TAG_TIMER_STATE, timer);

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_ID: u16 = 1;
        const TAG_PENDING: u16 = 2;
        const TAG_ACTIVE_STACK: u16 = 3;
        const TAG_TRIGGER_MODE: u16 = 4;
        const TAG_TPR: u16 = 5;
        const TAG_SVR: u16 = 6;
        const TAG_LVT_TIMER: u16 = 7;
        const TAG_TIMER_DIVIDE: u16 = 8;
        const TAG_TIMER_INITIAL: u16 = 9;
        const TAG_TIMER_STATE: u16 = 10;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        self.arbiter.reset();
        for vector in 0..VECTOR_COUNT as LineId {
            self.arbiter.set_enabled(vector, true);
        }
        self.trigger_mode = [0; VECTOR_COUNT / 32];
        self.tpr = 0;
        self.svr = 0;
        self.arbiter.set_global_mask(true);
        self.lvt_timer = LVT_MASKED;
        self.timer_divide = 0;
        self.timer_initial = 0;
        self.timer.set_enabled(false);
        self.timer.set_periodic(false);
        self.timer.set_hz(self.timer_hz);
        self.timer.set_reload(0);
        self.timer.set_value(0);

        if let Some(id) = r.u8(TAG_ID)? {
            self.id = id;
        }
        if let Some(bits) = r.bytes(TAG_PENDING) {
            self.arbiter
                .table_mut()
                .load_flag_bits(LineFlags::PENDING, bits);
        }
        if let Some(buf) = r.bytes(TAG_ACTIVE_STACK) {
            let mut d = Decoder::new(buf);
            let depth = d.u32()? as usize;
            for _ in 0..depth {
                let vector = d.u16()?;
                if (vector as usize) < VECTOR_COUNT {
                    self.arbiter.restore_active(vector);
                }
            }
            d.finish()?;
        }
        if let Some(buf) = r.bytes(TAG_TRIGGER_MODE) {
            let mut d = Decoder::new(buf);
            for word in self.trigger_mode.iter_mut() {
                *word = d.u32()?;
            }
            d.finish()?;
        }
        if let Some(tpr) = r.u32(TAG_TPR)? {
            self.tpr = tpr;
        }
        if let Some(svr) = r.u32(TAG_SVR)? {
            self.svr = svr;
            let enabled = self.software_enabled();
            self.arbiter.set_global_mask(!enabled);
        }
        if let Some(lvt) = r.u32(TAG_LVT_TIMER)? {
            self.lvt_timer = lvt;
            self.timer.set_periodic(lvt & LVT_TIMER_PERIODIC != 0);
        }
        if let Some(divide) = r.u32(TAG_TIMER_DIVIDE)? {
            self.timer_divide = divide;
            self.timer.set_hz(self.timer_hz / u64::from(self.divisor()));
        }
        if let Some(initial) = r.u32(TAG_TIMER_INITIAL)? {
            self.timer_initial = initial;
        }
        if let Some(buf) = r.bytes(TAG_TIMER_STATE) {
            let mut d = Decoder::new(buf);
            let enabled = d.bool()?;
            let reload = d.u64()?;
            let value = d.u64()?;
            d.finish()?;
            self.timer.set_reload(reload);
            self.timer.set_value(value);
            self.timer.set_enabled(enabled);
        }

        self.arbiter.reevaluate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_timers::ManualClock;

    fn apic() -> (ManualClock, LocalApic<ManualClock>) {
        let clock = ManualClock::new();
        let mut apic = LocalApic::new_default(0, clock.clone());
        apic.mmio_write(REG_SVR, SVR_SOFTWARE_ENABLE | 0xFF);
        (clock, apic)
    }

    #[test]
    fn highest_vector_wins() {
        let (_, mut apic) = apic();
        apic.inject(0x31, TriggerMode::Edge);
        apic.inject(0x80, TriggerMode::Edge);
        apic.inject(0x40, TriggerMode::Edge);

        assert_eq!(apic.acknowledge(), Some(0x80));
        apic.eoi();
        assert_eq!(apic.acknowledge(), Some(0x40));
        apic.eoi();
        assert_eq!(apic.acknowledge(), Some(0x31));
    }

    #[test]
    fn lower_vector_waits_for_eoi_of_in_service_one() {
        let (_, mut apic) = apic();
        apic.inject(0x60, TriggerMode::Edge);
        assert_eq!(apic.acknowledge(), Some(0x60));

        apic.inject(0x40, TriggerMode::Edge);
        assert!(!apic.irq_asserted());

        apic.inject(0x70, TriggerMode::Edge);
        assert!(apic.irq_asserted());
        assert_eq!(apic.acknowledge(), Some(0x70));

        assert_eq!(
            apic.eoi(),
            Some(EoiNotice {
                vector: 0x70,
                level_triggered: false
            })
        );
        assert_eq!(
            apic.eoi(),
            Some(EoiNotice {
                vector: 0x60,
                level_triggered: false
            })
        );
        assert_eq!(apic.acknowledge(), Some(0x40));
    }

    #[test]
    fn software_disable_gates_delivery_but_latches_requests() {
        let (_, mut apic) = apic();
        apic.mmio_write(REG_SVR, 0xFF); // clear the enable bit
        apic.inject(0x55, TriggerMode::Edge);

        assert!(!apic.irq_asserted());
        assert_eq!(apic.acknowledge(), None);
        // The request survives and the wake flag still sees it.
        assert!(apic.pending_interrupt_present());

        apic.mmio_write(REG_SVR, SVR_SOFTWARE_ENABLE | 0xFF);
        assert!(apic.irq_asserted());
        assert_eq!(apic.acknowledge(), Some(0x55));
    }

    #[test]
    fn illegal_vectors_are_rejected() {
        let (_, mut apic) = apic();
        apic.inject(3, TriggerMode::Edge);
        assert_eq!(apic.acknowledge(), None);
    }

    #[test]
    fn bitmap_windows_expose_request_and_service_state() {
        let (_, mut apic) = apic();
        apic.inject(0x41, TriggerMode::Level);

        // Vector 0x41 = word 2, bit 1.
        let irr2 = apic.mmio_read(REG_IRR_BASE + 2 * BITMAP_STRIDE);
        assert_eq!(irr2, 1 << 1);
        let tmr2 = apic.mmio_read(REG_TMR_BASE + 2 * BITMAP_STRIDE);
        assert_eq!(tmr2, 1 << 1);

        assert_eq!(apic.acknowledge(), Some(0x41));
        let irr2 = apic.mmio_read(REG_IRR_BASE + 2 * BITMAP_STRIDE);
        assert_eq!(irr2, 0);
        let isr2 = apic.mmio_read(REG_ISR_BASE + 2 * BITMAP_STRIDE);
        assert_eq!(isr2, 1 << 1);

        assert_eq!(
            apic.eoi(),
            Some(EoiNotice {
                vector: 0x41,
                level_triggered: true
            })
        );
        let isr2 = apic.mmio_read(REG_ISR_BASE + 2 * BITMAP_STRIDE);
        assert_eq!(isr2, 0);
    }

    #[test]
    fn timer_fires_and_rearms_in_periodic_mode() {
        let (clock, mut apic) = apic();

        // Divide by 8: select encoding 0b010.
        apic.mmio_write(REG_TIMER_DIVIDE, 0b010);
        apic.mmio_write(REG_LVT_TIMER, 0x90 | LVT_TIMER_PERIODIC);
        apic.mmio_write(REG_TIMER_INITIAL, 1_000);

        // 1000 ticks at 125 MHz = 8µs.
        clock.advance_ns(7_999);
        apic.poll();
        assert_eq!(apic.acknowledge(), None);

        clock.advance_ns(8_001);
        apic.poll();
        assert_eq!(apic.acknowledge(), Some(0x90));
        apic.eoi();

        clock.advance_ns(8_000);
        apic.poll();
        assert_eq!(apic.acknowledge(), Some(0x90));
    }

    #[test]
    fn masked_lvt_swallows_timer_fires() {
        let (clock, mut apic) = apic();
        apic.mmio_write(REG_TIMER_DIVIDE, 0b1011); // divide by 1
        apic.mmio_write(REG_LVT_TIMER, 0x90 | LVT_MASKED);
        apic.mmio_write(REG_TIMER_INITIAL, 100);

        clock.advance_ns(1_000);
        apic.poll();
        assert_eq!(apic.acknowledge(), None);
    }

    #[test]
    fn one_shot_timer_stops_after_one_fire() {
        let (clock, mut apic) = apic();
        apic.mmio_write(REG_TIMER_DIVIDE, 0b1011);
        apic.mmio_write(REG_LVT_TIMER, 0x90); // one-shot, unmasked
        apic.mmio_write(REG_TIMER_INITIAL, 100);

        clock.advance_ns(100);
        apic.poll();
        assert_eq!(apic.acknowledge(), Some(0x90));
        apic.eoi();

        clock.advance_ns(10_000);
        apic.poll();
        assert_eq!(apic.acknowledge(), None);
        assert_eq!(apic.mmio_read(REG_TIMER_CURRENT), 0);
    }

    #[test]
    fn snapshot_round_trips_service_state() {
        let (clock, mut apic) = apic();
        apic.inject(0x44, TriggerMode::Level);
        apic.inject(0x55, TriggerMode::Edge);
        assert_eq!(apic.acknowledge(), Some(0x55));
        apic.mmio_write(REG_TPR, 0x20);

        let bytes = apic.save_state();
        let mut restored = LocalApic::new_default(9, clock);
        restored.load_state(&bytes).unwrap();

        assert_eq!(restored.id(), 0);
        assert_eq!(restored.mmio_read(REG_TPR), 0x20);
        assert_eq!(restored.arbiter().active_stack(), &[0x55]);
        assert!(restored.software_enabled());
        // Pending 0x44 survives but cannot preempt in-service 0x55.
        assert!(!restored.irq_asserted());
        assert_eq!(
            restored.eoi(),
            Some(EoiNotice {
                vector: 0x55,
                level_triggered: false
            })
        );
        assert_eq!(restored.acknowledge(), Some(0x44));
    }
}
