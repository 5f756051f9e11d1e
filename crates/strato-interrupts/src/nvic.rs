//! Nested-vector interrupt controller with group-priority preemption and an
//! integrated tick timer.
//!
//! The register window is word-granular; byte/halfword lane handling is done
//! by the platform MMIO adapter. Undefined offsets read as zero and ignore
//! writes with a warning, since guests routinely probe the register file.

use strato_io_snapshot::codec::{Decoder, Encoder};
use strato_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use strato_timers::{Clock, CountdownTimer};

use crate::arbiter::{Arbiter, GroupPriority, NestingError};
use crate::line::{LineFlags, LineId};

/// Internal exception lines; enabled out of reset and not reachable through
/// the set/clear-enable banks.
pub const INTERNAL_LINES: usize = 16;
/// External interrupt inputs behind the enable/pending banks.
pub const EXTERNAL_LINES: usize = 256;
pub const LINE_COUNT: usize = INTERNAL_LINES + EXTERNAL_LINES;

pub const NMI: LineId = 2;
pub const PENDSV: LineId = 14;
pub const SYSTICK: LineId = 15;

pub const REG_SYST_CSR: u64 = 0x010;
pub const REG_SYST_RVR: u64 = 0x014;
pub const REG_SYST_CVR: u64 = 0x018;
pub const REG_SYST_CALIB: u64 = 0x01C;

// One bit per external line, eight 32-bit words per bank.
const BANK_BYTES: u64 = (EXTERNAL_LINES / 32 * 4) as u64;
pub const REG_ISER_BASE: u64 = 0x100;
pub const REG_ICER_BASE: u64 = 0x180;
pub const REG_ISPR_BASE: u64 = 0x200;
pub const REG_ICPR_BASE: u64 = 0x280;
pub const REG_IABR_BASE: u64 = 0x300;

// One priority byte per external line, four per word.
pub const REG_IPR_BASE: u64 = 0x400;
pub const REG_IPR_END: u64 = REG_IPR_BASE + EXTERNAL_LINES as u64;

pub const REG_CPUID: u64 = 0xD00;
pub const REG_ICSR: u64 = 0xD04;
pub const REG_VTOR: u64 = 0xD08;
pub const REG_AIRCR: u64 = 0xD0C;
pub const REG_SCR: u64 = 0xD10;
pub const REG_CCR: u64 = 0xD14;
// Priority bytes for internal lines 4..16.
pub const REG_SHPR_BASE: u64 = 0xD18;
pub const REG_SHPR_END: u64 = 0xD24;
pub const REG_STIR: u64 = 0xF00;

pub const SYST_CSR_ENABLE: u32 = 1 << 0;
pub const SYST_CSR_TICKINT: u32 = 1 << 1;
pub const SYST_CSR_CLKSOURCE: u32 = 1 << 2;
pub const SYST_CSR_COUNTFLAG: u32 = 1 << 16;
pub const SYST_RVR_MASK: u32 = 0x00FF_FFFF;

pub const ICSR_VECTPENDING_SHIFT: u32 = 12;
pub const ICSR_ISRPENDING: u32 = 1 << 22;
pub const ICSR_PENDSTCLR: u32 = 1 << 25;
pub const ICSR_PENDSTSET: u32 = 1 << 26;
pub const ICSR_PENDSVCLR: u32 = 1 << 27;
pub const ICSR_PENDSVSET: u32 = 1 << 28;
pub const ICSR_NMIPENDSET: u32 = 1 << 31;

pub const AIRCR_VECTKEY: u32 = 0x05FA;
pub const AIRCR_VECTKEYSTAT: u32 = 0xFA05;
pub const AIRCR_PRIGROUP_SHIFT: u32 = 8;
pub const AIRCR_PRIGROUP_MASK: u32 = 0x7;
pub const AIRCR_SYSRESETREQ: u32 = 1 << 2;

const CPUID_VALUE: u32 = 0x410F_C241;
const CCR_RESET: u32 = 0x0000_0200;
const SCR_WRITABLE: u32 = 0b1_0110;
const VTOR_ALIGN_MASK: u32 = 0xFFFF_FF80;

/// Coarse view of the guest physical address map, used to validate
/// guest-programmed table addresses before accepting them.
pub trait MemoryMap {
    fn is_mapped(&self, addr: u64) -> bool;
}

/// Accepts every address; for hosts without a populated map.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullyMapped;

impl MemoryMap for FullyMapped {
    fn is_mapped(&self, _addr: u64) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct NvicConfig {
    /// Input frequency of the tick timer, in Hz.
    pub systick_hz: u64,
}

impl Default for NvicConfig {
    fn default() -> Self {
        Self {
            systick_hz: 10_000_000,
        }
    }
}

#[derive(Debug, Clone)]
struct SysTick<C: Clock> {
    timer: CountdownTimer<C>,
    tick_interrupt: bool,
    clk_source: bool,
    count_flag: bool,
}

impl<C: Clock> SysTick<C> {
    fn new(clock: C, hz: u64) -> Self {
        let mut timer = CountdownTimer::new(clock, hz);
        timer.set_periodic(true);
        Self {
            timer,
            tick_interrupt: false,
            clk_source: false,
            count_flag: false,
        }
    }

    fn csr(&self) -> u32 {
        let mut value = 0;
        if self.timer.is_enabled() {
            value |= SYST_CSR_ENABLE;
        }
        if self.tick_interrupt {
            value |= SYST_CSR_TICKINT;
        }
        if self.clk_source {
            value |= SYST_CSR_CLKSOURCE;
        }
        if self.count_flag {
            value |= SYST_CSR_COUNTFLAG;
        }
        value
    }
}

#[derive(Debug)]
pub struct Nvic<C: Clock> {
    arbiter: Arbiter<GroupPriority>,
    systick: SysTick<C>,
    vtor: u32,
    scr: u32,
    ccr: u32,
}

impl<C: Clock> Nvic<C> {
    pub fn new(clock: C, config: NvicConfig) -> Self {
        let mut nvic = Self {
            arbiter: Arbiter::new(LINE_COUNT, GroupPriority::default()),
            systick: SysTick::new(clock, config.systick_hz),
            vtor: 0,
            scr: 0,
            ccr: CCR_RESET,
        };
        nvic.enable_internal_lines();
        nvic
    }

    pub fn new_default(clock: C) -> Self {
        Self::new(clock, NvicConfig::default())
    }

    fn enable_internal_lines(&mut self) {
        for line in 0..INTERNAL_LINES as LineId {
            self.arbiter.set_enabled(line, true);
        }
    }

    /// Reinitializes to the power-on state without reallocating the table.
    pub fn reset(&mut self) {
        self.arbiter.reset();
        self.arbiter.policy_mut().group_split = 0;
        self.enable_internal_lines();
        self.systick.tick_interrupt = false;
        self.systick.clk_source = false;
        self.systick.count_flag = false;
        self.systick.timer.set_enabled(false);
        self.systick.timer.set_reload(0);
        self.systick.timer.set_value(0);
        self.vtor = 0;
        self.scr = 0;
        self.ccr = CCR_RESET;
    }

    pub fn arbiter(&self) -> &Arbiter<GroupPriority> {
        &self.arbiter
    }

    /// Drives the tick timer; call periodically (or from a timer thread).
    /// Each underflow sets COUNTFLAG and, with TICKINT, pends line 15.
    pub fn poll(&mut self) {
        let fired = self.systick.timer.poll();
        if fired > 0 {
            self.systick.count_flag = true;
            if self.systick.tick_interrupt {
                self.arbiter.set_pending(SYSTICK);
            }
        }
    }

    // ---- CPU-facing port -------------------------------------------------

    pub fn set_pending_irq(&mut self, line: LineId) {
        if line as usize >= LINE_COUNT {
            tracing::warn!("nvic: pend request for line {line} out of range, ignored");
            return;
        }
        self.arbiter.set_pending(line);
    }

    /// Level input from an external peripheral. Input `number` maps to line
    /// `number + 16`; out-of-range inputs are dropped.
    pub fn on_gpio(&mut self, number: usize, asserted: bool) {
        if number >= EXTERNAL_LINES {
            tracing::warn!("nvic: external input {number} out of range, ignored");
            return;
        }
        self.arbiter
            .set_running((number + INTERNAL_LINES) as LineId, asserted);
    }

    /// Claims the best deliverable line, or `None` for a spurious attempt.
    pub fn acknowledge_irq(&mut self) -> Option<LineId> {
        self.arbiter.acknowledge()
    }

    /// Retires the innermost active line. A nesting violation is fatal to
    /// the emulated session and is handed back to the caller undisturbed.
    pub fn complete_irq(&mut self, line: LineId) -> Result<(), NestingError> {
        self.arbiter.complete(line)
    }

    pub fn priority_floor(&self) -> u8 {
        self.arbiter.priority_floor()
    }

    pub fn write_priority_floor(&mut self, floor: u8) {
        self.arbiter.set_priority_floor(floor);
    }

    pub fn global_mask(&self) -> bool {
        self.arbiter.global_mask()
    }

    pub fn write_global_mask(&mut self, masked: bool) {
        self.arbiter.set_global_mask(masked);
    }

    pub fn irq_asserted(&self) -> bool {
        self.arbiter.irq_asserted()
    }

    /// True when an eligible interrupt exists, ignoring the global mask;
    /// backs the CPU wait-for-interrupt primitive.
    pub fn pending_interrupt_present(&self) -> bool {
        self.arbiter.pending_interrupt_present()
    }

    /// Vector table base; owned by the CPU core but programmed through this
    /// register window.
    pub fn vector_table_base(&self) -> u32 {
        self.vtor
    }

    // ---- Register window -------------------------------------------------

    pub fn mmio_read(&mut self, offset: u64) -> u32 {
        let offset = offset & !3;
        match offset {
            REG_SYST_CSR => {
                self.poll();
                let value = self.systick.csr();
                // COUNTFLAG clears on read.
                self.systick.count_flag = false;
                value
            }
            REG_SYST_RVR => self.systick.timer.reload() as u32,
            REG_SYST_CVR => {
                self.poll();
                self.systick.timer.value() as u32
            }
            REG_SYST_CALIB => (self.systick.timer.hz() / 100) as u32 & SYST_RVR_MASK,
            o if (REG_ISER_BASE..REG_ISER_BASE + BANK_BYTES).contains(&o) => {
                self.bank_word(LineFlags::ENABLED, o - REG_ISER_BASE)
            }
            o if (REG_ICER_BASE..REG_ICER_BASE + BANK_BYTES).contains(&o) => {
                self.bank_word(LineFlags::ENABLED, o - REG_ICER_BASE)
            }
            o if (REG_ISPR_BASE..REG_ISPR_BASE + BANK_BYTES).contains(&o) => {
                self.bank_word(LineFlags::PENDING, o - REG_ISPR_BASE)
            }
            o if (REG_ICPR_BASE..REG_ICPR_BASE + BANK_BYTES).contains(&o) => {
                self.bank_word(LineFlags::PENDING, o - REG_ICPR_BASE)
            }
            o if (REG_IABR_BASE..REG_IABR_BASE + BANK_BYTES).contains(&o) => {
                self.bank_word(LineFlags::ACTIVE, o - REG_IABR_BASE)
            }
            o if (REG_IPR_BASE..REG_IPR_END).contains(&o) => {
                self.priority_word(INTERNAL_LINES as u64 + (o - REG_IPR_BASE))
            }
            o if (REG_SHPR_BASE..REG_SHPR_END).contains(&o) => {
                self.priority_word(4 + (o - REG_SHPR_BASE))
            }
            REG_CPUID => CPUID_VALUE,
            REG_ICSR => self.icsr(),
            REG_VTOR => self.vtor,
            REG_AIRCR => {
                (AIRCR_VECTKEYSTAT << 16)
                    | ((self.arbiter.policy().group_split as u32) << AIRCR_PRIGROUP_SHIFT)
            }
            REG_SCR => self.scr,
            REG_CCR => self.ccr,
            _ => {
                tracing::warn!("nvic: unhandled register read at {offset:#05x}");
                0
            }
        }
    }

    pub fn mmio_write(&mut self, offset: u64, value: u32, mem: &dyn MemoryMap) {
        let offset = offset & !3;
        match offset {
            REG_SYST_CSR => self.write_syst_csr(value),
            REG_SYST_RVR => {
                self.systick.timer.set_reload((value & SYST_RVR_MASK) as u64);
            }
            REG_SYST_CVR => {
                // Any write clears the counter and COUNTFLAG; the current
                // period restarts from the reload value.
                self.systick.count_flag = false;
                let reload = self.systick.timer.reload();
                self.systick.timer.set_value(reload);
            }
            o if (REG_ISER_BASE..REG_ISER_BASE + BANK_BYTES).contains(&o) => {
                self.for_set_bits(o - REG_ISER_BASE, value, |nvic, line| {
                    nvic.arbiter.set_enabled(line, true);
                });
            }
            o if (REG_ICER_BASE..REG_ICER_BASE + BANK_BYTES).contains(&o) => {
                self.for_set_bits(o - REG_ICER_BASE, value, |nvic, line| {
                    nvic.arbiter.set_enabled(line, false);
                });
            }
            o if (REG_ISPR_BASE..REG_ISPR_BASE + BANK_BYTES).contains(&o) => {
                self.for_set_bits(o - REG_ISPR_BASE, value, |nvic, line| {
                    nvic.arbiter.set_pending(line);
                });
            }
            o if (REG_ICPR_BASE..REG_ICPR_BASE + BANK_BYTES).contains(&o) => {
                self.for_set_bits(o - REG_ICPR_BASE, value, |nvic, line| {
                    nvic.arbiter.clear_pending(line);
                });
            }
            o if (REG_IPR_BASE..REG_IPR_END).contains(&o) => {
                self.write_priority_word(INTERNAL_LINES as u64 + (o - REG_IPR_BASE), value);
            }
            o if (REG_SHPR_BASE..REG_SHPR_END).contains(&o) => {
                self.write_priority_word(4 + (o - REG_SHPR_BASE), value);
            }
            REG_ICSR => self.write_icsr(value),
            REG_VTOR => {
                let target = value & VTOR_ALIGN_MASK;
                if mem.is_mapped(target as u64) {
                    self.vtor = target;
                } else {
                    tracing::warn!(
                        "nvic: vector table base {target:#010x} is outside the memory map, ignored"
                    );
                }
            }
            REG_AIRCR => self.write_aircr(value),
            REG_SCR => self.scr = value & SCR_WRITABLE,
            REG_CCR => self.ccr = value,
            REG_STIR => {
                let number = (value & 0x1FF) as usize;
                if number < EXTERNAL_LINES {
                    self.arbiter
                        .set_pending((number + INTERNAL_LINES) as LineId);
                } else {
                    tracing::warn!("nvic: software trigger for input {number} out of range");
                }
            }
            _ => {
                tracing::warn!("nvic: unhandled register write at {offset:#05x} = {value:#010x}");
            }
        }
    }

    fn write_syst_csr(&mut self, value: u32) {
        self.systick.tick_interrupt = value & SYST_CSR_TICKINT != 0;
        self.systick.clk_source = value & SYST_CSR_CLKSOURCE != 0;
        let enable = value & SYST_CSR_ENABLE != 0;
        let was_enabled = self.systick.timer.is_enabled();
        self.systick.timer.set_enabled(enable);
        if enable && !was_enabled && self.systick.timer.value() == 0 {
            let reload = self.systick.timer.reload();
            self.systick.timer.set_value(reload);
        }
    }

    fn icsr(&self) -> u32 {
        let mut value = self.arbiter.active_top().unwrap_or(0) as u32;
        if let Some(pending) = self.arbiter.best_candidate() {
            value |= (pending as u32) << ICSR_VECTPENDING_SHIFT;
        }
        let table = self.arbiter.table();
        for line in INTERNAL_LINES..LINE_COUNT {
            if table.has(line as LineId, LineFlags::PENDING) {
                value |= ICSR_ISRPENDING;
                break;
            }
        }
        if table.has(SYSTICK, LineFlags::PENDING) {
            value |= ICSR_PENDSTSET;
        }
        if table.has(PENDSV, LineFlags::PENDING) {
            value |= ICSR_PENDSVSET;
        }
        value
    }

    fn write_icsr(&mut self, value: u32) {
        if value & ICSR_NMIPENDSET != 0 {
            self.arbiter.set_pending(NMI);
        }
        if value & ICSR_PENDSVSET != 0 {
            self.arbiter.set_pending(PENDSV);
        }
        if value & ICSR_PENDSVCLR != 0 {
            self.arbiter.clear_pending(PENDSV);
        }
        if value & ICSR_PENDSTSET != 0 {
            self.arbiter.set_pending(SYSTICK);
        }
        if value & ICSR_PENDSTCLR != 0 {
            self.arbiter.clear_pending(SYSTICK);
        }
    }

    fn write_aircr(&mut self, value: u32) {
        if value >> 16 != AIRCR_VECTKEY {
            tracing::debug!(
                "nvic: AIRCR write with bad key {:#06x}, rejected",
                value >> 16
            );
            return;
        }
        if value & AIRCR_SYSRESETREQ != 0 {
            tracing::info!("nvic: system reset requested");
        }
        self.arbiter.policy_mut().group_split =
            ((value >> AIRCR_PRIGROUP_SHIFT) & AIRCR_PRIGROUP_MASK) as u8;
        self.arbiter.reevaluate();
    }

    fn bank_word(&self, flag: LineFlags, byte_offset: u64) -> u32 {
        let first = INTERNAL_LINES + (byte_offset / 4) as usize * 32;
        self.arbiter.table().bitmap_word(flag, first)
    }

    fn for_set_bits(&mut self, byte_offset: u64, value: u32, mut apply: impl FnMut(&mut Self, LineId)) {
        let first = INTERNAL_LINES + (byte_offset / 4) as usize * 32;
        for bit in 0..32 {
            if value & (1 << bit) == 0 {
                continue;
            }
            let line = first + bit;
            if line < LINE_COUNT {
                apply(self, line as LineId);
            }
        }
    }

    fn priority_word(&self, first_line: u64) -> u32 {
        let table = self.arbiter.table();
        let mut word = 0u32;
        for lane in 0..4 {
            let line = first_line + lane;
            if (line as usize) < LINE_COUNT {
                word |= (table.priority(line as LineId) as u32) << (lane * 8);
            }
        }
        word
    }

    fn write_priority_word(&mut self, first_line: u64, value: u32) {
        for lane in 0..4 {
            let line = first_line + lane;
            if (line as usize) < LINE_COUNT {
                self.arbiter
                    .set_priority(line as LineId, (value >> (lane * 8)) as u8);
            }
        }
    }
}

impl<C: Clock> IoSnapshot for Nvic<C> {
    const DEVICE_ID: [u8; 4] = *b"NVIC";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_ENABLED: u16 = 1;
        const TAG_PENDING: u16 = 2;
        const TAG_RUNNING: u16 = 3;
        const TAG_PRIORITIES: u16 = 4;
        const TAG_ACTIVE_STACK: u16 = 5;
        const TAG_GLOBAL_MASK: u16 = 6;
        const TAG_PRIORITY_FLOOR: u16 = 7;
        const TAG_GROUP_SPLIT: u16 = 8;
        const TAG_VTOR: u16 = 9;
        const TAG_SCR: u16 = 10;
        const TAG_CCR: u16 = 11;
        const TAG_SYSTICK: u16 = 12;

        let table = self.arbiter.table();
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_ENABLED, table.flag_bits(LineFlags::ENABLED));
        w.field_bytes(TAG_PENDING, table.flag_bits(LineFlags::PENDING));
        w.field_bytes(TAG_RUNNING, table.flag_bits(LineFlags::RUNNING));
        w.field_bytes(TAG_PRIORITIES, table.priorities().to_vec());

        let mut stack = Encoder::new().u32(self.arbiter.active_depth() as u32);
        for &line in self.arbiter.active_stack() {
            stack = stack.u16(line);
        }
        w.field_bytes(TAG_ACTIVE_STACK, stack.finish());

        w.field_bool(TAG_GLOBAL_MASK, self.arbiter.global_mask());
        w.field_u8(TAG_PRIORITY_FLOOR, self.arbiter.priority_floor());
        w.field_u8(TAG_GROUP_SPLIT, self.arbiter.policy().group_split);
        w.field_u32(TAG_VTOR, self.vtor);
        w.field_u32(TAG_SCR, self.scr);
        w.field_u32(TAG_CCR, self.ccr);

        let systick = Encoder::new()
            .bool(self.systick.timer.is_enabled())
            .bool(self.systick.tick_interrupt)
            .bool(self.systick.clk_source)
            .bool(self.systick.count_flag)
            .u64(self.systick.timer.reload())
            .u64(self.systick.timer.value_unsynced())
            .finish();
        w.field_bytes(TAG_SYSTICK, systick);

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_ENABLED: u16 = 1;
        const TAG_PENDING: u16 = 2;
        const TAG_RUNNING: u16 = 3;
        const TAG_PRIORITIES: u16 = 4;
        const TAG_ACTIVE_STACK: u16 = 5;
        const TAG_GLOBAL_MASK: u16 = 6;
        const TAG_PRIORITY_FLOOR: u16 = 7;
        const TAG_GROUP_SPLIT: u16 = 8;
        const TAG_VTOR: u16 = 9;
        const TAG_SCR: u16 = 10;
        const TAG_CCR: u16 = 11;
        const TAG_SYSTICK: u16 = 12;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        self.reset();

        let table = self.arbiter.table_mut();
        if let Some(bits) = r.bytes(TAG_ENABLED) {
            table.load_flag_bits(LineFlags::ENABLED, bits);
        }
        if let Some(bits) = r.bytes(TAG_PENDING) {
            table.load_flag_bits(LineFlags::PENDING, bits);
        }
        if let Some(bits) = r.bytes(TAG_RUNNING) {
            table.load_flag_bits(LineFlags::RUNNING, bits);
        }
        if let Some(priorities) = r.bytes(TAG_PRIORITIES) {
            table.load_priorities(priorities);
        }

        if let Some(buf) = r.bytes(TAG_ACTIVE_STACK) {
            let mut d = Decoder::new(buf);
            let depth = d.u32()? as usize;
            for _ in 0..depth {
                let line = d.u16()?;
                if (line as usize) < LINE_COUNT {
                    self.arbiter.restore_active(line);
                }
            }
            d.finish()?;
        }

        if let Some(mask) = r.bool(TAG_GLOBAL_MASK)? {
            self.arbiter.set_global_mask(mask);
        }
        if let Some(floor) = r.u8(TAG_PRIORITY_FLOOR)? {
            self.arbiter.set_priority_floor(floor);
        }
        if let Some(split) = r.u8(TAG_GROUP_SPLIT)? {
            self.arbiter.policy_mut().group_split = split;
        }
        if let Some(vtor) = r.u32(TAG_VTOR)? {
            self.vtor = vtor;
        }
        if let Some(scr) = r.u32(TAG_SCR)? {
            self.scr = scr;
        }
        if let Some(ccr) = r.u32(TAG_CCR)? {
            self.ccr = ccr;
        }

        if let Some(buf) = r.bytes(TAG_SYSTICK) {
            let mut d = Decoder::new(buf);
            let enabled = d.bool()?;
            self.systick.tick_interrupt = d.bool()?;
            self.systick.clk_source = d.bool()?;
            self.systick.count_flag = d.bool()?;
            let reload = d.u64()?;
            let value = d.u64()?;
            d.finish()?;
            self.systick.timer.set_reload(reload);
            self.systick.timer.set_value(value);
            self.systick.timer.set_enabled(enabled);
        }

        self.arbiter.reevaluate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_timers::ManualClock;

    fn nvic() -> (ManualClock, Nvic<ManualClock>) {
        let clock = ManualClock::new();
        let nvic = Nvic::new_default(clock.clone());
        (clock, nvic)
    }

    struct SramOnly;

    impl MemoryMap for SramOnly {
        fn is_mapped(&self, addr: u64) -> bool {
            (0x2000_0000..0x2010_0000).contains(&addr)
        }
    }

    #[test]
    fn reset_enables_only_internal_lines() {
        let (_, nvic) = nvic();
        let table = nvic.arbiter().table();
        for line in 0..INTERNAL_LINES as LineId {
            assert!(table.has(line, LineFlags::ENABLED));
        }
        for line in INTERNAL_LINES as LineId..LINE_COUNT as LineId {
            assert!(!table.has(line, LineFlags::ENABLED));
        }
    }

    #[test]
    fn enable_banks_set_and_clear_external_lines() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;

        // Enable external inputs 1 and 33 (lines 17 and 49).
        nvic.mmio_write(REG_ISER_BASE, 1 << 1, &mem);
        nvic.mmio_write(REG_ISER_BASE + 4, 1 << 1, &mem);
        assert_eq!(nvic.mmio_read(REG_ISER_BASE), 1 << 1);
        assert_eq!(nvic.mmio_read(REG_ICER_BASE + 4), 1 << 1);

        nvic.mmio_write(REG_ICER_BASE, 1 << 1, &mem);
        assert_eq!(nvic.mmio_read(REG_ISER_BASE), 0);
        assert_eq!(nvic.mmio_read(REG_ISER_BASE + 4), 1 << 1);
    }

    #[test]
    fn pend_banks_drive_delivery() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_ISER_BASE, 1 << 4, &mem);
        nvic.mmio_write(REG_ISPR_BASE, 1 << 4, &mem);
        assert!(nvic.irq_asserted());
        assert_eq!(nvic.mmio_read(REG_ISPR_BASE), 1 << 4);

        nvic.mmio_write(REG_ICPR_BASE, 1 << 4, &mem);
        assert!(!nvic.irq_asserted());
        assert_eq!(nvic.acknowledge_irq(), None);
    }

    #[test]
    fn priority_bytes_pack_four_per_word() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_IPR_BASE, 0x4030_2010, &mem);
        let table = nvic.arbiter().table();
        assert_eq!(table.priority(16), 0x10);
        assert_eq!(table.priority(17), 0x20);
        assert_eq!(table.priority(18), 0x30);
        assert_eq!(table.priority(19), 0x40);
        assert_eq!(nvic.mmio_read(REG_IPR_BASE), 0x4030_2010);
    }

    #[test]
    fn system_handler_priorities_map_to_internal_lines() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;

        // SHPR3 covers lines 12..16; byte lanes 2 and 3 are PendSV/SysTick.
        nvic.mmio_write(REG_SHPR_BASE + 8, 0x80C0_0000, &mem);
        let table = nvic.arbiter().table();
        assert_eq!(table.priority(PENDSV), 0xC0);
        assert_eq!(table.priority(SYSTICK), 0x80);
    }

    #[test]
    fn gpio_input_maps_to_external_line() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;
        nvic.mmio_write(REG_ISER_BASE, 1 << 3, &mem);

        nvic.on_gpio(3, true);
        assert!(nvic.irq_asserted());
        assert_eq!(nvic.acknowledge_irq(), Some(19));

        // Out-of-range inputs are dropped without touching state.
        nvic.on_gpio(EXTERNAL_LINES, true);
        assert_eq!(nvic.arbiter().active_depth(), 1);
    }

    #[test]
    fn software_trigger_pends_external_line() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;
        nvic.mmio_write(REG_ISER_BASE, 1 << 7, &mem);
        nvic.mmio_write(REG_STIR, 7, &mem);
        assert_eq!(nvic.acknowledge_irq(), Some(23));
    }

    #[test]
    fn icsr_reports_active_and_pending_vectors() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_ISER_BASE, 0b11 << 2, &mem);
        nvic.mmio_write(REG_IPR_BASE, 0x40 << 16, &mem); // line 18 -> 0x40
        nvic.set_pending_irq(18);
        nvic.set_pending_irq(19);

        let icsr = nvic.mmio_read(REG_ICSR);
        assert_eq!(icsr & 0x1FF, 0);
        assert_eq!((icsr >> ICSR_VECTPENDING_SHIFT) & 0x1FF, 19);
        assert_ne!(icsr & ICSR_ISRPENDING, 0);

        assert_eq!(nvic.acknowledge_irq(), Some(19));
        let icsr = nvic.mmio_read(REG_ICSR);
        assert_eq!(icsr & 0x1FF, 19);
    }

    #[test]
    fn icsr_write_bits_pend_and_unpend_system_lines() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_ICSR, ICSR_PENDSTSET | ICSR_PENDSVSET, &mem);
        let table = nvic.arbiter().table();
        assert!(table.has(SYSTICK, LineFlags::PENDING));
        assert!(table.has(PENDSV, LineFlags::PENDING));

        nvic.mmio_write(REG_ICSR, ICSR_PENDSTCLR | ICSR_PENDSVCLR, &mem);
        let table = nvic.arbiter().table();
        assert!(!table.has(SYSTICK, LineFlags::PENDING));
        assert!(!table.has(PENDSV, LineFlags::PENDING));

        nvic.mmio_write(REG_ICSR, ICSR_NMIPENDSET, &mem);
        assert_eq!(nvic.acknowledge_irq(), Some(NMI));
    }

    #[test]
    fn aircr_requires_the_key() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_AIRCR, 0x1234_0000 | (5 << AIRCR_PRIGROUP_SHIFT), &mem);
        assert_eq!(nvic.arbiter().policy().group_split, 0);

        nvic.mmio_write(
            REG_AIRCR,
            (AIRCR_VECTKEY << 16) | (5 << AIRCR_PRIGROUP_SHIFT),
            &mem,
        );
        assert_eq!(nvic.arbiter().policy().group_split, 5);
        let aircr = nvic.mmio_read(REG_AIRCR);
        assert_eq!(aircr >> 16, AIRCR_VECTKEYSTAT);
        assert_eq!((aircr >> AIRCR_PRIGROUP_SHIFT) & 0x7, 5);
    }

    #[test]
    fn vtor_writes_are_validated_against_the_map() {
        let (_, mut nvic) = nvic();

        nvic.mmio_write(REG_VTOR, 0x2000_0100, &SramOnly);
        assert_eq!(nvic.vector_table_base(), 0x2000_0100);

        // Unmapped target: logged and ignored.
        nvic.mmio_write(REG_VTOR, 0x6000_0000, &SramOnly);
        assert_eq!(nvic.vector_table_base(), 0x2000_0100);

        // Low bits are reserved and read back as zero.
        nvic.mmio_write(REG_VTOR, 0x2000_007F, &SramOnly);
        assert_eq!(nvic.vector_table_base(), 0x2000_0000);
    }

    #[test]
    fn systick_underflow_pends_line_15() {
        let (clock, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_SYST_RVR, 100, &mem);
        nvic.mmio_write(REG_SYST_CSR, SYST_CSR_ENABLE | SYST_CSR_TICKINT, &mem);

        // 100 ticks at 10 MHz = 10µs.
        clock.advance_ns(9_000);
        nvic.poll();
        assert!(!nvic.irq_asserted());

        clock.advance_ns(1_000);
        nvic.poll();
        assert!(nvic.irq_asserted());
        assert_eq!(nvic.acknowledge_irq(), Some(SYSTICK));

        let csr = nvic.mmio_read(REG_SYST_CSR);
        assert_ne!(csr & SYST_CSR_COUNTFLAG, 0);
        // COUNTFLAG is read-to-clear.
        assert_eq!(nvic.mmio_read(REG_SYST_CSR) & SYST_CSR_COUNTFLAG, 0);
    }

    #[test]
    fn systick_without_tickint_only_sets_countflag() {
        let (clock, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_SYST_RVR, 10, &mem);
        nvic.mmio_write(REG_SYST_CSR, SYST_CSR_ENABLE, &mem);
        clock.advance_ns(10_000);
        nvic.poll();

        assert!(!nvic.irq_asserted());
        assert_ne!(nvic.mmio_read(REG_SYST_CSR) & SYST_CSR_COUNTFLAG, 0);
    }

    #[test]
    fn current_value_write_restarts_the_period() {
        let (clock, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_SYST_RVR, 100, &mem);
        nvic.mmio_write(REG_SYST_CSR, SYST_CSR_ENABLE, &mem);
        clock.advance_ns(4_000); // 40 ticks
        assert_eq!(nvic.mmio_read(REG_SYST_CVR), 60);

        nvic.mmio_write(REG_SYST_CVR, 0xDEAD, &mem);
        assert_eq!(nvic.mmio_read(REG_SYST_CVR), 100);
        assert_eq!(nvic.mmio_read(REG_SYST_CSR) & SYST_CSR_COUNTFLAG, 0);
    }

    #[test]
    fn unknown_offsets_read_zero_and_ignore_writes() {
        let (_, mut nvic) = nvic();
        let mem = FullyMapped;
        assert_eq!(nvic.mmio_read(0xE00), 0);
        nvic.mmio_write(0xE00, 0xFFFF_FFFF, &mem);
        assert!(!nvic.irq_asserted());
    }

    #[test]
    fn snapshot_round_trips_nesting_and_timer_state() {
        let (clock, mut nvic) = nvic();
        let mem = FullyMapped;

        nvic.mmio_write(REG_ISER_BASE, 0b111 << 2, &mem);
        nvic.mmio_write(REG_IPR_BASE, 0x10 << 24, &mem); // line 19
        nvic.set_pending_irq(18);
        nvic.set_pending_irq(19);
        nvic.on_gpio(4, true); // line 20, level held
        assert_eq!(nvic.acknowledge_irq(), Some(18));
        nvic.write_priority_floor(0x40);
        nvic.mmio_write(REG_SYST_RVR, 55, &mem);
        nvic.mmio_write(REG_SYST_CSR, SYST_CSR_ENABLE | SYST_CSR_TICKINT, &mem);
        nvic.mmio_write(REG_VTOR, 0x2000_0000, &mem);

        let bytes = nvic.save_state();

        let mut restored = Nvic::new_default(clock);
        restored.load_state(&bytes).unwrap();

        assert_eq!(restored.arbiter().active_stack(), &[18]);
        assert_eq!(restored.priority_floor(), 0x40);
        assert_eq!(restored.vector_table_base(), 0x2000_0000);
        let table = restored.arbiter().table();
        assert!(table.has(19, LineFlags::PENDING));
        assert!(table.has(20, LineFlags::RUNNING));
        assert_eq!(table.priority(19), 0x10);
        assert_eq!(restored.mmio_read(REG_SYST_RVR), 55);

        // The signal is re-derived from the restored state, not stored.
        assert_eq!(restored.irq_asserted(), nvic.irq_asserted());
    }
}
