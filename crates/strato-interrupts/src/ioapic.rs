//! I/O interrupt redirection controller: external lines statically remapped
//! to vectors, no priorities and no nesting of its own.
//!
//! Guests program it through the indirect IOREGSEL/IOWIN window. Deliveries
//! are returned as plain values; the platform routes them to the local
//! controller, so the model never calls out while being mutated.

use strato_io_snapshot::codec::{Decoder, Encoder};
use strato_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};

pub const IOAPIC_LINE_COUNT: usize = 24;

pub const MMIO_IOREGSEL: u64 = 0x00;
pub const MMIO_IOWIN: u64 = 0x10;

pub const REG_ID: u8 = 0x00;
pub const REG_VERSION: u8 = 0x01;
pub const REG_ARBITRATION: u8 = 0x02;
pub const REG_REDIR_BASE: u8 = 0x10;

const ENTRY_VECTOR_MASK: u64 = 0xFF;
const ENTRY_DELIVERY_STATUS: u64 = 1 << 12;
const ENTRY_ACTIVE_LOW: u64 = 1 << 13;
const ENTRY_REMOTE_IRR: u64 = 1 << 14;
const ENTRY_LEVEL_TRIGGERED: u64 = 1 << 15;
const ENTRY_MASKED: u64 = 1 << 16;
const ENTRY_DEST_SHIFT: u64 = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

/// One redirection table entry. `remote_irr` is hardware-owned and
/// read-only through the register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectionEntry {
    pub vector: u8,
    pub dest: u8,
    pub masked: bool,
    pub trigger: TriggerMode,
    pub active_low: bool,
    pub remote_irr: bool,
}

impl RedirectionEntry {
    /// Fixed delivery to one destination, masked until software opts in.
    pub fn fixed(vector: u8, dest: u8) -> Self {
        Self {
            vector,
            dest,
            masked: true,
            trigger: TriggerMode::Edge,
            active_low: false,
            remote_irr: false,
        }
    }

    fn from_bits(bits: u64) -> Self {
        Self {
            vector: (bits & ENTRY_VECTOR_MASK) as u8,
            dest: (bits >> ENTRY_DEST_SHIFT) as u8,
            masked: bits & ENTRY_MASKED != 0,
            trigger: if bits & ENTRY_LEVEL_TRIGGERED != 0 {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
            active_low: bits & ENTRY_ACTIVE_LOW != 0,
            remote_irr: bits & ENTRY_REMOTE_IRR != 0,
        }
    }

    fn to_bits(self) -> u64 {
        let mut bits = self.vector as u64;
        bits |= (self.dest as u64) << ENTRY_DEST_SHIFT;
        if self.masked {
            bits |= ENTRY_MASKED;
        }
        if self.trigger == TriggerMode::Level {
            bits |= ENTRY_LEVEL_TRIGGERED;
        }
        if self.active_low {
            bits |= ENTRY_ACTIVE_LOW;
        }
        if self.remote_irr {
            bits |= ENTRY_REMOTE_IRR;
        }
        bits
    }
}

/// One interrupt message on its way to a local controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub vector: u8,
    pub dest: u8,
    pub trigger: TriggerMode,
}

#[derive(Debug, Clone)]
pub struct IoApic {
    id: u8,
    regsel: u8,
    entries: Vec<RedirectionEntry>,
    asserted: Vec<bool>,
}

impl IoApic {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            regsel: 0,
            entries: (0..IOAPIC_LINE_COUNT)
                .map(|_| RedirectionEntry::fixed(0, 0))
                .collect(),
            asserted: vec![false; IOAPIC_LINE_COUNT],
        }
    }

    pub fn line_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, line: usize) -> Option<RedirectionEntry> {
        self.entries.get(line).copied()
    }

    pub fn is_asserted(&self, line: usize) -> bool {
        self.asserted.get(line).copied().unwrap_or(false)
    }

    /// Programs one redirection entry; unmasking a held level input can
    /// deliver immediately.
    pub fn set_entry(&mut self, line: usize, entry: RedirectionEntry) -> Vec<Delivery> {
        if line >= self.entries.len() {
            tracing::warn!("ioapic: redirection entry {line} out of range, ignored");
            return Vec::new();
        }
        // Remote-IRR is hardware-owned; keep the live value.
        let remote_irr = self.entries[line].remote_irr;
        self.entries[line] = RedirectionEntry {
            remote_irr,
            ..entry
        };
        self.evaluate_line(line)
    }

    /// External input edge/level change.
    pub fn set_line(&mut self, line: u32, asserted: bool) -> Vec<Delivery> {
        let Some(slot) = self.asserted.get_mut(line as usize) else {
            tracing::warn!("ioapic: input line {line} out of range, ignored");
            return Vec::new();
        };
        let was_asserted = *slot;
        *slot = asserted;

        let line = line as usize;
        let entry = self.entries[line];
        match entry.trigger {
            // Edge inputs deliver on the rising edge only.
            TriggerMode::Edge if asserted && !was_asserted && !entry.masked => {
                vec![self.delivery_for(line)]
            }
            TriggerMode::Level => self.evaluate_line(line),
            _ => Vec::new(),
        }
    }

    /// End-of-interrupt by vector: clears remote-IRR on every matching
    /// level entry and re-delivers lines still asserted.
    pub fn eoi(&mut self, vector: u8) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for line in 0..self.entries.len() {
            let entry = &mut self.entries[line];
            if entry.trigger != TriggerMode::Level
                || entry.vector != vector
                || !entry.remote_irr
            {
                continue;
            }
            entry.remote_irr = false;
            deliveries.extend(self.evaluate_line(line));
        }
        deliveries
    }

    fn evaluate_line(&mut self, line: usize) -> Vec<Delivery> {
        let entry = self.entries[line];
        if entry.trigger != TriggerMode::Level
            || entry.masked
            || entry.remote_irr
            || !self.asserted[line]
        {
            return Vec::new();
        }
        self.entries[line].remote_irr = true;
        vec![self.delivery_for(line)]
    }

    fn delivery_for(&self, line: usize) -> Delivery {
        let entry = self.entries[line];
        Delivery {
            vector: entry.vector,
            dest: entry.dest,
            trigger: entry.trigger,
        }
    }

    // ---- Indirect register window ---------------------------------------

    pub fn mmio_read(&self, offset: u64) -> u32 {
        match offset & !3 {
            MMIO_IOREGSEL => self.regsel as u32,
            MMIO_IOWIN => self.register_read(self.regsel),
            other => {
                tracing::warn!("ioapic: unhandled window read at {other:#04x}");
                0
            }
        }
    }

    pub fn mmio_write(&mut self, offset: u64, value: u32) -> Vec<Delivery> {
        match offset & !3 {
            MMIO_IOREGSEL => {
                self.regsel = value as u8;
                Vec::new()
            }
            MMIO_IOWIN => self.register_write(self.regsel, value),
            other => {
                tracing::warn!("ioapic: unhandled window write at {other:#04x} = {value:#010x}");
                Vec::new()
            }
        }
    }

    fn register_read(&self, reg: u8) -> u32 {
        match reg {
            REG_ID => (self.id as u32) << 24,
            REG_VERSION => 0x11 | (((self.entries.len() as u32) - 1) << 16),
            REG_ARBITRATION => (self.id as u32) << 24,
            reg if reg >= REG_REDIR_BASE => {
                let index = (reg - REG_REDIR_BASE) as usize;
                let (line, high) = (index / 2, index % 2 == 1);
                match self.entries.get(line) {
                    Some(entry) if high => (entry.to_bits() >> 32) as u32,
                    Some(entry) => entry.to_bits() as u32,
                    None => {
                        tracing::warn!("ioapic: redirection register {reg:#04x} out of range");
                        0
                    }
                }
            }
            _ => {
                tracing::warn!("ioapic: unhandled register read {reg:#04x}");
                0
            }
        }
    }

    fn register_write(&mut self, reg: u8, value: u32) -> Vec<Delivery> {
        match reg {
            REG_ID => {
                self.id = (value >> 24) as u8;
                Vec::new()
            }
            reg if reg >= REG_REDIR_BASE => {
                let index = (reg - REG_REDIR_BASE) as usize;
                let (line, high) = (index / 2, index % 2 == 1);
                let Some(entry) = self.entries.get(line) else {
                    tracing::warn!("ioapic: redirection register {reg:#04x} out of range");
                    return Vec::new();
                };
                let old = entry.to_bits();
                let bits = if high {
                    (old & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32)
                } else {
                    (old & 0xFFFF_FFFF_0000_0000) | value as u64
                };
                // Read-only bits are preserved from the live entry.
                let sanitized = (bits & !(ENTRY_REMOTE_IRR | ENTRY_DELIVERY_STATUS))
                    | (old & ENTRY_REMOTE_IRR);
                self.entries[line] = RedirectionEntry::from_bits(sanitized);
                self.evaluate_line(line)
            }
            _ => {
                tracing::warn!("ioapic: unhandled register write {reg:#04x} = {value:#010x}");
                Vec::new()
            }
        }
    }

    pub fn reset(&mut self) {
        self.regsel = 0;
        for entry in self.entries.iter_mut() {
            *entry = RedirectionEntry::fixed(0, 0);
        }
        self.asserted.fill(false);
    }
}

impl IoSnapshot for IoApic {
    const DEVICE_ID: [u8; 4] = *b"IOAP";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_ID: u16 = 1;
        const TAG_REGSEL: u16 = 2;
        const TAG_ENTRIES: u16 = 3;
        const TAG_ASSERTED: u16 = 4;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u8(TAG_ID, self.id);
        w.field_u8(TAG_REGSEL, self.regsel);

        let mut enc = Encoder::new().u32(self.entries.len() as u32);
        for entry in &self.entries {
            enc = enc.u64(entry.to_bits());
        }
        w.field_bytes(TAG_ENTRIES, enc.finish());

        let mut levels = Encoder::new().u32(self.asserted.len() as u32);
        for &asserted in &self.asserted {
            levels = levels.bool(asserted);
        }
        w.field_bytes(TAG_ASSERTED, levels.finish());

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_ID: u16 = 1;
        const TAG_REGSEL: u16 = 2;
        const TAG_ENTRIES: u16 = 3;
        const TAG_ASSERTED: u16 = 4;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        self.reset();

        if let Some(id) = r.u8(TAG_ID)? {
            self.id = id;
        }
        if let Some(regsel) = r.u8(TAG_REGSEL)? {
            self.regsel = regsel;
        }
        if let Some(buf) = r.bytes(TAG_ENTRIES) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            for line in 0..count {
                let bits = d.u64()?;
                if line < self.entries.len() {
                    self.entries[line] = RedirectionEntry::from_bits(bits);
                }
            }
            d.finish()?;
        }
        if let Some(buf) = r.bytes(TAG_ASSERTED) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            for line in 0..count {
                let asserted = d.bool()?;
                if line < self.asserted.len() {
                    self.asserted[line] = asserted;
                }
            }
            d.finish()?;
        }

        Ok(())
    }
}
