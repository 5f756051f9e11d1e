use strato_io_snapshot::{IoSnapshot, SnapshotResult};
use strato_interrupts::ioapic::Delivery;
use strato_interrupts::{IoApic, LocalApic};
use strato_timers::Clock;

/// The I/O redirection controller feeding one local controller, wired the
/// way the machine wires them: external lines enter as GSIs, deliveries are
/// routed to the local controller by destination id, and level-triggered
/// EOIs flow back for the remote-IRR handshake.
#[derive(Debug)]
pub struct ApicPair<C: Clock> {
    lapic: LocalApic<C>,
    ioapic: IoApic,
}

impl<C: Clock> ApicPair<C> {
    pub fn new(lapic: LocalApic<C>, ioapic: IoApic) -> Self {
        Self { lapic, ioapic }
    }

    pub fn lapic(&self) -> &LocalApic<C> {
        &self.lapic
    }

    pub fn lapic_mut(&mut self) -> &mut LocalApic<C> {
        &mut self.lapic
    }

    pub fn ioapic(&self) -> &IoApic {
        &self.ioapic
    }

    pub fn ioapic_mut(&mut self) -> &mut IoApic {
        &mut self.ioapic
    }

    pub fn raise_gsi(&mut self, gsi: u32) {
        let deliveries = self.ioapic.set_line(gsi, true);
        self.route(deliveries);
    }

    pub fn lower_gsi(&mut self, gsi: u32) {
        let deliveries = self.ioapic.set_line(gsi, false);
        self.route(deliveries);
    }

    pub fn pulse_gsi(&mut self, gsi: u32) {
        self.raise_gsi(gsi);
        self.lower_gsi(gsi);
    }

    /// Best deliverable vector, without claiming it.
    pub fn pending_vector(&self) -> Option<u8> {
        self.lapic.pending_vector()
    }

    pub fn acknowledge(&mut self) -> Option<u8> {
        self.lapic.acknowledge()
    }

    /// Retires the innermost in-service vector and completes the level
    /// handshake with the I/O controller, which may re-deliver immediately.
    pub fn eoi(&mut self) -> Option<u8> {
        let notice = self.lapic.eoi()?;
        if notice.level_triggered {
            let deliveries = self.ioapic.eoi(notice.vector);
            self.route(deliveries);
        }
        Some(notice.vector)
    }

    pub fn irq_asserted(&self) -> bool {
        self.lapic.irq_asserted()
    }

    pub fn pending_interrupt_present(&self) -> bool {
        self.lapic.pending_interrupt_present()
    }

    /// Drives the local timer.
    pub fn poll(&mut self) {
        self.lapic.poll();
    }

    pub fn lapic_mmio_read(&mut self, offset: u64) -> u32 {
        self.lapic.mmio_read(offset)
    }

    pub fn lapic_mmio_write(&mut self, offset: u64, value: u32) {
        self.lapic.mmio_write(offset, value);
    }

    pub fn ioapic_mmio_read(&self, offset: u64) -> u32 {
        self.ioapic.mmio_read(offset)
    }

    pub fn ioapic_mmio_write(&mut self, offset: u64, value: u32) {
        let deliveries = self.ioapic.mmio_write(offset, value);
        self.route(deliveries);
    }

    pub fn save_state(&self) -> (Vec<u8>, Vec<u8>) {
        (self.lapic.save_state(), self.ioapic.save_state())
    }

    pub fn load_state(&mut self, lapic: &[u8], ioapic: &[u8]) -> SnapshotResult<()> {
        self.lapic.load_state(lapic)?;
        self.ioapic.load_state(ioapic)?;
        Ok(())
    }

    fn route(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            if delivery.dest != self.lapic.id() {
                tracing::debug!(
                    "dropping vector {:#04x} for absent destination {}",
                    delivery.vector,
                    delivery.dest
                );
                continue;
            }
            self.lapic.inject(delivery.vector, delivery.trigger);
        }
    }
}
