//! Checkpointing a machine mid-interrupt and resuming it elsewhere: the
//! nesting state, latched requests and timer programming must all survive,
//! and the published request line must be re-derived on load.

use std::sync::Arc;

use strato_interrupts::lapic::{self, LocalApic};
use strato_interrupts::nvic::{self, Nvic};
use strato_interrupts::{FullyMapped, IoApic, RedirectionEntry, TriggerMode};
use strato_platform::{ApicPair, SharedNvic};
use strato_timers::ManualClock;

#[test]
fn nvic_checkpoint_resumes_timer_and_nesting() {
    let clock = ManualClock::new();
    let nvic = SharedNvic::new(Nvic::new_default(clock.clone()), Arc::new(FullyMapped));

    nvic.mmio_write(nvic::REG_ISER_BASE, 0b11);
    nvic.mmio_write(nvic::REG_IPR_BASE, 0x10); // line 16 outranked by line 17
    nvic.set_pending_irq(16);
    assert_eq!(nvic.acknowledge_irq(), Some(16));
    nvic.mmio_write(nvic::REG_SYST_RVR, 500);
    nvic.mmio_write(
        nvic::REG_SYST_CSR,
        nvic::SYST_CSR_ENABLE | nvic::SYST_CSR_TICKINT,
    );

    let checkpoint = nvic.save_state();

    // Resume on a fresh controller sharing the same guest clock.
    let resumed = SharedNvic::new(Nvic::new_default(clock.clone()), Arc::new(FullyMapped));
    resumed.load_state(&checkpoint).unwrap();

    assert!(!resumed.irq_asserted());
    assert_eq!(resumed.mmio_read(nvic::REG_SYST_RVR), 500);

    // The handler claimed before the checkpoint is still the innermost one.
    resumed.set_pending_irq(17);
    assert_eq!(resumed.acknowledge_irq(), Some(17));
    resumed.complete_irq(17).unwrap();
    resumed.complete_irq(16).unwrap();

    // 500 ticks at 10 MHz = 50µs from the restored programming.
    clock.advance_ns(50_000);
    resumed.poll();
    assert_eq!(resumed.acknowledge_irq(), Some(nvic::SYSTICK));
}

#[test]
fn apic_pair_checkpoint_preserves_the_level_handshake() {
    let clock = ManualClock::new();
    let mut lapic = LocalApic::new_default(0, clock.clone());
    lapic.mmio_write(lapic::REG_SVR, lapic::SVR_SOFTWARE_ENABLE | 0xFF);
    let mut pair = ApicPair::new(lapic, IoApic::new(0));

    let mut entry = RedirectionEntry::fixed(0x40, 0);
    entry.masked = false;
    entry.trigger = TriggerMode::Level;
    pair.ioapic_mut().set_entry(2, entry);

    pair.raise_gsi(2);
    assert_eq!(pair.acknowledge(), Some(0x40));

    let (lapic_bytes, ioapic_bytes) = pair.save_state();

    let mut resumed = ApicPair::new(
        LocalApic::new_default(0, clock),
        IoApic::new(0),
    );
    resumed.load_state(&lapic_bytes, &ioapic_bytes).unwrap();

    // The vector is still in service; EOI re-delivers because the line
    // level was captured as asserted.
    assert_eq!(resumed.eoi(), Some(0x40));
    assert_eq!(resumed.acknowledge(), Some(0x40));
    resumed.lower_gsi(2);
    assert_eq!(resumed.eoi(), Some(0x40));
    assert_eq!(resumed.pending_vector(), None);
}
