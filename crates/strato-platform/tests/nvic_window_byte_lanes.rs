use std::sync::Arc;

use strato_interrupts::nvic::{self, Nvic};
use strato_interrupts::FullyMapped;
use strato_platform::{MmioHandler, NvicWindow, SharedNvic};
use strato_timers::ManualClock;

fn window() -> (SharedNvic<ManualClock>, NvicWindow<ManualClock>) {
    let clock = ManualClock::new();
    let nvic = SharedNvic::new(Nvic::new_default(clock), Arc::new(FullyMapped));
    (nvic.clone(), NvicWindow::new(nvic))
}

#[test]
fn byte_writes_to_priority_registers_leave_neighbours_alone() {
    let (nvic, mut window) = window();

    window.write(nvic::REG_IPR_BASE, 4, 0x4433_2211);
    // Replace only the second priority byte.
    window.write(nvic::REG_IPR_BASE + 1, 1, 0xAA);

    assert_eq!(window.read(nvic::REG_IPR_BASE, 4), 0x4433_AA11);
    assert_eq!(nvic.mmio_read(nvic::REG_IPR_BASE), 0x4433_AA11);
}

#[test]
fn halfword_reads_straddle_register_words() {
    let (_, mut window) = window();

    window.write(nvic::REG_IPR_BASE, 8, 0x8877_6655_4433_2211);
    let value = window.read(nvic::REG_IPR_BASE + 3, 2);
    assert_eq!(value, 0x5544);
}

#[test]
fn aligned_word_write_to_pend_bank_sets_exactly_those_bits() {
    let (nvic, mut window) = window();
    nvic.mmio_write(nvic::REG_ISER_BASE, 0xFF);

    window.write(nvic::REG_ISPR_BASE, 4, 0x0000_0021);
    assert_eq!(nvic.mmio_read(nvic::REG_ISPR_BASE), 0x21);
    assert_eq!(nvic.acknowledge_irq(), Some(16));
}

#[test]
fn wide_read_spans_the_systick_block_without_side_effects_on_neighbours() {
    let (nvic, mut window) = window();
    nvic.mmio_write(nvic::REG_SYST_RVR, 0x1234);

    let value = window.read(nvic::REG_SYST_RVR, 8);
    assert_eq!(value & 0xFFFF_FFFF, 0x1234);
    // High half is the current-value register, idle at zero.
    assert_eq!(value >> 32, 0);
}
