mod router;
mod shared;

pub use router::ApicPair;
pub use shared::{SharedApicPair, SharedNvic};

use strato_interrupts::NestingError;

/// The seam the CPU core drives. One implementation per machine flavour;
/// the core never sees which controller family sits behind it.
pub trait InterruptController {
    /// Best deliverable source, without claiming it.
    fn pending_interrupt(&self) -> Option<u16>;

    /// Claims the best deliverable source; `None` is a spurious attempt.
    fn acknowledge(&mut self) -> Option<u16>;

    /// Retires a claimed source. A nesting violation is unrecoverable and
    /// must terminate the emulated session, not be papered over.
    fn complete(&mut self, source: u16) -> Result<(), NestingError>;
}
