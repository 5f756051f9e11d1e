//! Priority-based nested interrupt controller models.
//!
//! Three controller variants share one line table and arbitration engine:
//! a nested-vector controller with group-priority preemption ([`nvic`]),
//! a local controller where the highest vector number wins ([`lapic`]), and
//! an I/O redirection controller with no nesting of its own ([`ioapic`]).

#![forbid(unsafe_code)]

pub mod arbiter;
pub mod ioapic;
pub mod lapic;
pub mod line;
pub mod nvic;

pub use arbiter::{Arbiter, ArbitrationPolicy, GroupPriority, NestingError, VectorOrder};
pub use ioapic::{Delivery, IoApic, RedirectionEntry, TriggerMode};
pub use lapic::{EoiNotice, LocalApic, LocalApicConfig};
pub use line::{LineFlags, LineId, LineTable};
pub use nvic::{FullyMapped, MemoryMap, Nvic, NvicConfig};
