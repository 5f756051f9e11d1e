//! Candidate selection, preemption gating and the active-interrupt stack.

use thiserror::Error;

use crate::line::{LineFlags, LineId, LineTable};

/// Variant-specific ordering rules. The arbiter owns the candidate filter
/// (pending, enabled, not active, under the priority floor); the policy only
/// decides which eligible line wins and whether the winner may interrupt the
/// innermost active handler.
pub trait ArbitrationPolicy {
    /// True when `candidate` is strictly preferable to `incumbent`. The
    /// arbiter scans ascending line indices, so a non-strict policy keeps
    /// the lowest index on ties.
    fn prefer(&self, table: &LineTable, candidate: LineId, incumbent: LineId) -> bool;

    /// True when `candidate` may preempt `active_top`.
    fn preempts(&self, table: &LineTable, candidate: LineId, active_top: LineId) -> bool;
}

/// Lowest priority byte wins; preemption compares group bits only.
///
/// `group_split` is the number of low-order priority bits excluded from the
/// preemption comparison. At split 7 the whole byte is sub-priority and
/// nothing ever preempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupPriority {
    pub group_split: u8,
}

impl GroupPriority {
    pub fn group_mask(&self) -> u8 {
        let split = self.group_split.min(7);
        !(((1u16 << (split + 1)) - 1) as u8)
    }
}

impl ArbitrationPolicy for GroupPriority {
    fn prefer(&self, table: &LineTable, candidate: LineId, incumbent: LineId) -> bool {
        table.priority(candidate) < table.priority(incumbent)
    }

    fn preempts(&self, table: &LineTable, candidate: LineId, active_top: LineId) -> bool {
        let mask = self.group_mask();
        (table.priority(candidate) & mask) < (table.priority(active_top) & mask)
    }
}

/// Highest line index wins and preempts; priority bytes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VectorOrder;

impl ArbitrationPolicy for VectorOrder {
    fn prefer(&self, _table: &LineTable, candidate: LineId, incumbent: LineId) -> bool {
        candidate > incumbent
    }

    fn preempts(&self, _table: &LineTable, candidate: LineId, active_top: LineId) -> bool {
        candidate > active_top
    }
}

/// Completion that violates the nesting discipline. This means the emulated
/// software (or the model) is in an inconsistent state; callers must treat
/// it as fatal rather than resynchronize around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NestingError {
    #[error("completing line {0}, which is not active")]
    NotActive(LineId),
    #[error("completing line {line} out of order; innermost active line is {top}")]
    OutOfOrder { line: LineId, top: LineId },
}

/// Line table plus active stack plus masking registers, kept consistent as
/// one unit: every mutation re-runs arbitration before returning, so the
/// output signal always reflects the latest state.
#[derive(Debug, Clone)]
pub struct Arbiter<P> {
    table: LineTable,
    active: Vec<LineId>,
    policy: P,
    global_mask: bool,
    priority_floor: u8,
    signal: bool,
    deliverable: bool,
}

impl<P: ArbitrationPolicy> Arbiter<P> {
    pub fn new(line_count: usize, policy: P) -> Self {
        Self {
            table: LineTable::new(line_count),
            active: Vec::new(),
            policy,
            global_mask: false,
            priority_floor: 0,
            signal: false,
            deliverable: false,
        }
    }

    pub fn table(&self) -> &LineTable {
        &self.table
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Mutable policy access; callers must follow up with `reevaluate()`.
    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The interrupt-request line observed by the CPU core.
    pub fn irq_asserted(&self) -> bool {
        self.signal
    }

    /// True when an eligible interrupt exists, ignoring the global mask.
    /// Backs the CPU wait-for-interrupt primitive.
    pub fn pending_interrupt_present(&self) -> bool {
        self.deliverable
    }

    pub fn active_top(&self) -> Option<LineId> {
        self.active.last().copied()
    }

    pub fn active_depth(&self) -> usize {
        self.active.len()
    }

    pub fn active_stack(&self) -> &[LineId] {
        &self.active
    }

    pub fn global_mask(&self) -> bool {
        self.global_mask
    }

    pub fn set_global_mask(&mut self, masked: bool) {
        self.global_mask = masked;
        self.reevaluate();
    }

    pub fn priority_floor(&self) -> u8 {
        self.priority_floor
    }

    pub fn set_priority_floor(&mut self, floor: u8) {
        self.priority_floor = floor;
        self.reevaluate();
    }

    /// Latches a request unless the line is already being serviced; a line
    /// cannot queue behind itself before completing.
    pub fn set_pending(&mut self, line: LineId) {
        if !self.table.has(line, LineFlags::ACTIVE) {
            self.table.set(line, LineFlags::PENDING, true);
        }
        self.reevaluate();
    }

    pub fn clear_pending(&mut self, line: LineId) {
        self.table.set(line, LineFlags::PENDING, false);
        self.reevaluate();
    }

    /// Level input edge. Asserting latches a request (unless active);
    /// deasserting drops only the level. A latched request survives until
    /// acknowledged.
    pub fn set_running(&mut self, line: LineId, asserted: bool) {
        if asserted {
            self.table.set(line, LineFlags::RUNNING, true);
            if !self.table.has(line, LineFlags::ACTIVE) {
                self.table.set(line, LineFlags::PENDING, true);
            }
        } else {
            self.table.set(line, LineFlags::RUNNING, false);
        }
        self.reevaluate();
    }

    pub fn set_enabled(&mut self, line: LineId, enabled: bool) {
        self.table.set(line, LineFlags::ENABLED, enabled);
        self.reevaluate();
    }

    pub fn set_priority(&mut self, line: LineId, priority: u8) {
        self.table.set_priority(line, priority);
        self.reevaluate();
    }

    /// Pure arbitration: best eligible candidate after preemption gating,
    /// with no signal side effects.
    pub fn best_candidate(&self) -> Option<LineId> {
        let candidate = self.select_candidate()?;
        if let Some(top) = self.active_top() {
            if !self.policy.preempts(&self.table, candidate, top) {
                return None;
            }
        }
        Some(candidate)
    }

    fn select_candidate(&self) -> Option<LineId> {
        let mut best: Option<LineId> = None;
        for index in 0..self.table.len() {
            let line = index as LineId;
            let flags = self.table.flags(line);
            if !flags.contains(LineFlags::PENDING | LineFlags::ENABLED)
                || flags.contains(LineFlags::ACTIVE)
            {
                continue;
            }
            if self.priority_floor != 0 && self.table.priority(line) >= self.priority_floor {
                continue;
            }
            match best {
                Some(incumbent) if !self.policy.prefer(&self.table, line, incumbent) => {}
                _ => best = Some(line),
            }
        }
        best
    }

    /// Re-runs arbitration and republishes the signal and wake flag.
    pub fn reevaluate(&mut self) {
        let deliverable = self.best_candidate().is_some();
        self.deliverable = deliverable;
        self.signal = deliverable && !self.global_mask;
    }

    /// Claims the best candidate: pending becomes active, the line is pushed
    /// on the nesting stack and the request signal drops. The signal drops
    /// unconditionally once a line is claimed, even if further eligible work
    /// remains; the next completion or register write re-runs arbitration
    /// and raises it again.
    pub fn acknowledge(&mut self) -> Option<LineId> {
        match self.best_candidate() {
            Some(line) => {
                self.table.set(line, LineFlags::PENDING, false);
                self.table.set(line, LineFlags::ACTIVE, true);
                self.active.push(line);
                self.deliverable = true;
                self.signal = false;
                Some(line)
            }
            None => {
                self.reevaluate();
                None
            }
        }
    }

    /// Retires the innermost active line. A still-asserted level input
    /// immediately re-latches the request.
    pub fn complete(&mut self, line: LineId) -> Result<(), NestingError> {
        if !self.table.has(line, LineFlags::ACTIVE) {
            return Err(NestingError::NotActive(line));
        }
        match self.active_top() {
            Some(top) if top == line => {}
            Some(top) => return Err(NestingError::OutOfOrder { line, top }),
            None => return Err(NestingError::NotActive(line)),
        }

        self.table.set(line, LineFlags::ACTIVE, false);
        if self.table.has(line, LineFlags::RUNNING) {
            self.table.set(line, LineFlags::PENDING, true);
        }
        self.active.pop();
        self.reevaluate();
        Ok(())
    }

    /// Marks a line active and pushes it on the nesting stack without
    /// arbitrating; state-restore only.
    pub fn restore_active(&mut self, line: LineId) {
        self.table.set(line, LineFlags::ACTIVE, true);
        self.active.push(line);
    }

    /// Reinitializes flags, priorities, stack and masks in place.
    pub fn reset(&mut self) {
        self.table.reset();
        self.active.clear();
        self.global_mask = false;
        self.priority_floor = 0;
        self.reevaluate();
    }

    pub(crate) fn table_mut(&mut self) -> &mut LineTable {
        &mut self.table
    }
}
