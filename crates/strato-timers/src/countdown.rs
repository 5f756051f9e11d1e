use crate::Clock;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Down-counting timer clocked from guest time.
///
/// The counter holds the number of input ticks remaining until the next
/// underflow. On underflow a periodic timer rearms from `reload`; a one-shot
/// timer parks at zero until reprogrammed. `poll()` returns how many
/// underflows elapsed since the previous poll, so a slow poller observes
/// every period of a fast timer.
#[derive(Debug, Clone)]
pub struct CountdownTimer<C: Clock> {
    clock: C,
    hz: u64,
    enabled: bool,
    periodic: bool,
    reload: u64,
    value: u64,
    last_update_ns: u64,
    // Sub-tick remainder, in units of ns * hz, carried between polls so long
    // uneven polling intervals do not drift.
    carry: u64,
    // Underflows accounted but not yet reported through `poll()`.
    pending_fires: u64,
}

impl<C: Clock> CountdownTimer<C> {
    pub fn new(clock: C, hz: u64) -> Self {
        let now = clock.now_ns();
        Self {
            clock,
            hz,
            enabled: false,
            periodic: true,
            reload: 0,
            value: 0,
            last_update_ns: now,
            carry: 0,
            pending_fires: 0,
        }
    }

    pub fn hz(&self) -> u64 {
        self.hz
    }

    /// Changes the input frequency. Takes effect from the current instant;
    /// elapsed time is accounted at the old rate first.
    pub fn set_hz(&mut self, hz: u64) {
        self.account();
        self.hz = hz;
        self.carry = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            // Time spent disabled does not tick the counter.
            self.last_update_ns = self.clock.now_ns();
            self.carry = 0;
        } else if !enabled {
            self.account();
        }
        self.enabled = enabled;
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn set_periodic(&mut self, periodic: bool) {
        self.account();
        self.periodic = periodic;
    }

    pub fn reload(&self) -> u64 {
        self.reload
    }

    /// Sets the rearm value. The in-flight period is unaffected; the new
    /// value is picked up at the next underflow.
    pub fn set_reload(&mut self, reload: u64) {
        self.account();
        self.reload = reload;
    }

    /// Loads the counter. Zero parks the timer until the next `set_value`
    /// (or, for a periodic timer, permanently if `reload` is also zero).
    pub fn set_value(&mut self, value: u64) {
        self.account();
        self.value = value;
    }

    /// Ticks remaining until the next underflow. Accounts elapsed time but
    /// leaves unreported underflows for the next `poll()`.
    pub fn value(&mut self) -> u64 {
        self.account();
        self.value
    }

    /// Counter value as of the last accounting, without reading the clock.
    /// Intended for state capture; poll first for an up-to-date value.
    pub fn value_unsynced(&self) -> u64 {
        self.value
    }

    /// Accounts elapsed guest time and returns the number of underflows
    /// since the previous poll.
    pub fn poll(&mut self) -> u64 {
        self.account();
        std::mem::take(&mut self.pending_fires)
    }

    fn account(&mut self) {
        let ticks = self.sync();
        let fired = self.consume(ticks);
        self.pending_fires += fired;
    }

    fn sync(&mut self) -> u64 {
        let now = self.clock.now_ns();
        let elapsed = now.saturating_sub(self.last_update_ns);
        self.last_update_ns = now;
        if !self.enabled {
            self.carry = 0;
            return 0;
        }
        let total = elapsed as u128 * self.hz as u128 + self.carry as u128;
        self.carry = (total % NANOS_PER_SEC) as u64;
        (total / NANOS_PER_SEC) as u64
    }

    fn consume(&mut self, mut ticks: u64) -> u64 {
        if !self.enabled || self.value == 0 || ticks == 0 {
            return 0;
        }
        if ticks < self.value {
            self.value -= ticks;
            return 0;
        }

        ticks -= self.value;
        let mut fired = 1u64;
        if self.periodic && self.reload > 0 {
            fired += ticks / self.reload;
            let into_period = ticks % self.reload;
            self.value = self.reload - into_period;
        } else {
            self.value = 0;
        }
        fired
    }
}
