//! # Tick Timer Module
//!
//! The engine never reads a wall clock. All protocol timers (positive acknowledgement, NAK
//! and inactivity) are plain countdown counters which are decremented once per engine wakeup.
//! The duration of one tick is therefore defined by the configured ticks per second and by how
//! often [crate::engine::Engine::cycle] is called.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Countdown timer measured in engine ticks.
///
/// A timer with a tick count of zero is expired. A default constructed timer is expired, which
/// is also the state of an unarmed timer: the engine simply stops ticking timers it does not
/// care about.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Timer {
    tick: u32,
}

impl Timer {
    /// Create a timer which expires after `rel_sec` seconds worth of ticks.
    pub const fn new_rel_sec(rel_sec: u32, ticks_per_second: u32) -> Self {
        Self {
            tick: rel_sec.saturating_mul(ticks_per_second),
        }
    }

    /// Re-arm the timer relative to now.
    pub fn init_rel_sec(&mut self, rel_sec: u32, ticks_per_second: u32) {
        self.tick = rel_sec.saturating_mul(ticks_per_second);
    }

    #[inline]
    pub const fn expired(&self) -> bool {
        self.tick == 0
    }

    #[inline]
    pub const fn remaining_ticks(&self) -> u32 {
        self.tick
    }

    /// Advance the timer by one tick.
    ///
    /// Ticking an expired timer is a caller bug. It is caught in debug builds and saturates in
    /// release builds.
    pub fn tick(&mut self) {
        debug_assert!(self.tick != 0, "ticked an expired timer");
        self.tick = self.tick.saturating_sub(1);
    }
}
