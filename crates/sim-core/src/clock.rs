//! The emulated time base.
//!
//! Everything is counted in CPU clock cycles since reset. Wall-clock style
//! time (microseconds) is derived from the configured CPU frequency.

/// A count of CPU clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cycles(pub u64);

impl Cycles {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(count: u64) -> Self {
        Self(count)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl core::ops::Add for Cycles {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl core::ops::AddAssign for Cycles {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl core::ops::Sub for Cycles {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl core::fmt::Display for Cycles {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU clock configuration.
///
/// One quantum of execution is roughly a millisecond of simulated time;
/// the main loop never asks the CPU to run longer than that in one go.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// CPU frequency in Hz (e.g. `8_000_000` for an 8 MHz 68000).
    pub frequency_hz: u64,
}

impl Clock {
    #[must_use]
    pub const fn new(frequency_hz: u64) -> Self {
        Self { frequency_hz }
    }

    /// Default execution quantum: ~1 ms of simulated time.
    #[must_use]
    pub const fn default_quantum(&self) -> Cycles {
        Cycles::new(self.frequency_hz / 1000)
    }

    /// Microseconds since reset for an elapsed cycle count.
    #[must_use]
    pub const fn micros(&self, cycles: Cycles) -> u64 {
        cycles.get() * 1_000_000 / self.frequency_hz
    }

    /// Cycle count covering the given number of microseconds.
    #[must_use]
    pub const fn cycles_for_micros(&self, micros: u64) -> Cycles {
        Cycles::new(micros * self.frequency_hz / 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantum_is_a_millisecond() {
        assert_eq!(Clock::new(8_000_000).default_quantum(), Cycles::new(8000));
    }

    #[test]
    fn micros_round_trip() {
        let clock = Clock::new(8_000_000);
        assert_eq!(clock.micros(Cycles::new(8000)), 1000);
        assert_eq!(clock.cycles_for_micros(1000), Cycles::new(8000));
    }

    #[test]
    fn sub_saturates() {
        assert_eq!(Cycles::new(5) - Cycles::new(9), Cycles::ZERO);
    }
}
