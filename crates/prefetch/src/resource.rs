//! Power-aware resource policy.
//!
//! Prefetch aggressiveness follows the device's power situation: plugged in
//! or well charged runs at full tilt, a draining battery narrows the
//! parallel window, and a low battery drops to one-at-a-time and defers the
//! background compression sweep.

use std::fmt;

/// Where the device's power currently comes from.
pub trait PowerSource: Send + Sync {
    /// Battery charge in percent, 0..=100.
    fn battery_percent(&self) -> u8;
    fn is_charging(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggressiveness {
    Full,
    Balanced,
    Conservative,
}

impl Aggressiveness {
    pub fn from_power(power: &dyn PowerSource) -> Self {
        if power.is_charging() || power.battery_percent() > 50 {
            Self::Full
        } else if power.battery_percent() > 20 {
            Self::Balanced
        } else {
            Self::Conservative
        }
    }

    /// Upper bound on concurrent synthesis steps, applied on top of the
    /// engine tier's own slot count.
    pub fn parallel_cap(self) -> usize {
        match self {
            Self::Full => 4,
            Self::Balanced => 2,
            Self::Conservative => 1,
        }
    }

    /// Whether the background compression sweep should wait for a better
    /// power situation.
    pub fn defer_compression(self) -> bool {
        self == Self::Conservative
    }
}

impl fmt::Display for Aggressiveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Full => "full",
            Self::Balanced => "balanced",
            Self::Conservative => "conservative",
        };
        f.write_str(label)
    }
}

#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockPowerSource;

#[cfg(any(test, feature = "mock"))]
mod mock {
    use super::PowerSource;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

    /// A scriptable power source for tests.
    #[derive(Debug)]
    pub struct MockPowerSource {
        percent: AtomicU8,
        charging: AtomicBool,
    }

    impl MockPowerSource {
        pub fn new(percent: u8, charging: bool) -> Self {
            Self { percent: AtomicU8::new(percent), charging: AtomicBool::new(charging) }
        }

        pub fn set_battery(&self, percent: u8) {
            self.percent.store(percent, Ordering::SeqCst);
        }

        pub fn set_charging(&self, charging: bool) {
            self.charging.store(charging, Ordering::SeqCst);
        }
    }

    impl PowerSource for MockPowerSource {
        fn battery_percent(&self) -> u8 {
            self.percent.load(Ordering::SeqCst)
        }

        fn is_charging(&self) -> bool {
            self.charging.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10, true, Aggressiveness::Full)]
    #[case(80, false, Aggressiveness::Full)]
    #[case(51, false, Aggressiveness::Full)]
    #[case(50, false, Aggressiveness::Balanced)]
    #[case(21, false, Aggressiveness::Balanced)]
    #[case(20, false, Aggressiveness::Conservative)]
    #[case(5, false, Aggressiveness::Conservative)]
    fn power_maps_to_aggressiveness(
        #[case] percent: u8,
        #[case] charging: bool,
        #[case] expected: Aggressiveness,
    ) {
        let power = MockPowerSource::new(percent, charging);
        assert_eq!(Aggressiveness::from_power(&power), expected);
    }

    #[test]
    fn conservative_defers_compression_and_serializes() {
        assert!(Aggressiveness::Conservative.defer_compression());
        assert_eq!(Aggressiveness::Conservative.parallel_cap(), 1);
        assert!(!Aggressiveness::Full.defer_compression());
    }
}
