//! Channel status word.
//!
//! Devices report a set of mutually non-exclusive status bits per
//! channel. The `bitflags` representation keeps the word compact and
//! makes mask checks explicit.

use bitflags::bitflags;

bitflags! {
    /// Per-channel status flags as reported by the device facade.
    ///
    /// `TRIP` and `ILK` are the trip-class flags covered by
    /// [`TRIP_MASK`](ChannelStatus::TRIP_MASK).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChannelStatus: u16 {
        /// Channel output is enabled.
        const ON   = 0x0001;
        /// Channel is ramping up toward its setpoint.
        const RUP  = 0x0002;
        /// Channel is ramping down toward its setpoint.
        const RDW  = 0x0004;
        /// Channel tripped (overcurrent or device-reported fault).
        const TRIP = 0x0008;
        /// Output was killed without ramp-down.
        const KILL = 0x0010;
        /// Hardware interlock is holding the channel off.
        const ILK  = 0x0020;
        /// Channel is administratively disabled.
        const DIS  = 0x0040;
    }
}

impl ChannelStatus {
    /// Mask of flags that indicate an unsafe, trip-like condition.
    pub const TRIP_MASK: Self = Self::from_bits_truncate(Self::TRIP.bits() | Self::ILK.bits());

    /// Returns true if any trip-like flag is set.
    #[inline]
    pub const fn is_tripped(&self) -> bool {
        self.intersects(Self::TRIP_MASK)
    }

    /// Returns true if the output is enabled.
    #[inline]
    pub const fn is_on(&self) -> bool {
        self.contains(Self::ON)
    }
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trip_mask() {
        assert!(!ChannelStatus::ON.is_tripped());
        assert!(ChannelStatus::TRIP.is_tripped());
        assert!(ChannelStatus::ILK.is_tripped());
        assert!((ChannelStatus::ON | ChannelStatus::TRIP).is_tripped());
    }

    #[test]
    fn status_bits_roundtrip() {
        for flag in [
            ChannelStatus::ON,
            ChannelStatus::RUP,
            ChannelStatus::RDW,
            ChannelStatus::TRIP,
            ChannelStatus::KILL,
            ChannelStatus::ILK,
            ChannelStatus::DIS,
        ] {
            let bits = flag.bits();
            assert_eq!(ChannelStatus::from_bits(bits).unwrap(), flag);
        }
        let combo = ChannelStatus::ON | ChannelStatus::RUP;
        assert_eq!(ChannelStatus::from_bits(combo.bits()).unwrap(), combo);
    }
}
