use std::{convert::TryFrom, fmt, iter::Sum};

/// Millisatoshi amount, the unit all payment amounts are expressed in.
///
/// Arithmetic is always checked: running out of `u64` range is a bug we
/// want surfaced, not wrapped.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MilliSatoshi(u64);

impl MilliSatoshi {
    pub const ZERO: MilliSatoshi = MilliSatoshi(0);

    pub const fn from_msat(msat: u64) -> Self {
        Self(msat)
    }

    /// Converts a satoshi value. `None` if the msat value does not fit.
    pub fn from_sat(sat: u64) -> Option<Self> {
        sat.checked_mul(1000).map(Self)
    }

    pub const fn as_msat(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// Adds the forwarding fee a channel with the given policy charges for
    /// this amount: `base + amount * proportional / 1_000_000`.
    pub fn checked_add_fee(
        self,
        fee_base_msat: u32,
        fee_proportional_millionths: u32,
    ) -> Option<Self> {
        let proportional = (self.0 as u128 * fee_proportional_millionths as u128) / 1_000_000;
        let proportional = u64::try_from(proportional).ok()?;

        self.0
            .checked_add(fee_base_msat as u64)?
            .checked_add(proportional)
            .map(Self)
    }
}

impl From<u64> for MilliSatoshi {
    fn from(msat: u64) -> Self {
        Self(msat)
    }
}

impl Sum for MilliSatoshi {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, a| {
            Self(acc.0.checked_add(a.0).expect("msat sum overflow"))
        })
    }
}

impl fmt::Display for MilliSatoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}msat", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_is_base_plus_proportional() {
        let amount = MilliSatoshi::from_msat(1_000_000);

        let with_fee = amount.checked_add_fee(10, 1_000).unwrap();

        assert_eq!(with_fee, MilliSatoshi::from_msat(1_001_010));
    }

    #[test]
    fn fee_on_zero_amount_is_base_only() {
        let amount = MilliSatoshi::ZERO;

        let with_fee = amount.checked_add_fee(25, 10_000).unwrap();

        assert_eq!(with_fee, MilliSatoshi::from_msat(25));
    }

    #[test]
    fn addition_overflow_is_detected() {
        let amount = MilliSatoshi::from_msat(u64::max_value());

        assert_eq!(amount.checked_add(MilliSatoshi::from_msat(1)), None);
    }

    #[test]
    fn sat_conversion_scales_by_one_thousand() {
        assert_eq!(
            MilliSatoshi::from_sat(100_000),
            Some(MilliSatoshi::from_msat(100_000_000))
        );
    }
}
