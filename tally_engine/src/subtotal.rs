//! Per-channel numeric counters of a result.
//!
//! Every change goes through [`SubTotal::apply`] as an explicit signed delta
//! scaled by a [`DeltaFactor`]. Apply and revert share the code path and the
//! magnitude, which makes them exact inverses.

use std::iter::Sum;
use std::ops::AddAssign;

use crate::config::{TallyError, TallyResult};

/// Direction of a delta application.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum DeltaFactor {
    Apply,
    Revert,
}

impl DeltaFactor {
    pub fn signed(self) -> i64 {
        match self {
            DeltaFactor::Apply => 1,
            DeltaFactor::Revert => -1,
        }
    }
}

/// A never-negative counter with checked delta arithmetic.
#[derive(Eq, PartialEq, Debug, Clone, Copy, PartialOrd, Ord, Hash, Default)]
pub struct Count(u64);

impl Count {
    pub const ZERO: Count = Count(0);

    pub fn new(value: u64) -> Count {
        Count(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Applies a signed delta. Going negative or past `u64::MAX` is fatal for
    /// the surrounding event, never a wrap.
    pub fn apply(&mut self, delta: i64, field: &'static str) -> TallyResult<()> {
        let next = if delta >= 0 {
            self.0
                .checked_add(delta as u64)
                .ok_or(TallyError::CounterOverflow { field })?
        } else {
            self.0
                .checked_sub(delta.unsigned_abs())
                .ok_or(TallyError::CounterUnderflow { field })?
        };
        self.0 = next;
        Ok(())
    }
}

impl AddAssign for Count {
    fn add_assign(&mut self, rhs: Count) {
        self.0 += rhs.0;
    }
}

impl Sum for Count {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Count(iter.map(|c| c.0).sum())
    }
}

/// The per-data-source partial tally of a result.
///
/// Vote-count fields and ballot-count fields live side by side; the write-in
/// engine and the bundle fold both mutate them exclusively through
/// [`SubTotal::apply`].
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct SubTotal {
    pub received_ballots: Count,
    pub blank_ballots: Count,
    pub invalid_ballots: Count,
    pub accounted_ballots: Count,
    /// Ballots entered ballot-by-ballot through bundles.
    pub detailed_entered_ballots: Count,
    pub individual_votes: Count,
    /// Empty votes, including write-ins resolved to `Empty`.
    pub empty_votes: Count,
    pub invalid_votes: Count,
    /// Total candidate votes, individual votes excluded.
    pub candidate_votes: Count,
}

/// Field-by-field signed delta over a [`SubTotal`].
///
/// Magnitudes are always stated positively where possible; the caller picks
/// the direction through the factor so that a fold-out is the exact inverse
/// of its fold-in.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct SubTotalDelta {
    pub received_ballots: i64,
    pub blank_ballots: i64,
    pub invalid_ballots: i64,
    pub accounted_ballots: i64,
    pub detailed_entered_ballots: i64,
    pub individual_votes: i64,
    pub empty_votes: i64,
    pub invalid_votes: i64,
    pub candidate_votes: i64,
}

impl SubTotal {
    /// Applies `delta` scaled by `factor`, field by field.
    pub fn apply(&mut self, delta: &SubTotalDelta, factor: DeltaFactor) -> TallyResult<()> {
        let f = factor.signed();
        self.received_ballots
            .apply(f * delta.received_ballots, "received_ballots")?;
        self.blank_ballots
            .apply(f * delta.blank_ballots, "blank_ballots")?;
        self.invalid_ballots
            .apply(f * delta.invalid_ballots, "invalid_ballots")?;
        self.accounted_ballots
            .apply(f * delta.accounted_ballots, "accounted_ballots")?;
        self.detailed_entered_ballots
            .apply(f * delta.detailed_entered_ballots, "detailed_entered_ballots")?;
        self.individual_votes
            .apply(f * delta.individual_votes, "individual_votes")?;
        self.empty_votes.apply(f * delta.empty_votes, "empty_votes")?;
        self.invalid_votes
            .apply(f * delta.invalid_votes, "invalid_votes")?;
        self.candidate_votes
            .apply(f * delta.candidate_votes, "candidate_votes")?;
        Ok(())
    }

    /// Field-wise sum, used by the query surface to combine the per-source
    /// partial tallies into the reported total.
    pub fn combined<'a, I: IntoIterator<Item = &'a SubTotal>>(parts: I) -> SubTotal {
        let mut total = SubTotal::default();
        for p in parts {
            total.received_ballots += p.received_ballots;
            total.blank_ballots += p.blank_ballots;
            total.invalid_ballots += p.invalid_ballots;
            total.accounted_ballots += p.accounted_ballots;
            total.detailed_entered_ballots += p.detailed_entered_ballots;
            total.individual_votes += p.individual_votes;
            total.empty_votes += p.empty_votes;
            total.invalid_votes += p.invalid_votes;
            total.candidate_votes += p.candidate_votes;
        }
        total
    }
}

/// Checked narrowing of a raw count into the signed delta domain. Values
/// beyond `i64::MAX` cannot be represented as a delta and are fatal.
pub(crate) fn to_signed(value: u64, field: &'static str) -> TallyResult<i64> {
    i64::try_from(value).map_err(|_| TallyError::CounterOverflow { field })
}

/// Difference `target - current`, expressed as a delta so that electronic
/// snapshot replacement also goes through the explicit-delta path.
pub(crate) fn diff(field: u64, target: u64, name: &'static str) -> TallyResult<i64> {
    Ok(to_signed(target, name)? - to_signed(field, name)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_delta() -> SubTotalDelta {
        SubTotalDelta {
            received_ballots: 5,
            blank_ballots: 1,
            invalid_ballots: 1,
            accounted_ballots: 3,
            detailed_entered_ballots: 3,
            individual_votes: 2,
            empty_votes: 4,
            invalid_votes: 1,
            candidate_votes: 7,
        }
    }

    #[test]
    fn apply_then_revert_is_identity() {
        let mut st = SubTotal::default();
        st.apply(&sample_delta(), DeltaFactor::Apply).unwrap();
        st.apply(&sample_delta(), DeltaFactor::Apply).unwrap();
        let snapshot = st.clone();
        st.apply(&sample_delta(), DeltaFactor::Apply).unwrap();
        st.apply(&sample_delta(), DeltaFactor::Revert).unwrap();
        assert_eq!(st, snapshot);
    }

    #[test]
    fn revert_below_zero_is_an_error() {
        let mut st = SubTotal::default();
        let err = st.apply(&sample_delta(), DeltaFactor::Revert).unwrap_err();
        assert!(matches!(err, TallyError::CounterUnderflow { .. }));
    }

    #[test]
    fn overflow_is_an_error() {
        let mut c = Count::new(u64::MAX - 1);
        let err = c.apply(5, "c").unwrap_err();
        assert!(matches!(err, TallyError::CounterOverflow { .. }));
        // The counter is untouched on failure.
        assert_eq!(c.get(), u64::MAX - 1);
    }

    #[test]
    fn counts_beyond_the_signed_range_are_an_error() {
        let err = to_signed(u64::MAX, "c").unwrap_err();
        assert!(matches!(err, TallyError::CounterOverflow { .. }));
        let err = diff(0, i64::MAX as u64 + 1, "c").unwrap_err();
        assert!(matches!(err, TallyError::CounterOverflow { .. }));
        assert_eq!(diff(7, 3, "c").unwrap(), -4);
    }

    #[test]
    fn combined_sums_field_wise() {
        let mut a = SubTotal::default();
        a.apply(&sample_delta(), DeltaFactor::Apply).unwrap();
        let mut b = SubTotal::default();
        b.apply(&sample_delta(), DeltaFactor::Apply).unwrap();
        let total = SubTotal::combined([&a, &b]);
        assert_eq!(total.received_ballots.get(), 10);
        assert_eq!(total.candidate_votes.get(), 14);
    }
}
