//! Ballot bundles and their lifecycle.
//!
//! A bundle gates *when* its ballots are folded into the result totals:
//! folding happens exactly on the `Reviewed` transition, and is undone with
//! the same delta on deletion or reset of a reviewed bundle.

use std::collections::HashMap;

use log::debug;

use crate::config::*;
use crate::subtotal::{to_signed, SubTotalDelta};

/// One entry of the append-only bundle log.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct BundleLogEntry {
    pub actor: Actor,
    pub timestamp: Timestamp,
    pub state: BundleState,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub(crate) struct Ballot {
    pub number: BallotNumber,
    pub content: BallotContent,
}

/// A batch of manually entered ballots, reviewed as a unit.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    pub number: BundleNumber,
    state: BundleState,
    ballots: Vec<Ballot>,
    review_sample: Vec<BallotNumber>,
    log: Vec<BundleLogEntry>,
}

/// Signed vote deltas of a fold, applied by the result aggregate with a
/// single factor for the whole batch.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct FoldDelta {
    pub subtotal: SubTotalDelta,
    pub candidate_votes: HashMap<CandidateId, i64>,
    /// Per question: (yes, no, unspecified).
    pub answers: HashMap<QuestionId, (i64, i64, i64)>,
}

impl Bundle {
    pub(crate) fn new(id: BundleId, number: BundleNumber, actor: &Actor, ts: Timestamp) -> Bundle {
        let mut b = Bundle {
            id,
            number,
            state: BundleState::InProcess,
            ballots: Vec::new(),
            review_sample: Vec::new(),
            log: Vec::new(),
        };
        b.push_log(actor, ts);
        b
    }

    pub fn state(&self) -> BundleState {
        self.state
    }

    pub fn count_of_ballots(&self) -> u32 {
        self.ballots.len() as u32
    }

    /// Ballot numbers that must be checked by the reviewer.
    pub fn review_sample(&self) -> &[BallotNumber] {
        &self.review_sample
    }

    pub fn log(&self) -> &[BundleLogEntry] {
        &self.log
    }

    fn push_log(&mut self, actor: &Actor, ts: Timestamp) {
        self.log.push(BundleLogEntry {
            actor: actor.clone(),
            timestamp: ts,
            state: self.state,
        });
    }

    fn editable(&self) -> TallyResult<()> {
        match self.state {
            BundleState::InProcess | BundleState::InCorrection => Ok(()),
            state => Err(TallyError::BundleNotEditable { id: self.id, state }),
        }
    }

    fn transition(
        &mut self,
        allowed_from: &[BundleState],
        to: BundleState,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<()> {
        if !allowed_from.contains(&self.state) {
            return Err(TallyError::InvalidBundleTransition {
                id: self.id,
                from: self.state,
                to,
            });
        }
        debug!("bundle {:?}: {:?} -> {:?}", self.id, self.state, to);
        self.state = to;
        self.push_log(actor, ts);
        Ok(())
    }

    // ****** Ballot mutations (no accumulator effect) ******

    pub(crate) fn create_ballot(
        &mut self,
        number: BallotNumber,
        content: BallotContent,
    ) -> TallyResult<()> {
        self.editable()?;
        if self.ballots.iter().any(|b| b.number == number) {
            return Err(TallyError::DuplicateBallotNumber {
                bundle: self.id,
                number,
            });
        }
        self.ballots.push(Ballot { number, content });
        Ok(())
    }

    pub(crate) fn update_ballot(
        &mut self,
        number: BallotNumber,
        content: BallotContent,
    ) -> TallyResult<()> {
        self.editable()?;
        let ballot = self
            .ballots
            .iter_mut()
            .find(|b| b.number == number)
            .ok_or(TallyError::BallotNotFound {
                bundle: self.id,
                number,
            })?;
        ballot.content = content;
        Ok(())
    }

    pub(crate) fn delete_ballot(&mut self, number: BallotNumber) -> TallyResult<()> {
        self.editable()?;
        let before = self.ballots.len();
        self.ballots.retain(|b| b.number != number);
        if self.ballots.len() == before {
            return Err(TallyError::BallotNotFound {
                bundle: self.id,
                number,
            });
        }
        Ok(())
    }

    // ****** Lifecycle transitions ******

    pub(crate) fn submission_finished(&mut self, actor: &Actor, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[BundleState::InProcess],
            BundleState::ReadyForReview,
            actor,
            ts,
        )?;
        self.review_sample = self.pick_review_sample();
        Ok(())
    }

    pub(crate) fn correction_finished(&mut self, actor: &Actor, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[BundleState::InCorrection],
            BundleState::ReadyForReview,
            actor,
            ts,
        )?;
        self.review_sample = self.pick_review_sample();
        Ok(())
    }

    pub(crate) fn review_rejected(&mut self, actor: &Actor, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[BundleState::ReadyForReview],
            BundleState::InCorrection,
            actor,
            ts,
        )
    }

    /// Marks the bundle reviewed and returns the delta to fold in.
    pub(crate) fn review_succeeded(
        &mut self,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<FoldDelta> {
        self.transition(
            &[BundleState::ReadyForReview],
            BundleState::Reviewed,
            actor,
            ts,
        )?;
        self.fold_delta()
    }

    /// Deletes the bundle. Returns the delta to fold out iff the bundle was
    /// reviewed (its ballots are in the totals), `None` otherwise.
    pub(crate) fn delete(&mut self, actor: &Actor, ts: Timestamp) -> TallyResult<Option<FoldDelta>> {
        let was_reviewed = self.state == BundleState::Reviewed;
        self.transition(
            &[
                BundleState::InProcess,
                BundleState::ReadyForReview,
                BundleState::InCorrection,
                BundleState::Reviewed,
            ],
            BundleState::Deleted,
            actor,
            ts,
        )?;
        Ok(if was_reviewed {
            Some(self.fold_delta()?)
        } else {
            None
        })
    }

    /// Undoes a review while keeping the ballots: folds out and re-runs the
    /// submission-finished transition, which re-picks a sample.
    pub(crate) fn reset_to_submission_finished(
        &mut self,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<FoldDelta> {
        self.transition(
            &[BundleState::Reviewed],
            BundleState::ReadyForReview,
            actor,
            ts,
        )?;
        self.review_sample = self.pick_review_sample();
        self.fold_delta()
    }

    // ****** Folding ******

    /// Vote deltas of all ballots of this bundle, stated with positive
    /// magnitudes. The caller applies it with +1 on review and -1 on undo,
    /// through the same accumulator path.
    pub(crate) fn fold_delta(&self) -> TallyResult<FoldDelta> {
        let mut delta = FoldDelta::default();
        for ballot in &self.ballots {
            delta.subtotal.received_ballots += 1;
            delta.subtotal.accounted_ballots += 1;
            delta.subtotal.detailed_entered_ballots += 1;
            delta.subtotal.individual_votes +=
                to_signed(ballot.content.individual_votes, "individual_votes")?;
            delta.subtotal.empty_votes += to_signed(ballot.content.empty_votes, "empty_votes")?;
            delta.subtotal.invalid_votes +=
                to_signed(ballot.content.invalid_votes, "invalid_votes")?;
            for cid in &ballot.content.candidates {
                *delta.candidate_votes.entry(*cid).or_insert(0) += 1;
                delta.subtotal.candidate_votes += 1;
            }
            for (qid, answer) in &ballot.content.answers {
                let counts = delta.answers.entry(*qid).or_insert((0, 0, 0));
                match answer {
                    BallotAnswer::Yes => counts.0 += 1,
                    BallotAnswer::No => counts.1 += 1,
                    BallotAnswer::Unspecified => counts.2 += 1,
                }
            }
        }
        Ok(delta)
    }

    // ****** Review sampling ******

    /// How often this bundle reached `ReadyForReview`, used to salt the
    /// sample so a re-submission picks a fresh one.
    fn submission_round(&self) -> usize {
        self.log
            .iter()
            .filter(|e| e.state == BundleState::ReadyForReview)
            .count()
    }

    /// Deterministic sample of ballot numbers to review: orders the ballots
    /// by a digest keyed on (bundle id, submission round, ballot number) and
    /// takes ceil(sqrt(n)) of them, plus every ballot flagged during entry.
    fn pick_review_sample(&self) -> Vec<BallotNumber> {
        let n = self.ballots.len();
        if n == 0 {
            return Vec::new();
        }
        let sample_size = (n as f64).sqrt().ceil() as usize;
        let round = self.submission_round();

        let mut ordered: Vec<(String, BallotNumber)> = self
            .ballots
            .iter()
            .map(|b| {
                let key = sha256::digest(format!(
                    "{:08}{:08}{:08}",
                    self.id.0, round, b.number.0
                ));
                (key, b.number)
            })
            .collect();
        ordered.sort();

        let mut sample: Vec<BallotNumber> =
            ordered.iter().take(sample_size).map(|p| p.1).collect();
        for b in &self.ballots {
            if b.content.marked_for_review && !sample.contains(&b.number) {
                sample.push(b.number);
            }
        }
        sample.sort();
        debug!(
            "pick_review_sample: bundle {:?} round {} sample {:?}",
            self.id, round, sample
        );
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTOR: &str = "reviewer";
    const TS: Timestamp = Timestamp(1_000);

    fn actor() -> Actor {
        Actor(ACTOR.to_string())
    }

    fn ballot(number: u32, candidates: &[u32]) -> (BallotNumber, BallotContent) {
        (
            BallotNumber(number),
            BallotContent {
                candidates: candidates.iter().map(|c| CandidateId(*c)).collect(),
                ..BallotContent::default()
            },
        )
    }

    fn bundle_with_ballots(count: u32) -> Bundle {
        let mut b = Bundle::new(BundleId(7), BundleNumber(1), &actor(), TS);
        for i in 0..count {
            let (n, c) = ballot(i + 1, &[1]);
            b.create_ballot(n, c).unwrap();
        }
        b
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut b = bundle_with_ballots(2);
        assert_eq!(b.state(), BundleState::InProcess);
        b.submission_finished(&actor(), TS).unwrap();
        assert_eq!(b.state(), BundleState::ReadyForReview);
        let delta = b.review_succeeded(&actor(), TS).unwrap();
        assert_eq!(b.state(), BundleState::Reviewed);
        assert_eq!(delta.subtotal.detailed_entered_ballots, 2);
        assert_eq!(delta.candidate_votes.get(&CandidateId(1)), Some(&2));
        // The log recorded every state in order.
        let states: Vec<BundleState> = b.log().iter().map(|e| e.state).collect();
        assert_eq!(
            states,
            vec![
                BundleState::InProcess,
                BundleState::ReadyForReview,
                BundleState::Reviewed
            ]
        );
    }

    #[test]
    fn correction_loop() {
        let mut b = bundle_with_ballots(3);
        b.submission_finished(&actor(), TS).unwrap();
        b.review_rejected(&actor(), TS).unwrap();
        assert_eq!(b.state(), BundleState::InCorrection);
        // Ballots stay editable in correction.
        let (n, c) = ballot(4, &[1]);
        b.create_ballot(n, c).unwrap();
        b.correction_finished(&actor(), TS).unwrap();
        assert_eq!(b.state(), BundleState::ReadyForReview);
        assert_eq!(b.count_of_ballots(), 4);
    }

    #[test]
    fn ballots_frozen_outside_entry_states() {
        let mut b = bundle_with_ballots(1);
        b.submission_finished(&actor(), TS).unwrap();
        let (n, c) = ballot(9, &[1]);
        let err = b.create_ballot(n, c).unwrap_err();
        assert!(matches!(err, TallyError::BundleNotEditable { .. }));
    }

    #[test]
    fn review_from_in_process_is_invalid() {
        let mut b = bundle_with_ballots(1);
        let err = b.review_succeeded(&actor(), TS).unwrap_err();
        assert!(matches!(err, TallyError::InvalidBundleTransition { .. }));
    }

    #[test]
    fn delete_reviewed_returns_fold_out_delta() {
        let mut b = bundle_with_ballots(2);
        b.submission_finished(&actor(), TS).unwrap();
        let folded = b.review_succeeded(&actor(), TS).unwrap();
        let unfolded = b.delete(&actor(), TS).unwrap().unwrap();
        assert_eq!(folded, unfolded);
        assert_eq!(b.state(), BundleState::Deleted);
    }

    #[test]
    fn delete_unreviewed_folds_nothing() {
        let mut b = bundle_with_ballots(2);
        assert_eq!(b.delete(&actor(), TS).unwrap(), None);
    }

    #[test]
    fn reset_re_picks_a_sample() {
        let mut b = bundle_with_ballots(9);
        b.submission_finished(&actor(), TS).unwrap();
        let first = b.review_sample().to_vec();
        assert_eq!(first.len(), 3);
        b.review_succeeded(&actor(), TS).unwrap();
        let delta = b.reset_to_submission_finished(&actor(), TS).unwrap();
        assert_eq!(delta.subtotal.detailed_entered_ballots, 9);
        // Same size, freshly salted pick.
        assert_eq!(b.review_sample().len(), 3);
        assert_ne!(b.submission_round(), 1);
    }

    #[test]
    fn sample_is_deterministic_and_includes_flagged_ballots() {
        let mut a = bundle_with_ballots(16);
        let mut b = bundle_with_ballots(16);
        let (n, mut c) = ballot(99, &[1]);
        c.marked_for_review = true;
        a.create_ballot(n, c.clone()).unwrap();
        b.create_ballot(n, c).unwrap();
        a.submission_finished(&actor(), TS).unwrap();
        b.submission_finished(&actor(), TS).unwrap();
        assert_eq!(a.review_sample(), b.review_sample());
        assert!(a.review_sample().contains(&BallotNumber(99)));
    }

    #[test]
    fn fold_delta_covers_answers() {
        let mut b = Bundle::new(BundleId(1), BundleNumber(1), &actor(), TS);
        let content = BallotContent {
            answers: vec![
                (QuestionId(1), BallotAnswer::Yes),
                (QuestionId(2), BallotAnswer::Unspecified),
            ],
            ..BallotContent::default()
        };
        b.create_ballot(BallotNumber(1), content.clone()).unwrap();
        b.create_ballot(
            BallotNumber(2),
            BallotContent {
                answers: vec![
                    (QuestionId(1), BallotAnswer::No),
                    (QuestionId(2), BallotAnswer::Yes),
                ],
                ..BallotContent::default()
            },
        )
        .unwrap();
        let delta = b.fold_delta().unwrap();
        assert_eq!(delta.answers.get(&QuestionId(1)), Some(&(1, 1, 0)));
        assert_eq!(delta.answers.get(&QuestionId(2)), Some(&(1, 0, 1)));
    }

    #[test]
    fn fold_delta_rejects_counts_beyond_the_signed_range() {
        let mut b = Bundle::new(BundleId(1), BundleNumber(1), &actor(), TS);
        b.create_ballot(
            BallotNumber(1),
            BallotContent {
                empty_votes: u64::MAX,
                ..BallotContent::default()
            },
        )
        .unwrap();
        let err = b.fold_delta().unwrap_err();
        assert!(matches!(err, TallyError::CounterOverflow { .. }));
    }
}
