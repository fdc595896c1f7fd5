//! The per-counting-circle result aggregate.
//!
//! Unit of consistency for everything the engine mutates: per-source
//! subtotals, candidate and answer results, bundles, write-in mappings and
//! the derived gauges. One instance per (political business, counting
//! circle).

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::bundle::{Bundle, FoldDelta};
use crate::config::*;
use crate::subtotal::{diff, Count, DeltaFactor, SubTotal, SubTotalDelta};
use crate::write_ins::{self, MappingOutcome, WriteInMapping};

/// Per-source tally of one candidate. The write-in sub-field is only ever
/// mutated by the write-in mapping engine.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct CandidateSubTotal {
    pub votes: Count,
    pub write_in_votes: Count,
}

#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct CandidateResult {
    counts: HashMap<DataSource, CandidateSubTotal>,
}

impl CandidateResult {
    pub fn by_source(&self, source: DataSource) -> CandidateSubTotal {
        self.counts.get(&source).cloned().unwrap_or_default()
    }

    /// Total votes over all sources, write-ins included.
    pub fn total_votes(&self) -> u64 {
        self.counts
            .values()
            .map(|c| c.votes.get() + c.write_in_votes.get())
            .sum()
    }
}

/// Per-source answer counts of one vote question.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct AnswerCounts {
    pub yes: Count,
    pub no: Count,
    pub unspecified: Count,
}

#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct AnswerResult {
    counts: HashMap<DataSource, AnswerCounts>,
}

impl AnswerResult {
    pub fn by_source(&self, source: DataSource) -> AnswerCounts {
        self.counts.get(&source).cloned().unwrap_or_default()
    }

    pub fn totals(&self) -> (u64, u64, u64) {
        self.counts.values().fold((0, 0, 0), |acc, c| {
            (
                acc.0 + c.yes.get(),
                acc.1 + c.no.get(),
                acc.2 + c.unspecified.get(),
            )
        })
    }
}

/// Last committed snapshot of an electronic source.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
struct ImportState {
    counts: ImportCounts,
    ballots: HashMap<ImportedBallotId, ImportedBallot>,
    mappings: Vec<WriteInMapping>,
}

/// Simplified read-projection kept in sync within the same transaction.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct SimplifiedProjection {
    pub unmapped_write_in_elections: u32,
}

/// Full totals of a result, per-source subtotals summed.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct TotalsSnapshot {
    pub subtotal: SubTotal,
    /// (candidate, total votes incl. write-ins, write-in votes), ascending id.
    pub candidates: Vec<(CandidateId, u64, u64)>,
    /// (question, yes, no, unspecified), ascending id.
    pub answers: Vec<(QuestionId, u64, u64, u64)>,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CountingCircleResult {
    pub id: ResultId,
    canton: CantonSettings,
    state: ResultState,
    published: bool,
    state_log: Vec<(ResultState, Timestamp)>,
    subtotals: HashMap<DataSource, SubTotal>,
    candidates: HashMap<CandidateId, CandidateResult>,
    answers: HashMap<QuestionId, AnswerResult>,
    bundles: HashMap<BundleId, Bundle>,
    imports: HashMap<DataSource, ImportState>,
    bundles_not_reviewed_or_deleted: u32,
    unmapped_write_ins: HashMap<DataSource, u32>,
    projection: SimplifiedProjection,
}

impl CountingCircleResult {
    pub(crate) fn new(
        id: ResultId,
        canton: CantonSettings,
        candidates: &[CandidateId],
        questions: &[QuestionId],
        ts: Timestamp,
    ) -> CountingCircleResult {
        CountingCircleResult {
            id,
            canton,
            state: ResultState::SubmissionOngoing,
            published: false,
            state_log: vec![(ResultState::SubmissionOngoing, ts)],
            subtotals: DataSource::ALL
                .iter()
                .map(|s| (*s, SubTotal::default()))
                .collect(),
            candidates: candidates
                .iter()
                .map(|c| (*c, CandidateResult::default()))
                .collect(),
            answers: questions
                .iter()
                .map(|q| (*q, AnswerResult::default()))
                .collect(),
            bundles: HashMap::new(),
            imports: HashMap::new(),
            bundles_not_reviewed_or_deleted: 0,
            unmapped_write_ins: HashMap::new(),
            projection: SimplifiedProjection::default(),
        }
    }

    // ****** Queries ******

    pub fn state(&self) -> ResultState {
        self.state
    }

    pub fn published(&self) -> bool {
        self.published
    }

    /// Timestamps of every state transition, in order.
    pub fn state_log(&self) -> &[(ResultState, Timestamp)] {
        &self.state_log
    }

    pub fn subtotal(&self, source: DataSource) -> &SubTotal {
        // All three sources are created with the result.
        &self.subtotals[&source]
    }

    fn subtotal_mut(&mut self, source: DataSource) -> TallyResult<&mut SubTotal> {
        self.subtotals
            .get_mut(&source)
            .ok_or(TallyError::Invariant {
                message: format!("no subtotal for source {:?}", source),
            })
    }

    pub fn candidate(&self, id: CandidateId) -> Option<&CandidateResult> {
        self.candidates.get(&id)
    }

    pub fn answer(&self, id: QuestionId) -> Option<&AnswerResult> {
        self.answers.get(&id)
    }

    pub fn bundle(&self, id: BundleId) -> Option<&Bundle> {
        self.bundles.get(&id)
    }

    pub fn bundle_states(&self) -> Vec<(BundleId, BundleNumber, BundleState)> {
        let mut states: Vec<(BundleId, BundleNumber, BundleState)> = self
            .bundles
            .values()
            .map(|b| (b.id, b.number, b.state()))
            .collect();
        states.sort_by_key(|s| s.0);
        states
    }

    pub fn count_of_bundles_not_reviewed_or_deleted(&self) -> u32 {
        self.bundles_not_reviewed_or_deleted
    }

    /// The unmapped write-in gauge for one import source: 1 while at least
    /// one mapping of that source is unresolved, 0 otherwise.
    pub fn unmapped_write_in_count(&self, source: DataSource) -> u32 {
        self.unmapped_write_ins.get(&source).copied().unwrap_or(0)
    }

    pub fn projection(&self) -> &SimplifiedProjection {
        &self.projection
    }

    pub fn write_in_mappings(&self, source: DataSource) -> &[WriteInMapping] {
        self.imports
            .get(&source)
            .map(|i| i.mappings.as_slice())
            .unwrap_or(&[])
    }

    /// The reported totals: field-wise sum of the per-source subtotals.
    pub fn totals(&self) -> TotalsSnapshot {
        let mut candidates: Vec<(CandidateId, u64, u64)> = self
            .candidates
            .iter()
            .map(|(cid, c)| {
                let write_ins: u64 = c.counts.values().map(|s| s.write_in_votes.get()).sum();
                (*cid, c.total_votes(), write_ins)
            })
            .collect();
        candidates.sort_by_key(|c| c.0);
        let mut answers: Vec<(QuestionId, u64, u64, u64)> = self
            .answers
            .iter()
            .map(|(qid, a)| {
                let (yes, no, unspecified) = a.totals();
                (*qid, yes, no, unspecified)
            })
            .collect();
        answers.sort_by_key(|a| a.0);
        TotalsSnapshot {
            subtotal: SubTotal::combined(self.subtotals.values()),
            candidates,
            answers,
        }
    }

    // ****** Bundle handlers ******

    pub(crate) fn bundle_created(
        &mut self,
        id: BundleId,
        number: BundleNumber,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<()> {
        if self.bundles.contains_key(&id) || self.bundles.values().any(|b| b.number == number) {
            return Err(TallyError::DuplicateBundleNumber { number });
        }
        self.bundles.insert(id, Bundle::new(id, number, actor, ts));
        self.bundles_not_reviewed_or_deleted += 1;
        Ok(())
    }

    fn bundle_mut(&mut self, id: BundleId) -> TallyResult<&mut Bundle> {
        self.bundles
            .get_mut(&id)
            .ok_or(TallyError::BundleNotFound { id })
    }

    pub(crate) fn ballot_created(
        &mut self,
        bundle: BundleId,
        number: BallotNumber,
        content: BallotContent,
    ) -> TallyResult<()> {
        self.check_ballot_refs(&content)?;
        self.bundle_mut(bundle)?.create_ballot(number, content)
    }

    pub(crate) fn ballot_updated(
        &mut self,
        bundle: BundleId,
        number: BallotNumber,
        content: BallotContent,
    ) -> TallyResult<()> {
        self.check_ballot_refs(&content)?;
        self.bundle_mut(bundle)?.update_ballot(number, content)
    }

    pub(crate) fn ballot_deleted(
        &mut self,
        bundle: BundleId,
        number: BallotNumber,
    ) -> TallyResult<()> {
        self.bundle_mut(bundle)?.delete_ballot(number)
    }

    fn check_ballot_refs(&self, content: &BallotContent) -> TallyResult<()> {
        for cid in &content.candidates {
            if !self.candidates.contains_key(cid) {
                return Err(TallyError::CandidateNotFound { id: *cid });
            }
        }
        for (qid, _) in &content.answers {
            if !self.answers.contains_key(qid) {
                return Err(TallyError::QuestionNotFound { id: *qid });
            }
        }
        Ok(())
    }

    pub(crate) fn bundle_submission_finished(
        &mut self,
        id: BundleId,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<()> {
        self.bundle_mut(id)?.submission_finished(actor, ts)
    }

    pub(crate) fn bundle_correction_finished(
        &mut self,
        id: BundleId,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<()> {
        self.bundle_mut(id)?.correction_finished(actor, ts)
    }

    pub(crate) fn bundle_review_rejected(
        &mut self,
        id: BundleId,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<()> {
        self.bundle_mut(id)?.review_rejected(actor, ts)
    }

    pub(crate) fn bundle_review_succeeded(
        &mut self,
        id: BundleId,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<()> {
        let delta = self.bundle_mut(id)?.review_succeeded(actor, ts)?;
        self.apply_fold(&delta, DeltaFactor::Apply)?;
        self.bundles_not_reviewed_or_deleted -= 1;
        Ok(())
    }

    pub(crate) fn bundle_deleted(
        &mut self,
        id: BundleId,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<()> {
        let was_counted = {
            let bundle = self.bundle_mut(id)?;
            bundle.state() == BundleState::Reviewed
        };
        let delta = self.bundle_mut(id)?.delete(actor, ts)?;
        if let Some(delta) = delta {
            self.apply_fold(&delta, DeltaFactor::Revert)?;
        }
        if !was_counted {
            // A reviewed bundle already left the gauge on review.
            self.bundles_not_reviewed_or_deleted -= 1;
        }
        Ok(())
    }

    pub(crate) fn bundle_reset_to_submission_finished(
        &mut self,
        id: BundleId,
        actor: &Actor,
        ts: Timestamp,
    ) -> TallyResult<()> {
        let delta = self.bundle_mut(id)?.reset_to_submission_finished(actor, ts)?;
        self.apply_fold(&delta, DeltaFactor::Revert)?;
        self.bundles_not_reviewed_or_deleted += 1;
        Ok(())
    }

    /// Folds a bundle delta into the conventional channel. The single entry
    /// point for both directions: review folds in, delete/reset fold out.
    fn apply_fold(&mut self, delta: &FoldDelta, factor: DeltaFactor) -> TallyResult<()> {
        let f = factor.signed();
        self.subtotal_mut(DataSource::Conventional)?
            .apply(&delta.subtotal, factor)?;
        for (cid, d) in &delta.candidate_votes {
            let counts = self
                .candidates
                .get_mut(cid)
                .ok_or(TallyError::CandidateNotFound { id: *cid })?
                .counts
                .entry(DataSource::Conventional)
                .or_default();
            counts.votes.apply(f * d, "candidate_votes")?;
        }
        for (qid, (yes, no, unspecified)) in &delta.answers {
            let counts = self
                .answers
                .get_mut(qid)
                .ok_or(TallyError::QuestionNotFound { id: *qid })?
                .counts
                .entry(DataSource::Conventional)
                .or_default();
            counts.yes.apply(f * yes, "answer_yes")?;
            counts.no.apply(f * no, "answer_no")?;
            counts.unspecified.apply(f * unspecified, "answer_unspecified")?;
        }
        Ok(())
    }

    // ****** Write-in handlers ******

    fn electronic(source: DataSource) -> TallyResult<()> {
        if !source.is_electronic() {
            return Err(TallyError::Invariant {
                message: format!("write-ins cannot arrive through {:?}", source),
            });
        }
        Ok(())
    }

    /// Replaces the snapshot of an electronic source: reverts the previous
    /// write-in contribution, moves the per-source counters by the snapshot
    /// difference, and swaps in the freshly discovered (unmapped) write-ins.
    pub(crate) fn write_ins_imported(
        &mut self,
        source: DataSource,
        counts: ImportCounts,
        ballots: Vec<ImportedBallot>,
        write_ins: Vec<DiscoveredWriteIn>,
    ) -> TallyResult<()> {
        Self::electronic(source)?;
        for (cid, _) in &counts.candidate_votes {
            if !self.candidates.contains_key(cid) {
                return Err(TallyError::CandidateNotFound { id: *cid });
            }
        }
        for (qid, ..) in &counts.answer_counts {
            if !self.answers.contains_key(qid) {
                return Err(TallyError::QuestionNotFound { id: *qid });
            }
        }
        for b in &ballots {
            for cid in &b.candidates {
                if !self.candidates.contains_key(cid) {
                    return Err(TallyError::CandidateNotFound { id: *cid });
                }
            }
        }
        let ballot_ids: HashSet<ImportedBallotId> = ballots.iter().map(|b| b.id).collect();
        for w in &write_ins {
            for (_, bid) in &w.positions {
                if !ballot_ids.contains(bid) {
                    return Err(TallyError::ImportedBallotNotFound { id: *bid });
                }
            }
        }

        self.unmapped_gauge_begin(source);

        // Undo whatever the previous import's mappings had applied.
        let old = self.imports.entry(source).or_default();
        let reverted = write_ins::contribution(&old.mappings, &old.ballots)?;
        let subtotal = self
            .subtotals
            .get_mut(&source)
            .ok_or(TallyError::Invariant {
                message: format!("no subtotal for source {:?}", source),
            })?;
        let candidates = &mut self.candidates;
        write_ins::apply_delta(
            subtotal,
            &mut |cid, d, is_write_in| {
                let counts = candidates
                    .get_mut(&cid)
                    .ok_or(TallyError::CandidateNotFound { id: cid })?
                    .counts
                    .entry(source)
                    .or_default();
                if is_write_in {
                    counts.write_in_votes.apply(d, "candidate_write_in_votes")
                } else {
                    counts.votes.apply(d, "candidate_votes")
                }
            },
            &reverted,
            DeltaFactor::Revert,
        )?;

        // Move the counters from the old snapshot to the new one, as one
        // explicit delta through the normal add path.
        let old_counts = old.counts.clone();
        let snapshot_delta = SubTotalDelta {
            received_ballots: diff(
                old_counts.received_ballots,
                counts.received_ballots,
                "received_ballots",
            )?,
            blank_ballots: diff(old_counts.blank_ballots, counts.blank_ballots, "blank_ballots")?,
            invalid_ballots: diff(
                old_counts.invalid_ballots,
                counts.invalid_ballots,
                "invalid_ballots",
            )?,
            accounted_ballots: diff(
                old_counts.accounted_ballots,
                counts.accounted_ballots,
                "accounted_ballots",
            )?,
            detailed_entered_ballots: 0,
            individual_votes: diff(
                old_counts.individual_votes,
                counts.individual_votes,
                "individual_votes",
            )?,
            empty_votes: diff(old_counts.empty_votes, counts.empty_votes, "empty_votes")?,
            invalid_votes: diff(old_counts.invalid_votes, counts.invalid_votes, "invalid_votes")?,
            candidate_votes: diff(
                old_counts.candidate_votes.iter().map(|(_, v)| v).sum(),
                counts.candidate_votes.iter().map(|(_, v)| v).sum(),
                "candidate_votes",
            )?,
        };
        subtotal.apply(&snapshot_delta, DeltaFactor::Apply)?;

        let old_votes: HashMap<CandidateId, u64> =
            old_counts.candidate_votes.iter().copied().collect();
        let new_votes: HashMap<CandidateId, u64> =
            counts.candidate_votes.iter().copied().collect();
        let all: HashSet<CandidateId> = old_votes.keys().chain(new_votes.keys()).copied().collect();
        for cid in all {
            let d = diff(
                old_votes.get(&cid).copied().unwrap_or(0),
                new_votes.get(&cid).copied().unwrap_or(0),
                "candidate_votes",
            )?;
            self.candidates
                .get_mut(&cid)
                .ok_or(TallyError::CandidateNotFound { id: cid })?
                .counts
                .entry(source)
                .or_default()
                .votes
                .apply(d, "candidate_votes")?;
        }

        // Same union treatment as the candidates: a question absent from the
        // new snapshot goes back to zero.
        let old_answers: HashMap<QuestionId, (u64, u64, u64)> = old_counts
            .answer_counts
            .iter()
            .map(|(q, y, n, u)| (*q, (*y, *n, *u)))
            .collect();
        let new_answers: HashMap<QuestionId, (u64, u64, u64)> = counts
            .answer_counts
            .iter()
            .map(|(q, y, n, u)| (*q, (*y, *n, *u)))
            .collect();
        let all_questions: HashSet<QuestionId> = old_answers
            .keys()
            .chain(new_answers.keys())
            .copied()
            .collect();
        for qid in all_questions {
            let prev = old_answers.get(&qid).copied().unwrap_or((0, 0, 0));
            let next = new_answers.get(&qid).copied().unwrap_or((0, 0, 0));
            let a = self
                .answers
                .get_mut(&qid)
                .ok_or(TallyError::QuestionNotFound { id: qid })?
                .counts
                .entry(source)
                .or_default();
            a.yes.apply(diff(prev.0, next.0, "answer_yes")?, "answer_yes")?;
            a.no.apply(diff(prev.1, next.1, "answer_no")?, "answer_no")?;
            a.unspecified
                .apply(diff(prev.2, next.2, "answer_unspecified")?, "answer_unspecified")?;
        }

        // Old mappings are cleared wholesale, new ones start unresolved.
        let import = self.imports.entry(source).or_default();
        import.counts = counts;
        import.ballots = ballots.into_iter().map(|b| (b.id, b)).collect();
        import.mappings = write_ins.iter().map(WriteInMapping::discovered).collect();
        debug!(
            "write_ins_imported: result {:?} source {:?}: {} mappings, {} ballots",
            self.id,
            source,
            import.mappings.len(),
            import.ballots.len()
        );

        self.unmapped_gauge_end(source);
        Ok(())
    }

    pub(crate) fn write_ins_mapped(
        &mut self,
        source: DataSource,
        updates: &[WriteInMappingUpdate],
    ) -> TallyResult<MappingOutcome> {
        Self::electronic(source)?;
        self.unmapped_gauge_begin(source);

        let known: HashSet<CandidateId> = self.candidates.keys().copied().collect();
        let import = self
            .imports
            .get_mut(&source)
            .ok_or(TallyError::Invariant {
                message: format!("no import for source {:?}", source),
            })?;
        let ImportState {
            mappings, ballots, ..
        } = import;
        let subtotal = self
            .subtotals
            .get_mut(&source)
            .ok_or(TallyError::Invariant {
                message: format!("no subtotal for source {:?}", source),
            })?;
        let candidates = &mut self.candidates;
        let outcome = write_ins::apply_mapping_update(
            mappings,
            ballots,
            subtotal,
            &mut |cid, d, is_write_in| {
                let counts = candidates
                    .get_mut(&cid)
                    .ok_or(TallyError::CandidateNotFound { id: cid })?
                    .counts
                    .entry(source)
                    .or_default();
                if is_write_in {
                    counts.write_in_votes.apply(d, "candidate_write_in_votes")
                } else {
                    counts.votes.apply(d, "candidate_votes")
                }
            },
            &known,
            &self.canton,
            updates,
        )?;

        self.unmapped_gauge_end(source);
        Ok(outcome)
    }

    pub(crate) fn write_ins_reset(&mut self, source: DataSource) -> TallyResult<()> {
        Self::electronic(source)?;
        self.unmapped_gauge_begin(source);

        let import = self
            .imports
            .get_mut(&source)
            .ok_or(TallyError::Invariant {
                message: format!("no import for source {:?}", source),
            })?;
        let ImportState {
            mappings, ballots, ..
        } = import;
        let subtotal = self
            .subtotals
            .get_mut(&source)
            .ok_or(TallyError::Invariant {
                message: format!("no subtotal for source {:?}", source),
            })?;
        let candidates = &mut self.candidates;
        write_ins::reset_mappings(mappings, ballots, subtotal, &mut |cid, d, is_write_in| {
            let counts = candidates
                .get_mut(&cid)
                .ok_or(TallyError::CandidateNotFound { id: cid })?
                .counts
                .entry(source)
                .or_default();
            if is_write_in {
                counts.write_in_votes.apply(d, "candidate_write_in_votes")
            } else {
                counts.votes.apply(d, "candidate_votes")
            }
        })?;

        self.unmapped_gauge_end(source);
        Ok(())
    }

    // ****** Unmapped write-in gauge ******

    /// First half of the decrement-then-recheck-then-increment pattern: the
    /// source's unresolved state is about to be re-evaluated, take it out of
    /// the gauge if it is currently counted.
    fn unmapped_gauge_begin(&mut self, source: DataSource) {
        if self.has_unmapped(source) {
            *self.unmapped_write_ins.entry(source).or_insert(0) -= 1;
            self.mirror_gauge();
        }
    }

    /// Second half: re-check after the mutation and count the source again
    /// if it still (or now) has unresolved write-ins.
    fn unmapped_gauge_end(&mut self, source: DataSource) {
        if self.has_unmapped(source) {
            *self.unmapped_write_ins.entry(source).or_insert(0) += 1;
            self.mirror_gauge();
        }
    }

    fn has_unmapped(&self, source: DataSource) -> bool {
        self.imports
            .get(&source)
            .map(|i| write_ins::has_unspecified(&i.mappings))
            .unwrap_or(false)
    }

    fn mirror_gauge(&mut self) {
        self.projection.unmapped_write_in_elections = self.unmapped_write_ins.values().sum();
    }

    // ****** Result state machine ******

    fn transition(
        &mut self,
        allowed_from: &[ResultState],
        to: ResultState,
        ts: Timestamp,
    ) -> TallyResult<()> {
        if !allowed_from.contains(&self.state) {
            return Err(TallyError::InvalidResultTransition {
                from: self.state,
                to,
            });
        }
        debug!("result {:?}: {:?} -> {:?}", self.id, self.state, to);
        self.state = to;
        self.state_log.push((to, ts));
        Ok(())
    }

    pub(crate) fn submission_finished(&mut self, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[ResultState::SubmissionOngoing],
            ResultState::SubmissionDone,
            ts,
        )
    }

    pub(crate) fn flagged_for_correction(&mut self, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[ResultState::SubmissionDone],
            ResultState::ReadyForCorrection,
            ts,
        )
    }

    pub(crate) fn correction_finished(&mut self, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[ResultState::ReadyForCorrection],
            ResultState::SubmissionDone,
            ts,
        )
    }

    pub(crate) fn audited_tentatively(&mut self, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[ResultState::SubmissionDone],
            ResultState::AuditedTentatively,
            ts,
        )
    }

    pub(crate) fn plausibilised(&mut self, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[ResultState::AuditedTentatively],
            ResultState::Plausibilised,
            ts,
        )
    }

    pub(crate) fn reset_to_submission_ongoing(&mut self, ts: Timestamp) -> TallyResult<()> {
        self.transition(
            &[
                ResultState::SubmissionDone,
                ResultState::ReadyForCorrection,
                ResultState::AuditedTentatively,
                ResultState::Plausibilised,
            ],
            ResultState::SubmissionOngoing,
            ts,
        )
    }

    pub(crate) fn set_published(&mut self, published: bool) -> TallyResult<()> {
        if published
            && !matches!(
                self.state,
                ResultState::AuditedTentatively | ResultState::Plausibilised
            )
        {
            return Err(TallyError::Invariant {
                message: format!("cannot publish a result in state {:?}", self.state),
            });
        }
        self.published = published;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: Timestamp = Timestamp(42);

    fn actor() -> Actor {
        Actor("typist".to_string())
    }

    fn election_result() -> CountingCircleResult {
        CountingCircleResult::new(
            ResultId("bus-1/cc-22".to_string()),
            CantonSettings::DEFAULT,
            &[CandidateId(1), CandidateId(2)],
            &[],
            TS,
        )
    }

    fn entered_ballot(candidates: &[u32]) -> BallotContent {
        BallotContent {
            candidates: candidates.iter().map(|c| CandidateId(*c)).collect(),
            ..BallotContent::default()
        }
    }

    fn reviewed_bundle(result: &mut CountingCircleResult, id: u64, ballots: u32) {
        result
            .bundle_created(BundleId(id), BundleNumber(id as u32), &actor(), TS)
            .unwrap();
        for i in 0..ballots {
            result
                .ballot_created(BundleId(id), BallotNumber(i + 1), entered_ballot(&[1]))
                .unwrap();
        }
        result
            .bundle_submission_finished(BundleId(id), &actor(), TS)
            .unwrap();
        result
            .bundle_review_succeeded(BundleId(id), &actor(), TS)
            .unwrap();
    }

    fn import(result: &mut CountingCircleResult, write_ins: Vec<DiscoveredWriteIn>) {
        result
            .write_ins_imported(
                DataSource::EVoting,
                ImportCounts {
                    received_ballots: 50,
                    accounted_ballots: 50,
                    candidate_votes: vec![(CandidateId(1), 30), (CandidateId(2), 20)],
                    ..ImportCounts::default()
                },
                vec![ImportedBallot {
                    id: ImportedBallotId(1),
                    candidates: vec![CandidateId(1)],
                    empty_votes: 0,
                    invalid_votes: 0,
                }],
                write_ins,
            )
            .unwrap();
    }

    fn one_write_in() -> Vec<DiscoveredWriteIn> {
        vec![DiscoveredWriteIn {
            id: WriteInMappingId(7),
            name: "J. Smith".to_string(),
            vote_count: 1,
            positions: vec![(BallotPositionId(1), ImportedBallotId(1))],
        }]
    }

    #[test]
    fn review_folds_in_and_moves_the_bundle_gauge() {
        // Scenario A: 2 ballots, submission finished, review succeeded.
        let mut result = election_result();
        result
            .bundle_created(BundleId(1), BundleNumber(1), &actor(), TS)
            .unwrap();
        assert_eq!(result.count_of_bundles_not_reviewed_or_deleted(), 1);
        result
            .ballot_created(BundleId(1), BallotNumber(1), entered_ballot(&[1]))
            .unwrap();
        result
            .ballot_created(BundleId(1), BallotNumber(2), entered_ballot(&[2]))
            .unwrap();
        result
            .bundle_submission_finished(BundleId(1), &actor(), TS)
            .unwrap();
        result
            .bundle_review_succeeded(BundleId(1), &actor(), TS)
            .unwrap();

        assert_eq!(result.count_of_bundles_not_reviewed_or_deleted(), 0);
        let conventional = result.subtotal(DataSource::Conventional);
        assert_eq!(conventional.detailed_entered_ballots.get(), 2);
        assert_eq!(
            result
                .candidate(CandidateId(1))
                .unwrap()
                .by_source(DataSource::Conventional)
                .votes
                .get(),
            1
        );
    }

    #[test]
    fn deleting_a_reviewed_bundle_removes_exactly_its_contribution() {
        let mut result = election_result();
        reviewed_bundle(&mut result, 1, 2);
        let before = result.totals();
        reviewed_bundle(&mut result, 2, 3);
        result.bundle_deleted(BundleId(2), &actor(), TS).unwrap();
        assert_eq!(result.totals(), before);
        assert_eq!(result.count_of_bundles_not_reviewed_or_deleted(), 0);
    }

    #[test]
    fn deleting_an_unreviewed_bundle_changes_no_totals() {
        let mut result = election_result();
        let before = result.totals();
        result
            .bundle_created(BundleId(1), BundleNumber(1), &actor(), TS)
            .unwrap();
        result
            .ballot_created(BundleId(1), BallotNumber(1), entered_ballot(&[1]))
            .unwrap();
        result.bundle_deleted(BundleId(1), &actor(), TS).unwrap();
        assert_eq!(result.totals(), before);
        assert_eq!(result.count_of_bundles_not_reviewed_or_deleted(), 0);
    }

    #[test]
    fn bundle_reset_unfolds_and_refolds() {
        let mut result = election_result();
        reviewed_bundle(&mut result, 1, 4);
        let folded = result.totals();
        result
            .bundle_reset_to_submission_finished(BundleId(1), &actor(), TS)
            .unwrap();
        assert_eq!(
            result
                .subtotal(DataSource::Conventional)
                .detailed_entered_ballots
                .get(),
            0
        );
        assert_eq!(result.count_of_bundles_not_reviewed_or_deleted(), 1);
        result
            .bundle_review_succeeded(BundleId(1), &actor(), TS)
            .unwrap();
        assert_eq!(result.totals(), folded);
    }

    #[test]
    fn import_replaces_the_snapshot_by_delta() {
        let mut result = election_result();
        import(&mut result, vec![]);
        assert_eq!(result.subtotal(DataSource::EVoting).received_ballots.get(), 50);
        assert_eq!(result.totals().subtotal.candidate_votes.get(), 50);

        // A re-delivery with corrected numbers fully supersedes the first.
        result
            .write_ins_imported(
                DataSource::EVoting,
                ImportCounts {
                    received_ballots: 40,
                    accounted_ballots: 40,
                    candidate_votes: vec![(CandidateId(1), 40)],
                    ..ImportCounts::default()
                },
                vec![],
                vec![],
            )
            .unwrap();
        assert_eq!(result.subtotal(DataSource::EVoting).received_ballots.get(), 40);
        assert_eq!(
            result.candidate(CandidateId(1)).unwrap().total_votes(),
            40
        );
        assert_eq!(result.candidate(CandidateId(2)).unwrap().total_votes(), 0);
    }

    #[test]
    fn reimport_clears_answers_missing_from_the_new_snapshot() {
        let mut result = CountingCircleResult::new(
            ResultId("vote-1/cc-3".to_string()),
            CantonSettings::DEFAULT,
            &[],
            &[QuestionId(1)],
            TS,
        );
        result
            .write_ins_imported(
                DataSource::EVoting,
                ImportCounts {
                    received_ballots: 10,
                    accounted_ballots: 10,
                    answer_counts: vec![(QuestionId(1), 5, 3, 2)],
                    ..ImportCounts::default()
                },
                vec![],
                vec![],
            )
            .unwrap();
        assert_eq!(result.totals().answers, vec![(QuestionId(1), 5, 3, 2)]);

        // The corrected delivery no longer reports the question at all: its
        // per-source counts go back to zero with the rest of the snapshot.
        result
            .write_ins_imported(
                DataSource::EVoting,
                ImportCounts::default(),
                vec![],
                vec![],
            )
            .unwrap();
        assert_eq!(result.totals().answers, vec![(QuestionId(1), 0, 0, 0)]);
    }

    #[test]
    fn import_rejects_positions_on_unknown_ballots() {
        let mut result = election_result();
        // one_write_in() carries a position on imported ballot 1, which the
        // delivery below does not contain.
        let err = result
            .write_ins_imported(
                DataSource::EVoting,
                ImportCounts::default(),
                vec![],
                one_write_in(),
            )
            .unwrap_err();
        assert!(matches!(err, TallyError::ImportedBallotNotFound { .. }));
    }

    #[test]
    fn unmapped_gauge_tracks_resolution_state() {
        let mut result = election_result();
        assert_eq!(result.unmapped_write_in_count(DataSource::EVoting), 0);

        import(&mut result, one_write_in());
        assert_eq!(result.unmapped_write_in_count(DataSource::EVoting), 1);
        assert_eq!(result.projection().unmapped_write_in_elections, 1);

        // Resolving flips the gauge exactly once, however often we remap.
        for target in [
            WriteInTarget::Individual,
            WriteInTarget::Empty,
            WriteInTarget::Candidate(CandidateId(2)),
        ] {
            result
                .write_ins_mapped(
                    DataSource::EVoting,
                    &[WriteInMappingUpdate {
                        mapping: WriteInMappingId(7),
                        target,
                    }],
                )
                .unwrap();
            assert_eq!(result.unmapped_write_in_count(DataSource::EVoting), 0);
            assert_eq!(result.projection().unmapped_write_in_elections, 0);
        }

        result.write_ins_reset(DataSource::EVoting).unwrap();
        assert_eq!(result.unmapped_write_in_count(DataSource::EVoting), 1);
        assert_eq!(result.projection().unmapped_write_in_elections, 1);
    }

    #[test]
    fn mapping_to_candidate_lands_in_the_write_in_sub_field() {
        let mut result = election_result();
        import(&mut result, one_write_in());
        result
            .write_ins_mapped(
                DataSource::EVoting,
                &[WriteInMappingUpdate {
                    mapping: WriteInMappingId(7),
                    target: WriteInTarget::Candidate(CandidateId(2)),
                }],
            )
            .unwrap();
        let c2 = result
            .candidate(CandidateId(2))
            .unwrap()
            .by_source(DataSource::EVoting);
        assert_eq!(c2.votes.get(), 20);
        assert_eq!(c2.write_in_votes.get(), 1);
        assert_eq!(result.subtotal(DataSource::EVoting).candidate_votes.get(), 51);

        // Remapping to individual restores the candidate and moves the vote.
        result
            .write_ins_mapped(
                DataSource::EVoting,
                &[WriteInMappingUpdate {
                    mapping: WriteInMappingId(7),
                    target: WriteInTarget::Individual,
                }],
            )
            .unwrap();
        let c2 = result
            .candidate(CandidateId(2))
            .unwrap()
            .by_source(DataSource::EVoting);
        assert_eq!(c2.write_in_votes.get(), 0);
        assert_eq!(result.subtotal(DataSource::EVoting).individual_votes.get(), 1);
    }

    #[test]
    fn state_machine_records_timestamps() {
        let mut result = election_result();
        result.submission_finished(Timestamp(10)).unwrap();
        result.flagged_for_correction(Timestamp(20)).unwrap();
        result.correction_finished(Timestamp(30)).unwrap();
        result.audited_tentatively(Timestamp(40)).unwrap();
        result.set_published(true).unwrap();
        result.plausibilised(Timestamp(50)).unwrap();
        assert!(result.published());
        assert_eq!(
            result.state_log().last(),
            Some(&(ResultState::Plausibilised, Timestamp(50)))
        );

        let err = result.audited_tentatively(Timestamp(60)).unwrap_err();
        assert!(matches!(err, TallyError::InvalidResultTransition { .. }));
    }

    #[test]
    fn publish_requires_an_audited_result() {
        let mut result = election_result();
        let err = result.set_published(true).unwrap_err();
        assert!(matches!(err, TallyError::Invariant { .. }));
    }

    #[test]
    fn vote_answers_fold_per_question() {
        let mut result = CountingCircleResult::new(
            ResultId("vote-1/cc-3".to_string()),
            CantonSettings::DEFAULT,
            &[],
            &[QuestionId(1)],
            TS,
        );
        result
            .bundle_created(BundleId(1), BundleNumber(1), &actor(), TS)
            .unwrap();
        result
            .ballot_created(
                BundleId(1),
                BallotNumber(1),
                BallotContent {
                    answers: vec![(QuestionId(1), BallotAnswer::Yes)],
                    ..BallotContent::default()
                },
            )
            .unwrap();
        result
            .bundle_submission_finished(BundleId(1), &actor(), TS)
            .unwrap();
        result
            .bundle_review_succeeded(BundleId(1), &actor(), TS)
            .unwrap();
        let totals = result.totals();
        assert_eq!(totals.answers, vec![(QuestionId(1), 1, 0, 0)]);
    }
}
