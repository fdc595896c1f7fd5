mod bundle;
mod config;
pub mod manual;
mod result;
mod subtotal;
mod write_ins;

use std::collections::HashMap;

use log::{debug, error, warn};

pub use crate::bundle::{Bundle, BundleLogEntry, FoldDelta};
pub use crate::config::*;
pub use crate::result::{
    AnswerCounts, AnswerResult, CandidateResult, CandidateSubTotal, CountingCircleResult,
    SimplifiedProjection, TotalsSnapshot,
};
pub use crate::subtotal::{Count, DeltaFactor, SubTotal, SubTotalDelta};
pub use crate::write_ins::{BallotPosition, MappingOutcome, WriteInMapping};

/// The event processor: consumes the ordered event stream and maintains one
/// [`CountingCircleResult`] per result id.
///
/// Events apply all-or-nothing. A failing event returns the error and leaves
/// both the addressed result and the committed sequence position untouched,
/// so the caller can resubmit the stream from the same position after fixing
/// the input.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct TallyProcessor {
    last_sequence: Option<u64>,
    results: HashMap<ResultId, CountingCircleResult>,
}

impl TallyProcessor {
    pub fn new() -> TallyProcessor {
        TallyProcessor::default()
    }

    pub fn result(&self, id: &ResultId) -> Option<&CountingCircleResult> {
        self.results.get(id)
    }

    /// All results, ordered by id.
    pub fn results(&self) -> Vec<&CountingCircleResult> {
        let mut all: Vec<&CountingCircleResult> = self.results.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// The sequence position of the last committed event.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Applies one event. The sequence must be strictly after the last
    /// committed one; anything else indicates a broken delivery pipeline and
    /// is fatal rather than reordered or skipped.
    pub fn apply(&mut self, event: &Event) -> TallyResult<EventOutcome> {
        if let Some(last) = self.last_sequence {
            if event.sequence <= last {
                error!(
                    "apply: event sequence {} arrived after {} was committed",
                    event.sequence, last
                );
                return Err(TallyError::OrderingViolation {
                    sequence: event.sequence,
                    last,
                });
            }
        }
        debug!("apply: seq {} {:?}", event.sequence, event.body.result_id());
        let outcome = self.dispatch(event)?;
        self.last_sequence = Some(event.sequence);
        Ok(outcome)
    }

    fn dispatch(&mut self, event: &Event) -> TallyResult<EventOutcome> {
        let rid = event.body.result_id();
        let mut outcome = EventOutcome::new(event.sequence, rid);

        if let EventBody::ResultDefined {
            result,
            canton,
            candidates,
            questions,
        } = &event.body
        {
            if self.results.contains_key(result) {
                return Err(TallyError::ResultAlreadyDefined {
                    id: result.0.clone(),
                });
            }
            self.results.insert(
                result.clone(),
                CountingCircleResult::new(
                    result.clone(),
                    *canton,
                    candidates,
                    questions,
                    event.timestamp,
                ),
            );
            return Ok(outcome);
        }

        // Deleting a bundle that is already gone is the one benign overlap
        // between user action and automated cleanup: acknowledge and move on.
        if let EventBody::BundleDeleted { result, bundle } = &event.body {
            let already_gone = self
                .results
                .get(result)
                .and_then(|r| r.bundle(*bundle))
                .map(|b| b.state() == BundleState::Deleted)
                .unwrap_or(false);
            if already_gone {
                warn!(
                    "apply: bundle {:?} of result {:?} already deleted, ignoring",
                    bundle, result
                );
                outcome.bundle = Some(*bundle);
                return Ok(outcome);
            }
        }

        let stored = self
            .results
            .get(rid)
            .ok_or_else(|| TallyError::ResultNotFound { id: rid.0.clone() })?;
        // All mutations land on a draft. It replaces the stored result only
        // when the whole event succeeded.
        let mut draft = stored.clone();
        let actor = &event.actor;
        let ts = event.timestamp;

        match &event.body {
            // Handled before the draft is taken.
            EventBody::ResultDefined { .. } => {}

            EventBody::BundleCreated { bundle, number, .. } => {
                draft.bundle_created(*bundle, *number, actor, ts)?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BallotCreated {
                bundle,
                number,
                content,
                ..
            } => {
                draft.ballot_created(*bundle, *number, content.clone())?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BallotUpdated {
                bundle,
                number,
                content,
                ..
            } => {
                draft.ballot_updated(*bundle, *number, content.clone())?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BallotDeleted { bundle, number, .. } => {
                draft.ballot_deleted(*bundle, *number)?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BundleSubmissionFinished { bundle, .. } => {
                draft.bundle_submission_finished(*bundle, actor, ts)?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BundleCorrectionFinished { bundle, .. } => {
                draft.bundle_correction_finished(*bundle, actor, ts)?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BundleReviewSucceeded { bundle, .. } => {
                draft.bundle_review_succeeded(*bundle, actor, ts)?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BundleReviewRejected { bundle, .. } => {
                draft.bundle_review_rejected(*bundle, actor, ts)?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BundleDeleted { bundle, .. } => {
                draft.bundle_deleted(*bundle, actor, ts)?;
                outcome.bundle = Some(*bundle);
            }
            EventBody::BundleResetToSubmissionFinished { bundle, .. } => {
                draft.bundle_reset_to_submission_finished(*bundle, actor, ts)?;
                outcome.bundle = Some(*bundle);
            }

            EventBody::WriteInsImported {
                source,
                counts,
                ballots,
                write_ins,
                ..
            } => {
                draft.write_ins_imported(
                    *source,
                    counts.clone(),
                    ballots.clone(),
                    write_ins.clone(),
                )?;
            }
            EventBody::WriteInsMapped {
                source, updates, ..
            } => {
                let mapped = draft.write_ins_mapped(*source, updates)?;
                outcome.duplicate_downgrades = mapped.duplicate_downgrades;
                outcome.invalid_ballot_cascades = mapped.invalid_ballot_cascades;
            }
            EventBody::WriteInsReset { source, .. } => {
                draft.write_ins_reset(*source)?;
            }

            EventBody::ResultSubmissionFinished { .. } => draft.submission_finished(ts)?,
            EventBody::ResultFlaggedForCorrection { .. } => draft.flagged_for_correction(ts)?,
            EventBody::ResultCorrectionFinished { .. } => draft.correction_finished(ts)?,
            EventBody::ResultAuditedTentatively { .. } => draft.audited_tentatively(ts)?,
            EventBody::ResultPlausibilised { .. } => draft.plausibilised(ts)?,
            EventBody::ResultResetToSubmissionFinished { .. } => {
                draft.reset_to_submission_ongoing(ts)?
            }
            EventBody::ResultPublished { .. } => draft.set_published(true)?,
            EventBody::ResultUnpublished { .. } => draft.set_published(false)?,
        }

        self.results.insert(rid.clone(), draft);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: u64, body: EventBody) -> Event {
        Event {
            sequence,
            actor: Actor("typist".to_string()),
            timestamp: Timestamp(sequence as i64 * 1000),
            body,
        }
    }

    fn rid() -> ResultId {
        ResultId("bus-1/cc-22".to_string())
    }

    fn defined() -> EventBody {
        EventBody::ResultDefined {
            result: rid(),
            canton: CantonSettings::DEFAULT,
            candidates: vec![CandidateId(1), CandidateId(2)],
            questions: vec![],
        }
    }

    fn ballot(candidates: &[u32]) -> BallotContent {
        BallotContent {
            candidates: candidates.iter().map(|c| CandidateId(*c)).collect(),
            ..BallotContent::default()
        }
    }

    /// A result with one reviewed two-ballot bundle, committed up to seq 6.
    fn processor_with_reviewed_bundle() -> TallyProcessor {
        let mut p = TallyProcessor::new();
        p.apply(&event(1, defined())).unwrap();
        p.apply(&event(
            2,
            EventBody::BundleCreated {
                result: rid(),
                bundle: BundleId(1),
                number: BundleNumber(1),
            },
        ))
        .unwrap();
        p.apply(&event(
            3,
            EventBody::BallotCreated {
                result: rid(),
                bundle: BundleId(1),
                number: BallotNumber(1),
                content: ballot(&[1]),
            },
        ))
        .unwrap();
        p.apply(&event(
            4,
            EventBody::BallotCreated {
                result: rid(),
                bundle: BundleId(1),
                number: BallotNumber(2),
                content: ballot(&[2]),
            },
        ))
        .unwrap();
        p.apply(&event(
            5,
            EventBody::BundleSubmissionFinished {
                result: rid(),
                bundle: BundleId(1),
            },
        ))
        .unwrap();
        p.apply(&event(
            6,
            EventBody::BundleReviewSucceeded {
                result: rid(),
                bundle: BundleId(1),
            },
        ))
        .unwrap();
        p
    }

    #[test]
    fn out_of_order_sequence_is_fatal() {
        let mut p = TallyProcessor::new();
        p.apply(&event(5, defined())).unwrap();
        let err = p
            .apply(&event(
                5,
                EventBody::ResultSubmissionFinished { result: rid() },
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            TallyError::OrderingViolation {
                sequence: 5,
                last: 5
            }
        ));
        let err = p
            .apply(&event(
                3,
                EventBody::ResultSubmissionFinished { result: rid() },
            ))
            .unwrap_err();
        assert!(matches!(err, TallyError::OrderingViolation { .. }));
    }

    #[test]
    fn failed_event_changes_nothing_and_can_be_retried() {
        let mut p = TallyProcessor::new();
        p.apply(&event(1, defined())).unwrap();
        p.apply(&event(
            2,
            EventBody::BundleCreated {
                result: rid(),
                bundle: BundleId(1),
                number: BundleNumber(1),
            },
        ))
        .unwrap();
        let before = p.clone();

        // Review straight from InProcess is an invalid transition.
        let err = p
            .apply(&event(
                3,
                EventBody::BundleReviewSucceeded {
                    result: rid(),
                    bundle: BundleId(1),
                },
            ))
            .unwrap_err();
        assert!(matches!(err, TallyError::InvalidBundleTransition { .. }));
        assert_eq!(p, before);

        // The same sequence position is still free for the corrected event.
        p.apply(&event(
            3,
            EventBody::BundleSubmissionFinished {
                result: rid(),
                bundle: BundleId(1),
            },
        ))
        .unwrap();
        assert_eq!(p.last_sequence(), Some(3));
    }

    #[test]
    fn unknown_result_is_fatal() {
        let mut p = TallyProcessor::new();
        let err = p
            .apply(&event(
                1,
                EventBody::ResultSubmissionFinished { result: rid() },
            ))
            .unwrap_err();
        assert!(matches!(err, TallyError::ResultNotFound { .. }));
    }

    #[test]
    fn defining_a_result_twice_is_fatal() {
        let mut p = TallyProcessor::new();
        p.apply(&event(1, defined())).unwrap();
        let err = p.apply(&event(2, defined())).unwrap_err();
        assert!(matches!(err, TallyError::ResultAlreadyDefined { .. }));
    }

    #[test]
    fn deleting_an_already_deleted_bundle_is_ignored() {
        let mut p = processor_with_reviewed_bundle();
        let totals_before_delete = p.result(&rid()).unwrap().totals();
        p.apply(&event(
            7,
            EventBody::BundleDeleted {
                result: rid(),
                bundle: BundleId(1),
            },
        ))
        .unwrap();
        let totals = p.result(&rid()).unwrap().totals();
        assert_ne!(totals, totals_before_delete);

        // Redelivered deletion: acknowledged, nothing changes.
        let outcome = p
            .apply(&event(
                8,
                EventBody::BundleDeleted {
                    result: rid(),
                    bundle: BundleId(1),
                },
            ))
            .unwrap();
        assert_eq!(outcome.bundle, Some(BundleId(1)));
        assert_eq!(p.result(&rid()).unwrap().totals(), totals);
        assert_eq!(p.last_sequence(), Some(8));

        // A never-created bundle is not benign.
        let err = p
            .apply(&event(
                9,
                EventBody::BundleDeleted {
                    result: rid(),
                    bundle: BundleId(99),
                },
            ))
            .unwrap_err();
        assert!(matches!(err, TallyError::BundleNotFound { .. }));
    }

    #[test]
    fn mapping_outcome_reports_downgrades_and_cascades() {
        let mut p = TallyProcessor::new();
        p.apply(&event(1, defined())).unwrap();
        p.apply(&event(
            2,
            EventBody::WriteInsImported {
                result: rid(),
                source: DataSource::EVoting,
                counts: ImportCounts {
                    received_ballots: 10,
                    accounted_ballots: 10,
                    candidate_votes: vec![(CandidateId(1), 10)],
                    ..ImportCounts::default()
                },
                ballots: vec![ImportedBallot {
                    id: ImportedBallotId(1),
                    candidates: vec![CandidateId(1)],
                    empty_votes: 0,
                    invalid_votes: 0,
                }],
                write_ins: vec![
                    DiscoveredWriteIn {
                        id: WriteInMappingId(1),
                        name: "Smith".to_string(),
                        vote_count: 1,
                        positions: vec![(BallotPositionId(1), ImportedBallotId(1))],
                    },
                    DiscoveredWriteIn {
                        id: WriteInMappingId(2),
                        name: "J. Smith".to_string(),
                        vote_count: 1,
                        positions: vec![(BallotPositionId(2), ImportedBallotId(1))],
                    },
                ],
            },
        ))
        .unwrap();

        // Both names resolve to candidate 2: the second position on the same
        // ballot is a duplicate and gets downgraded.
        let outcome = p
            .apply(&event(
                3,
                EventBody::WriteInsMapped {
                    result: rid(),
                    source: DataSource::EVoting,
                    updates: vec![
                        WriteInMappingUpdate {
                            mapping: WriteInMappingId(1),
                            target: WriteInTarget::Candidate(CandidateId(2)),
                        },
                        WriteInMappingUpdate {
                            mapping: WriteInMappingId(2),
                            target: WriteInTarget::Candidate(CandidateId(2)),
                        },
                    ],
                },
            ))
            .unwrap();
        assert_eq!(outcome.duplicate_downgrades, 1);
        assert_eq!(outcome.invalid_ballot_cascades, 0);

        let outcome = p
            .apply(&event(
                4,
                EventBody::WriteInsMapped {
                    result: rid(),
                    source: DataSource::EVoting,
                    updates: vec![WriteInMappingUpdate {
                        mapping: WriteInMappingId(1),
                        target: WriteInTarget::InvalidBallot,
                    }],
                },
            ))
            .unwrap();
        assert_eq!(outcome.invalid_ballot_cascades, 1);
    }

    #[test]
    fn results_are_listed_in_id_order() {
        let mut p = TallyProcessor::new();
        for (seq, id) in [(1, "b"), (2, "a"), (3, "c")] {
            p.apply(&event(
                seq,
                EventBody::ResultDefined {
                    result: ResultId(id.to_string()),
                    canton: CantonSettings::DEFAULT,
                    candidates: vec![],
                    questions: vec![],
                },
            ))
            .unwrap();
        }
        let ids: Vec<&str> = p.results().iter().map(|r| r.id.0.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
