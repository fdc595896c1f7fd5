use log::{debug, info, warn};

use tally_engine::*;

use snafu::{prelude::*, Snafu};

use std::fs;

use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::replay::event_reader::*;

#[derive(Debug, Snafu)]
pub enum ReplayError {
    #[snafu(display("Error opening file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing JSON"))]
    ParsingJson { source: serde_json::Error },
    #[snafu(display("Error writing summary to {path}"))]
    WritingSummary {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Event {sequence} was rejected: {source}"))]
    Rejected { source: TallyError, sequence: u64 },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

type ReplayResult<T> = Result<T, ReplayError>;

pub mod event_reader {
    use crate::replay::*;

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct EventFile {
        pub events: Vec<EventRecord>,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct EventRecord {
        pub sequence: u64,
        pub actor: String,
        pub timestamp: i64,
        pub body: EventRecordBody,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub enum SourceRecord {
        #[serde(rename = "eVoting")]
        EVoting,
        #[serde(rename = "eCounting")]
        ECounting,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub enum AnswerRecord {
        #[serde(rename = "yes")]
        Yes,
        #[serde(rename = "no")]
        No,
        #[serde(rename = "unspecified")]
        Unspecified,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
    pub struct BallotRecord {
        pub candidates: Option<Vec<u32>>,
        #[serde(rename = "emptyVotes")]
        pub empty_votes: Option<u64>,
        #[serde(rename = "invalidVotes")]
        pub invalid_votes: Option<u64>,
        #[serde(rename = "individualVotes")]
        pub individual_votes: Option<u64>,
        pub answers: Option<Vec<(u32, AnswerRecord)>>,
        #[serde(rename = "markedForReview")]
        pub marked_for_review: Option<bool>,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum TargetRecord {
        #[serde(rename = "unspecified")]
        Unspecified {},
        #[serde(rename = "candidate")]
        Candidate { candidate: u32 },
        #[serde(rename = "individual")]
        Individual {},
        #[serde(rename = "empty")]
        Empty {},
        #[serde(rename = "invalid")]
        Invalid {},
        #[serde(rename = "invalidBallot")]
        InvalidBallot {},
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
    pub struct ImportCountsRecord {
        #[serde(rename = "receivedBallots")]
        pub received_ballots: Option<u64>,
        #[serde(rename = "blankBallots")]
        pub blank_ballots: Option<u64>,
        #[serde(rename = "invalidBallots")]
        pub invalid_ballots: Option<u64>,
        #[serde(rename = "accountedBallots")]
        pub accounted_ballots: Option<u64>,
        #[serde(rename = "individualVotes")]
        pub individual_votes: Option<u64>,
        #[serde(rename = "emptyVotes")]
        pub empty_votes: Option<u64>,
        #[serde(rename = "invalidVotes")]
        pub invalid_votes: Option<u64>,
        #[serde(rename = "candidateVotes")]
        pub candidate_votes: Option<Vec<(u32, u64)>>,
        #[serde(rename = "answerCounts")]
        pub answer_counts: Option<Vec<(u32, u64, u64, u64)>>,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct ImportedBallotRecord {
        pub id: u64,
        pub candidates: Option<Vec<u32>>,
        #[serde(rename = "emptyVotes")]
        pub empty_votes: Option<u64>,
        #[serde(rename = "invalidVotes")]
        pub invalid_votes: Option<u64>,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct WriteInRecord {
        pub id: u64,
        pub name: String,
        #[serde(rename = "voteCount")]
        pub vote_count: Option<u64>,
        /// (position id, imported ballot id) pairs.
        pub positions: Option<Vec<(u64, u64)>>,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    pub struct MappingUpdateRecord {
        pub mapping: u64,
        pub target: TargetRecord,
    }

    #[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum EventRecordBody {
        #[serde(rename = "resultDefined")]
        ResultDefined {
            result: String,
            #[serde(rename = "supportsInvalidVotes")]
            supports_invalid_votes: Option<bool>,
            candidates: Option<Vec<u32>>,
            questions: Option<Vec<u32>>,
        },
        #[serde(rename = "bundleCreated")]
        BundleCreated {
            result: String,
            bundle: u64,
            number: u32,
        },
        #[serde(rename = "ballotCreated")]
        BallotCreated {
            result: String,
            bundle: u64,
            number: u32,
            content: BallotRecord,
        },
        #[serde(rename = "ballotUpdated")]
        BallotUpdated {
            result: String,
            bundle: u64,
            number: u32,
            content: BallotRecord,
        },
        #[serde(rename = "ballotDeleted")]
        BallotDeleted {
            result: String,
            bundle: u64,
            number: u32,
        },
        #[serde(rename = "bundleSubmissionFinished")]
        BundleSubmissionFinished { result: String, bundle: u64 },
        #[serde(rename = "bundleCorrectionFinished")]
        BundleCorrectionFinished { result: String, bundle: u64 },
        #[serde(rename = "bundleReviewSucceeded")]
        BundleReviewSucceeded { result: String, bundle: u64 },
        #[serde(rename = "bundleReviewRejected")]
        BundleReviewRejected { result: String, bundle: u64 },
        #[serde(rename = "bundleDeleted")]
        BundleDeleted { result: String, bundle: u64 },
        #[serde(rename = "bundleResetToSubmissionFinished")]
        BundleResetToSubmissionFinished { result: String, bundle: u64 },
        #[serde(rename = "writeInsImported")]
        WriteInsImported {
            result: String,
            source: SourceRecord,
            counts: ImportCountsRecord,
            ballots: Option<Vec<ImportedBallotRecord>>,
            #[serde(rename = "writeIns")]
            write_ins: Option<Vec<WriteInRecord>>,
        },
        #[serde(rename = "writeInsMapped")]
        WriteInsMapped {
            result: String,
            source: SourceRecord,
            updates: Vec<MappingUpdateRecord>,
        },
        #[serde(rename = "writeInsReset")]
        WriteInsReset {
            result: String,
            source: SourceRecord,
        },
        #[serde(rename = "resultSubmissionFinished")]
        ResultSubmissionFinished { result: String },
        #[serde(rename = "resultFlaggedForCorrection")]
        ResultFlaggedForCorrection { result: String },
        #[serde(rename = "resultCorrectionFinished")]
        ResultCorrectionFinished { result: String },
        #[serde(rename = "resultAuditedTentatively")]
        ResultAuditedTentatively { result: String },
        #[serde(rename = "resultPlausibilised")]
        ResultPlausibilised { result: String },
        #[serde(rename = "resultResetToSubmissionFinished")]
        ResultResetToSubmissionFinished { result: String },
        #[serde(rename = "resultPublished")]
        ResultPublished { result: String },
        #[serde(rename = "resultUnpublished")]
        ResultUnpublished { result: String },
    }

    pub fn read_events(path: String) -> ReplayResult<EventFile> {
        let contents =
            fs::read_to_string(path.clone()).context(OpeningJsonSnafu { path })?;
        let file: EventFile = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
        debug!("read_events: {} events", file.events.len());
        Ok(file)
    }

    pub fn read_summary(path: String) -> ReplayResult<JSValue> {
        let contents =
            fs::read_to_string(path.clone()).context(OpeningJsonSnafu { path })?;
        let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
        Ok(js)
    }
}

// ****** Conversion from the file records to the engine structures ******

fn convert_source(s: &SourceRecord) -> DataSource {
    match s {
        SourceRecord::EVoting => DataSource::EVoting,
        SourceRecord::ECounting => DataSource::ECounting,
    }
}

fn convert_answer(a: &AnswerRecord) -> BallotAnswer {
    match a {
        AnswerRecord::Yes => BallotAnswer::Yes,
        AnswerRecord::No => BallotAnswer::No,
        AnswerRecord::Unspecified => BallotAnswer::Unspecified,
    }
}

fn convert_target(t: &TargetRecord) -> WriteInTarget {
    match t {
        TargetRecord::Unspecified {} => WriteInTarget::Unspecified,
        TargetRecord::Candidate { candidate } => WriteInTarget::Candidate(CandidateId(*candidate)),
        TargetRecord::Individual {} => WriteInTarget::Individual,
        TargetRecord::Empty {} => WriteInTarget::Empty,
        TargetRecord::Invalid {} => WriteInTarget::Invalid,
        TargetRecord::InvalidBallot {} => WriteInTarget::InvalidBallot,
    }
}

fn convert_content(c: &BallotRecord) -> BallotContent {
    BallotContent {
        candidates: c
            .candidates
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|x| CandidateId(*x))
            .collect(),
        empty_votes: c.empty_votes.unwrap_or(0),
        invalid_votes: c.invalid_votes.unwrap_or(0),
        individual_votes: c.individual_votes.unwrap_or(0),
        answers: c
            .answers
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|(q, a)| (QuestionId(*q), convert_answer(a)))
            .collect(),
        marked_for_review: c.marked_for_review.unwrap_or(false),
    }
}

fn convert_counts(c: &ImportCountsRecord) -> ImportCounts {
    ImportCounts {
        received_ballots: c.received_ballots.unwrap_or(0),
        blank_ballots: c.blank_ballots.unwrap_or(0),
        invalid_ballots: c.invalid_ballots.unwrap_or(0),
        accounted_ballots: c.accounted_ballots.unwrap_or(0),
        individual_votes: c.individual_votes.unwrap_or(0),
        empty_votes: c.empty_votes.unwrap_or(0),
        invalid_votes: c.invalid_votes.unwrap_or(0),
        candidate_votes: c
            .candidate_votes
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|(c, v)| (CandidateId(*c), *v))
            .collect(),
        answer_counts: c
            .answer_counts
            .clone()
            .unwrap_or_default()
            .iter()
            .map(|(q, y, n, u)| (QuestionId(*q), *y, *n, *u))
            .collect(),
    }
}

fn convert_body(body: &EventRecordBody) -> EventBody {
    match body {
        EventRecordBody::ResultDefined {
            result,
            supports_invalid_votes,
            candidates,
            questions,
        } => EventBody::ResultDefined {
            result: ResultId(result.clone()),
            canton: CantonSettings {
                supports_invalid_votes: supports_invalid_votes
                    .unwrap_or(CantonSettings::DEFAULT.supports_invalid_votes),
            },
            candidates: candidates
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|c| CandidateId(*c))
                .collect(),
            questions: questions
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|q| QuestionId(*q))
                .collect(),
        },
        EventRecordBody::BundleCreated {
            result,
            bundle,
            number,
        } => EventBody::BundleCreated {
            result: ResultId(result.clone()),
            bundle: BundleId(*bundle),
            number: BundleNumber(*number),
        },
        EventRecordBody::BallotCreated {
            result,
            bundle,
            number,
            content,
        } => EventBody::BallotCreated {
            result: ResultId(result.clone()),
            bundle: BundleId(*bundle),
            number: BallotNumber(*number),
            content: convert_content(content),
        },
        EventRecordBody::BallotUpdated {
            result,
            bundle,
            number,
            content,
        } => EventBody::BallotUpdated {
            result: ResultId(result.clone()),
            bundle: BundleId(*bundle),
            number: BallotNumber(*number),
            content: convert_content(content),
        },
        EventRecordBody::BallotDeleted {
            result,
            bundle,
            number,
        } => EventBody::BallotDeleted {
            result: ResultId(result.clone()),
            bundle: BundleId(*bundle),
            number: BallotNumber(*number),
        },
        EventRecordBody::BundleSubmissionFinished { result, bundle } => {
            EventBody::BundleSubmissionFinished {
                result: ResultId(result.clone()),
                bundle: BundleId(*bundle),
            }
        }
        EventRecordBody::BundleCorrectionFinished { result, bundle } => {
            EventBody::BundleCorrectionFinished {
                result: ResultId(result.clone()),
                bundle: BundleId(*bundle),
            }
        }
        EventRecordBody::BundleReviewSucceeded { result, bundle } => {
            EventBody::BundleReviewSucceeded {
                result: ResultId(result.clone()),
                bundle: BundleId(*bundle),
            }
        }
        EventRecordBody::BundleReviewRejected { result, bundle } => {
            EventBody::BundleReviewRejected {
                result: ResultId(result.clone()),
                bundle: BundleId(*bundle),
            }
        }
        EventRecordBody::BundleDeleted { result, bundle } => EventBody::BundleDeleted {
            result: ResultId(result.clone()),
            bundle: BundleId(*bundle),
        },
        EventRecordBody::BundleResetToSubmissionFinished { result, bundle } => {
            EventBody::BundleResetToSubmissionFinished {
                result: ResultId(result.clone()),
                bundle: BundleId(*bundle),
            }
        }
        EventRecordBody::WriteInsImported {
            result,
            source,
            counts,
            ballots,
            write_ins,
        } => EventBody::WriteInsImported {
            result: ResultId(result.clone()),
            source: convert_source(source),
            counts: convert_counts(counts),
            ballots: ballots
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|b| ImportedBallot {
                    id: ImportedBallotId(b.id),
                    candidates: b
                        .candidates
                        .clone()
                        .unwrap_or_default()
                        .iter()
                        .map(|c| CandidateId(*c))
                        .collect(),
                    empty_votes: b.empty_votes.unwrap_or(0),
                    invalid_votes: b.invalid_votes.unwrap_or(0),
                })
                .collect(),
            write_ins: write_ins
                .clone()
                .unwrap_or_default()
                .iter()
                .map(|w| DiscoveredWriteIn {
                    id: WriteInMappingId(w.id),
                    name: w.name.clone(),
                    vote_count: w.vote_count.unwrap_or(0),
                    positions: w
                        .positions
                        .clone()
                        .unwrap_or_default()
                        .iter()
                        .map(|(p, b)| (BallotPositionId(*p), ImportedBallotId(*b)))
                        .collect(),
                })
                .collect(),
        },
        EventRecordBody::WriteInsMapped {
            result,
            source,
            updates,
        } => EventBody::WriteInsMapped {
            result: ResultId(result.clone()),
            source: convert_source(source),
            updates: updates
                .iter()
                .map(|u| WriteInMappingUpdate {
                    mapping: WriteInMappingId(u.mapping),
                    target: convert_target(&u.target),
                })
                .collect(),
        },
        EventRecordBody::WriteInsReset { result, source } => EventBody::WriteInsReset {
            result: ResultId(result.clone()),
            source: convert_source(source),
        },
        EventRecordBody::ResultSubmissionFinished { result } => {
            EventBody::ResultSubmissionFinished {
                result: ResultId(result.clone()),
            }
        }
        EventRecordBody::ResultFlaggedForCorrection { result } => {
            EventBody::ResultFlaggedForCorrection {
                result: ResultId(result.clone()),
            }
        }
        EventRecordBody::ResultCorrectionFinished { result } => {
            EventBody::ResultCorrectionFinished {
                result: ResultId(result.clone()),
            }
        }
        EventRecordBody::ResultAuditedTentatively { result } => {
            EventBody::ResultAuditedTentatively {
                result: ResultId(result.clone()),
            }
        }
        EventRecordBody::ResultPlausibilised { result } => EventBody::ResultPlausibilised {
            result: ResultId(result.clone()),
        },
        EventRecordBody::ResultResetToSubmissionFinished { result } => {
            EventBody::ResultResetToSubmissionFinished {
                result: ResultId(result.clone()),
            }
        }
        EventRecordBody::ResultPublished { result } => EventBody::ResultPublished {
            result: ResultId(result.clone()),
        },
        EventRecordBody::ResultUnpublished { result } => EventBody::ResultUnpublished {
            result: ResultId(result.clone()),
        },
    }
}

pub fn convert_event(record: &EventRecord) -> Event {
    Event {
        sequence: record.sequence,
        actor: Actor(record.actor.clone()),
        timestamp: Timestamp(record.timestamp),
        body: convert_body(&record.body),
    }
}

// ****** Summary output ******

fn state_name(state: ResultState) -> &'static str {
    match state {
        ResultState::SubmissionOngoing => "submissionOngoing",
        ResultState::SubmissionDone => "submissionDone",
        ResultState::ReadyForCorrection => "readyForCorrection",
        ResultState::AuditedTentatively => "auditedTentatively",
        ResultState::Plausibilised => "plausibilised",
    }
}

fn bundle_state_name(state: BundleState) -> &'static str {
    match state {
        BundleState::InProcess => "inProcess",
        BundleState::ReadyForReview => "readyForReview",
        BundleState::InCorrection => "inCorrection",
        BundleState::Reviewed => "reviewed",
        BundleState::Deleted => "deleted",
    }
}

fn subtotal_to_json(st: &SubTotal) -> JSValue {
    json!({
        "receivedBallots": st.received_ballots.get(),
        "blankBallots": st.blank_ballots.get(),
        "invalidBallots": st.invalid_ballots.get(),
        "accountedBallots": st.accounted_ballots.get(),
        "detailedEnteredBallots": st.detailed_entered_ballots.get(),
        "individualVotes": st.individual_votes.get(),
        "emptyVotes": st.empty_votes.get(),
        "invalidVotes": st.invalid_votes.get(),
        "candidateVotes": st.candidate_votes.get(),
    })
}

fn result_to_json(result: &CountingCircleResult) -> JSValue {
    let totals = result.totals();
    let candidates: Vec<JSValue> = totals
        .candidates
        .iter()
        .map(|(cid, votes, write_ins)| {
            json!({"candidate": cid.0, "votes": votes, "writeInVotes": write_ins})
        })
        .collect();
    let answers: Vec<JSValue> = totals
        .answers
        .iter()
        .map(|(qid, yes, no, unspecified)| {
            json!({"question": qid.0, "yes": yes, "no": no, "unspecified": unspecified})
        })
        .collect();
    let bundles: Vec<JSValue> = result
        .bundle_states()
        .iter()
        .map(|(id, number, state)| {
            json!({"bundle": id.0, "number": number.0, "state": bundle_state_name(*state)})
        })
        .collect();
    json!({
        "result": result.id.0,
        "state": state_name(result.state()),
        "published": result.published(),
        "totals": subtotal_to_json(&totals.subtotal),
        "candidates": candidates,
        "answers": answers,
        "bundles": bundles,
        "bundlesNotReviewedOrDeleted": result.count_of_bundles_not_reviewed_or_deleted(),
        "unmappedWriteInElections": result.projection().unmapped_write_in_elections,
    })
}

pub fn build_summary_js(processor: &TallyProcessor) -> JSValue {
    let results: Vec<JSValue> = processor.results().iter().map(|r| result_to_json(r)).collect();
    json!({ "results": results })
}

/// Replays a full event log and optionally checks the computed summary
/// against a reference file.
pub fn run_replay(
    events_path: String,
    check_summary_path: Option<String>,
    out_path: Option<String>,
) -> ReplayResult<()> {
    let file = read_events(events_path)?;
    let mut processor = TallyProcessor::new();
    for record in &file.events {
        let event = convert_event(record);
        let outcome = processor
            .apply(&event)
            .context(RejectedSnafu {
                sequence: record.sequence,
            })?;
        debug!("run_replay: {:?}", outcome);
        if outcome.duplicate_downgrades > 0 || outcome.invalid_ballot_cascades > 0 {
            info!(
                "run_replay: event {} downgraded {} duplicate positions, cascaded {} ballots",
                outcome.sequence, outcome.duplicate_downgrades, outcome.invalid_ballot_cascades
            );
        }
    }

    let summary_js = build_summary_js(&processor);
    let pretty_js = serde_json::to_string_pretty(&summary_js).context(ParsingJsonSnafu {})?;
    match out_path {
        Some(path) => {
            fs::write(path.clone(), &pretty_js).context(WritingSummarySnafu { path })?
        }
        None => println!("{}", pretty_js),
    }

    // The reference summary, if provided for comparison
    if let Some(summary_p) = check_summary_path {
        let summary_ref = read_summary(summary_p)?;
        let pretty_js_ref =
            serde_json::to_string_pretty(&summary_ref).context(ParsingJsonSnafu {})?;
        if pretty_js_ref != pretty_js {
            warn!("Found differences with the reference summary");
            print_diff(pretty_js_ref.as_str(), pretty_js.as_str(), "\n");
            whatever!("Difference detected between replayed summary and reference summary")
        }
    }

    Ok(())
}
