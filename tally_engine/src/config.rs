// ********* Input data structures ***********

use snafu::Snafu;

/// Identifier of a result: one per (political business, counting circle).
///
/// The engine treats it as an opaque key handed over by the event log.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd)]
pub struct ResultId(pub String);

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct BundleId(pub u64);

/// Number of a bundle, unique within its result.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct BundleNumber(pub u32);

/// Number of a manually entered ballot, unique within its bundle.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct BallotNumber(pub u32);

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct CandidateId(pub u32);

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct QuestionId(pub u32);

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct WriteInMappingId(pub u64);

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct BallotPositionId(pub u64);

/// Identifier of a ballot delivered by an electronic import.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct ImportedBallotId(pub u64);

/// The channel a partial tally was delivered through.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub enum DataSource {
    /// Manually keyed results, organized into reviewable bundles.
    Conventional,
    EVoting,
    ECounting,
}

impl DataSource {
    pub const ALL: [DataSource; 3] = [
        DataSource::Conventional,
        DataSource::EVoting,
        DataSource::ECounting,
    ];

    /// Electronic sources deliver complete snapshots and may carry write-ins.
    pub fn is_electronic(&self) -> bool {
        *self != DataSource::Conventional
    }
}

/// Where a free-text write-in entry resolves to.
///
/// A `Candidate` target always carries the candidate it maps to, so a mapped
/// candidate without a candidate reference cannot be represented.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum WriteInTarget {
    /// Discovered on import but not resolved yet.
    Unspecified,
    Candidate(CandidateId),
    /// Counted as a vote for an unlisted individual.
    Individual,
    Empty,
    Invalid,
    /// The whole ballot carrying the entry is invalid.
    InvalidBallot,
}

/// Answer on a vote (referendum) ballot for a single question.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum BallotAnswer {
    Yes,
    No,
    Unspecified,
}

/// Cantonal counting rules relevant to the engine.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct CantonSettings {
    /// Whether the canton knows invalid votes. Controls the downgrade target
    /// of duplicate-candidate write-in positions.
    pub supports_invalid_votes: bool,
}

impl CantonSettings {
    pub const DEFAULT: CantonSettings = CantonSettings {
        supports_invalid_votes: true,
    };
}

/// The actor recorded on an event by the upstream authentication layer.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd)]
pub struct Actor(pub String);

/// Event timestamp, recorded verbatim into bundle logs and state transitions.
/// Unix epoch milliseconds.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Ord, PartialOrd)]
pub struct Timestamp(pub i64);

/// Content of one manually entered ballot.
///
/// Election ballots carry candidate selections and empty/invalid/individual
/// positions; vote ballots carry per-question answers. The unused half stays
/// empty.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct BallotContent {
    pub candidates: Vec<CandidateId>,
    pub empty_votes: u64,
    pub invalid_votes: u64,
    pub individual_votes: u64,
    pub answers: Vec<(QuestionId, BallotAnswer)>,
    /// Flagged by the typist for mandatory review.
    pub marked_for_review: bool,
}

/// A ballot delivered by an electronic import, kept for the invalid-ballot
/// cascade of the write-in engine.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ImportedBallot {
    pub id: ImportedBallotId,
    /// Directly selected candidates (write-ins excluded).
    pub candidates: Vec<CandidateId>,
    pub empty_votes: u64,
    pub invalid_votes: u64,
}

/// A free-text write-in name discovered by an import, before resolution.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DiscoveredWriteIn {
    pub id: WriteInMappingId,
    pub name: String,
    /// Aggregate count, used only when no per-ballot positions are known.
    pub vote_count: u64,
    /// Ballot-level occurrences. Authoritative when non-empty.
    pub positions: Vec<(BallotPositionId, ImportedBallotId)>,
}

/// One entry of a write-in mapping update.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct WriteInMappingUpdate {
    pub mapping: WriteInMappingId,
    pub target: WriteInTarget,
}

/// Complete per-source snapshot delivered by an electronic import.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct ImportCounts {
    pub received_ballots: u64,
    pub blank_ballots: u64,
    pub invalid_ballots: u64,
    pub accounted_ballots: u64,
    pub individual_votes: u64,
    pub empty_votes: u64,
    pub invalid_votes: u64,
    /// Direct votes per candidate (write-ins not yet attributed).
    pub candidate_votes: Vec<(CandidateId, u64)>,
    /// Per question: (yes, no, unspecified).
    pub answer_counts: Vec<(QuestionId, u64, u64, u64)>,
}

/// A single event of the ordered stream consumed by the processor.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Event {
    /// Strictly increasing sequence position of the stream.
    pub sequence: u64,
    pub actor: Actor,
    pub timestamp: Timestamp,
    pub body: EventBody,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum EventBody {
    /// Defines a result with its referential data. Must precede all other
    /// events of that result.
    ResultDefined {
        result: ResultId,
        canton: CantonSettings,
        candidates: Vec<CandidateId>,
        questions: Vec<QuestionId>,
    },

    BundleCreated {
        result: ResultId,
        bundle: BundleId,
        number: BundleNumber,
    },
    BallotCreated {
        result: ResultId,
        bundle: BundleId,
        number: BallotNumber,
        content: BallotContent,
    },
    BallotUpdated {
        result: ResultId,
        bundle: BundleId,
        number: BallotNumber,
        content: BallotContent,
    },
    BallotDeleted {
        result: ResultId,
        bundle: BundleId,
        number: BallotNumber,
    },
    BundleSubmissionFinished {
        result: ResultId,
        bundle: BundleId,
    },
    BundleCorrectionFinished {
        result: ResultId,
        bundle: BundleId,
    },
    BundleReviewSucceeded {
        result: ResultId,
        bundle: BundleId,
    },
    BundleReviewRejected {
        result: ResultId,
        bundle: BundleId,
    },
    BundleDeleted {
        result: ResultId,
        bundle: BundleId,
    },
    BundleResetToSubmissionFinished {
        result: ResultId,
        bundle: BundleId,
    },

    WriteInsImported {
        result: ResultId,
        source: DataSource,
        counts: ImportCounts,
        ballots: Vec<ImportedBallot>,
        write_ins: Vec<DiscoveredWriteIn>,
    },
    WriteInsMapped {
        result: ResultId,
        source: DataSource,
        updates: Vec<WriteInMappingUpdate>,
    },
    WriteInsReset {
        result: ResultId,
        source: DataSource,
    },

    ResultSubmissionFinished { result: ResultId },
    ResultFlaggedForCorrection { result: ResultId },
    ResultCorrectionFinished { result: ResultId },
    ResultAuditedTentatively { result: ResultId },
    ResultPlausibilised { result: ResultId },
    ResultResetToSubmissionFinished { result: ResultId },
    ResultPublished { result: ResultId },
    ResultUnpublished { result: ResultId },
}

impl EventBody {
    /// The result the event addresses.
    pub fn result_id(&self) -> &ResultId {
        use EventBody::*;
        match self {
            ResultDefined { result, .. }
            | BundleCreated { result, .. }
            | BallotCreated { result, .. }
            | BallotUpdated { result, .. }
            | BallotDeleted { result, .. }
            | BundleSubmissionFinished { result, .. }
            | BundleCorrectionFinished { result, .. }
            | BundleReviewSucceeded { result, .. }
            | BundleReviewRejected { result, .. }
            | BundleDeleted { result, .. }
            | BundleResetToSubmissionFinished { result, .. }
            | WriteInsImported { result, .. }
            | WriteInsMapped { result, .. }
            | WriteInsReset { result, .. }
            | ResultSubmissionFinished { result }
            | ResultFlaggedForCorrection { result }
            | ResultCorrectionFinished { result }
            | ResultAuditedTentatively { result }
            | ResultPlausibilised { result }
            | ResultResetToSubmissionFinished { result }
            | ResultPublished { result }
            | ResultUnpublished { result } => result,
        }
    }
}

// ******** Output data structures *********

/// States of a ballot bundle.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum BundleState {
    InProcess,
    ReadyForReview,
    InCorrection,
    /// Terminal. The bundle's ballots are folded into the totals.
    Reviewed,
    /// Terminal. Reached from any state; reviewed bundles are folded out first.
    Deleted,
}

/// States of a result, reused across bundle-driven and directly-entered
/// results.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum ResultState {
    SubmissionOngoing,
    SubmissionDone,
    ReadyForCorrection,
    AuditedTentatively,
    Plausibilised,
}

/// Notification emitted after every successful event application.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct EventOutcome {
    pub sequence: u64,
    pub result: ResultId,
    pub bundle: Option<BundleId>,
    /// Duplicate-candidate downgrades performed by a write-in mapping event.
    pub duplicate_downgrades: u32,
    /// Ballots newly cascaded to invalid by a write-in mapping event.
    pub invalid_ballot_cascades: u32,
}

impl EventOutcome {
    pub(crate) fn new(sequence: u64, result: &ResultId) -> EventOutcome {
        EventOutcome {
            sequence,
            result: result.clone(),
            bundle: None,
            duplicate_downgrades: 0,
            invalid_ballot_cascades: 0,
        }
    }
}

// ********* Errors **********

/// Errors that abort the application of a single event.
///
/// The processor performs no partial commits: any of these leaves the stored
/// state fully pre-event.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TallyError {
    #[snafu(display("unknown result {id}"))]
    ResultNotFound { id: String },

    #[snafu(display("result {id} already defined"))]
    ResultAlreadyDefined { id: String },

    #[snafu(display("unknown bundle {id:?}"))]
    BundleNotFound { id: BundleId },

    #[snafu(display("bundle number {number:?} already used"))]
    DuplicateBundleNumber { number: BundleNumber },

    #[snafu(display("unknown ballot {number:?} in bundle {bundle:?}"))]
    BallotNotFound {
        bundle: BundleId,
        number: BallotNumber,
    },

    #[snafu(display("ballot {number:?} already exists in bundle {bundle:?}"))]
    DuplicateBallotNumber {
        bundle: BundleId,
        number: BallotNumber,
    },

    #[snafu(display("unknown candidate {id:?}"))]
    CandidateNotFound { id: CandidateId },

    #[snafu(display("unknown question {id:?}"))]
    QuestionNotFound { id: QuestionId },

    #[snafu(display("unknown write-in mapping {id:?}"))]
    WriteInMappingNotFound { id: WriteInMappingId },

    #[snafu(display("unknown imported ballot {id:?}"))]
    ImportedBallotNotFound { id: ImportedBallotId },

    #[snafu(display("bundle {id:?} cannot go from {from:?} to {to:?}"))]
    InvalidBundleTransition {
        id: BundleId,
        from: BundleState,
        to: BundleState,
    },

    #[snafu(display("ballots of bundle {id:?} are not editable in state {state:?}"))]
    BundleNotEditable { id: BundleId, state: BundleState },

    #[snafu(display("result cannot go from {from:?} to {to:?}"))]
    InvalidResultTransition {
        from: ResultState,
        to: ResultState,
    },

    #[snafu(display("event sequence {sequence} is not after last committed {last}"))]
    OrderingViolation { sequence: u64, last: u64 },

    #[snafu(display("counter {field} would exceed the representable range"))]
    CounterOverflow { field: &'static str },

    #[snafu(display("counter {field} would become negative"))]
    CounterUnderflow { field: &'static str },

    #[snafu(display("{message}"))]
    Invariant { message: String },
}

pub type TallyResult<T> = Result<T, TallyError>;
