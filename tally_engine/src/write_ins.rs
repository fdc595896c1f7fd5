//! Write-in mapping engine.
//!
//! Translates unresolved free-text write-in entries into vote-count effects.
//! The update pipeline is ordered: revert the current contribution, reassign
//! targets, resolve duplicate candidates, then reapply — always through the
//! same per-target effect function with a signed factor, so a mapping can be
//! re-applied arbitrarily many times without drift.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;

use crate::config::*;
use crate::subtotal::{to_signed, DeltaFactor, SubTotal, SubTotalDelta};

/// One occurrence of a write-in on a specific imported ballot.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct BallotPosition {
    pub id: BallotPositionId,
    pub ballot: ImportedBallotId,
    pub target: WriteInTarget,
}

/// A free-text write-in name discovered on import, with its resolution state.
///
/// `positions` is authoritative when non-empty; the aggregate `vote_count`
/// path only serves results imported before per-ballot detail existed, and
/// the two are mutually exclusive.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct WriteInMapping {
    pub id: WriteInMappingId,
    pub name: String,
    pub target: WriteInTarget,
    pub vote_count: u64,
    pub positions: Vec<BallotPosition>,
}

impl WriteInMapping {
    pub(crate) fn discovered(d: &DiscoveredWriteIn) -> WriteInMapping {
        WriteInMapping {
            id: d.id,
            name: d.name.clone(),
            target: WriteInTarget::Unspecified,
            // The aggregate count is dropped once ballot detail exists.
            vote_count: if d.positions.is_empty() { d.vote_count } else { 0 },
            positions: d
                .positions
                .iter()
                .map(|(pid, bid)| BallotPosition {
                    id: *pid,
                    ballot: *bid,
                    target: WriteInTarget::Unspecified,
                })
                .collect(),
        }
    }
}

/// Vote deltas of the write-in contribution of one source.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct WriteInDelta {
    pub subtotal: SubTotalDelta,
    /// Direct vote-count corrections (invalid-ballot cascade only).
    pub candidate_votes: HashMap<CandidateId, i64>,
    /// Write-in vote sub-field, only ever touched by this engine.
    pub candidate_write_ins: HashMap<CandidateId, i64>,
}

/// Counts reported to the notification collaborator.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub struct MappingOutcome {
    pub duplicate_downgrades: u32,
    pub invalid_ballot_cascades: u32,
}

/// Per-target effect function, shared by revert and (re-)apply.
/// `InvalidBallot` is handled entirely by the per-ballot cascade, not here.
fn effect(delta: &mut WriteInDelta, target: WriteInTarget, magnitude: i64) {
    match target {
        WriteInTarget::Unspecified => {}
        WriteInTarget::Individual => delta.subtotal.individual_votes += magnitude,
        WriteInTarget::Candidate(cid) => {
            *delta.candidate_write_ins.entry(cid).or_insert(0) += magnitude;
            delta.subtotal.candidate_votes += magnitude;
        }
        WriteInTarget::Empty => delta.subtotal.empty_votes += magnitude,
        WriteInTarget::Invalid => delta.subtotal.invalid_votes += magnitude,
        WriteInTarget::InvalidBallot => {}
    }
}

/// Ballots that currently map to an invalid ballot through at least one
/// position.
fn invalidated_ballots(mappings: &[WriteInMapping]) -> HashSet<ImportedBallotId> {
    mappings
        .iter()
        .flat_map(|m| &m.positions)
        .filter(|p| p.target == WriteInTarget::InvalidBallot)
        .map(|p| p.ballot)
        .collect()
}

/// Computes the full write-in contribution of a source under the current
/// targets, as a signed delta over the import baseline.
///
/// Positions are grouped by ballot and each group is folded once: a ballot
/// with an `InvalidBallot` position contributes the invalid-ballot cascade
/// (and nothing else), all other ballots contribute their per-position
/// effects. Legacy aggregate mappings contribute through the effect function
/// with their stored count.
pub(crate) fn contribution(
    mappings: &[WriteInMapping],
    ballots: &HashMap<ImportedBallotId, ImportedBallot>,
) -> TallyResult<WriteInDelta> {
    let mut delta = WriteInDelta::default();

    for m in mappings.iter().filter(|m| m.positions.is_empty()) {
        let count = to_signed(m.vote_count, "write_in_vote_count")?;
        match m.target {
            // Without ballot detail, an invalid-ballot resolution can only
            // move whole-ballot counters.
            WriteInTarget::InvalidBallot => {
                delta.subtotal.invalid_ballots += count;
                delta.subtotal.accounted_ballots -= count;
            }
            target => effect(&mut delta, target, count),
        }
    }

    // Group every position by ballot, in deterministic ballot order.
    let mut by_ballot: BTreeMap<ImportedBallotId, Vec<&BallotPosition>> = BTreeMap::new();
    for p in mappings.iter().flat_map(|m| &m.positions) {
        by_ballot.entry(p.ballot).or_default().push(p);
    }

    for (ballot_id, positions) in by_ballot {
        let cascaded = positions
            .iter()
            .any(|p| p.target == WriteInTarget::InvalidBallot);
        if cascaded {
            let ballot = ballots
                .get(&ballot_id)
                .ok_or(TallyError::ImportedBallotNotFound { id: ballot_id })?;
            delta.subtotal.invalid_ballots += 1;
            delta.subtotal.accounted_ballots -= 1;
            // The ballot's own contributions leave the totals with it.
            delta.subtotal.empty_votes -= to_signed(ballot.empty_votes, "empty_votes")?;
            delta.subtotal.invalid_votes -= to_signed(ballot.invalid_votes, "invalid_votes")?;
            for cid in &ballot.candidates {
                *delta.candidate_votes.entry(*cid).or_insert(0) -= 1;
                delta.subtotal.candidate_votes -= 1;
            }
        } else {
            for p in positions {
                effect(&mut delta, p.target, 1);
            }
        }
    }

    Ok(delta)
}

/// Applies a `WriteInDelta` to the accumulators, scaled by `factor`.
pub(crate) fn apply_delta(
    subtotal: &mut SubTotal,
    candidate_votes: &mut dyn FnMut(CandidateId, i64, bool) -> TallyResult<()>,
    delta: &WriteInDelta,
    factor: DeltaFactor,
) -> TallyResult<()> {
    subtotal.apply(&delta.subtotal, factor)?;
    let f = factor.signed();
    for (cid, d) in &delta.candidate_votes {
        candidate_votes(*cid, f * d, false)?;
    }
    for (cid, d) in &delta.candidate_write_ins {
        candidate_votes(*cid, f * d, true)?;
    }
    Ok(())
}

/// Duplicate-candidate resolution pass over *all* positions of a source.
///
/// Positions are visited in ascending (ballot id, position id) order, with a
/// ballot's direct candidate selections considered first. The earliest
/// occurrence of a candidate on a ballot is kept; every later `Candidate`
/// position for the same candidate is downgraded to `Invalid` (cantons with
/// invalid votes) or `Empty`. Returns the number of downgrades, which is zero
/// when re-run on an already-resolved set.
pub(crate) fn resolve_duplicates(
    mappings: &mut [WriteInMapping],
    ballots: &HashMap<ImportedBallotId, ImportedBallot>,
    canton: &CantonSettings,
) -> u32 {
    let downgrade_target = if canton.supports_invalid_votes {
        WriteInTarget::Invalid
    } else {
        WriteInTarget::Empty
    };

    // (ballot, position) coordinates of every position, deterministic order.
    let mut coords: Vec<(ImportedBallotId, BallotPositionId, usize, usize)> = Vec::new();
    for (mi, m) in mappings.iter().enumerate() {
        for (pi, p) in m.positions.iter().enumerate() {
            coords.push((p.ballot, p.id, mi, pi));
        }
    }
    coords.sort();

    let mut downgrades = 0;
    let mut current_ballot: Option<ImportedBallotId> = None;
    let mut seen: HashSet<CandidateId> = HashSet::new();
    for (ballot_id, position_id, mi, pi) in coords {
        if current_ballot != Some(ballot_id) {
            current_ballot = Some(ballot_id);
            seen = ballots
                .get(&ballot_id)
                .map(|b| b.candidates.iter().copied().collect())
                .unwrap_or_default();
        }
        let position = &mut mappings[mi].positions[pi];
        if let WriteInTarget::Candidate(cid) = position.target {
            if !seen.insert(cid) {
                debug!(
                    "resolve_duplicates: downgrading position {:?} on ballot {:?} ({:?} already present)",
                    position_id, ballot_id, cid
                );
                position.target = downgrade_target;
                downgrades += 1;
            }
        }
    }
    downgrades
}

/// Applies a mapping update to the write-in state of one source.
///
/// Ordered pipeline per the engine contract: revert the currently applied
/// contribution, reassign targets on the referenced mappings and their
/// positions, run the duplicate pass, then reapply the new contribution.
/// Candidate references are validated against `known_candidates`.
pub(crate) fn apply_mapping_update(
    mappings: &mut Vec<WriteInMapping>,
    ballots: &HashMap<ImportedBallotId, ImportedBallot>,
    subtotal: &mut SubTotal,
    candidate_votes: &mut dyn FnMut(CandidateId, i64, bool) -> TallyResult<()>,
    known_candidates: &HashSet<CandidateId>,
    canton: &CantonSettings,
    updates: &[WriteInMappingUpdate],
) -> TallyResult<MappingOutcome> {
    // 1. Revert the contribution currently applied, before any reassignment,
    // so stale state is never double-applied.
    let before = contribution(mappings, ballots)?;
    apply_delta(subtotal, candidate_votes, &before, DeltaFactor::Revert)?;
    let invalid_before = invalidated_ballots(mappings);

    // 2. Reassign targets.
    for update in updates {
        if let WriteInTarget::Candidate(cid) = update.target {
            if !known_candidates.contains(&cid) {
                return Err(TallyError::CandidateNotFound { id: cid });
            }
        }
        let mapping = mappings
            .iter_mut()
            .find(|m| m.id == update.mapping)
            .ok_or(TallyError::WriteInMappingNotFound { id: update.mapping })?;
        mapping.target = update.target;
        for p in mapping.positions.iter_mut() {
            p.target = update.target;
        }
    }

    // 3. Duplicate-candidate resolution over all positions of the source.
    let duplicate_downgrades = resolve_duplicates(mappings, ballots, canton);

    // 4.-6. Invalid-ballot cascade and per-target effects, reapplied in one
    // pass through the same path as the revert.
    let after = contribution(mappings, ballots)?;
    apply_delta(subtotal, candidate_votes, &after, DeltaFactor::Apply)?;

    let invalid_after = invalidated_ballots(mappings);
    let invalid_ballot_cascades = invalid_after.difference(&invalid_before).count() as u32;

    debug!(
        "apply_mapping_update: {} updates, {} downgrades, {} cascades",
        updates.len(),
        duplicate_downgrades,
        invalid_ballot_cascades
    );
    Ok(MappingOutcome {
        duplicate_downgrades,
        invalid_ballot_cascades,
    })
}

/// Reverts all applied effects and returns every mapping to `Unspecified`.
pub(crate) fn reset_mappings(
    mappings: &mut Vec<WriteInMapping>,
    ballots: &HashMap<ImportedBallotId, ImportedBallot>,
    subtotal: &mut SubTotal,
    candidate_votes: &mut dyn FnMut(CandidateId, i64, bool) -> TallyResult<()>,
) -> TallyResult<()> {
    let before = contribution(mappings, ballots)?;
    apply_delta(subtotal, candidate_votes, &before, DeltaFactor::Revert)?;
    for m in mappings.iter_mut() {
        m.target = WriteInTarget::Unspecified;
        for p in m.positions.iter_mut() {
            p.target = WriteInTarget::Unspecified;
        }
    }
    Ok(())
}

/// Whether any mapping of the source still awaits resolution.
pub(crate) fn has_unspecified(mappings: &[WriteInMapping]) -> bool {
    mappings.iter().any(|m| {
        if m.positions.is_empty() {
            m.target == WriteInTarget::Unspecified
        } else {
            m.positions
                .iter()
                .any(|p| p.target == WriteInTarget::Unspecified)
        }
    })
}
