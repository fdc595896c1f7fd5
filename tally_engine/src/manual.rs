/*!

This is the long-form manual for `tally_engine` and `cctally`.

## The event stream

The engine consumes a single ordered stream of events per election operation.
Every event carries a strictly increasing `sequence` position, an `actor` and
a `timestamp`. Events apply all-or-nothing: an event either commits completely
or leaves the stored state exactly as it was, including the sequence position,
so the producer can resubmit from the same point after fixing the input.

A `ResultDefined` event must precede every other event of its result. It
carries the referential data (cantonal settings, candidate list, question
list) that later events are validated against.

## Results and data sources

A result is the tally of one political business in one counting circle. It
keeps one partial tally (`SubTotal`) per data source:

* `conventional`: ballots keyed in manually, organized into bundles.
* `e_voting` and `e_counting`: complete snapshots delivered by an import.

The reported totals are always the field-wise sum of the per-source partial
tallies. Nothing is ever written directly into a total: conventional ballots
are folded in when their bundle passes review, and electronic snapshots are
converted into explicit deltas against the previously imported snapshot.

## Bundles

Manually entered ballots are grouped into bundles that move through a fixed
lifecycle:

```text
InProcess -> ReadyForReview -> Reviewed
                 |    ^
                 v    |
               InCorrection
```

Ballots are editable in `InProcess` and `InCorrection` only. A bundle counts
toward the totals exactly while it is in `Reviewed`: the review fold-in and
the fold-out on deletion or reset use the same delta with opposite signs.
Deletion is allowed from any state and is terminal; deleting a bundle that
was never reviewed does not touch the totals.

When a bundle becomes ready for review, the engine draws a deterministic
review sample: `ceil(sqrt(n))` ballots (at least one), selected by a digest
keyed on the bundle id, the submission round and the ballot number, plus
every ballot the typist flagged. The same bundle in the same round always
yields the same sample.

## Write-ins

Electronic ballots may carry free-text candidate names. The import stores
them as unresolved mappings; an election official later maps each name to a
listed candidate, to `individual` (an unlisted person), to an empty or
invalid vote, or declares the carrying ballot invalid.

Re-mapping is always allowed before the result is audited. The engine first
reverts the contribution of the current resolution, applies the new targets,
and then re-applies, so repeated corrections can never drift the counters.

Two rules run after every mapping update:

* **Duplicate candidates.** If resolving a name would give a ballot two
  votes for the same candidate (either through a direct selection or through
  another write-in position), the surplus positions are downgraded to
  invalid votes, or to empty votes in cantons without invalid votes.
  Positions are visited in a deterministic order, so the same update always
  downgrades the same positions.
* **Invalid-ballot cascade.** A position resolved to `invalid ballot` makes
  the whole carrying ballot invalid: the ballot moves from accounted to
  invalid and every vote it contained is taken out of the counters. A ballot
  cascades once, regardless of how many of its positions are invalid.

A result with at least one unresolved mapping is flagged through the
unmapped write-in gauge, which the simplified read projection mirrors.

## Result states

```text
SubmissionOngoing -> SubmissionDone -> AuditedTentatively -> Plausibilised
                        |    ^
                        v    |
                   ReadyForCorrection
```

Publication is a flag next to the state, allowed from `AuditedTentatively`
on. `ResultResetToSubmissionFinished` returns a result to
`SubmissionOngoing` from any later state.

## The `cctally` program

`cctally` replays an event log from a JSON file and prints the resulting
totals per result:

```text
cctally events.json
```

With `--reference summary.json` it compares the computed totals against a
previously exported summary and prints a diff, which is how the test suite
validates full replays end to end.

 */
