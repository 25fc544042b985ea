//! Relocation Queue: the authoritative record of what is queued, what is
//! in flight, and whether a new launch pass can admit more work.
//!
//! `queue_map` tiles the keyspace with whatever relocation currently "owns"
//! queuing intent for each key (the sentinel [`Relocation::empty`] where
//! nothing is queued); `in_flight` tiles it with whatever relocation a
//! relocator task currently holds. A range can be in exactly one of the two
//! non-empty at a time except during the brief window between launch and
//! the queue entry being cleared.

use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use crate::config::RelocationConfig;
use crate::ledger::Ledger;
use crate::range_map::RangeMap;
use crate::types::{KeyRange, RelocateShard, Relocation};

/// What an [`RelocationQueue::enqueue`] call changed beyond the queued
/// relocation itself: in-flight tasks it cancelled outright (the caller must
/// fire their `CancelToken`s so the stale relocators stop moving data into a
/// range they no longer own), and still-queued neighbors it narrowed (the
/// caller must restart their Source Fetcher if they hadn't resolved sources
/// yet, since their prior fetch covered a wider range than they still own).
#[derive(Debug)]
pub struct EnqueueOutcome {
    pub relocation: Relocation,
    pub cancelled_in_flight: Vec<Uuid>,
    pub refetch: Vec<Relocation>,
}

/// Point-in-time counters for the metrics surface and tests.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub active_relocations: i64,
    pub queued_relocations: i64,
    pub unhealthy_relocations: i64,
    pub highest_priority: Option<u32>,
    pub bytes_written: u64,
    pub per_priority_counts: std::collections::HashMap<u32, i64>,
}

#[derive(Debug)]
pub struct RelocationQueue {
    queue_map: RangeMap<Relocation>,
    in_flight: RangeMap<Relocation>,
    ledger: Ledger,
    bytes_written: u64,
}

impl Default for RelocationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RelocationQueue {
    pub fn new() -> Self {
        Self {
            queue_map: RangeMap::new(),
            in_flight: RangeMap::new(),
            ledger: Ledger::new(),
            bytes_written: 0,
        }
    }

    /// Admits a new relocation request. Any queued (not yet launched)
    /// entries overlapping `req.range` are absorbed into it, taking the max
    /// priority, the earliest start time, and the union of
    /// `wants_new_servers`. An in-flight task is only cancelled outright
    /// when its whole range is contained in the new request — a task that
    /// only partially overlaps keeps running, and the new request must wait
    /// behind it for that sub-range (checked in [`Self::try_launch`]).
    ///
    /// Queued neighbors that only partially overlap survive, but the tile
    /// split narrows their actual keyspace ownership; their `range` field is
    /// rewritten to match so a later [`Self::try_launch`] pass never reads a
    /// candidate whose `range` is wider than the tile it's keyed under.
    pub fn enqueue(&mut self, req: RelocateShard, now: Instant) -> EnqueueOutcome {
        let range = req.range.clone();
        let mut merged_priority = req.priority;
        let mut wants_new_servers = req.wants_new_servers;
        let mut start_time = now;

        for (_, existing) in self.queue_map.intersecting_ranges(&range) {
            if existing.is_empty() {
                continue;
            }
            merged_priority = merged_priority.max(existing.priority);
            wants_new_servers |= existing.wants_new_servers;
            start_time = start_time.min(existing.start_time);
        }

        let contained: Vec<(KeyRange, Relocation)> = self
            .in_flight
            .contained_ranges(&range)
            .into_iter()
            .filter(|(_, r)| !r.is_empty())
            .map(|(tile, r)| (tile, r.clone()))
            .collect();

        let mut cancelled_in_flight = Vec::with_capacity(contained.len());
        for (tile, victim) in contained {
            debug!(id = %victim.id, range = %tile, "cancelling in-flight relocation fully superseded by new request");
            self.ledger.complete(&victim);
            self.in_flight.insert(&tile, Relocation::empty(tile.clone()));
            cancelled_in_flight.push(victim.id);
        }

        // Neighbors the new range's tile will split off still own a narrower
        // slice of their old range afterward; re-key them to match and, if
        // they hadn't resolved sources yet, flag them for a fresh fetch.
        let affected = self.queue_map.affected_ranges_after_insertion(&range);
        let mut remnants: Vec<(KeyRange, Relocation)> = Vec::new();
        for tile in &affected {
            if tile == &range {
                continue;
            }
            let (_, occupant) = self.queue_map.range_containing(&tile.start);
            if occupant.is_empty() {
                continue;
            }
            let mut narrowed = occupant.clone();
            narrowed.range = tile.clone();
            remnants.push((tile.clone(), narrowed));
        }

        let relocation = Relocation::from_request(
            RelocateShard {
                range: range.clone(),
                priority: merged_priority,
                wants_new_servers,
            },
            start_time,
        );
        self.queue_map.insert(&range, relocation.clone());

        let mut refetch = Vec::new();
        for (tile, narrowed) in remnants {
            if narrowed.src.is_empty() {
                refetch.push(narrowed.clone());
            }
            self.queue_map.insert(&tile, narrowed);
        }

        EnqueueOutcome { relocation, cancelled_in_flight, refetch }
    }

    /// Records the outcome of a source fetch for a still-queued relocation.
    /// Returns `None` if the relocation has since been superseded or
    /// launched (its id no longer matches what `queue_map` holds there).
    pub fn complete_source_fetch(
        &mut self,
        id: Uuid,
        range: &KeyRange,
        src: Vec<crate::types::ServerId>,
        complete_sources: Vec<crate::types::ServerId>,
    ) -> Option<Relocation> {
        let (tile, existing) = self.queue_map.range_containing(&range.start);
        if existing.id != id || existing.is_empty() {
            return None;
        }
        let mut updated = existing.clone();
        updated.src = src;
        updated.complete_sources = complete_sources;
        self.queue_map.insert(&tile, updated.clone());
        Some(updated)
    }

    /// Queued relocations whose `src` has not yet been resolved — the
    /// driver's cue to spawn a Source Fetcher for each.
    pub fn pending_fetch(&self) -> Vec<Relocation> {
        self.queue_map
            .iter()
            .map(|(_, r)| r.clone())
            .filter(|r| !r.is_empty() && r.src.is_empty())
            .collect()
    }

    /// Scans every queued relocation with resolved sources, highest
    /// priority first, and launches every one the busyness ledger and the
    /// in-flight map will admit. Launched relocations are moved from
    /// `queue_map` into `in_flight` and charged against the ledger; the
    /// caller is expected to spawn a relocator task for each.
    pub fn try_launch(&mut self, config: &RelocationConfig) -> Vec<Relocation> {
        let mut candidates: Vec<Relocation> = self
            .queue_map
            .iter()
            .map(|(_, r)| r.clone())
            .filter(|r| !r.is_empty() && !r.src.is_empty())
            .collect();
        candidates.sort();

        let mut launched = Vec::new();
        for mut candidate in candidates {
            let blocked = self
                .in_flight
                .intersecting_ranges(&candidate.range)
                .into_iter()
                .any(|(_, r)| !r.is_empty());
            if blocked {
                continue;
            }
            if !self.ledger.can_launch(&candidate, config) {
                continue;
            }
            self.ledger.launch(&mut candidate, config);
            self.in_flight.insert(&candidate.range, candidate.clone());
            self.queue_map
                .insert(&candidate.range, Relocation::empty(candidate.range.clone()));
            launched.push(candidate);
        }
        launched
    }

    /// Releases a relocation's ledger charge without clearing it from
    /// `in_flight`. Called when the relocator finishes the physical data
    /// copy but is still converging replica ownership: the range keeps
    /// blocking overlapping launches, but the source servers' busyness
    /// budget is freed immediately so other pending work sharing those
    /// sources can be admitted.
    ///
    /// Zeroes the returned relocation's `work_factor` so a later
    /// [`Self::relocation_complete`] or [`Self::relocation_retry`] call
    /// against the same id does not double-release the ledger (see
    /// `Ledger::complete`'s no-op guard on `work_factor == 0`).
    pub fn data_transfer_complete(&mut self, id: Uuid, range: &KeyRange) -> Option<Relocation> {
        let (tile, existing) = self.in_flight.range_containing(&range.start);
        if existing.id != id || existing.is_empty() {
            return None;
        }
        let mut updated = existing.clone();
        self.ledger.complete(&updated);
        updated.work_factor = 0;
        self.in_flight.insert(&tile, updated.clone());
        Some(updated)
    }

    /// Releases a relocation's ledger charge and clears it from `in_flight`
    /// on success. A no-op if `relocation` no longer occupies its range in
    /// `in_flight` — it was already superseded and cancelled by an
    /// [`Self::enqueue`] call, and this is its relocator's late `Terminal`
    /// event arriving after the fact. Without this guard a late completion
    /// would double-release the ledger and carve a hole out of whatever
    /// relocation now owns the range.
    pub fn relocation_complete(&mut self, relocation: &Relocation, bytes_moved: u64) {
        let (_, existing) = self.in_flight.range_containing(&relocation.range.start);
        if existing.id != relocation.id {
            return;
        }
        self.ledger.complete(relocation);
        self.in_flight
            .insert(&relocation.range, Relocation::empty(relocation.range.clone()));
        self.bytes_written += bytes_moved;
    }

    /// Releases a relocation's ledger charge and re-queues it unchanged so
    /// it competes for launch again on the next pass (used on retryable
    /// relocator failure and on abandonment after exhausting retries, the
    /// latter distinguished only by the caller choosing not to re-enqueue).
    /// Same occupant guard as [`Self::relocation_complete`]: a no-op if the
    /// relocation has since been superseded and cancelled out of
    /// `in_flight`.
    pub fn relocation_retry(&mut self, relocation: Relocation) {
        let (_, existing) = self.in_flight.range_containing(&relocation.range.start);
        if existing.id != relocation.id {
            return;
        }
        self.ledger.complete(&relocation);
        self.in_flight
            .insert(&relocation.range, Relocation::empty(relocation.range.clone()));
        self.queue_map.insert(&relocation.range, relocation);
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut snap = QueueSnapshot::default();
        for (_, r) in self.in_flight.iter() {
            if r.is_empty() {
                continue;
            }
            snap.active_relocations += 1;
            if r.is_unhealthy_counted() {
                snap.unhealthy_relocations += 1;
            }
            snap.highest_priority = Some(snap.highest_priority.map_or(r.priority, |p| p.max(r.priority)));
            *snap.per_priority_counts.entry(r.priority).or_insert(0) += 1;
        }
        for (_, r) in self.queue_map.iter() {
            if r.is_empty() {
                continue;
            }
            snap.queued_relocations += 1;
            snap.highest_priority = Some(snap.highest_priority.map_or(r.priority, |p| p.max(r.priority)));
        }
        snap.bytes_written = self.bytes_written;
        snap
    }

    /// Debug-only consistency check across the queue map, in-flight map,
    /// and ledger.
    pub fn validate(&self) -> Result<(), String> {
        self.queue_map.validate()?;
        self.in_flight.validate()?;
        self.ledger.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{priority, KeyRange, ServerId};

    fn range(s: &[u8], e: Option<&[u8]>) -> KeyRange {
        KeyRange::new(s.to_vec(), e.map(|x| x.to_vec()))
    }

    fn server() -> ServerId {
        ServerId(uuid::Uuid::new_v4())
    }

    #[test]
    fn enqueue_then_launch_round_trip() {
        let mut q = RelocationQueue::new();
        let cfg = RelocationConfig::default();
        let now = Instant::now();

        let r = q.enqueue(RelocateShard::new(range(b"a", Some(b"m")), priority::SPLIT_SHARD), now).relocation;
        let resolved = q
            .complete_source_fetch(r.id, &r.range, vec![server(), server(), server()], vec![])
            .unwrap();
        assert_eq!(resolved.src.len(), 3);

        let launched = q.try_launch(&cfg);
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].id, r.id);

        let snap = q.snapshot();
        assert_eq!(snap.active_relocations, 1);
        assert_eq!(snap.queued_relocations, 0);
        q.validate().unwrap();
    }

    #[test]
    fn higher_priority_overlap_absorbs_lower_priority_queued_entry() {
        let mut q = RelocationQueue::new();
        let now = Instant::now();
        q.enqueue(
            RelocateShard::new(range(b"a", Some(b"z")), priority::REBALANCE_UNDERUTILIZED_TEAM),
            now,
        );
        let later = q.enqueue(RelocateShard::new(range(b"c", Some(b"d")), priority::SPLIT_SHARD), now).relocation;
        assert_eq!(later.priority, priority::SPLIT_SHARD);
        q.validate().unwrap();
    }

    #[test]
    fn in_flight_task_fully_contained_in_new_request_is_cancelled() {
        let mut q = RelocationQueue::new();
        let cfg = RelocationConfig::default();
        let now = Instant::now();

        let r = q.enqueue(RelocateShard::new(range(b"c", Some(b"d")), priority::SPLIT_SHARD), now).relocation;
        q.complete_source_fetch(r.id, &r.range, vec![server()], vec![]);
        let launched = q.try_launch(&cfg);
        assert_eq!(launched.len(), 1);

        // A new request spanning the in-flight task's whole range cancels it
        // and surfaces its id so the driver can fire its relocator's cancel
        // token.
        let outcome = q.enqueue(RelocateShard::new(range(b"a", Some(b"z")), priority::TEAM_0_LEFT), now);
        assert_eq!(outcome.cancelled_in_flight, vec![launched[0].id]);
        let snap = q.snapshot();
        assert_eq!(snap.active_relocations, 0, "fully-contained in-flight task should be cancelled");
        q.validate().unwrap();
    }

    #[test]
    fn partially_overlapping_in_flight_task_keeps_running_and_blocks_relaunch() {
        let mut q = RelocationQueue::new();
        let cfg = RelocationConfig::default();
        let now = Instant::now();

        let r = q.enqueue(RelocateShard::new(range(b"a", Some(b"m")), priority::SPLIT_SHARD), now).relocation;
        q.complete_source_fetch(r.id, &r.range, vec![server()], vec![]);
        let launched = q.try_launch(&cfg);
        assert_eq!(launched.len(), 1);

        // Overlaps [a,m) without containing it.
        let outcome2 = q.enqueue(RelocateShard::new(range(b"g", Some(b"z")), priority::SPLIT_SHARD), now);
        assert!(
            outcome2.cancelled_in_flight.is_empty(),
            "a merely-overlapping in-flight task must not be cancelled"
        );
        let r2 = outcome2.relocation;
        q.complete_source_fetch(r2.id, &r2.range, vec![server()], vec![]);
        let launched2 = q.try_launch(&cfg);
        assert!(launched2.is_empty(), "should block behind the still-running in-flight task");
        assert_eq!(q.snapshot().active_relocations, 1);
    }

    #[test]
    fn enqueue_narrows_a_surviving_neighbor_instead_of_leaving_a_stale_range() {
        let mut q = RelocationQueue::new();
        let now = Instant::now();

        let wide = q.enqueue(RelocateShard::new(range(b"a", Some(b"z")), priority::TEAM_HEALTHY), now).relocation;
        q.enqueue(RelocateShard::new(range(b"m", Some(b"p")), priority::SPLIT_SHARD), now);

        // The surviving [a,m) remnant must be re-keyed to its narrowed tile,
        // not left pointing at the original wide [a,z) range.
        let (tile, remnant) = q.queue_map.range_containing(b"c");
        assert_eq!(remnant.id, wide.id);
        assert_eq!(remnant.range, tile);
        assert_eq!(tile.end.as_deref(), Some(b"m".as_slice()));
        q.validate().unwrap();
    }

    #[test]
    fn data_transfer_complete_releases_ledger_but_keeps_range_in_flight() {
        let mut q = RelocationQueue::new();
        let cfg = RelocationConfig::default();
        let now = Instant::now();

        let r = q.enqueue(RelocateShard::new(range(b"a", Some(b"m")), priority::SPLIT_SHARD), now).relocation;
        q.complete_source_fetch(r.id, &r.range, vec![server()], vec![]);
        let launched = q.try_launch(&cfg).remove(0);

        let updated = q.data_transfer_complete(launched.id, &launched.range).unwrap();
        assert_eq!(updated.work_factor, 0, "ledger charge should be released");
        assert_eq!(
            q.snapshot().active_relocations,
            1,
            "range should still occupy in_flight until relocation_complete"
        );
        q.validate().unwrap();

        // A subsequent relocation_complete must not double-release the ledger.
        q.relocation_complete(&updated, 1024);
        assert_eq!(q.snapshot().active_relocations, 0);
        q.validate().unwrap();
    }

    #[test]
    fn a_superseded_relocation_s_stale_terminal_event_is_a_no_op() {
        let mut q = RelocationQueue::new();
        let cfg = RelocationConfig::default();
        let now = Instant::now();

        let victim = q.enqueue(RelocateShard::new(range(b"c", Some(b"d")), priority::SPLIT_SHARD), now).relocation;
        q.complete_source_fetch(victim.id, &victim.range, vec![server()], vec![]);
        let launched_victim = q.try_launch(&cfg).remove(0);

        // A wider, higher-priority request cancels the victim outright.
        let outcome = q.enqueue(RelocateShard::new(range(b"a", Some(b"z")), priority::TEAM_0_LEFT), now);
        assert_eq!(outcome.cancelled_in_flight, vec![launched_victim.id]);
        q.complete_source_fetch(outcome.relocation.id, &outcome.relocation.range, vec![server()], vec![]);
        let launched_superseding = q.try_launch(&cfg).remove(0);

        // The victim's relocator keeps running unaware and eventually reports
        // completion anyway; the queue must ignore it rather than double-
        // release the ledger or punch a hole in the superseding relocation's
        // in_flight entry.
        q.relocation_complete(&launched_victim, 999);
        assert_eq!(q.snapshot().bytes_written, 0, "a stale completion must not record bytes");
        assert_eq!(q.snapshot().active_relocations, 1, "the superseding relocation must still occupy in_flight");
        q.validate().unwrap();

        q.relocation_complete(&launched_superseding, 4096);
        assert_eq!(q.snapshot().bytes_written, 4096);
        assert_eq!(q.snapshot().active_relocations, 0);
        q.validate().unwrap();
    }

    #[test]
    fn pending_fetch_lists_only_relocations_without_resolved_sources() {
        let mut q = RelocationQueue::new();
        let now = Instant::now();
        let r = q.enqueue(RelocateShard::new(range(b"a", Some(b"m")), priority::SPLIT_SHARD), now).relocation;
        assert_eq!(q.pending_fetch().len(), 1);
        q.complete_source_fetch(r.id, &r.range, vec![server()], vec![]);
        assert!(q.pending_fetch().is_empty());
    }

    #[test]
    fn complete_source_fetch_records_both_the_full_source_set_and_the_complete_subset() {
        let mut q = RelocationQueue::new();
        let now = Instant::now();
        let whole_holder = server();
        let fragment_holder = server();
        let r = q.enqueue(RelocateShard::new(range(b"a", Some(b"m")), priority::SPLIT_SHARD), now).relocation;
        let resolved = q
            .complete_source_fetch(r.id, &r.range, vec![whole_holder, fragment_holder], vec![whole_holder])
            .unwrap();
        assert_eq!(resolved.src, vec![whole_holder, fragment_holder]);
        assert_eq!(resolved.complete_sources, vec![whole_holder]);
    }

    #[test]
    fn relocation_complete_releases_ledger_and_records_bytes() {
        let mut q = RelocationQueue::new();
        let cfg = RelocationConfig::default();
        let now = Instant::now();

        let r = q.enqueue(RelocateShard::new(range(b"a", Some(b"m")), priority::SPLIT_SHARD), now).relocation;
        q.complete_source_fetch(r.id, &r.range, vec![server()], vec![]);
        let launched = q.try_launch(&cfg).remove(0);
        q.relocation_complete(&launched, 4096);

        let snap = q.snapshot();
        assert_eq!(snap.active_relocations, 0);
        assert_eq!(snap.bytes_written, 4096);
        q.validate().unwrap();
    }
}
