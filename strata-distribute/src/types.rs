//! Core domain types for the relocation queue: key ranges, relocations,
//! priority bands, and the external collaborator traits the queue depends on
//! but does not implement itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

use crate::error::Result;

/// A single key in the keyspace. Opaque bytes; ordering is lexicographic.
pub type Key = Vec<u8>;

/// The identity of a storage server (shard replica host). Opaque to this
/// crate beyond equality, ordering, and hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A half-open key range `[start, end)`. `end = None` means "to the end of
/// the keyspace" — the sentinel tail range every `RangeMap` carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Key,
    pub end: Option<Key>,
}

impl KeyRange {
    pub fn new(start: Key, end: Option<Key>) -> Self {
        if let Some(ref e) = end {
            debug_assert!(&start < e, "KeyRange start must precede end");
        }
        Self { start, end }
    }

    pub fn unbounded_from(start: Key) -> Self {
        Self { start, end: None }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.as_deref().map_or(true, |e| key < e)
    }

    /// Whether `self` fully contains `other` (not merely overlaps it).
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.start >= self.start
            && match (&self.end, &other.end) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(a), Some(b)) => b <= a,
            }
    }

    pub fn intersects(&self, other: &KeyRange) -> bool {
        let starts_before_other_ends = match &other.end {
            None => true,
            Some(oe) => &self.start < oe,
        };
        let other_starts_before_self_ends = match &self.end {
            None => true,
            Some(se) => &other.start < se,
        };
        starts_before_other_ends && other_starts_before_self_ends
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.end, Some(e) if e <= &self.start)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            Some(end) => write!(f, "[{:?}, {:?})", self.start, end),
            None => write!(f, "[{:?}, +inf)", self.start),
        }
    }
}

/// Semantic priority bands, ordered low to high exactly as a real deployment
/// would rank them: cosmetic rebalancing first, then shape and placement
/// cleanup, then actual replication risk, with shard splitting as the most
/// urgent (it unblocks everything else queued behind an oversized shard).
pub mod priority {
    pub const RECOVER_MOVE: u32 = 100;
    pub const REBALANCE_UNDERUTILIZED_TEAM: u32 = 120;
    pub const REBALANCE_OVERUTILIZED_TEAM: u32 = 150;
    pub const TEAM_HEALTHY: u32 = 200;
    pub const TEAM_CONTAINS_UNDESIRED_SERVER: u32 = 300;
    pub const TEAM_REDUNDANT: u32 = 350;
    pub const MERGE_SHARD: u32 = 400;
    pub const POPULATE_REGION: u32 = 500;
    pub const TEAM_UNHEALTHY: u32 = 600;
    pub const TEAM_2_LEFT: u32 = 700;
    pub const TEAM_1_LEFT: u32 = 800;
    pub const TEAM_0_LEFT: u32 = 850;
    pub const SPLIT_SHARD: u32 = 900;

    /// Number of busyness-ledger bands a priority value can fall into.
    pub const BAND_COUNT: u32 = 10;

    pub fn band(p: u32) -> usize {
        ((p / 100).min(BAND_COUNT - 1)) as usize
    }

    /// Priorities for which a relocation's destination-team health matters
    /// enough to carry a `health_priority` derived value (used for inflight
    /// penalty selection and as the input set for [`is_unhealthy_counted`]).
    pub fn is_health_priority(p: u32) -> bool {
        matches!(
            p,
            TEAM_HEALTHY
                | TEAM_CONTAINS_UNDESIRED_SERVER
                | TEAM_REDUNDANT
                | POPULATE_REGION
                | TEAM_UNHEALTHY
                | TEAM_2_LEFT
                | TEAM_1_LEFT
                | TEAM_0_LEFT
        )
    }

    /// The narrower subset of health priorities that count toward the
    /// "unhealthy" observability counter. Excludes `TEAM_HEALTHY` and
    /// `TEAM_CONTAINS_UNDESIRED_SERVER`, which are health-tracked but not
    /// themselves symptomatic of reduced replication.
    pub fn is_unhealthy_counted(health_priority: u32) -> bool {
        matches!(
            health_priority,
            TEAM_REDUNDANT | POPULATE_REGION | TEAM_UNHEALTHY | TEAM_2_LEFT | TEAM_1_LEFT | TEAM_0_LEFT
        )
    }

    pub fn is_boundary_priority(p: u32) -> bool {
        matches!(p, SPLIT_SHARD | MERGE_SHARD)
    }
}

/// A request to relocate a key range, as submitted to the queue. Carries no
/// derived state — the queue fills in `id`, `start_time`, and the derived
/// priorities on enqueue.
#[derive(Debug, Clone)]
pub struct RelocateShard {
    pub range: KeyRange,
    pub priority: u32,
    /// Whether the relocation must land on servers not already holding the
    /// range (as opposed to merely rebalancing among the current team).
    pub wants_new_servers: bool,
}

impl RelocateShard {
    pub fn new(range: KeyRange, priority: u32) -> Self {
        Self {
            range,
            priority,
            wants_new_servers: false,
        }
    }
}

/// A relocation as tracked by the queue: a `RelocateShard` plus everything
/// the queue and relocator have since learned or computed about it.
///
/// Identity is by `id`, not by field equality — `range`, `src`, and the
/// derived priorities can all be rewritten in place as the relocation is
/// superseded or re-keyed by a `RangeMap` split, but it remains "the same"
/// relocation for cancellation, ordering, and bookkeeping purposes.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub id: Uuid,
    pub range: KeyRange,
    pub priority: u32,
    pub health_priority: Option<u32>,
    pub boundary_priority: Option<u32>,
    pub start_time: Instant,
    pub work_factor: u32,
    pub wants_new_servers: bool,
    pub src: Vec<ServerId>,
    pub complete_sources: Vec<ServerId>,
}

impl Relocation {
    pub fn from_request(req: RelocateShard, now: Instant) -> Self {
        let health_priority = priority::is_health_priority(req.priority).then_some(req.priority);
        let boundary_priority = priority::is_boundary_priority(req.priority).then_some(req.priority);
        Self {
            id: Uuid::new_v4(),
            range: req.range,
            priority: req.priority,
            health_priority,
            boundary_priority,
            start_time: now,
            work_factor: 1,
            wants_new_servers: req.wants_new_servers,
            src: Vec::new(),
            complete_sources: Vec::new(),
        }
    }

    /// Sentinel value occupying keyspace that has no relocation queued
    /// against it. Recognized by `priority == 0`; never spawned or launched.
    pub fn empty(range: KeyRange) -> Self {
        Self {
            id: Uuid::nil(),
            range,
            priority: 0,
            health_priority: None,
            boundary_priority: None,
            start_time: Instant::now(),
            work_factor: 0,
            wants_new_servers: false,
            src: Vec::new(),
            complete_sources: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.priority == 0 && self.id.is_nil()
    }

    /// Whether this relocation's destination-team health is tracked at all
    /// (see [`priority::is_health_priority`]).
    pub fn is_health_tracked(&self) -> bool {
        self.health_priority.is_some()
    }

    /// Whether this relocation should count toward the unhealthy-relocation
    /// observability gauge.
    pub fn is_unhealthy_counted(&self) -> bool {
        self.health_priority
            .map(priority::is_unhealthy_counted)
            .unwrap_or(false)
    }
}

impl PartialEq for Relocation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Relocation {}

impl std::hash::Hash for Relocation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Orders relocations highest-priority-first, ties broken by earlier
/// `start_time`, further ties by `id` (an arbitrary but stable tiebreak).
/// `BTreeSet<Relocation>` iteration order is therefore launch order.
impl Ord for Relocation {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.start_time.cmp(&other.start_time))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Relocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A destination team selected for a relocation, plus the metadata the
/// relocator needs to supersede overcharges and report completion.
#[derive(Debug, Clone)]
pub struct SelectedTeam {
    pub servers: Vec<ServerId>,
    /// `true` if any destination server in `servers` is not already holding
    /// a copy of the range (drives the byte over-charge at selection time).
    pub is_new_team: bool,
    /// Whether the placement layer currently considers this team healthy
    /// enough to receive the shard. A relocator needs at least one healthy
    /// team across all its replication dimensions before it will commit to
    /// a move.
    pub healthy: bool,
}

/// Per-range shard size and write-bandwidth sample, as produced by the
/// metrics collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardMetrics {
    pub bytes: i64,
    pub bytes_per_second: i64,
}

/// Read-only access to per-shard size and write-rate estimates. Implemented
/// by the storage layer's metrics tracker; this crate only consumes it.
#[async_trait]
pub trait ShardMetricsSource: Send + Sync {
    async fn shard_metrics(&self, range: &KeyRange) -> Result<ShardMetrics>;
}

/// Cluster-wide average shard size, used by the rebalancers to decide
/// whether a sampled donor shard is worth relocating.
#[async_trait]
pub trait AverageShardBytesSource: Send + Sync {
    async fn average_shard_bytes(&self) -> Result<i64>;
}

/// A team of servers known to the placement layer, with its current health
/// classification. This crate treats team identity and scoring as opaque;
/// it only needs to enumerate teams and compare their busyness.
#[derive(Debug, Clone)]
pub struct Team {
    pub servers: Vec<ServerId>,
    pub healthy: bool,
}

/// The ability to select a destination team for a relocation. Implemented by
/// the placement/team-tracker subsystem.
#[async_trait]
pub trait TeamCollection: Send + Sync {
    /// Selects a destination team for `relocation`, excluding servers in
    /// `exclude`, preferring healthy teams and (if `prefer_new_servers`)
    /// teams that do not already hold the range. Returns `None` if no
    /// acceptable team exists right now.
    async fn select_destination_team(
        &self,
        relocation: &Relocation,
        exclude: &HashSet<ServerId>,
        prefer_new_servers: bool,
    ) -> Result<Option<SelectedTeam>>;
}

/// Tracks which ranges are affected by a team's server failing, so the
/// relocator can re-verify a destination team is still valid just before
/// committing to it (health can change between selection and commit).
#[async_trait]
pub trait ShardsAffectedByTeamFailure: Send + Sync {
    async fn is_team_healthy(&self, servers: &[ServerId]) -> Result<bool>;
}

/// Outcome of a single `move_range` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Complete,
    RetryableError,
    MoveToRemovedServer,
}

/// The actual data-plane key mover. This crate never copies bytes itself —
/// it only decides *what* to move and *where*, then drives this trait.
#[async_trait]
pub trait KeyMover: Send + Sync {
    async fn move_range(
        &self,
        range: &KeyRange,
        src: &[ServerId],
        dst: &[ServerId],
    ) -> Result<MoveOutcome>;

    /// Polls whether the destination team is still healthy enough to keep
    /// waiting on (rather than abandoning and retrying team selection).
    async fn poll_destination_health(&self, dst: &[ServerId]) -> Result<bool>;
}

/// The source replicas backing a range, broken down per underlying shard
/// entry so the fetcher can tell which servers hold *all* of the range
/// apart from ones that only hold part of it.
#[derive(Debug, Clone, Default)]
pub struct ShardSources {
    /// Union of every server replicating any part of the range.
    pub all: Vec<ServerId>,
    /// Intersection of every shard entry's replica set: servers holding a
    /// complete copy of the whole range, not just a fragment of it.
    pub complete: Vec<ServerId>,
}

/// Authoritative range→servers directory, queried by the Source Fetcher.
#[async_trait]
pub trait RangeServerDirectory: Send + Sync {
    /// Source replicas for every shard entry the range currently spans, up
    /// to `limit` entries. A `None` return means the range spans too many
    /// shards to enumerate precisely, and the fetcher should fall back to
    /// all servers.
    async fn servers_for(&self, range: &KeyRange, limit: usize) -> Result<Option<ShardSources>>;

    /// Every storage server in the cluster, used as the fallback source set
    /// when `servers_for` can't enumerate precisely.
    async fn all_servers(&self) -> Result<Vec<ServerId>>;
}

/// Out-of-band operator control: whether rebalancing is currently disabled
/// cluster-wide (e.g. during a maintenance window).
#[async_trait]
pub trait RebalanceFlag: Send + Sync {
    async fn rebalance_disabled(&self) -> Result<bool>;
}

/// Cluster-wide team sampling for the mountain-chopper and valley-filler
/// rebalancers, which reason about "the most loaded team" and "the least
/// loaded team" rather than any single range's replica set.
#[async_trait]
pub trait RebalanceSource: Send + Sync {
    /// The team carrying the most write load, if any team is a worthwhile
    /// donor right now.
    async fn most_overutilized_team(&self) -> Result<Option<Team>>;

    /// The team carrying the least write load, if any team is a worthwhile
    /// recipient right now.
    async fn most_underutilized_team(&self) -> Result<Option<Team>>;

    /// Samples a shard currently owned by `team`, preferring one above
    /// `min_bytes`, to use as a rebalance candidate. `None` if the team
    /// owns no shard worth moving.
    async fn sample_shard(&self, team: &Team, min_bytes: i64) -> Result<Option<KeyRange>>;

    /// Re-checks that `team` still owns `range`, just before the rebalancer
    /// commits to emitting a `RelocateShard` for it. Ownership can change
    /// between sampling and this check (a concurrent relocation may already
    /// have moved the shard elsewhere), so the rebalancer must not act on a
    /// stale sample.
    async fn team_still_owns(&self, team: &Team, range: &KeyRange) -> Result<bool>;

    /// Whether the cluster is currently reporting write-bandwidth
    /// saturation. The rebalance loop itself tracks how recently this last
    /// returned `true` (see `RebalanceConfig::saturation_delay_secs`) rather
    /// than asking this method for a recency window.
    async fn cluster_write_saturated(&self) -> Result<bool>;
}
