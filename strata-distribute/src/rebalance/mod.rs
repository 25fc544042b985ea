//! Mountain-chopper and valley-filler: the two background loops that emit
//! cosmetic rebalancing work when nothing more urgent is queued.
//!
//! The mountain chopper samples a shard off the most overutilized team and
//! asks the queue to move it elsewhere; the valley filler samples a shard
//! from elsewhere and asks the queue to move it onto the most underutilized
//! team. Both share the same adaptive poll-interval loop and tolerance
//! check — they differ only in which team is the donor, which is the
//! recipient, and which priority they enqueue at.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RebalanceConfig;
use crate::fetcher::CancelToken;
use crate::metrics;
use crate::queue::QueueSnapshot;
use crate::types::{priority, AverageShardBytesSource, RebalanceFlag, RebalanceSource, RelocateShard, ShardMetricsSource};

/// Which side of the load distribution this loop waters down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceKind {
    /// Pulls shards off the most overutilized team.
    MountainChopper,
    /// Pushes shards onto the most underutilized team.
    ValleyFiller,
}

impl RebalanceKind {
    fn priority(self) -> u32 {
        match self {
            RebalanceKind::MountainChopper => priority::REBALANCE_OVERUTILIZED_TEAM,
            RebalanceKind::ValleyFiller => priority::REBALANCE_UNDERUTILIZED_TEAM,
        }
    }

    fn label(self) -> &'static str {
        match self {
            RebalanceKind::MountainChopper => "mountain_chopper",
            RebalanceKind::ValleyFiller => "valley_filler",
        }
    }
}

enum Tick {
    Sent,
    Saturated,
    NoOp,
}

/// Collaborators a rebalance loop needs. Bundled so `run` doesn't take an
/// unreadable number of positional arguments.
#[derive(Clone)]
pub struct RebalanceDeps {
    pub source: Arc<dyn RebalanceSource>,
    pub average_bytes: Arc<dyn AverageShardBytesSource>,
    pub shard_metrics: Arc<dyn ShardMetricsSource>,
    pub flag: Arc<dyn RebalanceFlag>,
}

/// Runs one rebalancer loop until `cancel` fires. Candidate relocations are
/// sent to `out`; the driver is responsible for feeding them into the
/// relocation queue and keeping `snapshot` current so this loop can see its
/// own in-flight count.
pub async fn run(
    kind: RebalanceKind,
    config: RebalanceConfig,
    deps: RebalanceDeps,
    snapshot: Arc<RwLock<QueueSnapshot>>,
    out: mpsc::Sender<RelocateShard>,
    cancel: CancelToken,
) {
    let mut poll_interval = config.poll_interval_secs;
    let mut no_op_streak: u32 = 0;
    let mut last_flag_check = Instant::now() - Duration::from_secs_f64(config.switch_check_interval_secs);
    let mut disabled = false;
    let mut last_saturated: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs_f64(poll_interval)) => {}
        }

        if last_flag_check.elapsed().as_secs_f64() >= config.switch_check_interval_secs {
            disabled = deps.flag.rebalance_disabled().await.unwrap_or(false);
            last_flag_check = Instant::now();
        }
        if disabled {
            debug!(loop_kind = kind.label(), "rebalancing disabled, skipping tick");
            continue;
        }

        let in_flight_at_priority = snapshot
            .read()
            .per_priority_counts
            .get(&kind.priority())
            .copied()
            .unwrap_or(0) as usize;

        match deps.source.cluster_write_saturated().await {
            Ok(true) => last_saturated = Some(Instant::now()),
            Ok(false) => {}
            Err(err) => warn!(loop_kind = kind.label(), error = %err, "failed to read cluster write saturation"),
        }
        let recently_saturated = last_saturated
            .is_some_and(|at| at.elapsed().as_secs_f64() < config.saturation_delay_secs);

        let tick = if in_flight_at_priority >= config.rebalance_parallelism || recently_saturated {
            Tick::Saturated
        } else {
            match try_one_tick(kind, &config, &deps, &out).await {
                Ok(true) => Tick::Sent,
                Ok(false) => Tick::NoOp,
                Err(err) => {
                    warn!(loop_kind = kind.label(), error = %err, "rebalance tick failed");
                    Tick::NoOp
                }
            }
        };

        match tick {
            Tick::Sent => {
                metrics::record_rebalance_tick(kind.label(), "sent");
                no_op_streak = 0;
                poll_interval = (poll_interval / config.decrease_rate).max(config.min_wait_secs);
            }
            Tick::Saturated => {
                metrics::record_rebalance_tick(kind.label(), "saturated");
                no_op_streak = 0;
                poll_interval = (poll_interval * config.increase_rate).min(config.max_wait_secs);
            }
            Tick::NoOp => {
                metrics::record_rebalance_tick(kind.label(), "no_op");
                no_op_streak += 1;
                if no_op_streak >= config.reset_amount {
                    info!(loop_kind = kind.label(), "no candidates for {no_op_streak} ticks, resetting poll interval");
                    poll_interval = config.poll_interval_secs;
                    no_op_streak = 0;
                } else {
                    poll_interval = (poll_interval / config.decrease_rate).max(config.min_wait_secs);
                }
            }
        }
    }
}

/// Samples a donor/recipient team pair, checks the sampled shard is worth
/// moving, and sends a `RelocateShard` if so. Returns `Ok(true)` if a
/// candidate was sent, `Ok(false)` if no acceptable candidate was found.
async fn try_one_tick(
    kind: RebalanceKind,
    config: &RebalanceConfig,
    deps: &RebalanceDeps,
    out: &mpsc::Sender<RelocateShard>,
) -> crate::error::Result<bool> {
    let team = match kind {
        RebalanceKind::MountainChopper => deps.source.most_overutilized_team().await?,
        RebalanceKind::ValleyFiller => deps.source.most_underutilized_team().await?,
    };
    let Some(team) = team else {
        return Ok(false);
    };

    let average_bytes = deps.average_bytes.average_shard_bytes().await?;
    let min_bytes = config.min_shard_bytes.max(average_bytes);

    for _ in 0..config.max_retries {
        let Some(range) = deps.source.sample_shard(&team, min_bytes).await? else {
            continue;
        };
        let metrics = deps.shard_metrics.shard_metrics(&range).await?;
        if source_and_dest_too_similar(metrics.bytes, average_bytes, config.min_shard_bytes) {
            continue;
        }
        if !deps.source.team_still_owns(&team, &range).await? {
            debug!(loop_kind = kind.label(), range = %range, "sampled shard moved before rebalance could commit, resampling");
            continue;
        }
        let _ = out
            .send(RelocateShard::new(range, kind.priority()))
            .await;
        return Ok(true);
    }
    Ok(false)
}

/// The rebalance tolerance check: a candidate shard is only worth moving if
/// it differs from the cluster average by more than `3 * max(min_shard_bytes,
/// shard_bytes)` — otherwise the move would just oscillate the same bytes
/// back and forth for no real gain.
fn source_and_dest_too_similar(shard_bytes: i64, average_bytes: i64, min_shard_bytes: i64) -> bool {
    let tolerance = 3 * min_shard_bytes.max(shard_bytes);
    (shard_bytes - average_bytes).abs() <= tolerance
}
