//! Relocator: the per-launched-relocation task that picks a destination
//! team, drives the external key-move, and reports back to the queue.
//!
//! State machine: `Selecting` -> `Moving` -> `Verifying` -> a terminal
//! outcome. Every terminal path — success, retryable `move_to_removed_server`,
//! cancellation, or any other error — notifies the queue so the busyness
//! ledger and in-flight bookkeeping unwind; only genuinely unexpected errors
//! are re-raised past this task.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RelocatorConfig;
use crate::error::{DistributeError, Result};
use crate::fetcher::CancelToken;
use crate::metrics;
use crate::types::{
    priority, KeyMover, MoveOutcome, Relocation, SelectedTeam, ServerId, ShardMetricsSource,
    ShardsAffectedByTeamFailure, TeamCollection,
};

/// Outcome a relocator reports once it reaches a terminal state. Carried
/// alongside the final [`Relocation`] so the queue can re-derive counters
/// and the busyness ledger without re-deriving priority bands itself.
#[derive(Debug)]
pub enum RelocatorOutcome {
    Success { bytes_moved: u64 },
    /// Cancelled by a superseding enqueue or a shutdown signal. Not an
    /// operational failure.
    Cancelled,
    /// Every other failure, forwarded to the supervising error channel by
    /// the driver after the queue has unwound its bookkeeping.
    Failed(DistributeError),
}

/// Events emitted over the relocator's lifetime. The driver relays
/// `DataTransferComplete` into [`crate::queue::RelocationQueue::data_transfer_complete`]
/// and `Terminal` into [`crate::queue::RelocationQueue::relocation_complete`].
#[derive(Debug)]
pub enum RelocatorEvent {
    DataTransferComplete { id: uuid::Uuid, relocation: Relocation },
    Terminal { relocation: Relocation, outcome: RelocatorOutcome },
}

/// Collaborators a relocator needs beyond what `Relocation` already carries.
/// One [`TeamCollection`] per configured replication dimension (e.g. two for
/// a two-datacenter deployment); the relocator requests a destination team
/// from each and requires at least one to come back healthy before moving.
#[derive(Clone)]
pub struct RelocatorDeps {
    pub teams: Vec<std::sync::Arc<dyn TeamCollection>>,
    pub mover: std::sync::Arc<dyn KeyMover>,
    /// Re-checked just before `Selecting` hands off to `Moving`, since team
    /// health can change in the gap between selection and commit.
    pub team_failure: std::sync::Arc<dyn ShardsAffectedByTeamFailure>,
    pub shard_metrics: std::sync::Arc<dyn ShardMetricsSource>,
}

/// Inflight penalty applied to team-selection requests, keyed by how
/// desperate the relocation is: a team-0/1-left relocation will accept a
/// much busier destination than a cosmetic rebalance would.
fn inflight_penalty(health_priority: Option<u32>, config: &RelocatorConfig) -> f64 {
    match health_priority {
        Some(priority::TEAM_0_LEFT) | Some(priority::TEAM_1_LEFT) | Some(priority::POPULATE_REGION) => {
            config.inflight_penalty_one_left
        }
        Some(priority::TEAM_UNHEALTHY) | Some(priority::TEAM_2_LEFT) => config.inflight_penalty_unhealthy,
        _ => config.inflight_penalty_healthy,
    }
}

/// A destination chosen for one replication dimension: the concrete primary
/// target plus any remaining teammates to catch up once the primary move
/// succeeds (the "extras" of §4.5 Verifying).
struct DimensionPlan {
    team: SelectedTeam,
    primary: ServerId,
    extras: Vec<ServerId>,
}

/// Splits a selected team into a single random non-holding destination (the
/// concrete move target) and the rest of the team as extras to catch up
/// afterward. If every server in the team already holds the range, the
/// first server is used as a no-op primary with no extras.
fn plan_dimension(team: SelectedTeam, complete_sources: &[ServerId]) -> DimensionPlan {
    let mut non_holding: Vec<ServerId> = team
        .servers
        .iter()
        .copied()
        .filter(|s| !complete_sources.contains(s))
        .collect();
    let primary = if non_holding.is_empty() {
        team.servers.first().copied().expect("selected team is never empty")
    } else {
        *non_holding.choose(&mut rand::thread_rng()).expect("non_holding is non-empty")
    };
    non_holding.retain(|s| *s != primary);
    DimensionPlan { team, primary, extras: non_holding }
}

/// Requests a destination team from every configured dimension, retrying
/// with `best_team_stuck_delay_ms` backoff until every dimension has
/// returned a team and at least one of them is healthy.
async fn select_teams(
    relocation: &Relocation,
    deps: &RelocatorDeps,
    config: &RelocatorConfig,
    cancel: &CancelToken,
) -> Result<Vec<DimensionPlan>> {
    let exclude: HashSet<ServerId> = relocation.src.iter().copied().collect();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let mut plans = Vec::with_capacity(deps.teams.len());
        let mut any_healthy = false;
        let mut all_resolved = true;

        for collection in &deps.teams {
            match collection
                .select_destination_team(relocation, &exclude, relocation.wants_new_servers)
                .await?
            {
                Some(team) => {
                    any_healthy |= team.healthy;
                    plans.push(plan_dimension(team, &relocation.complete_sources));
                }
                None => {
                    all_resolved = false;
                    break;
                }
            }
        }

        if all_resolved && any_healthy {
            return Ok(plans);
        }

        if attempt >= config.best_team_stuck_threshold {
            error!(id = %relocation.id, attempt, "stuck selecting a healthy destination team");
        } else {
            debug!(id = %relocation.id, attempt, "no healthy destination team yet, retrying");
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DistributeError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(config.best_team_stuck_delay_ms)) => {}
        }
    }
}

/// Runs one relocator task to completion. `penalty` is computed but not
/// threaded further than logging here — the real team-selection scoring
/// lives in the (out-of-scope) placement layer; this crate only passes the
/// penalty through as a selection hint via `TeamCollection`.
pub async fn run(
    mut relocation: Relocation,
    deps: RelocatorDeps,
    config: RelocatorConfig,
    cancel: CancelToken,
    events: mpsc::Sender<RelocatorEvent>,
) {
    let started = Instant::now();
    let penalty = inflight_penalty(relocation.health_priority, &config);
    debug!(id = %relocation.id, range = %relocation.range, penalty, "relocator starting");

    let mut signalled_transfer_complete = false;
    let outcome = loop {
        match run_once(&mut relocation, &deps, &config, &cancel, &events, &mut signalled_transfer_complete).await {
            Ok(outcome) => break outcome,
            Err(DistributeError::MoveToRemovedServer) => {
                warn!(id = %relocation.id, "move targeted a removed server, retrying from selection");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break RelocatorOutcome::Cancelled,
                    _ = tokio::time::sleep(Duration::from_millis(config.retry_relocate_shard_delay_ms)) => {}
                }
                continue;
            }
            Err(DistributeError::TeamUnavailable { attempts }) => {
                warn!(id = %relocation.id, attempts, "selected team failed re-verification, retrying from selection");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break RelocatorOutcome::Cancelled,
                    _ = tokio::time::sleep(Duration::from_millis(config.best_team_stuck_delay_ms)) => {}
                }
                continue;
            }
            Err(DistributeError::Cancelled) => break RelocatorOutcome::Cancelled,
            Err(err) => break RelocatorOutcome::Failed(err),
        }
    };

    if !signalled_transfer_complete {
        let _ = events
            .send(RelocatorEvent::DataTransferComplete {
                id: relocation.id,
                relocation: relocation.clone(),
            })
            .await;
    }

    let elapsed = started.elapsed();
    metrics::record_relocation_duration(relocation.priority, elapsed);
    if elapsed > Duration::from_secs(config.relocation_duration_budget_secs) {
        warn!(id = %relocation.id, elapsed_secs = elapsed.as_secs(), "relocation ran past its duration budget");
    } else {
        info!(id = %relocation.id, elapsed_secs = elapsed.as_secs(), "relocation finished");
    }

    let _ = events.send(RelocatorEvent::Terminal { relocation, outcome }).await;
}

/// One full pass through `Selecting` -> `Moving` -> `Verifying`. Returns the
/// terminal outcome on success, or the error that should drive a retry (by
/// the caller's loop) or a terminal failure.
async fn run_once(
    relocation: &mut Relocation,
    deps: &RelocatorDeps,
    config: &RelocatorConfig,
    cancel: &CancelToken,
    events: &mpsc::Sender<RelocatorEvent>,
    signalled_transfer_complete: &mut bool,
) -> Result<RelocatorOutcome> {
    // Selecting
    let plans = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DistributeError::Cancelled),
        result = select_teams(relocation, deps, config, cancel) => result?,
    };

    let dest_ids: Vec<ServerId> = plans.iter().map(|p| p.primary).collect();
    let healthy_ids: Vec<ServerId> = plans
        .iter()
        .filter(|p| p.team.healthy)
        .map(|p| p.primary)
        .collect();

    // Re-verify the selected team is still healthy right before committing:
    // health can change in the gap between Selecting and the move itself.
    let still_healthy = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DistributeError::Cancelled),
        result = deps.team_failure.is_team_healthy(&dest_ids) => result?,
    };
    if !still_healthy {
        return Err(DistributeError::TeamUnavailable { attempts: 1 });
    }

    // Moving: race the key-move RPC against a periodic health poll so we can
    // release source busyness (via DataTransferComplete) the moment a
    // destination goes unhealthy, without abandoning the in-flight move.
    let health_poll = Duration::from_millis(config.health_poll_time_ms);
    let move_timer = metrics::CallTimer::start();
    let move_outcome = {
        let move_fut = deps.mover.move_range(&relocation.range, &relocation.src, &dest_ids);
        tokio::pin!(move_fut);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DistributeError::Cancelled),
                result = &mut move_fut => {
                    match &result {
                        Ok(_) => metrics::record_move_attempt(Ok(()), move_timer.elapsed()),
                        Err(err) => metrics::record_move_attempt(Err(err), move_timer.elapsed()),
                    }
                    break result?;
                }
                _ = tokio::time::sleep(health_poll) => {
                    if !healthy_ids.is_empty() && !deps.mover.poll_destination_health(&healthy_ids).await.unwrap_or(true)
                        && !*signalled_transfer_complete
                    {
                        warn!(id = %relocation.id, "destination became unhealthy mid-move, releasing source busyness early");
                        let _ = events
                            .send(RelocatorEvent::DataTransferComplete {
                                id: relocation.id,
                                relocation: relocation.clone(),
                            })
                            .await;
                        *signalled_transfer_complete = true;
                    }
                }
            }
        }
    };

    match move_outcome {
        MoveOutcome::MoveToRemovedServer => return Err(DistributeError::MoveToRemovedServer),
        MoveOutcome::RetryableError => {
            return Err(DistributeError::Relocator("key-move reported a retryable error".into()))
        }
        MoveOutcome::Complete => {}
    }

    // Verifying: any dimension with leftover extras gets a follow-up move
    // that widens the destination set to the full team.
    for plan in &plans {
        if plan.extras.is_empty() {
            continue;
        }
        let mut widened = vec![plan.primary];
        widened.extend(plan.extras.iter().copied());
        debug!(id = %relocation.id, extras = plan.extras.len(), "widening destination to catch up team extras");
        match deps.mover.move_range(&relocation.range, &relocation.src, &widened).await? {
            MoveOutcome::MoveToRemovedServer => return Err(DistributeError::MoveToRemovedServer),
            MoveOutcome::RetryableError => {
                return Err(DistributeError::Relocator("extras catch-up move failed".into()))
            }
            MoveOutcome::Complete => {}
        }
    }

    relocation.src = dest_ids;
    let bytes_moved = match deps.shard_metrics.shard_metrics(&relocation.range).await {
        Ok(metrics) => metrics.bytes.max(0) as u64,
        Err(err) => {
            warn!(id = %relocation.id, error = %err, "failed to read shard bytes for completed relocation");
            0
        }
    };
    Ok(RelocatorOutcome::Success { bytes_moved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyRange, RelocateShard};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn server() -> ServerId {
        ServerId(uuid::Uuid::new_v4())
    }

    fn relocation(priority: u32) -> Relocation {
        let mut r = Relocation::from_request(
            RelocateShard::new(KeyRange::new(b"a".to_vec(), Some(b"m".to_vec())), priority),
            Instant::now(),
        );
        r.src = vec![server(), server(), server()];
        r
    }

    struct AlwaysHealthyTeams {
        servers: Vec<ServerId>,
    }

    #[async_trait]
    impl TeamCollection for AlwaysHealthyTeams {
        async fn select_destination_team(
            &self,
            _relocation: &Relocation,
            _exclude: &HashSet<ServerId>,
            _prefer_new_servers: bool,
        ) -> Result<Option<SelectedTeam>> {
            Ok(Some(SelectedTeam {
                servers: self.servers.clone(),
                is_new_team: true,
                healthy: true,
            }))
        }
    }

    struct AlwaysHealthyFailureCheck;

    #[async_trait]
    impl ShardsAffectedByTeamFailure for AlwaysHealthyFailureCheck {
        async fn is_team_healthy(&self, _servers: &[ServerId]) -> Result<bool> {
            Ok(true)
        }
    }

    struct ZeroMetrics;

    #[async_trait]
    impl ShardMetricsSource for ZeroMetrics {
        async fn shard_metrics(&self, _range: &KeyRange) -> Result<crate::types::ShardMetrics> {
            Ok(crate::types::ShardMetrics { bytes: 4096, bytes_per_second: 0 })
        }
    }

    struct CountingMover {
        moves: AtomicUsize,
    }

    #[async_trait]
    impl KeyMover for CountingMover {
        async fn move_range(&self, _range: &KeyRange, _src: &[ServerId], _dst: &[ServerId]) -> Result<MoveOutcome> {
            self.moves.fetch_add(1, Ordering::SeqCst);
            Ok(MoveOutcome::Complete)
        }

        async fn poll_destination_health(&self, _dst: &[ServerId]) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn successful_run_emits_transfer_complete_then_terminal() {
        let r = relocation(priority::SPLIT_SHARD);
        let deps = RelocatorDeps {
            teams: vec![Arc::new(AlwaysHealthyTeams {
                servers: vec![server(), server(), server()],
            })],
            mover: Arc::new(CountingMover { moves: AtomicUsize::new(0) }),
            team_failure: Arc::new(AlwaysHealthyFailureCheck),
            shard_metrics: Arc::new(ZeroMetrics),
        };
        let config = RelocatorConfig {
            health_poll_time_ms: 50_000,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(8);
        run(r, deps, config, CancelToken::new(), tx).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, RelocatorEvent::DataTransferComplete { .. }));
        let second = rx.recv().await.unwrap();
        match second {
            RelocatorEvent::Terminal { outcome, .. } => {
                assert!(matches!(outcome, RelocatorOutcome::Success { bytes_moved: 4096 }));
            }
            _ => panic!("expected terminal event"),
        }
    }

    #[tokio::test]
    async fn cancellation_before_selection_reports_cancelled_without_moving() {
        let r = relocation(priority::SPLIT_SHARD);
        let mover = Arc::new(CountingMover { moves: AtomicUsize::new(0) });
        let deps = RelocatorDeps {
            teams: vec![Arc::new(AlwaysHealthyTeams { servers: vec![server()] })],
            mover: mover.clone(),
            team_failure: Arc::new(AlwaysHealthyFailureCheck),
            shard_metrics: Arc::new(ZeroMetrics),
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(8);
        run(r, deps, RelocatorConfig::default(), cancel, tx).await;

        // Cancellation still unwinds through DataTransferComplete + Terminal.
        let _ = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            RelocatorEvent::Terminal { outcome: RelocatorOutcome::Cancelled, .. }
        ));
        assert_eq!(mover.moves.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn plan_dimension_prefers_non_holding_server_as_primary() {
        let holder = server();
        let fresh = server();
        let team = SelectedTeam {
            servers: vec![holder, fresh],
            is_new_team: true,
            healthy: true,
        };
        let plan = plan_dimension(team, &[holder]);
        assert_eq!(plan.primary, fresh);
        assert!(plan.extras.is_empty());
    }

    #[test]
    fn inflight_penalty_escalates_for_desperate_health_bands() {
        let config = RelocatorConfig::default();
        assert!(
            inflight_penalty(Some(priority::TEAM_0_LEFT), &config)
                > inflight_penalty(Some(priority::TEAM_UNHEALTHY), &config)
        );
        assert!(
            inflight_penalty(Some(priority::TEAM_UNHEALTHY), &config)
                > inflight_penalty(Some(priority::TEAM_HEALTHY), &config)
        );
    }
}
