//! Driver loop: the single reactor task that owns the relocation queue and
//! multiplexes every producer and completion signal into it.
//!
//! Every suspension point elsewhere in this crate — fetch permits, move
//! RPCs, poll delays — runs on its own spawned task; this loop itself never
//! awaits anything but the next event, so the queue's invariants hold at
//! every iteration boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::DistributeConfig;
use crate::error::{DistributeError, Result};
use crate::fetcher::{self, CancelToken};
use crate::metrics as relocation_metrics;
use crate::queue::{EnqueueOutcome, QueueSnapshot, RelocationQueue};
use crate::rebalance::{self, RebalanceDeps, RebalanceKind};
use crate::relocator::{self, RelocatorDeps, RelocatorEvent, RelocatorOutcome};
use crate::types::{KeyRange, RangeServerDirectory, RelocateShard, Relocation, ServerId};

/// Collaborators the driver loop needs to wire up fetchers, relocators, and
/// rebalancers. Bundled so `run`'s signature stays readable.
pub struct DriverDeps {
    pub directory: Arc<dyn RangeServerDirectory>,
    pub relocator: RelocatorDeps,
    pub rebalance: RebalanceDeps,
}

/// Result of one Source Fetcher task, relayed back to the driver.
struct FetchResult {
    id: Uuid,
    range: KeyRange,
    outcome: Result<(Vec<ServerId>, Vec<ServerId>)>,
}

/// Runs the reactor until `cancel` fires or `input_rx` is closed and
/// drained. Consumes `input_rx` as the external `RelocateShard` stream;
/// rebalancer output is merged into the same enqueue path internally.
///
/// `unhealthy` is a watch channel mirroring the `raw_processing_unhealthy`
/// observable; `errors` receives any non-benign relocator failure for the
/// caller to decide whether to restart the whole subsystem.
pub async fn run(
    config: DistributeConfig,
    deps: DriverDeps,
    mut input_rx: mpsc::Receiver<RelocateShard>,
    errors: mpsc::Sender<DistributeError>,
    unhealthy: watch::Sender<bool>,
    cancel: CancelToken,
) {
    let mut queue = RelocationQueue::new();
    let fetch_permits = Arc::new(Semaphore::new(config.fetcher.fetch_parallelism));

    let (fetch_tx, mut fetch_rx) = mpsc::channel::<FetchResult>(256);
    let (relocator_tx, mut relocator_rx) = mpsc::channel::<RelocatorEvent>(256);
    let (rebalance_tx, mut rebalance_rx) = mpsc::channel::<RelocateShard>(64);

    let snapshot = Arc::new(parking_lot::RwLock::new(QueueSnapshot::default()));
    for kind in [RebalanceKind::MountainChopper, RebalanceKind::ValleyFiller] {
        tokio::spawn(rebalance::run(
            kind,
            config.rebalance.clone(),
            clone_rebalance_deps(&deps.rebalance),
            snapshot.clone(),
            rebalance_tx.clone(),
            cancel.clone(),
        ));
    }

    let mut metrics_interval = tokio::time::interval(std::time::Duration::from_secs(config.driver.metrics_interval_secs));
    let mut fetch_cancels: HashMap<Uuid, CancelToken> = HashMap::new();
    let mut relocator_cancels: HashMap<Uuid, CancelToken> = HashMap::new();

    loop {
        let mut dirty = false;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("driver loop received shutdown signal");
                break;
            }

            maybe_req = input_rx.recv() => {
                match maybe_req {
                    Some(req) => {
                        let outcome = queue.enqueue(req, Instant::now());
                        handle_enqueue_outcome(outcome, &deps.directory, &config, &fetch_permits, &fetch_tx, &mut fetch_cancels, &mut relocator_cancels);
                        dirty = true;
                    }
                    None => {
                        debug!("input stream closed, continuing to drain in-flight work");
                    }
                }
            }

            Some(req) = rebalance_rx.recv() => {
                let outcome = queue.enqueue(req, Instant::now());
                handle_enqueue_outcome(outcome, &deps.directory, &config, &fetch_permits, &fetch_tx, &mut fetch_cancels, &mut relocator_cancels);
                dirty = true;
            }

            Some(result) = fetch_rx.recv() => {
                fetch_cancels.remove(&result.id);
                match result.outcome {
                    Ok((src, complete_sources)) => {
                        if queue
                            .complete_source_fetch(result.id, &result.range, src, complete_sources)
                            .is_some()
                        {
                            dirty = true;
                        }
                    }
                    Err(err) if err.is_benign() => {}
                    Err(err) => warn!(range = %result.range, error = %err, "source fetch exhausted retries"),
                }
            }

            Some(event) = relocator_rx.recv() => {
                handle_relocator_event(event, &mut queue, &mut relocator_cancels, &errors).await;
                dirty = true;
            }

            _ = metrics_interval.tick() => {
                let snap = queue.snapshot();
                emit_metrics(&snap);
                *snapshot.write() = snap;
            }
        }

        if dirty {
            let launched = queue.try_launch(&config.relocation);
            for relocation in launched {
                let token = CancelToken::new();
                relocator_cancels.insert(relocation.id, token.clone());
                tokio::spawn(relocator::run(
                    relocation,
                    clone_relocator_deps(&deps.relocator),
                    config.relocator.clone(),
                    token,
                    relocator_tx.clone(),
                ));
            }
            let snap = queue.snapshot();
            let is_unhealthy = snap.unhealthy_relocations > 0;
            relocation_metrics::record_unhealthy_observable(is_unhealthy);
            let _ = unhealthy.send(is_unhealthy);
        }

        if cfg!(debug_assertions) {
            if let Err(reason) = queue.validate() {
                error!(reason = %reason, "relocation queue failed its consistency check");
            }
        }
    }

    for token in fetch_cancels.values().chain(relocator_cancels.values()) {
        token.cancel();
    }
}

async fn handle_relocator_event(
    event: RelocatorEvent,
    queue: &mut RelocationQueue,
    relocator_cancels: &mut HashMap<Uuid, CancelToken>,
    errors: &mpsc::Sender<DistributeError>,
) {
    match event {
        RelocatorEvent::DataTransferComplete { id, relocation } => {
            queue.data_transfer_complete(id, &relocation.range);
        }
        RelocatorEvent::Terminal { relocation, outcome } => {
            relocator_cancels.remove(&relocation.id);
            match outcome {
                RelocatorOutcome::Success { bytes_moved } => {
                    queue.relocation_complete(&relocation, bytes_moved);
                }
                RelocatorOutcome::Cancelled => {
                    queue.relocation_complete(&relocation, 0);
                }
                RelocatorOutcome::Failed(err) => {
                    // The relocation keeps its identity and re-competes for
                    // launch; only non-benign errors escalate past this task.
                    let benign = err.is_benign();
                    queue.relocation_retry(relocation);
                    if !benign {
                        let _ = errors.send(err).await;
                    }
                }
            }
        }
    }
}

/// Applies the side effects of an [`EnqueueOutcome`]: cancels the relocators
/// of any in-flight work the enqueue superseded outright (so a stale
/// relocator never outlives the ledger charge it's about to lose), then
/// spawns a Source Fetcher for the enqueued relocation and for every
/// narrowed neighbor whose prior fetch no longer covers the range it still
/// owns.
fn handle_enqueue_outcome(
    outcome: EnqueueOutcome,
    directory: &Arc<dyn RangeServerDirectory>,
    config: &DistributeConfig,
    permits: &Arc<Semaphore>,
    fetch_tx: &mpsc::Sender<FetchResult>,
    fetch_cancels: &mut HashMap<Uuid, CancelToken>,
    relocator_cancels: &mut HashMap<Uuid, CancelToken>,
) {
    for id in &outcome.cancelled_in_flight {
        if let Some(token) = relocator_cancels.remove(id) {
            token.cancel();
        }
    }
    spawn_fetch(&outcome.relocation, directory, config, permits, fetch_tx, fetch_cancels);
    for relocation in &outcome.refetch {
        spawn_fetch(relocation, directory, config, permits, fetch_tx, fetch_cancels);
    }
}

fn spawn_fetch(
    relocation: &Relocation,
    directory: &Arc<dyn RangeServerDirectory>,
    config: &DistributeConfig,
    permits: &Arc<Semaphore>,
    fetch_tx: &mpsc::Sender<FetchResult>,
    fetch_cancels: &mut HashMap<Uuid, CancelToken>,
) {
    if let Some(existing) = fetch_cancels.remove(&relocation.id) {
        existing.cancel();
    }
    let cancel = CancelToken::new();
    fetch_cancels.insert(relocation.id, cancel.clone());

    let id = relocation.id;
    let range = relocation.range.clone();
    let mut scratch = relocation.clone();
    let directory = directory.clone();
    let fetcher_config = config.fetcher.clone();
    let permits = permits.clone();
    let fetch_tx = fetch_tx.clone();

    tokio::spawn(async move {
        let outcome = fetcher::fetch_sources(&mut scratch, directory.as_ref(), &fetcher_config, permits.as_ref(), &cancel)
            .await
            .map(|_| (scratch.src, scratch.complete_sources));
        let _ = fetch_tx.send(FetchResult { id, range, outcome }).await;
    });
}

fn emit_metrics(snapshot: &QueueSnapshot) {
    relocation_metrics::record_queue_snapshot(snapshot);
}

/// `RebalanceDeps`/`RelocatorDeps` hold trait objects behind `Arc`, so a
/// manual shallow clone is cheap and avoids requiring `Clone` bounds on the
/// traits themselves.
fn clone_rebalance_deps(deps: &RebalanceDeps) -> RebalanceDeps {
    RebalanceDeps {
        source: deps.source.clone(),
        average_bytes: deps.average_bytes.clone(),
        shard_metrics: deps.shard_metrics.clone(),
        flag: deps.flag.clone(),
    }
}

fn clone_relocator_deps(deps: &RelocatorDeps) -> RelocatorDeps {
    RelocatorDeps {
        teams: deps.teams.clone(),
        mover: deps.mover.clone(),
        team_failure: deps.team_failure.clone(),
        shard_metrics: deps.shard_metrics.clone(),
    }
}
