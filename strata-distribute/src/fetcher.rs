//! Source Fetcher: resolves which servers currently hold a queued
//! relocation's range before it is eligible for launch admission.
//!
//! Runs with bounded parallelism (a semaphore permit per in-flight fetch),
//! retries transient directory errors with exponential backoff, and falls
//! back to "every storage server is a potential source" when the directory
//! reports too many servers to enumerate precisely.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::FetcherConfig;
use crate::error::{DistributeError, Result};
use crate::metrics;
use crate::types::{RangeServerDirectory, Relocation, ServerId};

/// Cooperative cancellation handle. A single `Arc<Notify>`-backed flag,
/// chosen over pulling in `tokio-util` for the one `CancellationToken` use
/// site this crate has.
#[derive(Clone)]
pub struct CancelToken {
    notify: Arc<tokio::sync::Notify>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(tokio::sync::Notify::new()),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Resolves `relocation.src` by querying `directory`, retrying transient
/// failures with exponential backoff up to `config.max_retry_backoff_ms`,
/// bounded by `permits` for overall fetch parallelism, and abandoning
/// early (returning `Err(DistributeError::Cancelled)`) if `cancel` fires.
pub async fn fetch_sources(
    relocation: &mut Relocation,
    directory: &dyn RangeServerDirectory,
    config: &FetcherConfig,
    permits: &Semaphore,
    cancel: &CancelToken,
) -> Result<()> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DistributeError::Cancelled),
        permit = permits.acquire() => permit.map_err(|_| DistributeError::Cancelled)?,
    };

    let mut backoff = Duration::from_millis(config.retry_backoff_ms);
    let max_backoff = Duration::from_millis(config.max_retry_backoff_ms);
    let timer = metrics::CallTimer::start();

    loop {
        let attempt = directory.servers_for(&relocation.range, config.max_key_servers).await;
        match attempt {
            Ok(Some(sources)) => {
                relocation.src = sources.all;
                relocation.complete_sources = sources.complete;
                metrics::record_fetch_attempt(true, timer.elapsed());
                return Ok(());
            }
            Ok(None) => {
                debug!(range = %relocation.range, "source fetch exceeded max_key_servers, falling back to all servers");
                relocation.src = directory.all_servers().await?;
                relocation.complete_sources.clear();
                metrics::record_fetch_attempt(true, timer.elapsed());
                return Ok(());
            }
            Err(err) if err.is_benign() => return Err(err),
            Err(err) => {
                warn!(range = %relocation.range, error = %err, backoff_ms = backoff.as_millis() as u64, "source fetch failed, retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DistributeError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::types::{KeyRange, RelocateShard, ShardSources};

    struct FlakyDirectory {
        fail_times: AtomicUsize,
        servers: Vec<ServerId>,
    }

    #[async_trait]
    impl RangeServerDirectory for FlakyDirectory {
        async fn servers_for(&self, _range: &KeyRange, _limit: usize) -> Result<Option<ShardSources>> {
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(DistributeError::SourceFetch("transient".into()));
            }
            Ok(Some(ShardSources {
                all: self.servers.clone(),
                complete: self.servers.clone(),
            }))
        }

        async fn all_servers(&self) -> Result<Vec<ServerId>> {
            Ok(self.servers.clone())
        }
    }

    fn relocation() -> Relocation {
        Relocation::from_request(
            RelocateShard::new(KeyRange::new(b"a".to_vec(), Some(b"b".to_vec())), 900),
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn retries_until_directory_succeeds() {
        let dir = FlakyDirectory {
            fail_times: AtomicUsize::new(2),
            servers: vec![ServerId(uuid::Uuid::new_v4())],
        };
        let cfg = FetcherConfig {
            retry_backoff_ms: 1,
            max_retry_backoff_ms: 4,
            ..Default::default()
        };
        let sem = Semaphore::new(1);
        let cancel = CancelToken::new();
        let mut r = relocation();
        fetch_sources(&mut r, &dir, &cfg, &sem, &cancel).await.unwrap();
        assert_eq!(r.src.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_retry_loop() {
        let dir = FlakyDirectory {
            fail_times: AtomicUsize::new(1_000_000),
            servers: vec![],
        };
        let cfg = FetcherConfig {
            retry_backoff_ms: 50,
            max_retry_backoff_ms: 100,
            ..Default::default()
        };
        let sem = Semaphore::new(1);
        let cancel = CancelToken::new();
        let mut r = relocation();
        cancel.cancel();
        let err = fetch_sources(&mut r, &dir, &cfg, &sem, &cancel).await.unwrap_err();
        assert!(err.is_benign());
    }

    struct SplitDirectory {
        all: Vec<ServerId>,
        complete: Vec<ServerId>,
    }

    #[async_trait]
    impl RangeServerDirectory for SplitDirectory {
        async fn servers_for(&self, _range: &KeyRange, _limit: usize) -> Result<Option<ShardSources>> {
            Ok(Some(ShardSources {
                all: self.all.clone(),
                complete: self.complete.clone(),
            }))
        }

        async fn all_servers(&self) -> Result<Vec<ServerId>> {
            Ok(self.all.clone())
        }
    }

    #[tokio::test]
    async fn partial_shard_coverage_leaves_complete_sources_a_strict_subset_of_src() {
        let whole_holder = ServerId(uuid::Uuid::new_v4());
        let fragment_holder = ServerId(uuid::Uuid::new_v4());
        let dir = SplitDirectory {
            all: vec![whole_holder, fragment_holder],
            complete: vec![whole_holder],
        };
        let sem = Semaphore::new(1);
        let cancel = CancelToken::new();
        let mut r = relocation();
        fetch_sources(&mut r, &dir, &FetcherConfig::default(), &sem, &cancel).await.unwrap();
        assert_eq!(r.src, vec![whole_holder, fragment_holder]);
        assert_eq!(r.complete_sources, vec![whole_holder]);
    }
}
