//! Tunables for the relocation queue, its fetcher, relocator, and rebalancers.
//!
//! Every nested config carries `#[serde(default = "fn")]` fields and its own
//! `Default` impl so a deployment can override a single knob in a config
//! file without having to restate the whole subsystem.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the relocation queue subsystem.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DistributeConfig {
    /// Relocation admission and busyness-ledger tunables.
    #[serde(default)]
    pub relocation: RelocationConfig,

    /// Source-fetcher tunables.
    #[serde(default)]
    pub fetcher: FetcherConfig,

    /// Relocator state-machine tunables.
    #[serde(default)]
    pub relocator: RelocatorConfig,

    /// Mountain-chopper / valley-filler rebalancer tunables.
    #[serde(default)]
    pub rebalance: RebalanceConfig,

    /// Driver loop tunables.
    #[serde(default)]
    pub driver: DriverConfig,
}

impl Default for DistributeConfig {
    fn default() -> Self {
        Self {
            relocation: RelocationConfig::default(),
            fetcher: FetcherConfig::default(),
            relocator: RelocatorConfig::default(),
            rebalance: RebalanceConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

/// Admission and busyness-ledger tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelocationConfig {
    /// Number of replicas in a full team (e.g. 3 for triple replication).
    #[serde(default = "default_team_size")]
    pub team_size: usize,

    /// Team size within a single replication region (equals `team_size` for
    /// single-region deployments; smaller for multi-region ones).
    #[serde(default = "default_single_region_team_size")]
    pub single_region_team_size: usize,

    /// How many relocations a single source server may serve concurrently,
    /// at full work factor, before the busyness ledger refuses further work.
    #[serde(default = "default_parallelism_per_source_server")]
    pub parallelism_per_source_server: u32,

    /// Selects the formula used to compute the minimum number of admissible
    /// sources during launch admission (see `ledger::needed_servers`).
    ///
    /// `false` (default) uses the newer formula
    /// `min(|src|, team_size - single_region_team_size + 1)`; `true` uses
    /// the older `max(1, |src| - team_size + 1)`.
    #[serde(default)]
    pub use_old_needed_servers: bool,
}

fn default_team_size() -> usize {
    3
}

fn default_single_region_team_size() -> usize {
    3
}

fn default_parallelism_per_source_server() -> u32 {
    2
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            team_size: default_team_size(),
            single_region_team_size: default_single_region_team_size(),
            parallelism_per_source_server: default_parallelism_per_source_server(),
            use_old_needed_servers: false,
        }
    }
}

/// Source-fetcher tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetcherConfig {
    /// Maximum concurrent source-fetch tasks.
    #[serde(default = "default_fetch_parallelism")]
    pub fetch_parallelism: usize,

    /// Above this many returned shard entries for a single range, the
    /// fetcher gives up enumerating sources precisely and falls back to
    /// "all storage servers are potential sources".
    #[serde(default = "default_max_key_servers")]
    pub max_key_servers: usize,

    /// Initial backoff before retrying a transient backend error.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the exponential backoff.
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,
}

fn default_fetch_parallelism() -> usize {
    8
}

fn default_max_key_servers() -> usize {
    100
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_max_retry_backoff_ms() -> u64 {
    2_000
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            fetch_parallelism: default_fetch_parallelism(),
            max_key_servers: default_max_key_servers(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
        }
    }
}

/// Relocator state-machine tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelocatorConfig {
    /// How often the Relocator polls destination health while `Moving`.
    #[serde(default = "default_health_poll_time_ms")]
    pub health_poll_time_ms: u64,

    /// Delay before re-entering `Selecting` after `move_to_removed_server`.
    #[serde(default = "default_retry_relocate_shard_delay_ms")]
    pub retry_relocate_shard_delay_ms: u64,

    /// Delay between team-selection retries while no healthy team is found.
    #[serde(default = "default_best_team_stuck_delay_ms")]
    pub best_team_stuck_delay_ms: u64,

    /// Attempt count after which a stuck team search is logged at elevated
    /// severity.
    #[serde(default = "default_best_team_stuck_threshold")]
    pub best_team_stuck_threshold: u32,

    /// Relocation duration after which completion is logged at elevated
    /// severity, purely for observability (does not affect correctness).
    #[serde(default = "default_relocation_duration_budget_secs")]
    pub relocation_duration_budget_secs: u64,

    /// Inflight penalty applied to a healthy-team request.
    #[serde(default = "default_inflight_penalty_healthy")]
    pub inflight_penalty_healthy: f64,

    /// Inflight penalty applied when `health_priority` is in the
    /// "unhealthy" band (team-unhealthy, 2-left).
    #[serde(default = "default_inflight_penalty_unhealthy")]
    pub inflight_penalty_unhealthy: f64,

    /// Inflight penalty applied when the relocation is desperate (populate,
    /// 1-left, 0-left) — destinations accept busier teams.
    #[serde(default = "default_inflight_penalty_one_left")]
    pub inflight_penalty_one_left: f64,
}

fn default_health_poll_time_ms() -> u64 {
    1_000
}

fn default_retry_relocate_shard_delay_ms() -> u64 {
    2_000
}

fn default_best_team_stuck_delay_ms() -> u64 {
    1_000
}

fn default_best_team_stuck_threshold() -> u32 {
    50
}

fn default_relocation_duration_budget_secs() -> u64 {
    600
}

fn default_inflight_penalty_healthy() -> f64 {
    1.0
}

fn default_inflight_penalty_unhealthy() -> f64 {
    10.0
}

fn default_inflight_penalty_one_left() -> f64 {
    1_000_000.0
}

impl Default for RelocatorConfig {
    fn default() -> Self {
        Self {
            health_poll_time_ms: default_health_poll_time_ms(),
            retry_relocate_shard_delay_ms: default_retry_relocate_shard_delay_ms(),
            best_team_stuck_delay_ms: default_best_team_stuck_delay_ms(),
            best_team_stuck_threshold: default_best_team_stuck_threshold(),
            relocation_duration_budget_secs: default_relocation_duration_budget_secs(),
            inflight_penalty_healthy: default_inflight_penalty_healthy(),
            inflight_penalty_unhealthy: default_inflight_penalty_unhealthy(),
            inflight_penalty_one_left: default_inflight_penalty_one_left(),
        }
    }
}

/// Mountain-chopper / valley-filler tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RebalanceConfig {
    /// Starting (and reset-target) poll interval for both loops.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Lower bound the poll interval may shrink to when the cluster is not
    /// saturated.
    #[serde(default = "default_min_wait_secs")]
    pub min_wait_secs: f64,

    /// Upper bound the poll interval may grow to when the cluster is
    /// saturated.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: f64,

    /// Multiplier applied to the poll interval after a saturated tick.
    #[serde(default = "default_increase_rate")]
    pub increase_rate: f64,

    /// Divisor applied to the poll interval after a non-saturated tick.
    #[serde(default = "default_decrease_rate")]
    pub decrease_rate: f64,

    /// Consecutive no-op ticks after which the poll interval snaps back to
    /// `poll_interval_secs`.
    #[serde(default = "default_reset_amount")]
    pub reset_amount: u32,

    /// How long, after the cluster last reported write-bandwidth
    /// saturation, the rebalancer still treats it as "recently saturated"
    /// for the purpose of growing its poll interval.
    #[serde(default = "default_saturation_delay_secs")]
    pub saturation_delay_secs: f64,

    /// How often the "rebalance disabled" flag is re-read.
    #[serde(default = "default_switch_check_interval_secs")]
    pub switch_check_interval_secs: f64,

    /// Maximum in-flight relocations at overutilized/underutilized priority
    /// before a rebalancer loop skips injecting more work.
    #[serde(default = "default_rebalance_parallelism")]
    pub rebalance_parallelism: usize,

    /// Number of candidate shards to sample from the donor team before
    /// giving up on finding one above the cluster's average shard size.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Floor used in the donor/recipient similarity tolerance so that tiny
    /// shards don't get oscillated back and forth.
    #[serde(default = "default_min_shard_bytes")]
    pub min_shard_bytes: i64,
}

fn default_poll_interval_secs() -> f64 {
    10.0
}

fn default_min_wait_secs() -> f64 {
    0.1
}

fn default_max_wait_secs() -> f64 {
    60.0
}

fn default_increase_rate() -> f64 {
    1.1
}

fn default_decrease_rate() -> f64 {
    1.01
}

fn default_reset_amount() -> u32 {
    30
}

fn default_saturation_delay_secs() -> f64 {
    10.0
}

fn default_switch_check_interval_secs() -> f64 {
    60.0
}

fn default_rebalance_parallelism() -> usize {
    1
}

fn default_max_retries() -> u32 {
    10
}

fn default_min_shard_bytes() -> i64 {
    200 * 1024 * 1024
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            min_wait_secs: default_min_wait_secs(),
            max_wait_secs: default_max_wait_secs(),
            increase_rate: default_increase_rate(),
            decrease_rate: default_decrease_rate(),
            reset_amount: default_reset_amount(),
            saturation_delay_secs: default_saturation_delay_secs(),
            switch_check_interval_secs: default_switch_check_interval_secs(),
            rebalance_parallelism: default_rebalance_parallelism(),
            max_retries: default_max_retries(),
            min_shard_bytes: default_min_shard_bytes(),
        }
    }
}

/// Driver loop tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    /// How often the driver emits a metrics snapshot.
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    5
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = DistributeConfig::default();
        assert!(cfg.rebalance.min_wait_secs < cfg.rebalance.poll_interval_secs);
        assert!(cfg.rebalance.poll_interval_secs < cfg.rebalance.max_wait_secs);
        assert!(!cfg.relocation.use_old_needed_servers);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = DistributeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DistributeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.relocation.team_size, cfg.relocation.team_size);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: DistributeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.relocation.team_size, default_team_size());
    }
}
