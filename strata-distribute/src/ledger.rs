//! Busyness ledger: per-source-server admission accounting that keeps the
//! launch rate proportional to how much capacity each source still has,
//! banded by priority so low-priority cosmetic rebalancing never starves out
//! replication-risk relocations sharing the same source.
//!
//! All arithmetic is fixed-point, scaled by [`FRACTIONAL_SCALE`], to avoid
//! floating-point drift accumulating across millions of add/remove calls
//! over a server's lifetime.

use std::collections::HashMap;

use crate::config::RelocationConfig;
use crate::types::{priority, Relocation, ServerId};

/// Fixed-point scale factor: a fully free band holds `FRACTIONAL_SCALE`
/// "budget units"; launching a relocation spends some fraction of that.
pub const FRACTIONAL_SCALE: i64 = 10_000;

/// Per-server busyness, banded by priority (`priority / 100`, see
/// [`priority::band`]). Each band tracks how much budget is currently spent
/// by in-flight relocations at or below that band — a relocation at band `b`
/// charges every band from `0` through `b`, so low bands accumulate charges
/// from work of every priority while high bands see only the highest-
/// priority work. This is what lets a high-priority relocation launch past
/// low-priority congestion at a shared source while still blocking
/// low-priority launches at that source.
#[derive(Debug, Clone, Default)]
pub struct Busyness {
    bands: [i64; priority::BAND_COUNT as usize],
}

impl Busyness {
    fn band_spend(&self, band: usize) -> i64 {
        self.bands[band]
    }

    /// Whether a relocation with the given work factor can still launch
    /// against this source, i.e. band `band` (which already reflects every
    /// relocation at this priority or higher) has spare capacity.
    fn can_launch(&self, band: usize, work_factor: i64) -> bool {
        self.band_spend(band) + work_factor <= FRACTIONAL_SCALE
    }

    fn add_work(&mut self, band: usize, work_factor: i64) {
        for b in &mut self.bands[..=band] {
            *b += work_factor;
        }
    }

    fn remove_work(&mut self, band: usize, work_factor: i64) {
        for b in &mut self.bands[..=band] {
            *b = (*b - work_factor).max(0);
        }
    }
}

/// Tracks [`Busyness`] per source server and computes admission decisions
/// for the relocation queue's launch pass.
#[derive(Debug, Default)]
pub struct Ledger {
    per_server: HashMap<ServerId, Busyness>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, server: ServerId) -> &mut Busyness {
        self.per_server.entry(server).or_default()
    }

    /// Work factor charged against each source server for this relocation's
    /// priority band and team health, expressed as a fraction of
    /// [`FRACTIONAL_SCALE`]. A single source serving 0 or 1 surviving
    /// replicas is charged the whole band (it cannot parallelize with
    /// anything else); 2 surviving replicas share the band two ways; a
    /// healthy team's work is divided across `team_size` sources.
    pub fn work_factor(relocation: &Relocation, config: &RelocationConfig) -> i64 {
        let team_size = config.team_size.max(1) as i64;
        let parallelism = config.parallelism_per_source_server.max(1) as i64;
        let denom = match relocation.health_priority {
            Some(p) if p == priority::TEAM_0_LEFT || p == priority::TEAM_1_LEFT => parallelism,
            Some(priority::TEAM_2_LEFT) => 2 * parallelism,
            _ => team_size * parallelism,
        };
        (FRACTIONAL_SCALE / denom.max(1)).max(1)
    }

    /// Minimum number of admissible sources required before a relocation may
    /// launch, per [`crate::config::RelocationConfig::use_old_needed_servers`].
    pub fn needed_servers(src_len: usize, config: &RelocationConfig) -> usize {
        let team_size = config.team_size as i64;
        let single_region = config.single_region_team_size as i64;
        let src_len = src_len as i64;
        let needed = if config.use_old_needed_servers {
            (src_len - team_size + 1).max(1)
        } else {
            src_len.min(team_size - single_region + 1)
        };
        needed.max(1) as usize
    }

    /// Whether `relocation` can launch right now: among its source servers,
    /// at least [`Self::needed_servers`] must have spare budget in the
    /// relevant band, treating any server that also sources a relocation in
    /// `cancellable` as having that relocation's charge already released.
    pub fn can_launch(&self, relocation: &Relocation, config: &RelocationConfig) -> bool {
        let band = priority::band(relocation.priority);
        let work_factor = Self::work_factor(relocation, config);
        let admissible = relocation
            .src
            .iter()
            .filter(|s| {
                self.per_server
                    .get(s)
                    .map(|b| b.can_launch(band, work_factor))
                    .unwrap_or(true)
            })
            .count();
        admissible >= Self::needed_servers(relocation.src.len(), config)
    }

    /// Charges `relocation`'s work factor against every one of its source
    /// servers. Call once, at the moment a relocation is handed off to a
    /// relocator task.
    pub fn launch(&mut self, relocation: &mut Relocation, config: &RelocationConfig) {
        let band = priority::band(relocation.priority);
        let work_factor = Self::work_factor(relocation, config);
        relocation.work_factor = work_factor as u32;
        for server in relocation.src.clone() {
            self.entry(server).add_work(band, work_factor);
        }
    }

    /// Releases `relocation`'s charge from every source server, on
    /// completion, abandonment, or cancellation.
    pub fn complete(&mut self, relocation: &Relocation) {
        let band = priority::band(relocation.priority);
        let work_factor = relocation.work_factor as i64;
        if work_factor == 0 {
            return;
        }
        for server in &relocation.src {
            if let Some(b) = self.per_server.get_mut(server) {
                b.remove_work(band, work_factor);
            }
        }
    }

    /// Debug-only consistency check: no band may be negative or exceed
    /// `FRACTIONAL_SCALE`, and each band must be at least as large as the
    /// next (lower bands accumulate charges from every higher band too).
    pub fn validate(&self) -> Result<(), String> {
        for (server, busyness) in &self.per_server {
            for (band, &spend) in busyness.bands.iter().enumerate() {
                if spend < 0 {
                    return Err(format!("{server} band {band} went negative: {spend}"));
                }
            }
            for w in busyness.bands.windows(2) {
                if w[1] > w[0] {
                    return Err(format!(
                        "{server} bands must be non-increasing: {:?}",
                        busyness.bands
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KeyRange, RelocateShard};
    use std::time::Instant;

    fn server() -> ServerId {
        ServerId(uuid::Uuid::new_v4())
    }

    fn relocation(priority: u32, src: Vec<ServerId>) -> Relocation {
        let mut r = Relocation::from_request(
            RelocateShard::new(KeyRange::new(b"a".to_vec(), Some(b"b".to_vec())), priority),
            Instant::now(),
        );
        r.src = src;
        r
    }

    #[test]
    fn single_surviving_replica_takes_the_whole_band() {
        let cfg = RelocationConfig::default();
        let mut r = relocation(priority::TEAM_1_LEFT, vec![server()]);
        r.health_priority = Some(priority::TEAM_1_LEFT);
        assert_eq!(Ledger::work_factor(&r, &cfg), FRACTIONAL_SCALE);
    }

    #[test]
    fn healthy_team_divides_work_across_team_size() {
        let cfg = RelocationConfig::default();
        let r = relocation(priority::SPLIT_SHARD, vec![server()]);
        assert_eq!(
            Ledger::work_factor(&r, &cfg),
            FRACTIONAL_SCALE / (cfg.team_size as i64 * cfg.parallelism_per_source_server as i64)
        );
    }

    #[test]
    fn launch_then_complete_is_a_no_op_on_the_ledger() {
        let cfg = RelocationConfig::default();
        let mut ledger = Ledger::new();
        let mut r = relocation(priority::SPLIT_SHARD, vec![server(), server()]);
        assert!(ledger.can_launch(&r, &cfg));
        ledger.launch(&mut r, &cfg);
        ledger.validate().unwrap();
        ledger.complete(&r);
        ledger.validate().unwrap();
        for s in &r.src {
            assert_eq!(ledger.per_server.get(s).unwrap().bands, [0; priority::BAND_COUNT as usize]);
        }
    }

    #[test]
    fn saturated_source_blocks_admission_until_released() {
        let mut cfg = RelocationConfig::default();
        cfg.team_size = 1;
        cfg.parallelism_per_source_server = 1;
        let mut ledger = Ledger::new();
        let s = server();
        let mut first = relocation(priority::SPLIT_SHARD, vec![s]);
        let second = relocation(priority::SPLIT_SHARD, vec![s]);

        assert!(ledger.can_launch(&first, &cfg));
        ledger.launch(&mut first, &cfg);
        assert!(!ledger.can_launch(&second, &cfg));

        ledger.complete(&first);
        assert!(ledger.can_launch(&second, &cfg));
    }

    #[test]
    fn needed_servers_formulas_agree_at_the_boundary() {
        let mut cfg = RelocationConfig::default();
        cfg.team_size = 3;
        cfg.single_region_team_size = 3;
        cfg.use_old_needed_servers = false;
        assert_eq!(Ledger::needed_servers(3, &cfg), 1);

        cfg.use_old_needed_servers = true;
        assert_eq!(Ledger::needed_servers(3, &cfg), 1);
    }
}
