//! Allocator configuration.
//!
//! Counts are expressed in main-chunk units per size class, matching how the
//! backing memory is acquired and carved. The data tier section is optional;
//! without it, data-purpose demand shares the control tier.

use std::path::Path;

use serde::Deserialize;

use crate::class::POOL_COUNT;

/// Main-chunk budget for one tier.
#[derive(Debug, Clone, Deserialize)]
pub struct TierParams {
    /// Main chunks acquired for this tier at initialization.
    pub main_chunks: usize,
    /// Main chunks carved into the bulk pool, per size class.
    pub bulk: [usize; POOL_COUNT],
    /// Main chunks carved across the per-core fast pools, per size class.
    pub fast: [usize; POOL_COUNT],
    /// Main chunks carved into the reserved pool, per size class.
    pub reserved: [usize; POOL_COUNT],
}

impl TierParams {
    pub(crate) fn carved_total(&self) -> usize {
        self.bulk.iter().sum::<usize>()
            + self.fast.iter().sum::<usize>()
            + self.reserved.iter().sum::<usize>()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of per-core fast pools.
    pub cores: usize,
    /// Control-tier budget.
    pub control: TierParams,
    /// Data-tier budget. `None` leaves the data tier unprovisioned and routes
    /// data demand through the control tier.
    pub data: Option<TierParams>,
    /// Keep retrying a refused minimal slab instead of failing init.
    pub retry_forever: bool,
    /// Concurrent reservation holders.
    pub reserved_io_max: usize,
    /// Queue stall window before deadlock escalation, in milliseconds.
    pub stall_window_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            cores: 4,
            control: TierParams {
                main_chunks: 24,
                bulk: [4, 8, 2],
                fast: [2, 4, 2],
                reserved: [1, 2, 1],
            },
            data: None,
            retry_forever: false,
            reserved_io_max: 1,
            stall_window_ms: 1000,
        }
    }
}

impl PoolConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::PoolError> {
        if self.cores == 0 {
            return Err(crate::PoolError::InvalidConfig("cores must be nonzero".into()));
        }
        if self.reserved_io_max != 1 {
            return Err(crate::PoolError::InvalidConfig(
                "reserved_io_max other than 1 is not supported".into(),
            ));
        }
        for (name, tier) in [("control", Some(&self.control)), ("data", self.data.as_ref())] {
            let Some(tier) = tier else { continue };
            if tier.carved_total() > tier.main_chunks {
                return Err(crate::PoolError::InvalidConfig(format!(
                    "{} tier carves {} main chunks but acquires only {}",
                    name,
                    tier.carved_total(),
                    tier.main_chunks
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml() {
        let text = r#"
            cores = 2
            retry_forever = true

            [control]
            main_chunks = 8
            bulk = [2, 2, 1]
            fast = [1, 1, 0]
            reserved = [0, 1, 0]

            [data]
            main_chunks = 4
            bulk = [0, 3, 0]
            fast = [0, 1, 0]
            reserved = [0, 0, 0]
        "#;
        let config: PoolConfig = toml::from_str(text).unwrap();
        assert_eq!(config.cores, 2);
        assert!(config.retry_forever);
        assert_eq!(config.control.bulk, [2, 2, 1]);
        assert_eq!(config.data.as_ref().unwrap().bulk, [0, 3, 0]);
        assert_eq!(config.stall_window_ms, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_overcommitted_tier() {
        let config = PoolConfig {
            control: TierParams {
                main_chunks: 2,
                bulk: [2, 2, 0],
                fast: [0, 0, 0],
                reserved: [0, 0, 0],
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
