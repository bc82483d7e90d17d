//! Engine and analysis configuration.
//!
//! Defaults mirror what a typical desktop machine can sustain: a handful of
//! engine processes, each given an even share of the CPU threads.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, RefreshKind, System, SystemExt};

use crate::error::{Error, Result};

/// Sentinel centipawn value for forced mate, from the requested side.
pub const MATE_SCORE: i32 = 100_000;

/// Default engine search depth when no time limit is given.
pub const DEFAULT_ENGINE_DEPTH: u32 = 14;

/// Upper bound on pool size before CPU count is considered.
pub const DEFAULT_ENGINE_CONCURRENCY: usize = 4;

/// Default UCI `Hash` option, in megabytes.
pub const DEFAULT_ENGINE_HASH_MB: u32 = 256;

/// Default per-task timeout for pooled engine work.
pub const DEFAULT_ENGINE_TASK_TIMEOUT: Duration = Duration::from_secs(300);

pub fn cpu_count() -> usize {
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    sys.cpus().len().max(1)
}

/// Default pool size: bounded by the configured maximum and the machine.
pub fn default_concurrency() -> usize {
    DEFAULT_ENGINE_CONCURRENCY.min(cpu_count())
}

/// Centipawn cutoffs separating move quality classes.
///
/// A move with `cp_loss` below `inaccuracy` is good; at or above `blunder`
/// it is a blunder. Values must be strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub inaccuracy: i32,
    pub mistake: i32,
    pub blunder: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            inaccuracy: 50,
            mistake: 100,
            blunder: 200,
        }
    }
}

impl Thresholds {
    pub fn new(inaccuracy: i32, mistake: i32, blunder: i32) -> Result<Self> {
        let thresholds = Self {
            inaccuracy,
            mistake,
            blunder,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inaccuracy < self.mistake && self.mistake < self.blunder {
            Ok(())
        } else {
            Err(Error::InvalidThresholds(
                self.inaccuracy,
                self.mistake,
                self.blunder,
            ))
        }
    }
}

/// Search budget for a single position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchLimit {
    /// Search to a fixed depth.
    Depth(u32),
    /// Search for a fixed wall-clock time per position.
    MoveTime(Duration),
}

impl SearchLimit {
    /// Depth unless a time limit is given; time overrides depth.
    pub fn from_budget(depth: Option<u32>, time_limit: Option<f64>) -> Self {
        match time_limit {
            Some(secs) => SearchLimit::MoveTime(Duration::from_secs_f64(secs)),
            None => SearchLimit::Depth(depth.unwrap_or(DEFAULT_ENGINE_DEPTH)),
        }
    }
}

impl Default for SearchLimit {
    fn default() -> Self {
        SearchLimit::Depth(DEFAULT_ENGINE_DEPTH)
    }
}

/// Settings for the engine worker pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Number of engine processes.
    pub size: usize,
    /// UCI `Threads` per engine; defaults to an even share of the CPUs.
    pub threads_per_engine: u32,
    /// UCI `Hash` per engine, in megabytes.
    pub hash_mb: u32,
    /// Per-task timeout; `None` disables the watchdog.
    pub task_timeout: Option<Duration>,
}

impl PoolSettings {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            threads_per_engine: (cpu_count() / size).max(1) as u32,
            hash_mb: DEFAULT_ENGINE_HASH_MB,
            task_timeout: Some(DEFAULT_ENGINE_TASK_TIMEOUT),
        }
    }

    pub fn threads_per_engine(mut self, threads: u32) -> Self {
        self.threads_per_engine = threads.max(1);
        self
    }

    pub fn hash_mb(mut self, hash_mb: u32) -> Self {
        self.hash_mb = hash_mb;
        self
    }

    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds_are_valid() {
        assert!(Thresholds::default().validate().is_ok());
    }

    #[test]
    fn non_monotonic_thresholds_rejected() {
        assert!(Thresholds::new(100, 100, 200).is_err());
        assert!(Thresholds::new(200, 100, 50).is_err());
        assert!(Thresholds::new(50, 100, 200).is_ok());
    }

    #[test]
    fn time_limit_overrides_depth() {
        let limit = SearchLimit::from_budget(Some(20), Some(1.5));
        assert_eq!(limit, SearchLimit::MoveTime(Duration::from_millis(1500)));

        let limit = SearchLimit::from_budget(Some(20), None);
        assert_eq!(limit, SearchLimit::Depth(20));

        let limit = SearchLimit::from_budget(None, None);
        assert_eq!(limit, SearchLimit::Depth(DEFAULT_ENGINE_DEPTH));
    }

    #[test]
    fn pool_settings_share_cpus() {
        let settings = PoolSettings::new(2);
        assert!(settings.threads_per_engine >= 1);
        assert_eq!(settings.hash_mb, DEFAULT_ENGINE_HASH_MB);
    }
}
