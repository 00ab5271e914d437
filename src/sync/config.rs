//! Replication Tunables
//!
//! Every delay, interval and bound used by the replication engine lives here.
//! Defaults suit a small cluster; each field can be overridden through a
//! `REGISTRY_*` environment variable at startup.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between a local write and its sync task becoming eligible,
    /// giving rapid successive writes to one key a chance to merge.
    pub sync_delay: Duration,
    /// Fixed (non-exponential) delay before a failed push is retried.
    pub retry_delay: Duration,
    /// Period of the anti-entropy checksum broadcast.
    pub verify_interval: Duration,
    /// Tick of each shard's drain loop.
    pub drain_interval: Duration,
    /// A shard dispatches once this much time passed since its last
    /// dispatch, even if the batch is small.
    pub dispatch_period: Duration,
    /// A shard dispatches early once this many mutations are pending.
    pub max_batch_size: usize,
    /// Number of independent pending maps the write-side fan-out is sharded
    /// across. Defaults to the available CPU parallelism.
    pub shard_count: usize,
    /// Upper bound on concurrent network pushes.
    pub max_concurrent_pushes: usize,
    /// Delay between attempts of the initial full-state catch-up.
    pub load_retry_delay: Duration,
    /// When false, the node reports available immediately instead of waiting
    /// for the initial catch-up.
    pub data_warmup: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_delay: Duration::from_millis(1000),
            retry_delay: Duration::from_millis(3000),
            verify_interval: Duration::from_millis(5000),
            drain_interval: Duration::from_millis(100),
            dispatch_period: Duration::from_millis(200),
            max_batch_size: 1000,
            shard_count: default_shard_count(),
            max_concurrent_pushes: 8,
            load_retry_delay: Duration::from_millis(1000),
            data_warmup: true,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by any `REGISTRY_*` variables present in the
    /// environment. Unparsable values fall back to the default with a
    /// warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_u64("REGISTRY_SYNC_DELAY_MS") {
            config.sync_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("REGISTRY_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("REGISTRY_VERIFY_INTERVAL_MS") {
            config.verify_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("REGISTRY_DISPATCH_PERIOD_MS") {
            config.dispatch_period = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("REGISTRY_MAX_BATCH_SIZE") {
            config.max_batch_size = n as usize;
        }
        if let Some(n) = env_u64("REGISTRY_SHARD_COUNT") {
            config.shard_count = (n as usize).max(1);
        }
        if let Some(n) = env_u64("REGISTRY_MAX_CONCURRENT_PUSHES") {
            config.max_concurrent_pushes = (n as usize).max(1);
        }
        if let Some(flag) = env_bool("REGISTRY_DATA_WARMUP") {
            config.data_warmup = flag;
        }

        config
    }
}

fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={}", name, raw);
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => {
            tracing::warn!("Ignoring unparsable {}={}", name, raw);
            None
        }
    }
}
