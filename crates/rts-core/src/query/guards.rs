//! Shared guardrails for worker pools and store encodings.

pub const MIN_WORKERS: i64 = 1;
pub const MAX_WORKERS: i64 = 64;
pub const DEFAULT_INDEX_THRESHOLD: i64 = 64;
pub const MAX_INDEX_THRESHOLD: i64 = 1_000_000;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

/// Bound a requested worker count to the supported pool sizes.
pub fn clamp_workers(value: i64) -> usize {
    clamp_int(value, MIN_WORKERS, MAX_WORKERS) as usize
}

pub fn clamp_index_threshold(value: i64) -> usize {
    clamp_int(value, 0, MAX_INDEX_THRESHOLD) as usize
}

/// Worker count matching the machine, bounded like any requested value.
pub fn default_workers() -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(MIN_WORKERS);
    clamp_workers(available)
}

/// Build a bounded pool, or `None` when the pool cannot be created and the
/// caller should run sequentially.
pub fn bounded_pool(workers: usize) -> Option<rayon::ThreadPool> {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
    {
        Ok(pool) => Some(pool),
        Err(e) => {
            tracing::warn!("Falling back to sequential execution: {e}");
            None
        }
    }
}
