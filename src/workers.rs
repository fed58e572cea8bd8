use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::Result;

/// A bounded rayon pool for I/O-bound fan-out (fingerprinting, OCR text
/// post-processing, parallel directory walks).
///
/// The size is `min(available cores, cap)` and never below one thread.
pub struct WorkerPool {
    pool: ThreadPool,
    size: usize,
}

impl WorkerPool {
    pub fn new(cap: Option<usize>) -> Result<Self> {
        let size = pool_size(num_cpus::get(), cap);
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("pixseek-worker-{i}"))
            .build()?;
        tracing::debug!(size, "worker pool ready");
        Ok(Self { pool, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `op` inside the pool; parallel iterators used by `op` are
    /// confined to the pool's threads and joined before returning.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn pool_size(cores: usize, cap: Option<usize>) -> usize {
    cap.map_or(cores, |cap| cores.min(cap)).max(1)
}
