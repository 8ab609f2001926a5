use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{Error, Result};

pub const DEFAULT_BUCKET_CAPACITY: usize = 64;
pub const DEFAULT_MIN_ROWS_PER_TASK: usize = 8;

/// Construction-time tuning of the kernels. Nothing here changes results
/// except the bucket partition, which fixes the summation tree of the
/// sender-grouped reduction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Edge ids per neighbour-index bucket.
    pub bucket_capacity: usize,
    /// Smallest block of output rows handed to one CPU worker.
    pub min_rows_per_task: usize,
    /// Size of the CPU worker pool.
    pub num_threads: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            min_rows_per_task: DEFAULT_MIN_ROWS_PER_TASK,
            num_threads: num_cpus::get(),
        }
    }
}

impl KernelConfig {
    pub fn with_bucket_capacity(mut self, bucket_capacity: usize) -> Self {
        self.bucket_capacity = bucket_capacity;
        self
    }

    pub fn with_min_rows_per_task(mut self, min_rows_per_task: usize) -> Self {
        self.min_rows_per_task = min_rows_per_task;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_capacity == 0 {
            return Err(Error::unsupported("bucket_capacity must be at least 1"));
        }
        if self.min_rows_per_task == 0 {
            return Err(Error::unsupported("min_rows_per_task must be at least 1"));
        }
        if self.num_threads == 0 {
            return Err(Error::unsupported("num_threads must be at least 1"));
        }
        Ok(())
    }

    pub(crate) fn build_pool(&self) -> Result<Arc<ThreadPool>> {
        self.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .thread_name(|i| format!("maceops-{i}"))
            .build()
            .map_err(Error::wrap)?;
        Ok(Arc::new(pool))
    }
}
