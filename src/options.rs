/// Options controlling the size and concurrency of a [`crate::RowCache`].
///
/// * `cache_size_mb` - requested buffer budget, in megabytes.
/// * `training_size` - N, the number of training examples (before regression doubling).
/// * `regression` - if true, the addressable row space doubles to `2 * training_size` and rows
///   `>= training_size` fold onto their mirror row, per the regression addressing convention.
/// * `element_size` - size in bytes of one cached cell; used to convert `cache_size_mb` into a
///   cell budget.
/// * `num_threads` - size of the worker pool used by [`ensure`](crate::RowCache::ensure) to fill
///   rows in parallel. `0` or `1` always takes the serial path.
/// * `min_chunk_len` - don't split a parallel fill batch into chunks smaller than this.
#[derive(Clone, Copy)]
pub struct CacheOptions {
    pub cache_size_mb: usize,
    pub training_size: usize,
    pub regression: bool,
    pub element_size: usize,
    pub num_threads: usize,
    pub min_chunk_len: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            cache_size_mb: 10,
            training_size: 0,
            regression: false,
            element_size: std::mem::size_of::<f64>(),
            num_threads: 0,
            min_chunk_len: 1,
        }
    }
}
