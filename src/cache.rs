//! [`RowCache`]: the bounded-memory, LRU-evicted pool of kernel matrix rows.

use log::{info, warn};
#[cfg(feature = "local_thread_pool")]
use rayon::ThreadPoolBuilder;

use crate::active_set::ActiveSet;
use crate::batch;
use crate::buffer::Buffer;
use crate::clock::Clock;
use crate::error::CacheError;
use crate::kernel::Kernel;
use crate::options::CacheOptions;
use crate::regression;
use crate::slot_table::SlotTable;

/// The set of columns a [`RowCache::fetch`] call should produce.
pub enum Columns<'a> {
    /// A `-1`-terminated list of logical column indices, the legacy solver-facing contract.
    Sentinel(&'a [i64]),
    /// The same thing, as an explicit-length slice — a convenience addition, not a replacement.
    List(&'a [usize]),
    /// Every column in `[0, N)`.
    FullLine,
}

enum CachePool {
    #[cfg(not(feature = "local_thread_pool"))]
    Global,
    #[cfg(feature = "local_thread_pool")]
    Local(Option<rayon::ThreadPool>),
}

impl CachePool {
    fn build(num_threads: usize) -> Self {
        #[cfg(feature = "local_thread_pool")]
        {
            if num_threads < 2 {
                return CachePool::Local(None);
            }
            match ThreadPoolBuilder::new().num_threads(num_threads).build() {
                Ok(pool) => CachePool::Local(Some(pool)),
                Err(e) => {
                    warn!("failed to build kernel cache worker pool ({e}), falling back to the serial fill path");
                    CachePool::Local(None)
                }
            }
        }
        #[cfg(not(feature = "local_thread_pool"))]
        {
            let _ = num_threads;
            CachePool::Global
        }
    }

    fn available(&self) -> bool {
        match self {
            #[cfg(not(feature = "local_thread_pool"))]
            CachePool::Global => true,
            #[cfg(feature = "local_thread_pool")]
            CachePool::Local(pool) => pool.is_some(),
        }
    }

    fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        match self {
            #[cfg(not(feature = "local_thread_pool"))]
            CachePool::Global => op(),
            #[cfg(feature = "local_thread_pool")]
            CachePool::Local(Some(pool)) => pool.install(op),
            #[cfg(feature = "local_thread_pool")]
            CachePool::Local(None) => op(),
        }
    }
}

/// Derives `(n, n_prime, buffer_cells, max_elems)` from `options`, per the §4.1 sizing rules.
fn derive_sizing(options: &CacheOptions) -> Result<(usize, usize, usize, usize), CacheError> {
    let n = options.training_size;
    if n == 0 {
        return Err(CacheError::Config("training_size must be positive".into()));
    }
    if options.element_size == 0 {
        return Err(CacheError::Config("element_size must be positive".into()));
    }

    let n_prime = if options.regression {
        n.checked_mul(2)
            .ok_or_else(|| CacheError::Config("training_size too large for regression doubling".into()))?
    } else {
        n
    };

    let requested_cells =
        (options.cache_size_mb as u128 * (1u128 << 20)) / options.element_size as u128;
    let upper_bound = ((n_prime as u128) * (n_prime as u128)).max(10);
    let b = requested_cells.clamp(10, upper_bound);
    if b > i64::MAX as u128 {
        return Err(CacheError::Config(
            "requested buffer exceeds the largest representable cache index".into(),
        ));
    }
    let b = b as usize;
    if b < n {
        return Err(CacheError::Config(format!(
            "buffer of {b} cells cannot hold even one row of width {n}"
        )));
    }

    let m = (b / n).min(n);
    if m == 0 {
        return Err(CacheError::Config("buffer too small for any row".into()));
    }
    Ok((n, n_prime, b, m))
}

/// A bounded-memory, LRU-evicted cache over rows of a symmetric N x N kernel matrix.
///
/// Owns its `ActiveSet`, slot table, cell buffer, and LRU clock; `kernel` is a shared,
/// never-mutated collaborator. See the crate root docs for the read/write contract between
/// `fetch` and `ensure`.
pub struct RowCache<K: Kernel> {
    kernel: K,
    options: CacheOptions,
    n: usize,
    n_prime: usize,
    active: ActiveSet,
    slots: SlotTable,
    buffer: Buffer,
    clock: Clock,
    pool: CachePool,
}

impl<K: Kernel> RowCache<K> {
    /// Initializes a cache for `options.training_size` rows, backed by `kernel`.
    pub fn init(options: CacheOptions, kernel: K) -> Result<Self, CacheError> {
        let (n, n_prime, b, m) = derive_sizing(&options)?;
        let pool = CachePool::build(options.num_threads);
        info!(
            "kernel cache sized {} cells ({} MB requested) across {m} slots for {n} rows{}",
            b,
            options.cache_size_mb,
            if options.regression { ", regression folding enabled" } else { "" },
        );
        Ok(Self {
            kernel,
            options,
            n,
            n_prime,
            active: ActiveSet::identity(n),
            slots: SlotTable::new(n, m),
            buffer: {
                let mut buf = Buffer::new(n, b);
                buf.set_row_len(n);
                buf
            },
            clock: Clock::new(),
            pool,
        })
    }

    /// The logical training size N.
    pub fn training_size(&self) -> usize {
        self.n
    }

    /// The number of rows currently resident in the cache.
    pub fn len(&self) -> usize {
        self.slots.elems()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.elems() == 0
    }

    fn validate_and_fold(&self, row: usize) -> Result<usize, CacheError> {
        if row >= self.n_prime {
            return Err(CacheError::Usage(format!(
                "row {row} out of range [0, {})",
                self.n_prime
            )));
        }
        Ok(regression::fold(row, self.n))
    }

    /// Returns true iff `row` (folded, if in regression mode) is currently cached. Does not
    /// touch the LRU clock.
    pub fn check(&self, row: usize) -> Result<bool, CacheError> {
        let folded = self.validate_and_fold(row)?;
        Ok(self.slots.slot_of(folded).is_some())
    }

    fn columns_for<'a>(&self, columns: &'a Columns<'a>) -> Box<dyn Iterator<Item = usize> + 'a> {
        match *columns {
            Columns::FullLine => Box::new(0..self.n),
            Columns::List(list) => Box::new(list.iter().copied()),
            Columns::Sentinel(list) => Box::new(
                list.iter()
                    .take_while(|&&v| v != -1)
                    .map(|&v| v as usize),
            ),
        }
    }

    /// Serves a row query, mixing cached columns with freshly computed ones. Never inserts into
    /// the cache — population happens only via [`RowCache::ensure`].
    pub fn fetch(&mut self, row: usize, columns: Columns, out: &mut [f64]) -> Result<(), CacheError> {
        let folded = self.validate_and_fold(row)?;
        let hit_slot = self.slots.slot_of(folded);
        if let Some(slot) = hit_slot {
            let t = self.clock.tick();
            self.slots.set_lru(slot, t);
        }
        // Lock the hit row once up front rather than once per queried column.
        let hit_row = hit_slot.map(|slot| self.buffer.read_row(slot));
        for j in self.columns_for(&columns) {
            if j >= self.n {
                return Err(CacheError::Usage(format!(
                    "column {j} out of range [0, {})",
                    self.n
                )));
            }
            let value = match hit_row.as_ref().and_then(|r| self.active.column_of(j).map(|a| r[a])) {
                Some(v) => v,
                None => self
                    .kernel
                    .eval(folded, j)
                    .map_err(|source| CacheError::Compute { row: folded, source })?,
            };
            out[j] = value;
        }
        drop(hit_row);
        if self.clock.needs_auto_rebase() {
            self.reset_lru();
        }
        self.debug_check_invariants();
        Ok(())
    }

    /// Populates slots for every row in `rows` that isn't already cached, batching the fill
    /// across a worker pool when one is configured and the batch is large enough to benefit.
    pub fn ensure(&mut self, rows: &[usize]) -> Result<(), CacheError> {
        let mut uncached = Vec::with_capacity(rows.len());
        for &row in rows {
            let folded = self.validate_and_fold(row)?;
            if self.slots.slot_of(folded).is_none() && !uncached.contains(&folded) {
                uncached.push(folded);
            }
        }
        if uncached.is_empty() {
            return Ok(());
        }

        let use_parallel = self.pool.available() && self.options.num_threads >= 2 && uncached.len() >= 2;
        let result = if use_parallel {
            let n = self.n;
            let min_chunk_len = self.options.min_chunk_len;
            self.pool.install(|| {
                batch::parallel_fill(
                    &uncached,
                    n,
                    &mut self.slots,
                    &self.active,
                    &self.buffer,
                    &self.kernel,
                    &mut self.clock,
                    min_chunk_len,
                )
            })
        } else {
            batch::serial_fill(
                &uncached,
                &mut self.slots,
                &self.active,
                &self.buffer,
                &self.kernel,
                &mut self.clock,
            )
        };

        let result = match result {
            Ok(_allocated) => {
                if self.clock.needs_auto_rebase() {
                    self.reset_lru();
                }
                Ok(())
            }
            Err(CacheError::CacheFull { requested, capacity }) => {
                warn!(
                    "kernel cache full: requested {requested} new rows against a capacity of {capacity} slots"
                );
                Err(CacheError::CacheFull { requested, capacity })
            }
            Err(e) => Err(e),
        };
        self.debug_check_invariants();
        result
    }

    /// Rebases the LRU clock so the minimum occupied timestamp becomes zero, without changing
    /// relative order.
    pub fn reset_lru(&mut self) {
        let max_lru = (0..self.slots.max_elems())
            .filter(|&s| self.slots.row_of(s).is_some())
            .map(|s| self.slots.lru(s))
            .max()
            .unwrap_or(0);
        if max_lru == 0 {
            self.clock = Clock::new();
            return;
        }
        for s in 0..self.slots.max_elems() {
            if self.slots.row_of(s).is_some() {
                self.slots.set_lru(s, self.slots.lru(s) - max_lru);
            }
        }
        self.clock.rebase(max_lru);
    }

    /// Drops up to `numshrink` active columns for which `keep_predicate` returns false,
    /// compacting the buffer in place and re-deriving slot capacity for the new column width.
    pub fn shrink(
        &mut self,
        mut keep_predicate: impl FnMut(usize) -> bool,
        numshrink: usize,
    ) -> Result<(), CacheError> {
        let old_len = self.active.len();
        if numshrink > old_len {
            return Err(CacheError::Usage(format!(
                "numshrink {numshrink} exceeds the current active width {old_len}"
            )));
        }

        let mut keep_mask = vec![true; old_len];
        let mut dropped = 0usize;
        for (a, keep) in keep_mask.iter_mut().enumerate() {
            if dropped >= numshrink {
                break;
            }
            if !keep_predicate(self.active.row_at(a)) {
                *keep = false;
                dropped += 1;
            }
        }
        if dropped == 0 {
            return Ok(());
        }

        let new_len = old_len - dropped;
        self.buffer.compact(&keep_mask, new_len);

        let mut cursor = 0usize;
        self.active.retain(|_row| {
            let keep = keep_mask[cursor];
            cursor += 1;
            keep
        });

        // A row of width zero costs nothing to keep cached, so an empty active set imposes no
        // memory pressure at all: every slot stays addressable.
        let new_m = if new_len == 0 {
            self.n
        } else {
            (self.buffer.cell_budget() / new_len).min(self.n)
        };
        if new_m < self.slots.max_elems() {
            for slot in self.slots.evict_down_to(new_m) {
                self.buffer.release(slot);
            }
        } else {
            self.slots.raise_capacity(new_m);
        }
        self.debug_check_invariants();
        Ok(())
    }

    /// Releases every cached slot without touching the active set or the buffer's capacity.
    pub fn clear(&mut self) {
        for s in 0..self.slots.max_elems() {
            self.buffer.release(s);
        }
        self.slots.clear();
        self.debug_check_invariants();
    }

    /// Equivalent to `clear` followed by re-deriving the buffer budget and regression flag.
    /// Training size is fixed for the cache's lifetime.
    pub fn resize(&mut self, cache_size_mb: usize, regression: bool) -> Result<(), CacheError> {
        let mut options = self.options;
        options.cache_size_mb = cache_size_mb;
        options.regression = regression;
        let (n, n_prime, b, m) = derive_sizing(&options)?;
        debug_assert_eq!(n, self.n);
        self.options = options;
        self.n_prime = n_prime;
        self.active = ActiveSet::identity(n);
        self.slots = SlotTable::new(n, m);
        self.buffer = {
            let mut buf = Buffer::new(n, b);
            buf.set_row_len(n);
            buf
        };
        self.debug_check_invariants();
        Ok(())
    }

    /// Debug-only cross-checks between `active`, `slots`, `buffer`, and `clock`. Compiled out in
    /// release builds; a no-op is never the same as an invariant that was never written, so this
    /// stays cheap to keep.
    #[cfg(debug_assertions)]
    fn debug_check_invariants(&self) {
        debug_assert_eq!(self.buffer.row_len(), self.active.len());
        if self.active.is_empty() {
            debug_assert_eq!(self.buffer.row_len(), 0);
        }
        for a in 0..self.active.len() {
            let row = self.active.row_at(a);
            debug_assert!(self.active.is_active(row));
            debug_assert_eq!(self.active.column_of(row), Some(a));
        }
        for slot in 0..self.slots.max_elems() {
            if self.slots.row_of(slot).is_some() {
                debug_assert!(self.slots.lru(slot) <= self.clock.current());
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn debug_check_invariants(&self) {}
}
