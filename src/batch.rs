//! The "cache these rows" batch operation, with an optional parallel fill.
//!
//! Both the serial and parallel paths share [`compute_row`] for the actual per-row fill logic;
//! they differ only in when slots are allocated (interleaved vs. up front) and in how a row
//! decides whether another row's cached column is safe to reuse.

use crossbeam::atomic::AtomicCell;
use rayon::prelude::*;
use std::sync::Mutex;

use crate::active_set::ActiveSet;
use crate::buffer::Buffer;
use crate::clock::Clock;
use crate::error::CacheError;
use crate::kernel::Kernel;
use crate::slot_table::SlotTable;

/// Computes the full cached row for `row`, which has just been (or is about to be) committed to
/// `own_slot`. For each active column, reuses another slot's already-computed value when one
/// exists, isn't `own_slot`, and `may_reuse` allows it; otherwise calls the kernel directly.
fn compute_row<K: Kernel>(
    row: usize,
    own_slot: usize,
    active: &ActiveSet,
    slots: &SlotTable,
    buffer: &Buffer,
    kernel: &K,
    may_reuse: impl Fn(usize) -> bool,
) -> Result<Vec<f64>, CacheError> {
    // By symmetry K(row, j) == K(j, row): if j is already cached, its row holds that value at
    // the active column `row` occupies, not at `a` (the active column `j` occupies).
    let own_column = active.column_of(row);
    let mut out = Vec::with_capacity(active.len());
    for a in 0..active.len() {
        let j = active.row_at(a);
        let cached_elsewhere = own_column.and_then(|own_column| {
            slots
                .slot_of(j)
                .filter(|&other_slot| other_slot != own_slot && may_reuse(j))
                .map(|other_slot| (other_slot, own_column))
        });
        let value = match cached_elsewhere {
            Some((other_slot, own_column)) => buffer.get(other_slot, own_column),
            None => kernel
                .eval(row, j)
                .map_err(|source| CacheError::Compute { row, source })?,
        };
        out.push(value);
    }
    Ok(out)
}

fn rollback(allocated: &[(usize, usize)], slots: &mut SlotTable, buffer: &Buffer) {
    for &(_, slot) in allocated {
        slots.free(slot);
        buffer.release(slot);
    }
}

/// Allocates and fills each uncached row in order, one at a time: by the time row `k` is filled,
/// rows `0..k` from this same batch are already fully cached and safe to reuse from.
pub fn serial_fill<K: Kernel>(
    uncached: &[usize],
    slots: &mut SlotTable,
    active: &ActiveSet,
    buffer: &Buffer,
    kernel: &K,
    clock: &mut Clock,
) -> Result<Vec<(usize, usize)>, CacheError> {
    let mut allocated = Vec::with_capacity(uncached.len());
    for &row in uncached {
        let slot = match slots.allocate(row, &mut || clock.tick()) {
            Some(slot) => slot,
            None => {
                rollback(&allocated, slots, buffer);
                return Err(CacheError::CacheFull {
                    requested: uncached.len(),
                    capacity: slots.max_elems(),
                });
            }
        };
        allocated.push((row, slot));
        match compute_row(row, slot, active, slots, buffer, kernel, |_| true) {
            Ok(values) => buffer.write_row(slot, values),
            Err(e) => {
                rollback(&allocated, slots, buffer);
                return Err(e);
            }
        }
    }
    Ok(allocated)
}

/// Allocates every uncached row's slot up front (so `index[]`/`invindex[]` never change again
/// during this call), then fills them concurrently. Expected to run inside a
/// `rayon::ThreadPool::install` closure so `par_iter` below picks up the caller's pool.
/// `being_computed[row]` is the sole piece of cross-worker mutable state: true while a row from
/// this batch hasn't finished writing yet, so other workers fall back to a direct kernel call
/// instead of reading a half-written slot.
#[allow(clippy::too_many_arguments)]
pub fn parallel_fill<K: Kernel + Sync>(
    uncached: &[usize],
    n: usize,
    slots: &mut SlotTable,
    active: &ActiveSet,
    buffer: &Buffer,
    kernel: &K,
    clock: &mut Clock,
    min_chunk_len: usize,
) -> Result<Vec<(usize, usize)>, CacheError> {
    let mut alloc_failed = false;
    for &row in uncached {
        if slots.allocate(row, &mut || clock.tick()).is_none() {
            alloc_failed = true;
            break;
        }
    }

    // Rebuilt from `slot_of`, not collected as we allocate: when `uncached.len()` exceeds
    // `slots.max_elems()`, a later row's allocation can evict and reclaim the very slot an
    // earlier row in this same loop just received, so a push-as-you-go list can hold two
    // entries pointing at one physical slot. `slot_of` always reflects who actually owns a
    // slot once every allocation in this call has settled.
    let allocated: Vec<(usize, usize)> = uncached
        .iter()
        .filter_map(|&row| slots.slot_of(row).map(|slot| (row, slot)))
        .collect();

    if alloc_failed {
        rollback(&allocated, slots, buffer);
        return Err(CacheError::CacheFull {
            requested: uncached.len(),
            capacity: slots.max_elems(),
        });
    }

    let being_computed: Vec<AtomicCell<bool>> = (0..n).map(|_| AtomicCell::new(false)).collect();
    for &(row, _) in &allocated {
        being_computed[row].store(true);
    }

    let first_error: Mutex<Option<CacheError>> = Mutex::new(None);
    allocated
        .par_iter()
        .with_min_len(min_chunk_len)
        .for_each(|&(row, slot)| {
            let result = compute_row(row, slot, active, slots, buffer, kernel, |j| {
                !being_computed[j].load()
            });
            match result {
                Ok(values) => buffer.write_row(slot, values),
                Err(e) => {
                    let mut guard = first_error.lock().unwrap();
                    if guard.is_none() {
                        *guard = Some(e);
                    }
                }
            }
            being_computed[row].store(false);
        });

    if let Some(e) = first_error.into_inner().unwrap() {
        rollback(&allocated, slots, buffer);
        return Err(e);
    }
    Ok(allocated)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Symmetric, since a real kappa always is and the reuse path depends on it.
    fn kernel_ij(i: usize, j: usize) -> f64 {
        ((i + 1) * (j + 1)) as f64
    }

    #[test]
    fn serial_fill_reuses_across_rows_in_batch() {
        let n = 4;
        let active = ActiveSet::identity(n);
        let mut slots = SlotTable::new(n, n);
        let mut buffer = Buffer::new(n, n * n);
        buffer.set_row_len(n);
        let mut clock = Clock::new();
        let allocated =
            serial_fill(&[0, 1], &mut slots, &active, &buffer, &kernel_ij, &mut clock).unwrap();
        assert_eq!(allocated.len(), 2);
        for &(row, slot) in &allocated {
            for a in 0..n {
                assert_eq!(buffer.get(slot, a), kernel_ij(row, a));
            }
        }
    }

    #[test]
    fn parallel_fill_matches_kernel_everywhere() {
        let n = 20;
        let active = ActiveSet::identity(n);
        let mut slots = SlotTable::new(n, n);
        let mut buffer = Buffer::new(n, n * n);
        buffer.set_row_len(n);
        let mut clock = Clock::new();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap();
        let rows: Vec<usize> = (0..n).collect();
        let allocated = pool
            .install(|| parallel_fill(&rows, n, &mut slots, &active, &buffer, &kernel_ij, &mut clock, 1))
            .unwrap();
        assert_eq!(allocated.len(), n);
        for &(row, slot) in &allocated {
            for a in 0..n {
                assert_eq!(buffer.get(slot, a), kernel_ij(row, a));
            }
        }
    }

    /// When a batch asks for more distinct rows than there are slots, later rows evict earlier
    /// ones from the same batch before the pool even starts filling; `allocated` must still come
    /// back with one entry per physical slot, each pointing at whichever row actually survived.
    #[test]
    fn parallel_fill_oversized_batch_has_no_duplicate_slots() {
        let n = 8;
        let max_elems = 2;
        let active = ActiveSet::identity(n);
        let mut slots = SlotTable::new(n, max_elems);
        let mut buffer = Buffer::new(n, max_elems * n);
        buffer.set_row_len(n);
        let mut clock = Clock::new();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap();
        let rows: Vec<usize> = (0..6).collect();
        let allocated = pool
            .install(|| parallel_fill(&rows, n, &mut slots, &active, &buffer, &kernel_ij, &mut clock, 1))
            .unwrap();

        assert_eq!(allocated.len(), max_elems);
        let mut seen_slots = std::collections::HashSet::new();
        for &(row, slot) in &allocated {
            assert!(seen_slots.insert(slot), "slot {slot} owned by more than one row");
            assert_eq!(slots.slot_of(row), Some(slot));
            for a in 0..n {
                assert_eq!(buffer.get(slot, a), kernel_ij(row, a));
            }
        }
        assert_eq!(slots.elems(), max_elems);
    }
}
