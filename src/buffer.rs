//! The cache's cell storage.
//!
//! The source keeps one flat array indexed as `slot * row_len + column`. A single `&mut [f64]`
//! can't be handed to several worker threads at once without `unsafe`, so — mirroring this
//! crate's own [`RwLock`]-per-unit approach to parallel mutation (see the locking algorithm) —
//! storage here is one `RwLock<Vec<f64>>` per physical slot instead of one giant array. Each
//! worker locks only the slots it owns for the batch; reads of *other* slots (for inter-row
//! reuse) take a read lock, so no thread ever needs raw pointer arithmetic into shared memory.
//! Unoccupied slots hold an empty `Vec`, so memory use stays proportional to occupancy rather
//! than to the full physical slot count.

use std::sync::{RwLock, RwLockReadGuard};

pub struct Buffer {
    rows: Vec<RwLock<Vec<f64>>>,
    row_len: usize,
    cell_budget: usize,
}

impl Buffer {
    /// `num_slots` is the physical slot capacity (the training size `n`); `cell_budget` is `B`,
    /// retained only to answer [`Buffer::cell_budget`] for sizing math elsewhere.
    pub fn new(num_slots: usize, cell_budget: usize) -> Self {
        Self {
            rows: (0..num_slots).map(|_| RwLock::new(Vec::new())).collect(),
            row_len: 0,
            cell_budget,
        }
    }

    pub fn cell_budget(&self) -> usize {
        self.cell_budget
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn set_row_len(&mut self, row_len: usize) {
        self.row_len = row_len;
    }

    pub fn get(&self, slot: usize, column: usize) -> f64 {
        self.rows[slot].read().unwrap()[column]
    }

    pub fn read_row(&self, slot: usize) -> RwLockReadGuard<'_, Vec<f64>> {
        self.rows[slot].read().unwrap()
    }

    /// Installs a freshly computed row, replacing whatever was there before. Called exactly
    /// once per slot per fill.
    pub fn write_row(&self, slot: usize, values: Vec<f64>) {
        *self.rows[slot].write().unwrap() = values;
    }

    /// Empties a freed slot's storage.
    pub fn release(&self, slot: usize) {
        self.rows[slot].write().unwrap().clear();
    }

    /// Compacts every occupied (non-empty) row in place, keeping only the columns for which
    /// `keep[column]` is true, and records the new row width.
    pub fn compact(&mut self, keep: &[bool], new_row_len: usize) {
        for lock in &self.rows {
            let mut row = lock.write().unwrap();
            if row.is_empty() {
                continue;
            }
            let compacted: Vec<f64> = row
                .iter()
                .zip(keep.iter())
                .filter(|(_, &k)| k)
                .map(|(&v, _)| v)
                .collect();
            *row = compacted;
        }
        self.row_len = new_row_len;
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;

    #[test]
    fn write_then_read_row() {
        let mut buf = Buffer::new(4, 16);
        buf.set_row_len(3);
        buf.write_row(1, vec![1.0, 2.0, 3.0]);
        assert_eq!(buf.get(1, 2), 3.0);
        assert_eq!(*buf.read_row(1), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn release_empties_row() {
        let mut buf = Buffer::new(2, 8);
        buf.set_row_len(2);
        buf.write_row(0, vec![5.0, 6.0]);
        buf.release(0);
        assert!(buf.read_row(0).is_empty());
    }

    #[test]
    fn compact_drops_unkept_columns() {
        let mut buf = Buffer::new(2, 16);
        buf.set_row_len(4);
        buf.write_row(0, vec![0.0, 1.0, 2.0, 3.0]);
        buf.write_row(1, vec![10.0, 11.0, 12.0, 13.0]);
        buf.compact(&[true, false, true, true], 3);
        assert_eq!(buf.row_len(), 3);
        assert_eq!(*buf.read_row(0), vec![0.0, 2.0, 3.0]);
        assert_eq!(*buf.read_row(1), vec![10.0, 12.0, 13.0]);
    }
}
