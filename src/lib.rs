//! # svm-kernel-cache
//! A bounded-memory, LRU-evicted row cache for the symmetric N x N kernel matrix used inside an
//! SVM training loop. The solver repeatedly asks [`RowCache`] for rows of K(i, j) = kappa(x_i,
//! x_j); kappa is expensive, rows are re-requested across solver iterations, and the cache keeps
//! a pool of previously computed rows restricted to the currently *active* column set.
//!
//! The primary interface is [`RowCache`], constructed via [`RowCache::init`] with a
//! [`CacheOptions`] and a [`Kernel`]. [`RowCache::fetch`] serves row queries from a mix of cached
//! and freshly computed columns without ever inserting; [`RowCache::ensure`] populates slots,
//! optionally in parallel; [`RowCache::shrink`] compacts the cache in place when the solver's
//! active set contracts.

mod active_set;
mod batch;
mod buffer;
mod cache;
mod clock;
mod error;
mod kernel;
mod options;
mod regression;
mod slot_table;

pub use cache::{Columns, RowCache};
pub use error::CacheError;
pub use kernel::Kernel;
pub use options::CacheOptions;
