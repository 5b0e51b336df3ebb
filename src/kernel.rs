//! The external, out-of-scope collaborator: a symmetric similarity function over row indices.

/// A kernel function κ(i, j), assumed symmetric and deterministic, callable concurrently with
/// distinct arguments from multiple worker threads.
///
/// Implemented as a trait (rather than a bare `Fn`) so that a fallible evaluation can propagate
/// a [`crate::CacheError::Compute`]; a blanket impl below lets an infallible `Fn(usize, usize) ->
/// f64` closure be passed directly, which is the common case.
pub trait Kernel: Sync {
    fn eval(&self, i: usize, j: usize) -> Result<f64, Box<dyn std::error::Error + Send + Sync>>;
}

impl<F> Kernel for F
where
    F: Fn(usize, usize) -> f64 + Sync,
{
    fn eval(&self, i: usize, j: usize) -> Result<f64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self(i, j))
    }
}
