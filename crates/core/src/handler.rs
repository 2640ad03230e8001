//! The contract between the engine and the caller's large-vector storage.
//!
//! The engine never touches vector elements directly. Every operation on the
//! full space goes through a [`VectorHandler`], so the caller is free to back
//! vectors with plain memory, memory-mapped files, or a distributed store.
//! All operations are synchronous from the engine's point of view; a handler
//! may parallelise internally.

use crate::subspace::pspace::PVector;

/// Elementary operations on large vectors.
///
/// The scalar type is `f64`. Reduced matrices assembled from these dot
/// products may still acquire complex eigenpairs; that is handled internally
/// by the engine and never leaks into this interface.
pub trait VectorHandler {
    /// The opaque large-vector type.
    type Vector: Clone;

    /// Inner product `⟨a, b⟩`. `dot(a, a)` must be real and non-negative.
    fn dot(&self, a: &Self::Vector, b: &Self::Vector) -> f64;

    /// `y ← y + alpha·x`. `x` and `y` must not alias.
    fn axpy(&self, alpha: f64, x: &Self::Vector, y: &mut Self::Vector);

    /// `v ← alpha·v`. With `alpha == 0` the previous contents of `v` are
    /// treated as undefined and replaced by zero.
    fn scale(&self, alpha: f64, v: &mut Self::Vector);

    /// `dst` takes the value of `src`. Sizes must match.
    fn copy(&self, dst: &mut Self::Vector, src: &Self::Vector);

    /// `v ← 0`.
    fn fill_zero(&self, v: &mut Self::Vector);

    /// Inner product of a large vector with a sparse axis set.
    fn sparse_dot(&self, a: &Self::Vector, p: &PVector) -> f64;

    /// `y ← y + alpha·p`, scattering the sparse coefficients of `p`.
    fn sparse_axpy(&self, alpha: f64, p: &PVector, y: &mut Self::Vector);

    /// Picks up to `max_number` axes of the underlying full space along which
    /// the product `|x_i|·|r_i|` exceeds `threshold`, ordered by decreasing
    /// significance. Returns the axis indices and the products.
    ///
    /// Only used by `suggest_p`.
    fn select(
        &self,
        x: &Self::Vector,
        r: &Self::Vector,
        max_number: usize,
        threshold: f64,
    ) -> (Vec<usize>, Vec<f64>);
}
