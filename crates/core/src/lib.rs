//! Iterative subspace solvers over an abstract vector space.
//!
//! One engine drives four tightly related problems: linear eigensystems
//! (Davidson), linear inhomogeneous systems (optionally through an augmented
//! Hessian), quasi-Newton optimisation (L-BFGS with a cubic line search),
//! and DIIS/KAIN fixed-point acceleration. The caller owns the outer loop
//! and the large vectors; the engine owns a small P ⊕ Q ⊕ R subspace, the
//! reduced dense problems, and the bookkeeping of which roots are still
//! iterating.
//!
//! Large vectors are only ever touched through the [`handler::VectorHandler`]
//! trait, so storage and parallelism are entirely the caller's business.

pub mod engine;
pub mod error;
pub mod handler;
pub mod interpolate;
pub mod options;
pub mod subspace;
pub mod util;
pub mod variants;

#[cfg(test)]
mod _tests_engine;
#[cfg(test)]
mod _tests_optimize;

pub use engine::SubspaceEngine;
pub use error::{Result, SolverError};
pub use handler::VectorHandler;
pub use options::{ConvergenceMetric, DiisMode, OptimizeAlgorithm, SolverOptions};
pub use subspace::pspace::PVector;
