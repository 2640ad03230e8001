//! Error types for the subspace engine.
//!
//! The engine distinguishes caller mistakes (precondition failures) from
//! numerical breakdown discovered mid-solve. Soft conditioning problems are
//! handled internally by Q-space eviction and never surface here.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SolverError>;

/// Fatal errors surfaced synchronously to the caller.
#[derive(Debug, Error)]
pub enum SolverError {
    /// The caller violated an API precondition: mismatched parameter/action
    /// lengths, a buffer smaller than the number of roots, changing the root
    /// count after the first call, or clearing the P space after iterations
    /// have begun.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A quantity that must be non-zero (or finite) came out degenerate:
    /// a zero-norm vector where a unit vector is required, or a NaN in a
    /// reduced-problem coefficient.
    #[error("numerical breakdown: {0}")]
    NumericalBreakdown(String),

    /// The requested eigenvector has a genuinely complex component, which the
    /// solver cannot hand back through a real-valued interpolation.
    #[error("eigenvector for root {root} is complex (imaginary norm {imag_norm:.3e})")]
    ComplexEigenvector { root: usize, imag_norm: f64 },

    /// A dense kernel (SVD, eigendecomposition, QR) failed to converge.
    #[error("reduced problem solve failed: {0}")]
    ReducedSolve(String),

    /// An algorithm selector named a pathway that is recognised but not
    /// provided, e.g. RSPT.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

impl SolverError {
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        SolverError::Precondition(msg.into())
    }

    pub(crate) fn breakdown(msg: impl Into<String>) -> Self {
        SolverError::NumericalBreakdown(msg.into())
    }
}
