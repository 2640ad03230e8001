//! Typed configuration for the subspace engine.
//!
//! Every knob the solver honours lives in [`SolverOptions`]; there is no
//! string-keyed option map. Variant selectors ([`OptimizeAlgorithm`],
//! [`DiisMode`]) are plain enums chosen at construction time.

use serde::{Deserialize, Serialize};

/// What `errors()` reports for the non-linear variants.
///
/// The linear variants always report the residual norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceMetric {
    /// Predicted objective change: the scalar product of the last step with
    /// the current gradient.
    Energy,
    /// Norm of the last accepted step.
    Step,
    /// Norm of the residual (gradient) vector.
    Residual,
}

/// Quasi-Newton family selector for the Optimize variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizeAlgorithm {
    /// Limited-memory BFGS with a cubic line search.
    Lbfgs,
    /// Steepest descent: accept every iterate, no history recursion.
    Null,
}

/// Mode selector for the fixed-point acceleration variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiisMode {
    /// No extrapolation; the engine passes iterates through unchanged.
    Disabled,
    /// Direct Inversion in the Iterative Subspace (residual-overlap metric).
    Diis,
    /// Krylov-Accelerated Inexact Newton (solution-overlap metric).
    Kain,
}

/// Main configuration record for all solver variants.
///
/// Fields irrelevant to the active variant are ignored (the line-search
/// parameters only matter for Optimize, `augmented_hessian` only for linear
/// equations, and so on).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Convergence threshold on the per-root error.
    pub convergence_threshold: f64,
    /// What `errors()` measures for non-linear variants.
    pub convergence_metric: ConvergenceMetric,
    /// Minimum number of outer iterations before convergence may be declared.
    pub min_iterations: usize,
    /// Maximum number of outer iterations the caller intends to run. The
    /// engine itself never loops; this is reported back through accessors and
    /// used for progress logging only.
    pub max_iterations: usize,
    /// Whether the action can be assumed to come from a self-adjoint
    /// operator. Enables the Hermitian eigenvector clean-up passes.
    pub hermitian: bool,
    /// Relative threshold for singular-value truncation when whitening the
    /// overlap and when solving the DIIS system.
    pub svd_threshold: f64,
    /// Smallest acceptable singular value of the subspace overlap before the
    /// conditioning loop starts evicting Q vectors.
    pub singularity_threshold: f64,
    /// Maximum number of Q vectors retained at the end of an iteration.
    /// Exceeding it forces an eviction regardless of conditioning.
    pub max_q: usize,
    /// Largest tolerable residual of the reduced linear system `H·c = b`
    /// before a warning is logged.
    pub reduced_residual_tolerance: f64,
    /// Request the perturbation-theory pathway instead of diagonalisation.
    /// Recognised but not provided; enabling it is a fatal error.
    pub rspt: bool,

    // === Line search (Optimize only) ===
    /// Use the strong Wolfe curvature condition instead of the weak one.
    pub strong_wolfe: bool,
    /// Sufficient-decrease parameter c1.
    pub wolfe_1: f64,
    /// Curvature parameter c2.
    pub wolfe_2: f64,
    /// If the cubic model's step is within this distance of 1, skip the line
    /// search and accept the iterate.
    pub linesearch_tolerance: f64,
    /// Cap on extrapolating line-search steps, as a multiple of the current
    /// step length.
    pub linesearch_grow_factor: f64,

    // === DIIS only ===
    /// Override for the update shift reported to the caller's
    /// preconditioner. `None` reproduces the historical choice
    /// `−(1+ε)·H[0,0]`.
    pub diis_update_shift: Option<f64>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            convergence_threshold: 1e-8,
            convergence_metric: ConvergenceMetric::Residual,
            min_iterations: 0,
            max_iterations: 1000,
            hermitian: false,
            svd_threshold: 1e-15,
            singularity_threshold: 1e-5,
            max_q: 16,
            reduced_residual_tolerance: 1e-10,
            rspt: false,
            strong_wolfe: true,
            // Recommended values, Nocedal & Wright p. 142.
            wolfe_1: 1e-4,
            wolfe_2: 0.9,
            linesearch_tolerance: 0.2,
            linesearch_grow_factor: 3.0,
            diis_update_shift: None,
        }
    }
}

impl SolverOptions {
    /// Builder method: set the convergence threshold.
    pub fn with_threshold(mut self, thresh: f64) -> Self {
        self.convergence_threshold = thresh;
        self
    }

    /// Builder method: declare the operator self-adjoint.
    pub fn with_hermitian(mut self, hermitian: bool) -> Self {
        self.hermitian = hermitian;
        self
    }

    /// Builder method: set the Q-space size cap.
    pub fn with_max_q(mut self, max_q: usize) -> Self {
        self.max_q = max_q;
        self
    }

    /// Builder method: set the iteration budget reported to the caller.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Builder method: set the convergence metric.
    pub fn with_convergence_metric(mut self, metric: ConvergenceMetric) -> Self {
        self.convergence_metric = metric;
        self
    }
}
