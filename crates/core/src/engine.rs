//! The outer iteration engine shared by every solver variant.
//!
//! The caller owns the iteration loop and the large vectors. Each pass it
//! computes the action of the operator on the current trial vectors (or the
//! value/gradient pair for optimisation), hands them to
//! [`SubspaceEngine::add_vector`] / [`SubspaceEngine::add_value`], applies
//! its preconditioner to the returned residuals, and closes the pass with
//! [`SubspaceEngine::end_iteration`]:
//!
//! ```text
//! loop {
//!     action = A · parameters            (caller)
//!     n = engine.add_vector(&mut parameters, &mut action)?;
//!     precondition(parameters, action)   (caller, for the n working roots)
//!     if engine.end_iteration(&mut parameters, &action)? { break; }
//! }
//! ```
//!
//! The engine maintains the P/Q/R subspace, assembles and conditions the
//! reduced matrices, solves the reduced problem for the active variant, and
//! writes the interpolated solution and residual back into the caller's
//! buffers.

use std::collections::{BTreeMap, BTreeSet};

use faer::Mat;
use log::{debug, info};
use num_complex::Complex64;

use crate::error::{Result, SolverError};
use crate::handler::VectorHandler;
use crate::interpolate::{interpolate, ResidualConvention};
use crate::options::{ConvergenceMetric, DiisMode, OptimizeAlgorithm, SolverOptions};
use crate::subspace::pspace::{PSpace, PVector};
use crate::subspace::qspace::QSpace;
use crate::subspace::rspace::RSpace;
use crate::subspace::xspace::XSpace;
use crate::subspace::Dimensions;
use crate::variants::{LineSearchState, Variant};

/// Threshold that forces a Q eviction once the history exceeds its cap,
/// regardless of how well conditioned the subspace still is.
const FORCED_EVICTION_THRESHOLD: f64 = 1e6;

/// Error value assigned to every root after a conditioning eviction, so that
/// nothing can be declared converged off a stale interpolation.
const POST_EVICTION_ERROR: f64 = 1e20;

/// The iterative subspace solver.
///
/// Construct with one of [`eigensystem`](Self::eigensystem),
/// [`linear_equations`](Self::linear_equations),
/// [`optimize`](Self::optimize) or [`diis`](Self::diis).
pub struct SubspaceEngine<H: VectorHandler> {
    pub(crate) handler: H,
    pub(crate) variant: Variant<H::Vector>,
    pub(crate) options: SolverOptions,
    pub(crate) pspace: PSpace,
    pub(crate) qspace: QSpace<H::Vector>,
    pub(crate) rspace: RSpace<H::Vector>,
    pub(crate) xspace: XSpace,
    /// Right-hand-side vectors (linear equations only).
    pub(crate) rhs: Vec<H::Vector>,
    /// Optimum combination of subspace vectors, one column per root.
    pub(crate) interpolation: Mat<f64>,
    /// Eigenvalues of the reduced problem, ascending by real part.
    pub(crate) reduced_eigenvalues: Vec<Complex64>,
    /// Per-root shifts suggested to the caller's preconditioner.
    pub(crate) update_shifts: Vec<f64>,
    pub(crate) errors: Vec<f64>,
    /// Objective value history (Optimize only).
    pub(crate) values: Vec<f64>,
    pub(crate) working_set: Vec<usize>,
    /// Q-space key of the frozen solution for each converged root.
    pub(crate) q_solutions: BTreeMap<usize, usize>,
    pub(crate) roots: usize,
    pub(crate) iterations: usize,
    pub(crate) nullify_solution_before_update: bool,
    /// Solution/action pair of the previous iteration for each still-active
    /// root, pending insertion into Q on the next call.
    last_params: Vec<H::Vector>,
    last_actions: Vec<H::Vector>,
}

impl<H: VectorHandler> SubspaceEngine<H> {
    fn with_variant(
        handler: H,
        variant: Variant<H::Vector>,
        options: SolverOptions,
        roots: usize,
        rhs: Vec<H::Vector>,
    ) -> Self {
        let hermitian = options.hermitian;
        Self {
            handler,
            variant,
            options,
            pspace: PSpace::new(),
            qspace: QSpace::new(hermitian),
            rspace: RSpace::new(),
            xspace: XSpace::new(),
            rhs,
            interpolation: Mat::zeros(0, 0),
            reduced_eigenvalues: Vec::new(),
            update_shifts: Vec::new(),
            errors: Vec::new(),
            values: Vec::new(),
            working_set: Vec::new(),
            q_solutions: BTreeMap::new(),
            roots,
            iterations: 0,
            nullify_solution_before_update: false,
            last_params: Vec::new(),
            last_actions: Vec::new(),
        }
    }

    /// Davidson-style solver for the lowest `n_roots` eigenpairs.
    pub fn eigensystem(handler: H, n_roots: usize, options: SolverOptions) -> Result<Self> {
        if n_roots == 0 {
            return Err(SolverError::precondition(
                "an eigensystem needs at least one root",
            ));
        }
        Ok(Self::with_variant(
            handler,
            Variant::Eigensystem,
            options,
            n_roots,
            Vec::new(),
        ))
    }

    /// Solver for the linear systems `A x = b`, one per right-hand side.
    ///
    /// `augmented_hessian == 0` solves the equations unmodified; a positive
    /// value solves the damped augmented-Hessian reformulation with that
    /// scale factor.
    pub fn linear_equations(
        handler: H,
        rhs: Vec<H::Vector>,
        augmented_hessian: f64,
        options: SolverOptions,
    ) -> Result<Self> {
        if rhs.is_empty() {
            return Err(SolverError::precondition(
                "linear equations need at least one right-hand side",
            ));
        }
        if augmented_hessian < 0.0 {
            return Err(SolverError::precondition(
                "the augmented-hessian factor must be zero or positive",
            ));
        }
        let roots = rhs.len();
        Ok(Self::with_variant(
            handler,
            Variant::LinearEquations { augmented_hessian },
            options,
            roots,
            rhs,
        ))
    }

    /// Quasi-Newton optimiser for a single scalar objective.
    pub fn optimize(
        handler: H,
        algorithm: OptimizeAlgorithm,
        minimize: bool,
        mut options: SolverOptions,
    ) -> Self {
        options.hermitian = false;
        // The R vector is excluded from the redundancy test, and a raw Q is
        // what the two-loop recursion expects; no singularity pruning.
        options.singularity_threshold = 0.0;
        Self::with_variant(
            handler,
            Variant::Optimize {
                algorithm,
                minimize,
                line: LineSearchState::default(),
            },
            options,
            1,
            Vec::new(),
        )
    }

    /// DIIS/KAIN accelerator for a non-linear fixed-point iteration.
    pub fn diis(handler: H, mode: DiisMode, mut options: SolverOptions) -> Self {
        // A mildly singular extrapolation system is harmless here; the SVD
        // solve truncates it anyway.
        options.singularity_threshold = options.svd_threshold;
        Self::with_variant(handler, Variant::Diis { mode }, options, 1, Vec::new())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut SolverOptions {
        &mut self.options
    }

    /// Error per root at the last iteration.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// Roots still being iterated.
    pub fn working_set(&self) -> &[usize] {
        &self.working_set
    }

    /// Number of outer iterations so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Real parts of the lowest reduced eigenvalues, one per root.
    pub fn eigenvalues(&self) -> Vec<f64> {
        (0..self.roots.min(self.reduced_eigenvalues.len()))
            .map(|root| self.reduced_eigenvalues[root].re)
            .collect()
    }

    /// Eigenvalues restricted to the working set.
    pub fn working_set_eigenvalues(&self) -> Vec<f64> {
        self.working_set
            .iter()
            .filter_map(|&root| self.reduced_eigenvalues.get(root).map(|ev| ev.re))
            .collect()
    }

    /// Per-root shifts for the caller's preconditioner.
    pub fn update_shifts(&self) -> &[f64] {
        &self.update_shifts
    }

    /// Objective value history (Optimize only).
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Current block sizes of the subspace.
    pub fn subspace_dimensions(&self) -> Dimensions {
        Dimensions::new(self.pspace.size(), self.qspace.size(), self.rspace.size())
    }

    /// Size of the P space.
    pub fn dimension_p(&self) -> usize {
        self.pspace.size()
    }

    /// P-space expansion coefficients of the current solution, one row per
    /// working-set root.
    pub fn parameters_p(&self) -> Vec<Vec<f64>> {
        let np = self.pspace.size();
        self.working_set
            .iter()
            .map(|&root| {
                (0..np)
                    .map(|l| {
                        if root < self.interpolation.ncols() {
                            self.interpolation[(l, root)]
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect()
    }

    // ========================================================================
    // Outer iteration
    // ========================================================================

    /// Take the current trial vectors and their actions (residuals for
    /// non-linear problems), and replace them with the interpolated solution
    /// and residual. Returns the number of unconverged roots remaining.
    pub fn add_vector(
        &mut self,
        parameters: &mut [H::Vector],
        actions: &mut [H::Vector],
    ) -> Result<usize> {
        if parameters.len() != actions.len() {
            return Err(SolverError::precondition(format!(
                "{} parameters but {} actions",
                parameters.len(),
                actions.len()
            )));
        }
        if self.roots == 0 {
            self.roots = parameters.len();
        }
        if self.roots > parameters.len() {
            return Err(SolverError::precondition(format!(
                "buffer of {} vectors is smaller than the number of roots {}",
                parameters.len(),
                self.roots
            )));
        }
        if self.qspace.is_empty() && self.working_set.is_empty() {
            self.working_set = (0..self.roots.min(parameters.len())).collect();
        }
        if self.working_set.is_empty() {
            return Ok(0);
        }
        if parameters.len() < self.working_set.len() {
            return Err(SolverError::precondition(format!(
                "buffer of {} vectors is smaller than the working set of {}",
                parameters.len(),
                self.working_set.len()
            )));
        }
        self.iterations += 1;
        let nw = self.working_set.len();
        let res_res = self.variant.res_res();
        let is_linear = self.variant.is_linear();

        // Homogeneous problems can hand back arbitrarily scaled updates when
        // roots are nearly degenerate; bring them back to unit length before
        // any dot products are taken.
        if self.variant.residual_eigen() {
            for k in 0..nw {
                let s = self.handler.dot(&parameters[k], &parameters[k]);
                if !(s > 0.0) || !s.is_finite() {
                    return Err(SolverError::breakdown(format!(
                        "trial vector {k} has zero norm"
                    )));
                }
                if (s - 1.0).abs() > 1e-3 {
                    let inv = 1.0 / s.sqrt();
                    self.handler.scale(inv, &mut parameters[k]);
                    self.handler.scale(inv, &mut actions[k]);
                }
            }
        }

        // Fold the previous iteration's solution/action pairs into Q as
        // difference vectors against the incoming iterates.
        if !self.last_params.is_empty() {
            debug_assert_eq!(self.last_params.len(), nw);
            let orthogonalise = self.variant.orthogonalise_q();
            for k in 0..nw {
                self.qspace.add_difference(
                    &self.handler,
                    &parameters[k],
                    &actions[k],
                    &self.last_params[k],
                    &self.last_actions[k],
                    &self.rhs,
                    &self.pspace,
                    res_res,
                    orthogonalise,
                )?;
            }
            self.last_params.clear();
            self.last_actions.clear();
        }

        self.rspace.update(
            &self.handler,
            &parameters[..nw],
            &actions[..nw],
            &self.rhs,
            &self.pspace,
            res_res,
        )?;
        self.qspace
            .update_r_interactions(&self.handler, &parameters[..nw], &actions[..nw], res_res)?;

        self.build_subspace()?;
        self.solve_reduced_problem()?;

        self.errors.resize(self.roots, 0.0);
        self.working_set = (0..self.roots).collect();
        if is_linear {
            self.do_interpolation(parameters, actions, false)?;
        }
        for k in 0..self.working_set.len() {
            let root = self.working_set[k];
            let error = self.error_for_root(k, actions);
            self.errors[root] = error;
        }
        self.do_interpolation(parameters, actions, true)?;

        self.last_params.clear();
        self.last_actions.clear();
        let thresh = self.options.convergence_threshold;
        let mut k = 0;
        while k < self.working_set.len() {
            let root = self.working_set[k];
            let converged = is_linear && self.errors[root] < thresh;
            if converged && !self.q_solutions.contains_key(&root) {
                debug!(
                    "[engine] root {root} converged, freezing its solution into Q at position {}",
                    self.qspace.size()
                );
                let key = self.qspace.add_solution(
                    &self.handler,
                    &parameters[k],
                    &actions[k],
                    &self.rhs,
                    &self.pspace,
                    res_res,
                )?;
                self.q_solutions.insert(root, key);
            }
            if converged {
                // Compact the working set and the caller's buffers in step.
                for kp in (k + 1)..self.working_set.len() {
                    let (left, right) = parameters.split_at_mut(kp);
                    self.handler.copy(&mut left[kp - 1], &right[0]);
                    let (left, right) = actions.split_at_mut(kp);
                    self.handler.copy(&mut left[kp - 1], &right[0]);
                    self.working_set[kp - 1] = self.working_set[kp];
                }
                self.working_set.pop();
            } else {
                self.last_params.push(parameters[k].clone());
                self.last_actions.push(actions[k].clone());
                k += 1;
            }
        }
        debug_assert_eq!(self.last_params.len(), self.working_set.len());

        // Re-establish the full residual in the caller's buffers.
        self.do_interpolation(parameters, actions, false)?;

        if self.nullify_solution_before_update {
            // The caller's preconditioned update is the middle of the L-BFGS
            // two-loop recursion; it must start from zero, and the pending Q
            // difference is taken against the raw iterate, not the
            // interpolated one.
            self.last_params.clear();
            self.last_actions.clear();
            for k in 0..self.working_set.len() {
                self.handler.fill_zero(&mut parameters[k]);
                self.last_params.push(self.rspace.param(k).clone());
                self.last_actions.push(self.rspace.action(k).clone());
            }
        }
        Ok(self.working_set.len())
    }

    /// Take a single iterate with its objective value and gradient
    /// (Optimize only). Returns 1 when the caller should apply its
    /// preconditioned update before `end_iteration`, 0 otherwise.
    pub fn add_value(
        &mut self,
        parameters: &mut H::Vector,
        value: f64,
        action: &mut H::Vector,
    ) -> Result<usize> {
        if !matches!(self.variant, Variant::Optimize { .. }) {
            return Err(SolverError::precondition(
                "add_value is only available for the Optimize variant",
            ));
        }
        self.values.push(value);
        self.add_vector(
            std::slice::from_mut(parameters),
            std::slice::from_mut(action),
        )
    }

    /// Add P-space vectors to the expansion set (linear variants only, and
    /// only before any root has converged).
    ///
    /// `pp_action` is the action matrix projected onto (existing + new, new)
    /// with the existing+new index running fastest. On exit `parameters` and
    /// `actions` hold the interpolated solution and its Q/R residual; the
    /// action of the operator on the P components is the caller's to add.
    pub fn add_p(
        &mut self,
        pvectors: Vec<PVector>,
        pp_action: &[f64],
        parameters: &mut [H::Vector],
        actions: &mut [H::Vector],
    ) -> Result<usize> {
        if !self.variant.is_linear() {
            return Err(SolverError::precondition(
                "the P space is only meaningful for linear variants",
            ));
        }
        if !self.q_solutions.is_empty() {
            return Err(SolverError::precondition(
                "cannot extend the P space after a root has converged",
            ));
        }
        let rhs_dots: Vec<Vec<f64>> = pvectors
            .iter()
            .map(|p| self.rhs.iter().map(|b| self.handler.sparse_dot(b, p)).collect())
            .collect();
        self.pspace.add(pvectors, pp_action, &rhs_dots)?;
        self.qspace.refresh_pspace(&self.handler, &self.pspace);
        self.rspace.refresh_pspace(&self.handler, &self.pspace);
        if self.working_set.is_empty() && self.qspace.is_empty() {
            self.working_set = (0..self.roots.min(parameters.len())).collect();
        }
        self.build_subspace()?;
        self.solve_reduced_problem()?;
        self.do_interpolation(parameters, actions, false)?;
        Ok(self.working_set.len())
    }

    /// Report progress and decide convergence. For Optimize this also takes
    /// the pending line-search step or completes the two-loop recursion on
    /// the preconditioned update in `solution`.
    pub fn end_iteration(
        &mut self,
        solution: &mut [H::Vector],
        _residual: &[H::Vector],
    ) -> Result<bool> {
        if matches!(self.variant, Variant::Optimize { .. }) {
            if solution.is_empty() {
                return Err(SolverError::precondition(
                    "end_iteration needs the solution buffer",
                ));
            }
            self.finish_optimize_iteration(solution);
        }
        self.report();
        let max_error = self.errors.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Ok(!self.errors.is_empty()
            && self.iterations >= self.options.min_iterations
            && max_error < self.options.convergence_threshold)
    }

    /// Write the solution and residual for an arbitrary set of roots,
    /// typically after convergence.
    pub fn solution(
        &mut self,
        roots: &[usize],
        parameters: &mut [H::Vector],
        residual: &mut [H::Vector],
    ) -> Result<()> {
        if let Variant::Optimize { line, .. } = &self.variant {
            // There is a single root and its best iterate is cached.
            if let Some(best) = line.best.as_ref() {
                self.handler.copy(&mut parameters[0], &best.r);
                self.handler.copy(&mut residual[0], &best.v);
                return Ok(());
            }
            return Err(SolverError::precondition("no iterate has been accepted yet"));
        }
        // The R block stays in the subspace so that asking for the working
        // set right after `add_vector` reproduces its output exactly.
        let saved = std::mem::take(&mut self.working_set);
        self.working_set = roots.to_vec();
        let res_res = self.variant.res_res();
        let result = (|| -> Result<()> {
            // Entries promoted on convergence have never seen the current R
            // block; refresh every cached Q-R interaction before assembling.
            self.qspace.update_r_interactions(
                &self.handler,
                self.rspace.params(),
                self.rspace.actions(),
                res_res,
            )?;
            self.build_subspace()?;
            self.solve_reduced_problem()?;
            self.do_interpolation(parameters, residual, false)
        })();
        self.working_set = saved;
        result
    }

    /// The solver's suggestion of which axes of the full space would be most
    /// profitable to add to the P space, ordered by significance.
    pub fn suggest_p(
        &self,
        solution: &[H::Vector],
        residual: &[H::Vector],
        max_number: usize,
        threshold: f64,
    ) -> Vec<usize> {
        let mut merged: BTreeMap<usize, f64> = BTreeMap::new();
        for (x, r) in solution.iter().zip(residual) {
            let (indices, values) = self.handler.select(x, r, max_number, threshold);
            for (i, v) in indices.into_iter().zip(values) {
                merged
                    .entry(i)
                    .and_modify(|best| *best = best.max(v))
                    .or_insert(v);
            }
        }
        let mut ranked: Vec<(f64, usize)> = merged.into_iter().map(|(i, v)| (v, i)).collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(max_number);
        ranked.into_iter().map(|(_, i)| i).collect()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Assemble the reduced matrices, evicting near-redundant Q vectors until
    /// the subspace is well conditioned (or nothing evictable remains).
    pub(crate) fn build_subspace(&mut self) -> Result<()> {
        let res_res = self.variant.res_res();
        // Linear variants test the overlap; the quasi-Newton and DIIS
        // variants test the action matrix, whose conditioning is what their
        // reduced solves depend on.
        let test_overlap = self.variant.is_linear();
        loop {
            self.xspace
                .build(&self.pspace, &self.qspace, &self.rspace, self.rhs.len(), res_res);
            let dims = self.xspace.dimensions();
            if dims.nq == 0 {
                return Ok(());
            }
            let protected: BTreeSet<usize> = self.q_solutions.values().copied().collect();
            let keys = self.qspace.keys();
            let candidates: Vec<usize> = (0..dims.nq)
                .filter(|&a| !protected.contains(&keys[a]))
                .map(|a| dims.oq() + a)
                .collect();
            let threshold = if dims.nq > self.options.max_q {
                FORCED_EVICTION_THRESHOLD
            } else {
                self.options.singularity_threshold
            };
            let test_dim = if self.variant.exclude_r_from_redundancy_test() {
                dims.nx() - dims.nr
            } else {
                dims.nx()
            };
            match self
                .xspace
                .propose_singularity_deletion(test_dim, &candidates, threshold, test_overlap)?
            {
                Some(index) => {
                    let a = index - dims.oq();
                    debug!("[engine] evicting Q vector {a} to restore conditioning");
                    self.qspace.remove(a);
                    self.errors = vec![POST_EVICTION_ERROR; self.roots];
                }
                None => return Ok(()),
            }
        }
    }

    pub(crate) fn do_interpolation(
        &self,
        solution: &mut [H::Vector],
        residual: &mut [H::Vector],
        action_only: bool,
    ) -> Result<()> {
        let convention = ResidualConvention {
            eigen: self.variant.residual_eigen(),
            rhs: self.variant.residual_rhs(),
        };
        interpolate(
            &self.handler,
            &self.pspace,
            &self.qspace,
            &self.rspace,
            &self.interpolation,
            &self.working_set,
            &self.reduced_eigenvalues,
            &self.rhs,
            convention,
            solution,
            residual,
            action_only,
        )
    }

    /// Error measure for working-set slot `k`.
    fn error_for_root(&self, k: usize, actions: &[H::Vector]) -> f64 {
        let residual_norm = self.handler.dot(&actions[k], &actions[k]).sqrt();
        if self.variant.is_linear() {
            return residual_norm;
        }
        let n = self.qspace.size();
        match self.options.convergence_metric {
            ConvergenceMetric::Residual => residual_norm,
            ConvergenceMetric::Step if n > 0 => 1.0 / self.qspace.scale_factor(n - 1),
            ConvergenceMetric::Energy if n > 0 => {
                // Predicted change: the gradient projected on the last step.
                (self.handler.dot(&actions[k], self.qspace.param(n - 1))
                    / self.qspace.scale_factor(n - 1))
                .abs()
            }
            _ => residual_norm,
        }
    }

    fn report(&self) {
        let max_error = self
            .errors
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        match &self.variant {
            Variant::Eigensystem => info!(
                "[engine] iteration {} [{}] error = {:.3e}, eigenvalues: {:?}",
                self.iterations,
                self.working_set.len(),
                max_error,
                self.eigenvalues()
            ),
            Variant::Optimize { line, .. } => {
                if line.steplength != 0.0 {
                    info!(
                        "[engine] iteration {}, line search step = {:.3e}, value = {:?}, error = {:.3e}",
                        self.iterations,
                        line.steplength,
                        self.values.last(),
                        max_error
                    );
                } else {
                    info!(
                        "[engine] iteration {}, value = {:?}, error = {:.3e}",
                        self.iterations,
                        self.values.last(),
                        max_error
                    );
                }
            }
            _ => info!(
                "[engine] iteration {} [{}] error = {:.3e}",
                self.iterations,
                self.working_set.len(),
                max_error
            ),
        }
    }
}
