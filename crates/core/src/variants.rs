//! The four solver variants and their reduced-problem solves.
//!
//! The variants share all subspace machinery; what differs is how the small
//! reduced problem is solved and which residual convention the interpolator
//! applies afterwards. Rather than a class hierarchy, the variant is a
//! tagged sum carried by the engine, and `solve_reduced_problem` dispatches
//! on it.

use faer::Mat;
use log::{debug, warn};
use num_complex::Complex64;

use crate::engine::SubspaceEngine;
use crate::error::{Result, SolverError};
use crate::handler::VectorHandler;
use crate::options::{DiisMode, OptimizeAlgorithm};
use crate::subspace::dense;

/// Imaginary norm above which an eigenvector cannot be treated as real.
const IMAGINARY_TOLERANCE: f64 = 1e-10;

/// Best iterate cached by the Optimize variant.
pub(crate) struct BestIterate<V> {
    pub r: V,
    pub v: V,
    pub f: f64,
}

/// Line-search bookkeeping for the Optimize variant.
pub(crate) struct LineSearchState<V> {
    /// Non-zero while a line-search step is pending; the signed step length
    /// along the last Q direction, in units of the original step.
    pub steplength: f64,
    pub best: Option<BestIterate<V>>,
}

impl<V> Default for LineSearchState<V> {
    fn default() -> Self {
        Self {
            steplength: 0.0,
            best: None,
        }
    }
}

/// Which problem the engine is solving.
pub(crate) enum Variant<V> {
    /// Lowest-k eigenpairs of a linear operator, Davidson style.
    Eigensystem,
    /// Linear inhomogeneous systems, optionally through the augmented
    /// Hessian reformulation (scale factor > 0).
    LinearEquations { augmented_hessian: f64 },
    /// Quasi-Newton minimisation with a cubic line search.
    Optimize {
        algorithm: OptimizeAlgorithm,
        minimize: bool,
        line: LineSearchState<V>,
    },
    /// DIIS / KAIN fixed-point acceleration.
    Diis { mode: DiisMode },
}

impl<V> Variant<V> {
    /// Whether residuals are linear functions of the expansion vectors, so
    /// converged roots can be frozen into the Q space.
    pub fn is_linear(&self) -> bool {
        matches!(self, Variant::Eigensystem | Variant::LinearEquations { .. })
    }

    /// Whether the interpolated solution is renormalised and the residual
    /// shifted by `λ·solution`.
    pub fn residual_eigen(&self) -> bool {
        match self {
            Variant::Eigensystem => true,
            Variant::LinearEquations { augmented_hessian } => *augmented_hessian > 0.0,
            _ => false,
        }
    }

    /// Whether the right-hand side is subtracted from the residual.
    pub fn residual_rhs(&self) -> bool {
        matches!(self, Variant::LinearEquations { .. })
    }

    /// Whether the reduced action matrix is assembled in the
    /// residual-residual metric instead of solution-residual.
    pub fn res_res(&self) -> bool {
        matches!(
            self,
            Variant::Diis {
                mode: DiisMode::Diis | DiisMode::Disabled
            }
        )
    }

    /// Whether Q difference vectors are orthogonalised against the incoming
    /// iterate. Quasi-Newton and DIIS need the raw step difference.
    pub fn orthogonalise_q(&self) -> bool {
        matches!(self, Variant::Eigensystem | Variant::LinearEquations { .. })
    }

    /// Whether the R block is excluded from the redundancy (conditioning)
    /// test.
    pub fn exclude_r_from_redundancy_test(&self) -> bool {
        matches!(self, Variant::Optimize { .. } | Variant::Diis { .. })
    }
}

/// Locate the minimum of the cubic through `(0, f0)` and `(1, f1)` with end
/// slopes `g0` and `g1`. Returns the abscissa and the model value there, or
/// `None` when the cubic has no suitable turning point.
pub(crate) fn interpolated_minimum(f0: f64, f1: f64, g0: f64, g1: f64) -> Option<(f64, f64)> {
    if (2.0 * f1 - g1 - 2.0 * f0 - g0).abs() < 1e-10 {
        // Cubic coefficient vanishes; fall back to the quadratic model.
        let c2 = (g1 - g0) / 2.0;
        if c2 < 0.0 {
            return None;
        }
        let x = -0.5 * g0 / c2;
        let f = f0 + g0 * x + c2 * x * x;
        return Some((x, f));
    }
    let discriminant =
        (3.0 * f0 - 3.0 * f1 + g0).powi(2) + (6.0 * f0 - 6.0 * f1 + g0) * g1 + g1 * g1;
    if discriminant < 0.0 {
        return None;
    }
    let denom = 2.0 * f0 - 2.0 * f1 + g0 + g1;
    let (alpha_m, alpha_p) = if denom == 0.0 {
        let a = g0 / (2.0 * f1 - 2.0 * f0 - 2.0 * g1);
        (a, a)
    } else {
        (
            (3.0 * f0 - 3.0 * f1 + 2.0 * g0 + g1 - discriminant.sqrt()) / (3.0 * denom),
            (3.0 * f0 - 3.0 * f1 + 2.0 * g0 + g1 + discriminant.sqrt()) / (3.0 * denom),
        )
    };
    let model = |a: f64| {
        f0 + a * (g0 + a * (-3.0 * f0 + 3.0 * f1 - 2.0 * g0 - g1 + a * denom))
    };
    let fm = model(alpha_m);
    let fp = model(alpha_p);
    if fm < fp {
        Some((alpha_m, fm))
    } else {
        Some((alpha_p, fp))
    }
}

impl<H: VectorHandler> SubspaceEngine<H> {
    /// Solve the reduced problem for the active variant, filling the
    /// interpolation matrix and the per-root update shifts.
    pub(crate) fn solve_reduced_problem(&mut self) -> Result<()> {
        let augmented_hessian = match &self.variant {
            Variant::Eigensystem => return self.solve_reduced_eigensystem(),
            Variant::LinearEquations { augmented_hessian } => *augmented_hessian,
            Variant::Optimize { .. } => return self.solve_reduced_optimize(),
            Variant::Diis { .. } => return self.solve_reduced_diis(),
        };
        self.solve_reduced_linear_equations(augmented_hessian)
    }

    fn solve_reduced_eigensystem(&mut self) -> Result<()> {
        if self.options.rspt {
            return Err(SolverError::NotImplemented("RSPT"));
        }
        let reduced = dense::eigen_via_overlap_whitening(
            &self.xspace.h,
            &self.xspace.s,
            self.options.svd_threshold,
            self.options.hermitian,
        )?;
        let nx = self.xspace.dimensions().nx();
        let n_keep = self.roots.min(reduced.vectors.len());
        for k in 0..n_keep {
            let imag_norm = reduced.imaginary_norm(k);
            if imag_norm > IMAGINARY_TOLERANCE {
                return Err(SolverError::ComplexEigenvector { root: k, imag_norm });
            }
        }
        self.interpolation = Mat::from_fn(nx, n_keep, |i, k| reduced.vectors[k][i].re);
        self.reduced_eigenvalues = reduced.eigenvalues;

        let eps = f64::EPSILON;
        self.update_shifts = (0..self.roots)
            .map(|root| {
                let lambda = self
                    .reduced_eigenvalues
                    .get(root)
                    .map_or(0.0, |ev| ev.re);
                -(1.0 + eps) * lambda
            })
            .collect();
        Ok(())
    }

    fn solve_reduced_linear_equations(&mut self, augmented_hessian: f64) -> Result<()> {
        let nx = self.xspace.dimensions().nx();
        let n_rhs = self.rhs.len();
        if augmented_hessian > 0.0 {
            let mut interpolation = Mat::zeros(nx, n_rhs);
            self.reduced_eigenvalues = vec![Complex64::new(0.0, 0.0); n_rhs];
            self.update_shifts = vec![0.0; n_rhs];
            for root in 0..n_rhs {
                // Border H and S by one row/column encoding the right-hand
                // side; the lowest generalised eigenpair of the bordered
                // problem yields the damped solution.
                let h_aug = Mat::from_fn(nx + 1, nx + 1, |i, j| match (i == nx, j == nx) {
                    (false, false) => self.xspace.h[(i, j)],
                    (false, true) => -augmented_hessian * self.xspace.rhs[(i, root)],
                    (true, false) => -augmented_hessian * self.xspace.rhs[(j, root)],
                    (true, true) => 0.0,
                });
                let s_aug = Mat::from_fn(nx + 1, nx + 1, |i, j| match (i == nx, j == nx) {
                    (false, false) => self.xspace.s[(i, j)],
                    (true, true) => 1.0,
                    _ => 0.0,
                });
                let reduced = dense::eigen_via_overlap_whitening(
                    &h_aug,
                    &s_aug,
                    self.options.svd_threshold,
                    false,
                )?;
                // Eigenpairs arrive sorted ascending by real part.
                let lambda = reduced.eigenvalues[0];
                let vector = &reduced.vectors[0];
                let denominator = augmented_hessian * vector[nx].re;
                if denominator.abs() < 1e-300 {
                    return Err(SolverError::breakdown(format!(
                        "augmented-hessian eigenvector for rhs {root} has zero border component"
                    )));
                }
                for i in 0..nx {
                    interpolation[(i, root)] = vector[i].re / denominator;
                }
                self.reduced_eigenvalues[root] = lambda;
                self.update_shifts[root] = -(1.0 + f64::EPSILON) * lambda.re;
            }
            self.interpolation = interpolation;
        } else {
            self.interpolation = dense::solve_qr(&self.xspace.h, &self.xspace.rhs);
            let residuals =
                dense::reduced_residual_norms(&self.xspace.h, &self.interpolation, &self.xspace.rhs);
            for (root, &resid) in residuals.iter().enumerate() {
                if resid > self.options.reduced_residual_tolerance {
                    warn!(
                        "[equations] reduced residual {:.3e} for rhs {} exceeds tolerance {:.3e}",
                        resid, root, self.options.reduced_residual_tolerance
                    );
                }
            }
            self.update_shifts = vec![0.0; n_rhs];
        }
        Ok(())
    }

    fn solve_reduced_diis(&mut self) -> Result<()> {
        let eps = f64::EPSILON;
        let nx = self.xspace.dimensions().nx();
        if nx == 0 {
            return Err(SolverError::precondition(
                "no iterate has been supplied yet",
            ));
        }
        let default_shift = if nx > 0 {
            -(1.0 + eps) * self.xspace.h[(0, 0)]
        } else {
            0.0
        };
        self.update_shifts = vec![self.options.diis_update_shift.unwrap_or(default_shift)];

        let Variant::Diis { mode } = &self.variant else {
            unreachable!("DIIS solve dispatched for a non-DIIS variant");
        };
        let n_dim = nx - 1;
        let mut interpolation = Mat::zeros(nx, 1);
        if n_dim > 0 && *mode != DiisMode::Disabled {
            let b = Mat::from_fn(n_dim, n_dim, |i, j| self.xspace.h[(i, j)]);
            let rhs: Vec<f64> = (0..n_dim).map(|i| -self.xspace.h[(i, n_dim)]).collect();
            let coefficients = dense::svd_solve(&b, &rhs, self.options.svd_threshold)?;
            for (i, &c) in coefficients.iter().enumerate() {
                if c.is_nan() {
                    return Err(SolverError::breakdown(format!(
                        "NaN in extrapolation coefficient {i}"
                    )));
                }
                interpolation[(i, 0)] = c;
            }
            debug!("[diis] extrapolation coefficients {:?}", coefficients);
        }
        interpolation[(n_dim, 0)] = 1.0;
        self.interpolation = interpolation;
        Ok(())
    }

    fn solve_reduced_optimize(&mut self) -> Result<()> {
        let n = self.qspace.size();
        let thresh = self.options.convergence_threshold;
        let strong = self.options.strong_wolfe;
        let c1 = self.options.wolfe_1;
        let c2 = self.options.wolfe_2;
        let ls_tolerance = self.options.linesearch_tolerance;
        let grow = self.options.linesearch_grow_factor;

        let Variant::Optimize {
            algorithm,
            minimize,
            line,
        } = &mut self.variant
        else {
            unreachable!("Optimize solve dispatched for a non-Optimize variant");
        };
        let sign = if *minimize { 1.0 } else { -1.0 };

        if n > 0 {
            // Decide whether the new point is acceptable or whether we keep
            // line-searching along the last step.
            let step = 1.0 / self.qspace.scale_factor(n - 1);
            let best = line
                .best
                .as_ref()
                .expect("best iterate must exist once Q is non-empty");
            let f0 = sign * best.f;
            let f1 = sign
                * *self
                    .values
                    .last()
                    .ok_or_else(|| SolverError::precondition("add_value has not been called"))?;
            let g1 = sign * step * self.qspace.h_qr(n - 1, 0);
            let g0 = sign * step * self.handler.dot(&best.v, self.qspace.param(n - 1));
            let wolfe_1 = f1 <= f0 + c1 * g0;
            let wolfe_2 = if strong {
                g1 >= c2 * g0
            } else {
                g1.abs() <= c2 * g0.abs()
            };
            debug!(
                "[optimize] step={step:.3e} f0={f0:.6e} f1={f1:.6e} g0={g0:.3e} g1={g1:.3e} \
                 Wolfe: {wolfe_1}{wolfe_2}"
            );
            let mut accept = g1 < thresh || (wolfe_1 && wolfe_2);
            if !accept {
                let mut fitted = interpolated_minimum(f0, f1, g0, g1);
                if let Some((alpha, _)) = fitted {
                    // Reject interpolants that extrapolate the wrong way when
                    // the minimum is not bracketed.
                    if (g0 > 0.0 && g1 > 0.0 && alpha > 0.0)
                        || (g0 < 0.0 && g1 < 0.0 && alpha < 1.0)
                    {
                        fitted = None;
                    }
                }
                let alpha = match fitted {
                    Some((alpha, f_model)) if alpha <= grow => {
                        if (alpha - 1.0).abs() < ls_tolerance {
                            debug!(
                                "[optimize] predicted step {alpha:.4} is within tolerance, accepting"
                            );
                            accept = true;
                        } else {
                            debug!(
                                "[optimize] cubic minimum {f_model:.6e} at alpha={alpha:.4} \
                                 (absolute step {:.3e})",
                                (alpha - 1.0) * step
                            );
                        }
                        alpha
                    }
                    _ => {
                        debug!(
                            "[optimize] no usable cubic minimum, growing the search range to {grow}"
                        );
                        grow
                    }
                };
                if !accept {
                    // Ask the caller for another evaluation along the same
                    // direction; Q stays untouched until the step is settled.
                    let mut interpolation = Mat::zeros(n + 1, 1);
                    interpolation[(n, 0)] = 1.0;
                    self.interpolation = interpolation;
                    line.steplength = (alpha - 1.0) * step;
                    if f1 <= f0 {
                        line.best = Some(BestIterate {
                            r: self.rspace.param(0).clone(),
                            v: self.rspace.action(0).clone(),
                            f: *self.values.last().expect("value history is non-empty"),
                        });
                    }
                    self.nullify_solution_before_update = false;
                    self.update_shifts = vec![0.0];
                    return Ok(());
                }
            }
        }

        // Accept the iterate: the interpolation column is the unit vector on
        // the current R slot, plus the backward-recursion coefficients over
        // the Q history for L-BFGS.
        line.steplength = 0.0;
        let mut interpolation = Mat::zeros(n + 1, 1);
        interpolation[(n, 0)] = 1.0;
        if *algorithm == OptimizeAlgorithm::Lbfgs {
            for a in (0..n).rev() {
                let mut minus_alpha = -self.qspace.h_qr(a, 0);
                for b in (a + 1)..n {
                    minus_alpha -= interpolation[(b, 0)] * self.qspace.action(a, b);
                }
                minus_alpha /= self.qspace.action(a, a);
                interpolation[(a, 0)] = minus_alpha;
            }
        }
        self.interpolation = interpolation;
        self.nullify_solution_before_update = true;
        line.best = Some(BestIterate {
            r: self.rspace.param(0).clone(),
            v: self.rspace.action(0).clone(),
            f: *self
                .values
                .last()
                .ok_or_else(|| SolverError::precondition("add_value has not been called"))?,
        });
        self.update_shifts = vec![0.0];
        Ok(())
    }

    /// The Optimize-specific tail of `end_iteration`: either take the
    /// pending line-search step, or run the forward pass of the L-BFGS
    /// two-loop recursion over the preconditioned step in `solution`.
    pub(crate) fn finish_optimize_iteration(&mut self, solution: &mut [H::Vector]) {
        if self.q_solutions.contains_key(&0) {
            return;
        }
        let n = self.qspace.size();
        let Variant::Optimize {
            algorithm, line, ..
        } = &mut self.variant
        else {
            return;
        };
        if line.steplength != 0.0 {
            let best = line
                .best
                .as_ref()
                .expect("line search requires a cached best iterate");
            self.handler.copy(&mut solution[0], &best.r);
            self.handler
                .axpy(line.steplength, self.qspace.param(n - 1), &mut solution[0]);
            self.values.pop();
            self.qspace.remove(n - 1);
        } else if self.interpolation.nrows() > 0 {
            if *algorithm == OptimizeAlgorithm::Lbfgs {
                for a in 0..n {
                    let factor = self.interpolation[(a, 0)]
                        - self.handler.dot(self.qspace.action_vec(a), &solution[0])
                            / self.qspace.action(a, a);
                    self.handler
                        .axpy(factor, self.qspace.param(a), &mut solution[0]);
                }
            }
            if let Some(best) = line.best.as_ref() {
                self.handler.axpy(1.0, &best.r, &mut solution[0]);
            }
        }
    }
}
