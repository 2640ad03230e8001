//! Construction of the next solution and residual from the reduced solve.
//!
//! Given the interpolation matrix (one column of expansion coefficients per
//! root), the interpolator forms the linear combination of P, Q and R
//! vectors for every root in the working set, writing into the caller's
//! buffers. In action-only mode the P contribution to the solution is
//! omitted and the residual is the bare action combination: the engine has
//! no action vectors for P axes, so the caller adds those externally.

use faer::Mat;
use num_complex::Complex64;

use crate::error::{Result, SolverError};
use crate::handler::VectorHandler;
use crate::subspace::pspace::PSpace;
use crate::subspace::qspace::QSpace;
use crate::subspace::rspace::RSpace;

/// Residual conventions of the active variant.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResidualConvention {
    /// Renormalise the solution and subtract `λ·solution` from the residual.
    pub eigen: bool,
    /// Subtract the right-hand side from the residual.
    pub rhs: bool,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn interpolate<H: VectorHandler>(
    handler: &H,
    pspace: &PSpace,
    qspace: &QSpace<H::Vector>,
    rspace: &RSpace<H::Vector>,
    interpolation: &Mat<f64>,
    working_set: &[usize],
    eigenvalues: &[Complex64],
    rhs: &[H::Vector],
    convention: ResidualConvention,
    solution: &mut [H::Vector],
    residual: &mut [H::Vector],
    action_only: bool,
) -> Result<()> {
    let np = pspace.size();
    let nr = rspace.size();
    // Guard against Q vectors added after the reduced solve: only as many Q
    // rows exist as the interpolation matrix was built with.
    let nq = interpolation.nrows().saturating_sub(np + nr);
    debug_assert!(nq <= qspace.size());
    let oq = np;
    let or = oq + nq;

    if working_set.len() > solution.len() || working_set.len() > residual.len() {
        return Err(SolverError::precondition(format!(
            "buffers hold {} vectors but the working set has {}",
            solution.len().min(residual.len()),
            working_set.len()
        )));
    }

    for (kkk, &root) in working_set.iter().enumerate() {
        if root >= interpolation.ncols() {
            return Err(SolverError::precondition(format!(
                "root {root} has no interpolation column (subspace rank too small)"
            )));
        }
        handler.fill_zero(&mut solution[kkk]);
        handler.fill_zero(&mut residual[kkk]);

        if !action_only {
            for l in 0..np {
                handler.sparse_axpy(
                    interpolation[(l, root)],
                    pspace.vector(l),
                    &mut solution[kkk],
                );
            }
        }
        for q in 0..nq {
            let coeff = interpolation[(oq + q, root)];
            handler.axpy(coeff, qspace.param(q), &mut solution[kkk]);
            handler.axpy(coeff, qspace.action_vec(q), &mut residual[kkk]);
        }
        for c in 0..nr {
            let coeff = interpolation[(or + c, root)];
            handler.axpy(coeff, rspace.param(c), &mut solution[kkk]);
            handler.axpy(coeff, rspace.action(c), &mut residual[kkk]);
        }

        if convention.eigen {
            let norm = handler.dot(&solution[kkk], &solution[kkk]);
            if norm == 0.0 {
                return Err(SolverError::breakdown(format!(
                    "interpolated solution for root {root} has zero norm"
                )));
            }
            handler.scale(1.0 / norm.sqrt(), &mut solution[kkk]);
            handler.scale(1.0 / norm.sqrt(), &mut residual[kkk]);
        }
        if !action_only && convention.eigen {
            let lambda = eigenvalues.get(root).map_or(0.0, |ev| ev.re);
            let solution_k = solution[kkk].clone();
            handler.axpy(-lambda, &solution_k, &mut residual[kkk]);
        }
        if !action_only && convention.rhs {
            handler.axpy(-1.0, &rhs[root], &mut residual[kkk]);
        }
    }
    Ok(())
}
