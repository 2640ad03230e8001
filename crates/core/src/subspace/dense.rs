//! Small dense kernels for the reduced problems.
//!
//! Everything here operates on nX-sized matrices, where nX is the subspace
//! dimension (tens, not thousands), so the cost of these routines is
//! negligible next to a single large-vector dot product. Decompositions are
//! delegated to faer; the surrounding plumbing (whitening, sorting,
//! orthonormalisation in the overlap metric) is explicit because the reduced
//! eigenproblem is generalised and possibly non-Hermitian.

use faer::linalg::solvers::{Eigen, Solve};
use faer::{Mat, MatRef};
use log::debug;
use num_complex::Complex64;

use crate::error::{Result, SolverError};

/// Eigenvalues below this magnitude are treated as numerically zero when
/// deciding whether an eigenvector may be rotated into the real axis.
const ZERO_EIGENVALUE_TOLERANCE: f64 = 1e-12;

/// Deterministic mixing weight used to fold the imaginary part of a
/// null-space eigenvector into its real part.
const NULL_SPACE_FOLD: f64 = 0.3256897;

/// Result of the whitened generalised eigendecomposition.
///
/// Eigenvectors are stored column-wise in the original (un-whitened)
/// subspace basis; there are `rank` of them, where `rank` is the retained
/// rank of the overlap.
pub(crate) struct ReducedEigen {
    pub eigenvalues: Vec<Complex64>,
    /// `vectors[k][i]` is component i of eigenvector k.
    pub vectors: Vec<Vec<Complex64>>,
}

impl ReducedEigen {
    /// Euclidean norm of the imaginary part of eigenvector `k`.
    pub fn imaginary_norm(&self, k: usize) -> f64 {
        self.vectors[k]
            .iter()
            .map(|c| c.im * c.im)
            .sum::<f64>()
            .sqrt()
    }
}

/// Smallest singular value of the leading `n`×`n` block of `m`, together
/// with the corresponding right singular vector.
pub(crate) fn smallest_singular_pair(m: MatRef<'_, f64>, n: usize) -> Result<(f64, Vec<f64>)> {
    let block = Mat::from_fn(n, n, |i, j| m[(i, j)]);
    let svd = block
        .as_ref()
        .svd()
        .map_err(|e| SolverError::ReducedSolve(format!("SVD of the subspace overlap: {e:?}")))?;
    let sv = svd.S().column_vector();
    let mut most_singular = 0;
    for k in 1..n {
        if sv[k] < sv[most_singular] {
            most_singular = k;
        }
    }
    let v = svd.V();
    let vector = (0..n).map(|i| v[(i, most_singular)]).collect();
    Ok((sv[most_singular], vector))
}

/// Solve the generalised eigenproblem `H c = λ S c` by whitening the overlap.
///
/// The overlap is SVD-decomposed as `S = U Σ Vᵀ`, truncated at
/// `svd_threshold` relative to the largest singular value, and the
/// eigenproblem of `H̄ = Σ^{-1/2} Uᵀ H V Σ^{-1/2}` is solved with a general
/// (possibly complex) eigendecomposition. Eigenvectors are mapped back
/// through `V Σ^{-1/2}`, sorted by ascending real eigenvalue, and cleaned
/// up: null-space vectors are rotated onto the real axis, Hermitian problems
/// get three passes of Gram–Schmidt in the S metric, every vector is
/// S-normalised, and the phase is fixed so the largest-magnitude component
/// is positive real.
pub(crate) fn eigen_via_overlap_whitening(
    h: &Mat<f64>,
    s: &Mat<f64>,
    svd_threshold: f64,
    hermitian: bool,
) -> Result<ReducedEigen> {
    let n = s.nrows();
    debug_assert_eq!(s.ncols(), n);
    debug_assert_eq!(h.nrows(), n);

    let mut s_work = s.clone();
    // Snap near-unit diagonal entries; some SVD implementations lose accuracy
    // on nearly-identity matrices otherwise.
    for k in 0..n {
        if (s_work[(k, k)] - 1.0).abs() < 1e-15 {
            s_work[(k, k)] = 1.0;
        }
    }

    let svd = s_work
        .as_ref()
        .svd()
        .map_err(|e| SolverError::ReducedSolve(format!("SVD of the subspace overlap: {e:?}")))?;
    let sv = svd.S().column_vector();
    let sv_max = if n > 0 { sv[0] } else { 0.0 };
    let mut rank = 0;
    for k in 0..n {
        if sv[k] > svd_threshold * sv_max {
            rank += 1;
        }
    }
    if rank == 0 {
        return Err(SolverError::breakdown(
            "subspace overlap is numerically zero",
        ));
    }
    if rank < n {
        debug!("[dense] overlap rank {rank} in subspace of dimension {n}");
    }
    let svmh: Vec<f64> = (0..rank).map(|k| 1.0 / sv[k].sqrt()).collect();

    let u_r = svd.U().subcols(0, rank);
    let v_r = svd.V().subcols(0, rank);
    let ut_h = u_r.transpose() * h.as_ref();
    let mut hbar = ut_h * v_r;
    for a in 0..rank {
        for b in 0..rank {
            hbar[(a, b)] *= svmh[a] * svmh[b];
        }
    }

    let eig = Eigen::new_from_real(hbar.as_ref())
        .map_err(|e| SolverError::ReducedSolve(format!("eigendecomposition failed: {e:?}")))?;
    let lambda = eig.S().column_vector();
    let w = eig.U();

    // Map the whitened eigenvectors back to the original basis:
    // x_k = V Σ^{-1/2} w_k.
    let mut eigenvalues: Vec<Complex64> = (0..rank)
        .map(|k| Complex64::new(lambda[k].re, lambda[k].im))
        .collect();
    let mut vectors: Vec<Vec<Complex64>> = (0..rank)
        .map(|k| {
            (0..n)
                .map(|i| {
                    let mut acc = Complex64::new(0.0, 0.0);
                    for r in 0..rank {
                        let wrk = Complex64::new(w[(r, k)].re, w[(r, k)].im);
                        acc += v_r[(i, r)] * svmh[r] * wrk;
                    }
                    acc
                })
                .collect()
        })
        .collect();

    // Sort eigenpairs by ascending real part.
    let mut order: Vec<usize> = (0..rank).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[a]
            .re
            .partial_cmp(&eigenvalues[b].re)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    eigenvalues = order.iter().map(|&k| eigenvalues[k]).collect();
    vectors = order.iter().map(|&k| vectors[k].clone()).collect();

    // Clean-up passes. Repeated three times: Gram-Schmidt in a possibly
    // ill-conditioned metric needs the extra sweeps to stay orthogonal.
    let mut metric_rows: Vec<Vec<Complex64>> = vec![Vec::new(); rank];
    for _repeat in 0..3 {
        for k in 0..rank {
            if eigenvalues[k].norm() < ZERO_EIGENVALUE_TOLERANCE {
                // A zero eigenvalue leaves the phase free: rotate the vector
                // onto the real axis so the null space stays representable.
                for c in vectors[k].iter_mut() {
                    *c = Complex64::new(c.re + NULL_SPACE_FOLD * c.im, 0.0);
                }
            }
            if hermitian {
                for l in 0..k {
                    let row = &metric_rows[l];
                    let ovl: Complex64 = row
                        .iter()
                        .zip(vectors[k].iter())
                        .map(|(m, x)| m.conj() * x)
                        .sum();
                    let projection: Vec<Complex64> =
                        vectors[l].iter().map(|c| c * ovl).collect();
                    for (x, p) in vectors[k].iter_mut().zip(projection) {
                        *x -= p;
                    }
                }
            }
            let s_xk = metric_apply(s, &vectors[k]);
            let ovl: Complex64 = vectors[k]
                .iter()
                .zip(s_xk.iter())
                .map(|(x, sx)| x.conj() * sx)
                .sum();
            if !(ovl.re > 0.0) || !ovl.re.is_finite() {
                return Err(SolverError::breakdown(format!(
                    "eigenvector {k} has non-positive norm {:.3e} in the overlap metric",
                    ovl.re
                )));
            }
            let inv = 1.0 / ovl.re.sqrt();
            for c in vectors[k].iter_mut() {
                *c *= inv;
            }
            metric_rows[k] = metric_apply(s, &vectors[k]);

            // Phase: force the largest-magnitude component positive real.
            let mut lmax = 0;
            for i in 1..n {
                if vectors[k][i].norm() > vectors[k][lmax].norm() {
                    lmax = i;
                }
            }
            if vectors[k][lmax].re < 0.0 {
                for c in vectors[k].iter_mut() {
                    *c = -*c;
                }
            }
        }
    }

    Ok(ReducedEigen {
        eigenvalues,
        vectors,
    })
}

/// `S · y` for a complex column over the real metric `S`.
fn metric_apply(s: &Mat<f64>, y: &[Complex64]) -> Vec<Complex64> {
    let n = y.len();
    (0..n)
        .map(|i| {
            let mut acc = Complex64::new(0.0, 0.0);
            for j in 0..n {
                acc += s[(i, j)] * y[j];
            }
            acc
        })
        .collect()
}

/// Solve `H·C = B` by column-pivoted Householder QR. Works for indefinite
/// matrices, which rules out a Cholesky shortcut here.
pub(crate) fn solve_qr(h: &Mat<f64>, rhs: &Mat<f64>) -> Mat<f64> {
    let qr = h.as_ref().col_piv_qr();
    qr.solve(rhs)
}

/// Residual norm `‖H·c − b‖` of a reduced linear solve, per column.
pub(crate) fn reduced_residual_norms(h: &Mat<f64>, c: &Mat<f64>, rhs: &Mat<f64>) -> Vec<f64> {
    let hc = h.as_ref() * c.as_ref();
    (0..rhs.ncols())
        .map(|j| {
            (0..rhs.nrows())
                .map(|i| {
                    let d = hc[(i, j)] - rhs[(i, j)];
                    d * d
                })
                .sum::<f64>()
                .sqrt()
        })
        .collect()
}

/// Minimum-norm least-squares solve of `B·c = rhs` through a truncated SVD.
///
/// Singular values below `threshold` relative to the largest are discarded,
/// matching the truncation used when whitening the overlap.
pub(crate) fn svd_solve(b: &Mat<f64>, rhs: &[f64], threshold: f64) -> Result<Vec<f64>> {
    let n = b.nrows();
    debug_assert_eq!(b.ncols(), n);
    debug_assert_eq!(rhs.len(), n);
    let svd = b
        .as_ref()
        .svd()
        .map_err(|e| SolverError::ReducedSolve(format!("SVD solve failed: {e:?}")))?;
    let sv = svd.S().column_vector();
    let sv_max = if n > 0 { sv[0] } else { 0.0 };
    let u = svd.U();
    let v = svd.V();
    let mut c = vec![0.0; n];
    for k in 0..n {
        if sv[k] <= threshold * sv_max {
            continue;
        }
        let mut ub = 0.0;
        for i in 0..n {
            ub += u[(i, k)] * rhs[i];
        }
        let w = ub / sv[k];
        for i in 0..n {
            c[i] += v[(i, k)] * w;
        }
    }
    Ok(c)
}
