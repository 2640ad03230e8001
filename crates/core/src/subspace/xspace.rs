//! Assembly and conditioning of the reduced subspace matrices.
//!
//! The overlap S, action H and right-hand-side block are assembled from the
//! cached interactions of the P, Q and R blocks; nothing here touches a
//! large vector. The P space is consulted through a borrowed handle at build
//! time only and never stored.

use faer::Mat;
use log::{debug, warn};

use crate::error::Result;
use crate::subspace::dense::smallest_singular_pair;
use crate::subspace::pspace::PSpace;
use crate::subspace::qspace::QSpace;
use crate::subspace::rspace::RSpace;
use crate::subspace::Dimensions;

/// A right-singular-vector coefficient this small means the corresponding
/// subspace axis does not participate in the near-null direction, so it is
/// not a useful eviction target.
const SINGULAR_COEFFICIENT_FLOOR: f64 = 1e-3;

/// The reduced equation data of the concatenated P ⊕ Q ⊕ R space.
pub struct XSpace {
    /// Action matrix: `H[i,j] = ⟨x_i, A x_j⟩`, or `⟨A x_i, A x_j⟩` under the
    /// residual-residual metric.
    pub h: Mat<f64>,
    /// Overlap: `S[i,j] = ⟨x_i, x_j⟩`. Equals `H` under the
    /// residual-residual metric.
    pub s: Mat<f64>,
    /// Right-hand sides projected onto the subspace (nX × nRhs).
    pub rhs: Mat<f64>,
    dims: Dimensions,
}

impl XSpace {
    pub fn new() -> Self {
        Self {
            h: Mat::zeros(0, 0),
            s: Mat::zeros(0, 0),
            rhs: Mat::zeros(0, 0),
            dims: Dimensions::default(),
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dims
    }

    /// Assemble S, H and the RHS block from the current subspace contents.
    ///
    /// Assembling twice without intervening mutation yields identical
    /// matrices; every entry is copied from data cached in the three spaces.
    pub fn build<V: Clone>(
        &mut self,
        pspace: &PSpace,
        qspace: &QSpace<V>,
        rspace: &RSpace<V>,
        n_rhs: usize,
        res_res: bool,
    ) {
        let np = pspace.size();
        let nq = qspace.size();
        let nr = rspace.size();
        self.dims = Dimensions::new(np, nq, nr);
        let nx = self.dims.nx();
        let (op, oq, or) = (self.dims.op(), self.dims.oq(), self.dims.or());
        debug!("[xspace] build nP={np}, nQ={nq}, nR={nr}");

        let mut h = Mat::zeros(nx, nx);
        let mut s = Mat::zeros(nx, nx);
        let mut rhs = Mat::zeros(nx, n_rhs);

        for a in 0..nq {
            for (j, &value) in qspace.rhs(a).iter().enumerate() {
                rhs[(oq + a, j)] = value;
            }
            for b in 0..nq {
                h[(oq + b, oq + a)] = qspace.action(b, a);
                s[(oq + b, oq + a)] = qspace.metric(b, a);
            }
            let metric_p = qspace.metric_pspace(a);
            let action_p = qspace.action_pspace(a);
            for i in 0..np {
                h[(op + i, oq + a)] = action_p[i];
                h[(oq + a, op + i)] = action_p[i];
                s[(op + i, oq + a)] = metric_p[i];
                s[(oq + a, op + i)] = metric_p[i];
            }
            for m in 0..nr {
                h[(or + m, oq + a)] = qspace.h_rq(a, m);
                h[(oq + a, or + m)] = qspace.h_qr(a, m);
                s[(or + m, oq + a)] = qspace.s_qr(a, m);
                s[(oq + a, or + m)] = qspace.s_qr(a, m);
            }
        }

        for i in 0..np {
            for j in 0..n_rhs {
                rhs[(op + i, j)] = pspace.rhs(i, j);
            }
            for j in 0..np {
                h[(op + i, op + j)] = pspace.action(i, j);
                s[(op + i, op + j)] = pspace.overlap(i, j);
            }
            for m in 0..nr {
                h[(or + m, op + i)] = rspace.h_pr(i, m);
                h[(op + i, or + m)] = rspace.h_pr(i, m);
                s[(or + m, op + i)] = rspace.s_pr(i, m);
                s[(op + i, or + m)] = rspace.s_pr(i, m);
            }
        }

        for n in 0..nr {
            for j in 0..n_rhs {
                rhs[(or + n, j)] = rspace.rhs(n, j);
            }
            for m in 0..nr {
                h[(or + m, or + n)] = rspace.h_rr(m, n);
                s[(or + m, or + n)] = rspace.s_rr(m, n);
            }
        }

        if res_res {
            s = h.clone();
        }
        self.h = h;
        self.s = s;
        self.rhs = rhs;
    }

    /// Find a Q vector responsible for near-singularity of the subspace.
    ///
    /// Computes the SVD of the leading `test_dim`×`test_dim` block of the
    /// singularity tester (the overlap for the linear variants, the action
    /// matrix otherwise). If the smallest singular value falls below
    /// `threshold`, the candidate whose right-singular-vector coefficient is
    /// largest (and above a floor) is proposed for eviction.
    ///
    /// `candidates` are absolute subspace indices; only Q rows not tied to a
    /// converged root belong in the set.
    pub fn propose_singularity_deletion(
        &self,
        test_dim: usize,
        candidates: &[usize],
        threshold: f64,
        test_overlap: bool,
    ) -> Result<Option<usize>> {
        if test_dim == 0 || candidates.is_empty() {
            return Ok(None);
        }
        let tester = if test_overlap { &self.s } else { &self.h };
        let (sigma_min, v) = smallest_singular_pair(tester.as_ref(), test_dim)?;
        if sigma_min > threshold {
            return Ok(None);
        }
        debug!(
            "[xspace] smallest singular value {:.3e} below threshold {:.3e}",
            sigma_min, threshold
        );
        let mut best: Option<usize> = None;
        for &k in candidates {
            if k >= test_dim {
                continue;
            }
            let coefficient = v[k].abs();
            if coefficient > SINGULAR_COEFFICIENT_FLOOR
                && best.map_or(true, |b| coefficient > v[b].abs())
            {
                best = Some(k);
            }
        }
        if best.is_none() {
            warn!(
                "[xspace] subspace is near-singular (sigma={:.3e}) but no Q vector is evictable",
                sigma_min
            );
        }
        Ok(best)
    }
}

impl Default for XSpace {
    fn default() -> Self {
        Self::new()
    }
}
