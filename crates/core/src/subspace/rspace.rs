//! The working block: the trial vectors of the current outer iteration.
//!
//! R vectors are owned by the caller; the engine snapshots them for the
//! duration of one `add_vector` call so the interpolation can still read the
//! originals after the caller's buffers have been overwritten with the new
//! solution. The snapshots are dropped on the next call.

use crate::error::{Result, SolverError};
use crate::handler::VectorHandler;
use crate::subspace::pspace::PSpace;

/// Current trial vectors, their actions, and their intra-block dot products.
pub struct RSpace<V> {
    params: Vec<V>,
    actions: Vec<V>,
    /// `s_rr[m][n] = ⟨r_m, r_n⟩` — but note assembly reads it transposed, so
    /// store exactly what the reduced overlap needs: `⟨r_n, r_m⟩` at [m][n].
    s_rr: Vec<Vec<f64>>,
    /// `h_rr[m][n] = H(r_m, r_n)` in the active metric.
    h_rr: Vec<Vec<f64>>,
    /// `rhs_r[m][j] = ⟨r_m, rhs_j⟩`.
    rhs_r: Vec<Vec<f64>>,
    /// `s_pr[i][m] = ⟨r_m, p_i⟩`.
    s_pr: Vec<Vec<f64>>,
    /// `h_pr[i][m] = ⟨A r_m, p_i⟩`.
    h_pr: Vec<Vec<f64>>,
}

impl<V: Clone> RSpace<V> {
    pub fn new() -> Self {
        Self {
            params: Vec::new(),
            actions: Vec::new(),
            s_rr: Vec::new(),
            h_rr: Vec::new(),
            rhs_r: Vec::new(),
            s_pr: Vec::new(),
            h_pr: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn param(&self, m: usize) -> &V {
        &self.params[m]
    }

    pub fn action(&self, m: usize) -> &V {
        &self.actions[m]
    }

    pub fn params(&self) -> &[V] {
        &self.params
    }

    pub fn actions(&self) -> &[V] {
        &self.actions
    }

    pub fn s_rr(&self, m: usize, n: usize) -> f64 {
        self.s_rr[m][n]
    }

    pub fn h_rr(&self, m: usize, n: usize) -> f64 {
        self.h_rr[m][n]
    }

    pub fn rhs(&self, m: usize, j: usize) -> f64 {
        self.rhs_r[m][j]
    }

    pub fn s_pr(&self, i: usize, m: usize) -> f64 {
        self.s_pr[i][m]
    }

    pub fn h_pr(&self, i: usize, m: usize) -> f64 {
        self.h_pr[i][m]
    }

    /// Recompute the P-interaction rows against a grown P space, keeping the
    /// current snapshots.
    pub fn refresh_pspace<H>(&mut self, handler: &H, pspace: &PSpace)
    where
        H: VectorHandler<Vector = V>,
    {
        let np = pspace.size();
        let nr = self.params.len();
        self.s_pr = vec![vec![0.0; nr]; np];
        self.h_pr = vec![vec![0.0; nr]; np];
        for i in 0..np {
            let p = pspace.vector(i);
            for m in 0..nr {
                self.s_pr[i][m] = handler.sparse_dot(&self.params[m], p);
                self.h_pr[i][m] = handler.sparse_dot(&self.actions[m], p);
            }
        }
    }

    /// Snapshot the caller's trial vectors and recompute every dot product
    /// the reduced matrices need from the R block.
    pub fn update<H>(
        &mut self,
        handler: &H,
        params: &[V],
        actions: &[V],
        rhs: &[V],
        pspace: &PSpace,
        res_res: bool,
    ) -> Result<()>
    where
        H: VectorHandler<Vector = V>,
    {
        if params.len() != actions.len() {
            return Err(SolverError::precondition(format!(
                "parameter set has {} vectors but action set has {}",
                params.len(),
                actions.len()
            )));
        }
        self.params = params.to_vec();
        self.actions = actions.to_vec();

        let nr = params.len();
        self.s_rr = vec![vec![0.0; nr]; nr];
        self.h_rr = vec![vec![0.0; nr]; nr];
        for m in 0..nr {
            for n in 0..nr {
                self.s_rr[m][n] = handler.dot(&params[m], &params[n]);
                self.h_rr[m][n] = if res_res {
                    handler.dot(&actions[n], &actions[m])
                } else {
                    handler.dot(&actions[n], &params[m])
                };
            }
        }

        self.rhs_r = (0..nr)
            .map(|m| rhs.iter().map(|b| handler.dot(&params[m], b)).collect())
            .collect();

        let np = pspace.size();
        self.s_pr = vec![vec![0.0; nr]; np];
        self.h_pr = vec![vec![0.0; nr]; np];
        for i in 0..np {
            let p = pspace.vector(i);
            for m in 0..nr {
                self.s_pr[i][m] = handler.sparse_dot(&params[m], p);
                self.h_pr[i][m] = handler.sparse_dot(&actions[m], p);
            }
        }
        Ok(())
    }
}

impl<V: Clone> Default for RSpace<V> {
    fn default() -> Self {
        Self::new()
    }
}
