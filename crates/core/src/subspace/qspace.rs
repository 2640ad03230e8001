//! The history block of the subspace.
//!
//! Q entries are unit-normalised snapshots: either the difference between
//! the latest interpolated solution and the previous one (the search
//! direction the caller just explored), or a converged solution promoted so
//! its root keeps contributing to the reduced problem after leaving the
//! working set.
//!
//! Each entry owns its parameter and action vectors and caches every
//! interaction the reduced matrices need: the Q–Q metric and action rows,
//! the dots against the P space and the RHS set, and the per-iteration
//! interactions with the current R block. Removing an entry removes all of
//! its cached data, so cache rows stay in one-to-one correspondence with Q
//! indices without any re-indexing pass.

use log::debug;

use crate::error::{Result, SolverError};
use crate::handler::VectorHandler;
use crate::subspace::pspace::PSpace;

/// A single history vector: (parameter q, action A·q, scale factor).
pub struct QEntry<V> {
    param: V,
    action: V,
    /// The factor the raw difference was multiplied by to reach unit norm;
    /// its reciprocal is the length of the underlying step.
    scale_factor: f64,
    /// Stable identifier, unique over the lifetime of the engine.
    key: usize,
    /// `⟨q, rhs_j⟩` for each right-hand side.
    rhs: Vec<f64>,
    /// `⟨p_i, q⟩` for each P vector.
    metric_p: Vec<f64>,
    /// `⟨p_i, A q⟩` for each P vector.
    action_p: Vec<f64>,
    /// Per current R column m: `⟨r_m, q⟩`.
    s_r: Vec<f64>,
    /// Per current R column m: H(q-row, r-column).
    h_qr: Vec<f64>,
    /// Per current R column m: H(r-row, q-column).
    h_rq: Vec<f64>,
}

/// Ordered history of Q entries plus their pairwise metric and action.
pub struct QSpace<V> {
    entries: Vec<QEntry<V>>,
    /// `metric[a][b] = ⟨q_a, q_b⟩`.
    metric: Vec<Vec<f64>>,
    /// `action[a][b] = H(a, b)` in the active metric.
    action: Vec<Vec<f64>>,
    hermitian: bool,
    next_key: usize,
}

impl<V: Clone> QSpace<V> {
    pub fn new(hermitian: bool) -> Self {
        Self {
            entries: Vec::new(),
            metric: Vec::new(),
            action: Vec::new(),
            hermitian,
            next_key: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stable keys of the stored entries, in index order.
    pub fn keys(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.key).collect()
    }

    pub fn param(&self, a: usize) -> &V {
        &self.entries[a].param
    }

    pub fn action_vec(&self, a: usize) -> &V {
        &self.entries[a].action
    }

    pub fn scale_factor(&self, a: usize) -> f64 {
        self.entries[a].scale_factor
    }

    /// `⟨q_a, q_b⟩`.
    pub fn metric(&self, a: usize, b: usize) -> f64 {
        self.metric[a][b]
    }

    /// Action block entry H(a, b).
    pub fn action(&self, a: usize, b: usize) -> f64 {
        self.action[a][b]
    }

    pub fn rhs(&self, a: usize) -> &[f64] {
        &self.entries[a].rhs
    }

    pub fn metric_pspace(&self, a: usize) -> &[f64] {
        &self.entries[a].metric_p
    }

    pub fn action_pspace(&self, a: usize) -> &[f64] {
        &self.entries[a].action_p
    }

    pub fn s_qr(&self, a: usize, m: usize) -> f64 {
        self.entries[a].s_r[m]
    }

    pub fn h_qr(&self, a: usize, m: usize) -> f64 {
        self.entries[a].h_qr[m]
    }

    pub fn h_rq(&self, a: usize, m: usize) -> f64 {
        self.entries[a].h_rq[m]
    }

    /// Enqueue the step from the previous iterate to the new one.
    ///
    /// The stored direction is `d = r_new − r_prev` (with the matching action
    /// difference), optionally orthogonalised against `r_new`, then scaled to
    /// unit norm. The forward orientation is what the line search's slope
    /// bookkeeping assumes; for the linear variants only the span matters.
    /// A vanishing difference is a numerical breakdown: the caller fed the
    /// same iterate twice.
    #[allow(clippy::too_many_arguments)]
    pub fn add_difference<H>(
        &mut self,
        handler: &H,
        r_new: &V,
        action_new: &V,
        r_prev: &V,
        action_prev: &V,
        rhs: &[V],
        pspace: &PSpace,
        res_res: bool,
        orthogonalise: bool,
    ) -> Result<usize>
    where
        H: VectorHandler<Vector = V>,
    {
        let mut d = r_new.clone();
        handler.axpy(-1.0, r_prev, &mut d);
        let mut hd = action_new.clone();
        handler.axpy(-1.0, action_prev, &mut hd);

        if orthogonalise {
            let denom = handler.dot(r_new, r_new);
            if denom > 0.0 {
                let coeff = handler.dot(r_new, &d) / denom;
                // The same combination applies to the action: A(d − c·r) for
                // linear problems.
                handler.axpy(-coeff, r_new, &mut d);
                handler.axpy(-coeff, action_new, &mut hd);
            }
        }

        let norm = handler.dot(&d, &d).sqrt();
        if !(norm > 0.0) || !norm.is_finite() {
            return Err(SolverError::breakdown(
                "difference vector for the Q space has zero norm",
            ));
        }
        handler.scale(1.0 / norm, &mut d);
        handler.scale(1.0 / norm, &mut hd);
        self.push_entry(handler, d, hd, 1.0 / norm, rhs, pspace, res_res)
    }

    /// Promote a converged solution: store the vector itself, normalised.
    pub fn add_solution<H>(
        &mut self,
        handler: &H,
        r: &V,
        action: &V,
        rhs: &[V],
        pspace: &PSpace,
        res_res: bool,
    ) -> Result<usize>
    where
        H: VectorHandler<Vector = V>,
    {
        let norm = handler.dot(r, r).sqrt();
        if !(norm > 0.0) || !norm.is_finite() {
            return Err(SolverError::breakdown(
                "converged solution has zero norm and cannot join the Q space",
            ));
        }
        let mut q = r.clone();
        let mut hq = action.clone();
        handler.scale(1.0 / norm, &mut q);
        handler.scale(1.0 / norm, &mut hq);
        self.push_entry(handler, q, hq, 1.0 / norm, rhs, pspace, res_res)
    }

    fn push_entry<H>(
        &mut self,
        handler: &H,
        q: V,
        hq: V,
        scale_factor: f64,
        rhs: &[V],
        pspace: &PSpace,
        res_res: bool,
    ) -> Result<usize>
    where
        H: VectorHandler<Vector = V>,
    {
        let rhs_dots: Vec<f64> = rhs.iter().map(|b| handler.dot(&q, b)).collect();
        let metric_p: Vec<f64> = pspace
            .vectors()
            .iter()
            .map(|p| handler.sparse_dot(&q, p))
            .collect();
        let action_p: Vec<f64> = pspace
            .vectors()
            .iter()
            .map(|p| handler.sparse_dot(&hq, p))
            .collect();

        // Grow the Q-Q metric and action by one row and column.
        let n = self.entries.len();
        for a in 0..n {
            let s = handler.dot(&self.entries[a].param, &q);
            self.metric[a].push(s);
            let h_ab = if res_res {
                handler.dot(&self.entries[a].action, &hq)
            } else {
                handler.dot(&self.entries[a].param, &hq)
            };
            self.action[a].push(h_ab);
        }
        let mut metric_row: Vec<f64> = (0..n)
            .map(|b| handler.dot(&q, &self.entries[b].param))
            .collect();
        metric_row.push(handler.dot(&q, &q));
        let mut action_row: Vec<f64> = (0..n)
            .map(|b| {
                if res_res {
                    handler.dot(&hq, &self.entries[b].action)
                } else {
                    handler.dot(&q, &self.entries[b].action)
                }
            })
            .collect();
        action_row.push(if res_res {
            handler.dot(&hq, &hq)
        } else {
            handler.dot(&q, &hq)
        });
        self.metric.push(metric_row);
        self.action.push(action_row);

        let key = self.next_key;
        self.next_key += 1;
        self.entries.push(QEntry {
            param: q,
            action: hq,
            scale_factor,
            key,
            rhs: rhs_dots,
            metric_p,
            action_p,
            s_r: Vec::new(),
            h_qr: Vec::new(),
            h_rq: Vec::new(),
        });
        debug!(
            "[qspace] entry {} added, size now {}",
            key,
            self.entries.len()
        );
        Ok(key)
    }

    /// Drop entry `a` and every cached row or column that refers to it.
    /// Indices above `a` shift down by one; keys are stable.
    pub fn remove(&mut self, a: usize) {
        assert!(a < self.entries.len(), "Q index out of range");
        let key = self.entries[a].key;
        self.entries.remove(a);
        self.metric.remove(a);
        self.action.remove(a);
        for row in &mut self.metric {
            row.remove(a);
        }
        for row in &mut self.action {
            row.remove(a);
        }
        debug!(
            "[qspace] entry {} removed, size now {}",
            key,
            self.entries.len()
        );
    }

    /// Recompute the P-space dots of every entry. Called after the P space
    /// has grown.
    pub fn refresh_pspace<H>(&mut self, handler: &H, pspace: &PSpace)
    where
        H: VectorHandler<Vector = V>,
    {
        for entry in &mut self.entries {
            entry.metric_p = pspace
                .vectors()
                .iter()
                .map(|p| handler.sparse_dot(&entry.param, p))
                .collect();
            entry.action_p = pspace
                .vectors()
                .iter()
                .map(|p| handler.sparse_dot(&entry.action, p))
                .collect();
        }
    }

    /// Rebuild the interactions of every entry with the current R block.
    ///
    /// Called once per outer iteration, after the working-set vectors have
    /// been received and before the subspace matrices are assembled.
    pub fn update_r_interactions<H>(
        &mut self,
        handler: &H,
        params: &[V],
        actions: &[V],
        res_res: bool,
    ) -> Result<()>
    where
        H: VectorHandler<Vector = V>,
    {
        if params.len() != actions.len() {
            return Err(SolverError::precondition(
                "parameter and action sets differ in length",
            ));
        }
        let hermitian = self.hermitian;
        for entry in &mut self.entries {
            let nr = params.len();
            entry.s_r.resize(nr, 0.0);
            entry.h_qr.resize(nr, 0.0);
            entry.h_rq.resize(nr, 0.0);
            for m in 0..nr {
                entry.s_r[m] = handler.dot(&params[m], &entry.param);
                entry.h_qr[m] = if res_res {
                    handler.dot(&actions[m], &entry.action)
                } else {
                    handler.dot(&actions[m], &entry.param)
                };
                entry.h_rq[m] = if hermitian {
                    entry.h_qr[m]
                } else if res_res {
                    handler.dot(&actions[m], &entry.action)
                } else {
                    handler.dot(&params[m], &entry.action)
                };
            }
        }
        Ok(())
    }
}
