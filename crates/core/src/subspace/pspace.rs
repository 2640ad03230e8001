//! Sparse P-space vectors and their cached reduced blocks.

use std::collections::BTreeMap;

use faer::Mat;

use crate::error::{Result, SolverError};

/// A sparse axis of the full space: a set of (index, coefficient) pairs with
/// unique indices.
///
/// P vectors are cheap to dot against each other exactly, which is why the
/// PP overlap block is always recomputed from the coefficients rather than
/// trusted from the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PVector {
    entries: BTreeMap<usize, f64>,
}

impl PVector {
    /// Build from (index, coefficient) pairs. Duplicate indices are a
    /// precondition failure.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (usize, f64)>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (index, coefficient) in pairs {
            if entries.insert(index, coefficient).is_some() {
                return Err(SolverError::precondition(format!(
                    "P vector has duplicate index {index}"
                )));
            }
        }
        Ok(Self { entries })
    }

    /// A single-axis P vector with unit coefficient.
    pub fn unit(index: usize) -> Self {
        Self {
            entries: BTreeMap::from([(index, 1.0)]),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over (index, coefficient) pairs in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.entries.iter().map(|(&i, &c)| (i, c))
    }

    /// Exact sparse–sparse inner product over the index intersection.
    pub fn dot(&self, other: &PVector) -> f64 {
        // Walk the smaller map, probe the larger.
        let (small, large) = if self.entries.len() <= other.entries.len() {
            (&self.entries, &other.entries)
        } else {
            (&other.entries, &self.entries)
        };
        small
            .iter()
            .filter_map(|(i, c)| large.get(i).map(|d| c * d))
            .sum()
    }
}

/// The ordered list of P vectors plus the PP blocks of the reduced matrices.
///
/// P entries are added at most once per vector; after iterations have begun
/// the space may only grow, never be cleared.
#[derive(Debug)]
pub struct PSpace {
    vectors: Vec<PVector>,
    /// PP block of the action matrix H, supplied by the caller.
    action: Mat<f64>,
    /// PP block of the overlap S, recomputed exactly from the coefficients.
    overlap: Mat<f64>,
    /// Dots of each P vector against each RHS vector (nP × nRhs).
    rhs: Mat<f64>,
}

impl Default for PSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl PSpace {
    pub fn new() -> Self {
        Self {
            vectors: Vec::new(),
            action: Mat::zeros(0, 0),
            overlap: Mat::zeros(0, 0),
            rhs: Mat::zeros(0, 0),
        }
    }

    pub fn size(&self) -> usize {
        self.vectors.len()
    }

    /// Append new P vectors.
    ///
    /// `pp_action` holds the action block projected onto (existing + new, new)
    /// in row-major order with the existing+new index running fastest, i.e.
    /// `pp_action[n * (old + new) + i] = ⟨p_i, A p_new_n⟩`.
    ///
    /// `rhs_dots[n][j]` carries `⟨p_new_n, rhs_j⟩`, computed by the engine
    /// through the handler.
    pub fn add(
        &mut self,
        new_vectors: Vec<PVector>,
        pp_action: &[f64],
        rhs_dots: &[Vec<f64>],
    ) -> Result<()> {
        let old = self.vectors.len();
        let total = old + new_vectors.len();
        if pp_action.len() != new_vectors.len() * total {
            return Err(SolverError::precondition(format!(
                "PP action block has {} entries, expected {} ({} new x {} total)",
                pp_action.len(),
                new_vectors.len() * total,
                new_vectors.len(),
                total
            )));
        }
        if rhs_dots.len() != new_vectors.len() {
            return Err(SolverError::precondition(
                "RHS dot rows do not match the number of new P vectors",
            ));
        }
        let n_rhs = rhs_dots.first().map_or(self.rhs.ncols(), Vec::len);

        self.vectors.extend(new_vectors);

        let mut action = Mat::zeros(total, total);
        let mut overlap = Mat::zeros(total, total);
        for i in 0..old {
            for j in 0..old {
                action[(i, j)] = self.action[(i, j)];
                overlap[(i, j)] = self.overlap[(i, j)];
            }
        }
        for n in 0..(total - old) {
            for i in 0..total {
                let value = pp_action[n * total + i];
                action[(old + n, i)] = value;
                action[(i, old + n)] = value;
            }
        }
        for i in old..total {
            for j in 0..total {
                let s = self.vectors[i].dot(&self.vectors[j]);
                overlap[(i, j)] = s;
                overlap[(j, i)] = s;
            }
        }
        self.action = action;
        self.overlap = overlap;

        let mut rhs = Mat::zeros(total, n_rhs);
        for i in 0..old {
            for j in 0..self.rhs.ncols() {
                rhs[(i, j)] = self.rhs[(i, j)];
            }
        }
        for (n, dots) in rhs_dots.iter().enumerate() {
            for (j, &value) in dots.iter().enumerate() {
                rhs[(old + n, j)] = value;
            }
        }
        self.rhs = rhs;
        Ok(())
    }

    /// Drop P vector `i` together with its rows and columns in the cached
    /// blocks. Indices above `i` shift down by one.
    pub fn erase(&mut self, i: usize) {
        assert!(i < self.vectors.len(), "P index out of range");
        self.vectors.remove(i);
        self.action = remove_row_col(&self.action, i);
        self.overlap = remove_row_col(&self.overlap, i);
        self.rhs = remove_row(&self.rhs, i);
    }

    pub fn vector(&self, i: usize) -> &PVector {
        &self.vectors[i]
    }

    pub fn vectors(&self) -> &[PVector] {
        &self.vectors
    }

    /// PP block of the action matrix: `⟨p_i, A p_j⟩`.
    pub fn action(&self, i: usize, j: usize) -> f64 {
        self.action[(i, j)]
    }

    /// PP block of the overlap: exact `⟨p_i, p_j⟩`.
    pub fn overlap(&self, i: usize, j: usize) -> f64 {
        self.overlap[(i, j)]
    }

    /// `⟨p_i, rhs_j⟩`.
    pub fn rhs(&self, i: usize, j: usize) -> f64 {
        self.rhs[(i, j)]
    }
}

fn remove_row_col(m: &Mat<f64>, k: usize) -> Mat<f64> {
    Mat::from_fn(m.nrows() - 1, m.ncols() - 1, |i, j| {
        let si = if i >= k { i + 1 } else { i };
        let sj = if j >= k { j + 1 } else { j };
        m[(si, sj)]
    })
}

fn remove_row(m: &Mat<f64>, k: usize) -> Mat<f64> {
    Mat::from_fn(m.nrows() - 1, m.ncols(), |i, j| {
        let si = if i >= k { i + 1 } else { i };
        m[(si, j)]
    })
}
