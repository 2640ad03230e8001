//! In-memory dense vector handler.
//!
//! Vectors are contiguous `Vec<f64>` buffers. This is the reference handler
//! used by the test suites and by callers whose problems fit in memory;
//! distributed or offline storage belongs in a different handler crate.
//!
//! With the `parallel` feature the elementwise kernels run on rayon once the
//! vectors are long enough to amortise the fork/join overhead.

use krysolv_core::handler::VectorHandler;
use krysolv_core::PVector;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Below this length the parallel code paths fall back to plain loops.
#[cfg(feature = "parallel")]
const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 15;

/// Dense in-memory handler over `Vec<f64>`.
#[derive(Clone, Copy)]
pub struct DenseHandler {
    #[cfg(feature = "parallel")]
    parallel_min_elements: usize,
}

impl Default for DenseHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DenseHandler {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "parallel")]
            parallel_min_elements: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    /// Builder method: set the minimum vector length for parallel kernels.
    #[cfg(feature = "parallel")]
    pub fn with_parallel_threshold(mut self, min_elements: usize) -> Self {
        self.parallel_min_elements = min_elements.max(1);
        self
    }

    #[cfg(feature = "parallel")]
    fn parallel(&self, len: usize) -> bool {
        len >= self.parallel_min_elements
    }
}

impl VectorHandler for DenseHandler {
    type Vector = Vec<f64>;

    fn dot(&self, a: &Vec<f64>, b: &Vec<f64>) -> f64 {
        assert_eq!(a.len(), b.len(), "dot: length mismatch");
        #[cfg(feature = "parallel")]
        if self.parallel(a.len()) {
            return a.par_iter().zip(b.par_iter()).map(|(x, y)| x * y).sum();
        }
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn axpy(&self, alpha: f64, x: &Vec<f64>, y: &mut Vec<f64>) {
        assert_eq!(x.len(), y.len(), "axpy: length mismatch");
        #[cfg(feature = "parallel")]
        if self.parallel(x.len()) {
            y.par_iter_mut()
                .zip(x.par_iter())
                .for_each(|(dst, src)| *dst += alpha * src);
            return;
        }
        for (dst, src) in y.iter_mut().zip(x) {
            *dst += alpha * src;
        }
    }

    fn scale(&self, alpha: f64, v: &mut Vec<f64>) {
        if alpha == 0.0 {
            // Previous contents are allowed to be undefined (even NaN).
            v.fill(0.0);
            return;
        }
        for value in v.iter_mut() {
            *value *= alpha;
        }
    }

    fn copy(&self, dst: &mut Vec<f64>, src: &Vec<f64>) {
        assert_eq!(dst.len(), src.len(), "copy: length mismatch");
        dst.copy_from_slice(src);
    }

    fn fill_zero(&self, v: &mut Vec<f64>) {
        v.fill(0.0);
    }

    fn sparse_dot(&self, a: &Vec<f64>, p: &PVector) -> f64 {
        p.iter().map(|(index, coefficient)| a[index] * coefficient).sum()
    }

    fn sparse_axpy(&self, alpha: f64, p: &PVector, y: &mut Vec<f64>) {
        for (index, coefficient) in p.iter() {
            y[index] += alpha * coefficient;
        }
    }

    fn select(
        &self,
        x: &Vec<f64>,
        r: &Vec<f64>,
        max_number: usize,
        threshold: f64,
    ) -> (Vec<usize>, Vec<f64>) {
        assert_eq!(x.len(), r.len(), "select: length mismatch");
        let mut ranked: Vec<(f64, usize)> = x
            .iter()
            .zip(r)
            .enumerate()
            .map(|(i, (xi, ri))| ((xi * ri).abs(), i))
            .filter(|(significance, _)| *significance > threshold)
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(max_number);
        let indices = ranked.iter().map(|&(_, i)| i).collect();
        let values = ranked.iter().map(|&(v, _)| v).collect();
        (indices, values)
    }
}
