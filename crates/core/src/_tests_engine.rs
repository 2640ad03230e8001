#![cfg(test)]

use crate::engine::SubspaceEngine;
use crate::handler::VectorHandler;
use crate::options::SolverOptions;
use crate::subspace::pspace::PVector;

/// Dense in-memory handler over `Vec<f64>` used by the engine test suites.
#[derive(Clone, Copy, Default)]
pub(crate) struct TestHandler;

impl VectorHandler for TestHandler {
    type Vector = Vec<f64>;

    fn dot(&self, a: &Vec<f64>, b: &Vec<f64>) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn axpy(&self, alpha: f64, x: &Vec<f64>, y: &mut Vec<f64>) {
        for (dst, src) in y.iter_mut().zip(x) {
            *dst += alpha * src;
        }
    }

    fn scale(&self, alpha: f64, v: &mut Vec<f64>) {
        if alpha == 0.0 {
            v.fill(0.0);
            return;
        }
        for value in v.iter_mut() {
            *value *= alpha;
        }
    }

    fn copy(&self, dst: &mut Vec<f64>, src: &Vec<f64>) {
        dst.copy_from_slice(src);
    }

    fn fill_zero(&self, v: &mut Vec<f64>) {
        v.fill(0.0);
    }

    fn sparse_dot(&self, a: &Vec<f64>, p: &PVector) -> f64 {
        p.iter().map(|(i, c)| a[i] * c).sum()
    }

    fn sparse_axpy(&self, alpha: f64, p: &PVector, y: &mut Vec<f64>) {
        for (i, c) in p.iter() {
            y[i] += alpha * c;
        }
    }

    fn select(
        &self,
        x: &Vec<f64>,
        r: &Vec<f64>,
        max_number: usize,
        threshold: f64,
    ) -> (Vec<usize>, Vec<f64>) {
        let mut ranked: Vec<(f64, usize)> = x
            .iter()
            .zip(r)
            .enumerate()
            .map(|(i, (xi, ri))| ((xi * ri).abs(), i))
            .filter(|(s, _)| *s > threshold)
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        ranked.truncate(max_number);
        (
            ranked.iter().map(|&(_, i)| i).collect(),
            ranked.iter().map(|&(v, _)| v).collect(),
        )
    }
}

/// Dense square matrix fixture with row-major storage.
pub(crate) struct DenseMatrix {
    pub n: usize,
    pub entries: Vec<f64>,
}

impl DenseMatrix {
    pub fn tridiagonal(n: usize, off: f64, diag: f64) -> Self {
        let mut entries = vec![0.0; n * n];
        for i in 0..n {
            entries[i * n + i] = diag;
            if i + 1 < n {
                entries[i * n + i + 1] = off;
                entries[(i + 1) * n + i] = off;
            }
        }
        Self { n, entries }
    }

    pub fn from_rows(rows: &[&[f64]]) -> Self {
        let n = rows.len();
        let mut entries = Vec::with_capacity(n * n);
        for row in rows {
            assert_eq!(row.len(), n);
            entries.extend_from_slice(row);
        }
        Self { n, entries }
    }

    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        (0..self.n)
            .map(|i| {
                (0..self.n)
                    .map(|j| self.entries[i * self.n + j] * x[j])
                    .sum()
            })
            .collect()
    }

    pub fn diagonal(&self, i: usize) -> f64 {
        self.entries[i * self.n + i]
    }
}

/// Solve the shifted tridiagonal system `(tri(off, diag, off) + sigma) x = b`
/// by the Thomas algorithm. Used as the scenario preconditioner.
pub(crate) fn tridiagonal_solve(n: usize, off: f64, diag: f64, sigma: f64, b: &[f64]) -> Vec<f64> {
    let mut c_prime = vec![0.0; n];
    let mut d_prime = vec![0.0; n];
    let d0 = diag + sigma;
    c_prime[0] = off / d0;
    d_prime[0] = b[0] / d0;
    for i in 1..n {
        let denom = diag + sigma - off * c_prime[i - 1];
        c_prime[i] = off / denom;
        d_prime[i] = (b[i] - off * d_prime[i - 1]) / denom;
    }
    let mut x = vec![0.0; n];
    x[n - 1] = d_prime[n - 1];
    for i in (0..n - 1).rev() {
        x[i] = d_prime[i] - c_prime[i] * x[i + 1];
    }
    x
}

fn unit_vector(n: usize, k: usize) -> Vec<f64> {
    let mut v = vec![0.0; n];
    v[k] = 1.0;
    v
}

fn norm(handler: &TestHandler, v: &Vec<f64>) -> f64 {
    handler.dot(v, v).sqrt()
}

// ============================================================================
// Scenario: lowest eigenpairs of the discrete 1-D Laplacian
// ============================================================================

#[test]
fn tridiagonal_eigenpairs_match_analytic_values() {
    let n = 100;
    let n_roots = 3;
    let matrix = DenseMatrix::tridiagonal(n, -1.0, 2.0);
    let handler = TestHandler;
    let mut engine = SubspaceEngine::eigensystem(
        handler,
        n_roots,
        SolverOptions::default()
            .with_threshold(1e-8)
            .with_hermitian(true)
            .with_max_q(24),
    )
    .unwrap();

    let mut params: Vec<Vec<f64>> = (0..n_roots).map(|k| unit_vector(n, k)).collect();
    let mut actions = vec![vec![0.0; n]; n_roots];
    let mut converged = false;
    let mut iterations = 0;
    for _ in 0..40 {
        iterations += 1;
        let nw = if engine.iterations() == 0 {
            n_roots
        } else {
            engine.working_set().len()
        };
        for k in 0..nw {
            actions[k] = matrix.apply(&params[k]);
        }
        let n_work = engine.add_vector(&mut params, &mut actions).unwrap();

        // Errors cover every root, and working-set roots are the ones still
        // above threshold.
        assert_eq!(engine.errors().len(), n_roots);
        for &root in engine.working_set() {
            assert!(engine.errors()[root] >= 1e-8);
        }

        // Inverse-iteration style preconditioner: the exact tridiagonal
        // solve, which the engine's subspace then accelerates.
        for k in 0..n_work {
            let correction = tridiagonal_solve(n, -1.0, 2.0, 0.0, &actions[k]);
            for j in 0..n {
                params[k][j] -= correction[j];
            }
        }
        if engine.end_iteration(&mut params, &actions).unwrap() {
            converged = true;
            break;
        }
    }
    assert!(converged, "no convergence within 40 iterations");
    assert!(iterations <= 40);

    let eigenvalues = engine.eigenvalues();
    for (k, &ev) in eigenvalues.iter().enumerate() {
        let analytic =
            2.0 * (1.0 - (std::f64::consts::PI * (k + 1) as f64 / (n as f64 + 1.0)).cos());
        assert!(
            (ev - analytic).abs() < 1e-7,
            "eigenvalue {k}: got {ev}, expected {analytic}"
        );
    }
}

#[test]
fn tridiagonal_eigenpairs_with_diagonal_preconditioner() {
    // Smaller instance driven by the plain diagonal preconditioner; the
    // subspace is allowed to span the full space so the reduced problem
    // becomes exact.
    let n = 30;
    let n_roots = 3;
    let matrix = DenseMatrix::tridiagonal(n, -1.0, 2.0);
    let handler = TestHandler;
    let mut engine = SubspaceEngine::eigensystem(
        handler,
        n_roots,
        SolverOptions::default()
            .with_threshold(1e-8)
            .with_hermitian(true)
            .with_max_q(40),
    )
    .unwrap();

    let mut params: Vec<Vec<f64>> = (0..n_roots).map(|k| unit_vector(n, k)).collect();
    let mut actions = vec![vec![0.0; n]; n_roots];
    let mut converged = false;
    for _ in 0..40 {
        let nw = if engine.iterations() == 0 {
            n_roots
        } else {
            engine.working_set().len()
        };
        for k in 0..nw {
            actions[k] = matrix.apply(&params[k]);
        }
        let n_work = engine.add_vector(&mut params, &mut actions).unwrap();
        let shifts = engine.working_set_eigenvalues();
        for k in 0..n_work {
            let lambda = shifts[k];
            for j in 0..n {
                params[k][j] -= actions[k][j] / (matrix.diagonal(j) - lambda + 1e-13);
            }
        }
        if engine.end_iteration(&mut params, &actions).unwrap() {
            converged = true;
            break;
        }
    }
    assert!(converged, "no convergence within 40 iterations");
    for (k, &ev) in engine.eigenvalues().iter().enumerate() {
        let analytic =
            2.0 * (1.0 - (std::f64::consts::PI * (k + 1) as f64 / (n as f64 + 1.0)).cos());
        assert!((ev - analytic).abs() < 1e-7);
    }
}

// ============================================================================
// Scenario: non-Hermitian operator with a complex pair above the target roots
// ============================================================================

#[test]
fn non_hermitian_real_lowest_pair_is_found() {
    // Block-diagonal: real eigenvalues 1 and 2, a complex pair 5 ± 2i, and a
    // well-separated 10. Only the two lowest (real) roots are requested.
    let matrix = DenseMatrix::from_rows(&[
        &[1.0, 0.3, 0.0, 0.0, 0.0],
        &[0.0, 2.0, 0.2, 0.0, 0.0],
        &[0.0, 0.0, 5.0, 2.0, 0.0],
        &[0.0, 0.0, -2.0, 5.0, 0.0],
        &[0.0, 0.0, 0.0, 0.0, 10.0],
    ]);
    let n = matrix.n;
    let handler = TestHandler;
    let mut engine =
        SubspaceEngine::eigensystem(handler, 2, SolverOptions::default().with_threshold(1e-9))
            .unwrap();

    let mut params: Vec<Vec<f64>> = (0..2).map(|k| unit_vector(n, k)).collect();
    let mut actions = vec![vec![0.0; n]; 2];
    let mut converged = false;
    for _ in 0..20 {
        let nw = if engine.iterations() == 0 {
            2
        } else {
            engine.working_set().len()
        };
        for k in 0..nw {
            actions[k] = matrix.apply(&params[k]);
        }
        let n_work = engine.add_vector(&mut params, &mut actions).unwrap();
        for k in 0..n_work {
            for j in 0..n {
                params[k][j] -= actions[k][j] / (matrix.diagonal(j) + 1.0);
            }
        }
        if engine.end_iteration(&mut params, &actions).unwrap() {
            converged = true;
            break;
        }
    }
    assert!(converged, "non-Hermitian eigensystem did not converge");
    let eigenvalues = engine.eigenvalues();
    assert!((eigenvalues[0] - 1.0).abs() < 1e-6);
    assert!((eigenvalues[1] - 2.0).abs() < 1e-6);
    // The complex pair never becomes a tracked root.
    assert!(engine.working_set().iter().all(|&root| root < 2));
}

// ============================================================================
// Scenario: linear equations, plain and augmented-Hessian
// ============================================================================

fn drive_linear_equations(
    augmented_hessian: f64,
    sigma: f64,
    max_iterations: usize,
) -> (SubspaceEngine<TestHandler>, Vec<f64>, Vec<f64>, bool) {
    let n = 50;
    let matrix = DenseMatrix::tridiagonal(n, -1.0, 2.0);
    let b = unit_vector(n, 0);
    let handler = TestHandler;
    let mut engine = SubspaceEngine::linear_equations(
        handler,
        vec![b.clone()],
        augmented_hessian,
        SolverOptions::default()
            .with_threshold(1e-10)
            .with_hermitian(true)
            .with_max_q(60),
    )
    .unwrap();

    let mut params = vec![b.clone()];
    let mut actions = vec![vec![0.0; n]];
    let mut converged = false;
    for _ in 0..max_iterations {
        let nw = if engine.iterations() == 0 {
            1
        } else {
            engine.working_set().len()
        };
        for k in 0..nw {
            actions[k] = matrix.apply(&params[k]);
        }
        let n_work = engine.add_vector(&mut params, &mut actions).unwrap();
        for k in 0..n_work {
            let correction = tridiagonal_solve(n, -1.0, 2.0, sigma, &actions[k]);
            for j in 0..n {
                params[k][j] -= correction[j];
            }
        }
        if engine.end_iteration(&mut params, &actions).unwrap() {
            converged = true;
            break;
        }
    }
    (engine, params.remove(0), b, converged)
}

#[test]
fn linear_equations_reach_the_direct_solution() {
    let n = 50;
    let (engine, solution, b, converged) = drive_linear_equations(0.0, 0.05, 60);
    assert!(converged, "linear equations did not converge in 60 iterations");
    assert!(engine.errors()[0] <= 1e-10);

    let reference = tridiagonal_solve(n, -1.0, 2.0, 0.0, &b);
    for j in 0..n {
        assert!(
            (solution[j] - reference[j]).abs() < 1e-8,
            "component {j}: {} vs {}",
            solution[j],
            reference[j]
        );
    }
}

#[test]
fn augmented_hessian_satisfies_its_stationarity_condition() {
    // The augmented-Hessian reformulation solves (A - lambda) x ∝ b with the
    // lowest eigenvalue of the bordered pencil; verify the stationarity of
    // the converged pair rather than a particular scaling.
    let n = 50;
    let matrix = DenseMatrix::tridiagonal(n, -1.0, 2.0);
    let (mut engine, _, b, _) = drive_linear_equations(1.0, 0.66, 70);
    assert!(engine.iterations() <= 70);

    // The caller's buffers end the loop with a preconditioner update mixed
    // in; ask the engine for the clean interpolated solution instead.
    let mut solution_buf = vec![vec![0.0; n]];
    let mut residual_buf = vec![vec![0.0; n]];
    engine
        .solution(&[0], &mut solution_buf, &mut residual_buf)
        .unwrap();
    let solution = solution_buf.remove(0);

    let handler = TestHandler;
    let lambda = engine.eigenvalues()[0];
    assert!(lambda < 0.0, "damping eigenvalue should be negative");

    // v = (A - lambda) x should be parallel to b.
    let mut v = matrix.apply(&solution);
    handler.axpy(-lambda, &solution, &mut v);
    let cosine = handler.dot(&v, &b) / (norm(&handler, &v) * norm(&handler, &b));
    assert!(
        cosine.abs() > 1.0 - 1e-6,
        "stationarity violated: cos angle = {cosine}"
    );
}

// ============================================================================
// Invariants
// ============================================================================

#[test]
fn subspace_matrices_are_symmetric_and_consistent() {
    let n = 30;
    let n_roots = 2;
    let matrix = DenseMatrix::tridiagonal(n, -1.0, 2.0);
    let handler = TestHandler;
    let mut engine = SubspaceEngine::eigensystem(
        handler,
        n_roots,
        SolverOptions::default()
            .with_threshold(1e-10)
            .with_hermitian(true),
    )
    .unwrap();

    let mut params: Vec<Vec<f64>> = (0..n_roots).map(|k| unit_vector(n, k)).collect();
    let mut actions = vec![vec![0.0; n]; n_roots];
    for _ in 0..5 {
        let nw = if engine.iterations() == 0 {
            n_roots
        } else {
            engine.working_set().len()
        };
        for k in 0..nw {
            actions[k] = matrix.apply(&params[k]);
        }
        let n_work = engine.add_vector(&mut params, &mut actions).unwrap();

        let dims = engine.xspace.dimensions();
        assert_eq!(dims.nx(), dims.np + dims.nq + dims.nr);
        assert_eq!(engine.xspace.s.nrows(), dims.nx());
        for i in 0..dims.nx() {
            for j in 0..dims.nx() {
                let s_ij = engine.xspace.s[(i, j)];
                let s_ji = engine.xspace.s[(j, i)];
                assert!((s_ij - s_ji).abs() < 1e-10, "S not symmetric at ({i},{j})");
                let h_ij = engine.xspace.h[(i, j)];
                let h_ji = engine.xspace.h[(j, i)];
                assert!((h_ij - h_ji).abs() < 1e-8, "H not symmetric at ({i},{j})");
            }
        }
        for i in 0..dims.nx() {
            assert!(engine.xspace.s[(i, i)] > 0.0, "S diagonal must be positive");
        }

        for k in 0..n_work {
            let correction = tridiagonal_solve(n, -1.0, 2.0, 0.0, &actions[k]);
            for j in 0..n {
                params[k][j] -= correction[j];
            }
        }
        if engine.end_iteration(&mut params, &actions).unwrap() {
            break;
        }
    }
}

#[test]
fn solution_round_trips_the_working_set() {
    let n = 30;
    let n_roots = 2;
    let matrix = DenseMatrix::tridiagonal(n, -1.0, 2.0);
    let handler = TestHandler;
    let mut engine = SubspaceEngine::eigensystem(
        handler,
        n_roots,
        SolverOptions::default()
            .with_threshold(1e-12)
            .with_hermitian(true),
    )
    .unwrap();

    let mut params: Vec<Vec<f64>> = (0..n_roots).map(|k| unit_vector(n, k)).collect();
    let mut actions = vec![vec![0.0; n]; n_roots];
    for iteration in 0..3 {
        let nw = if engine.iterations() == 0 {
            n_roots
        } else {
            engine.working_set().len()
        };
        for k in 0..nw {
            actions[k] = matrix.apply(&params[k]);
        }
        engine.add_vector(&mut params, &mut actions).unwrap();

        let roots = engine.working_set().to_vec();
        let mut replay_params = vec![vec![0.0; n]; roots.len()];
        let mut replay_residual = vec![vec![0.0; n]; roots.len()];
        engine
            .solution(&roots, &mut replay_params, &mut replay_residual)
            .unwrap();
        for k in 0..roots.len() {
            for j in 0..n {
                assert!(
                    (replay_params[k][j] - params[k][j]).abs() < 1e-10,
                    "iteration {iteration}: solution mismatch for root slot {k}"
                );
                assert!((replay_residual[k][j] - actions[k][j]).abs() < 1e-10);
            }
        }

        for k in 0..engine.working_set().len() {
            let correction = tridiagonal_solve(n, -1.0, 2.0, 0.0, &actions[k]);
            for j in 0..n {
                params[k][j] -= correction[j];
            }
        }
    }
}

#[test]
fn add_vector_after_convergence_is_idempotent() {
    let n = 20;
    let matrix = DenseMatrix::tridiagonal(n, -1.0, 2.0);
    let handler = TestHandler;
    let mut engine = SubspaceEngine::eigensystem(
        handler,
        1,
        SolverOptions::default()
            .with_threshold(1e-8)
            .with_hermitian(true),
    )
    .unwrap();

    let mut params = vec![unit_vector(n, 0)];
    let mut actions = vec![vec![0.0; n]];
    for _ in 0..40 {
        if !engine.working_set().is_empty() || engine.iterations() == 0 {
            actions[0] = matrix.apply(&params[0]);
        }
        let n_work = engine.add_vector(&mut params, &mut actions).unwrap();
        for k in 0..n_work {
            let correction = tridiagonal_solve(n, -1.0, 2.0, 0.0, &actions[k]);
            for j in 0..n {
                params[k][j] -= correction[j];
            }
        }
        if engine.end_iteration(&mut params, &actions).unwrap() {
            break;
        }
    }
    assert!(engine.working_set().is_empty(), "root should have converged");

    let q_size = engine.qspace.size();
    let errors = engine.errors().to_vec();
    let zero_residual = vec![vec![0.0; n]];
    let mut params_again = params.clone();
    let mut actions_again = zero_residual.clone();
    let remaining = engine
        .add_vector(&mut params_again, &mut actions_again)
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(engine.qspace.size(), q_size);
    assert_eq!(engine.errors(), errors.as_slice());
    assert!(engine.working_set().is_empty());
}

// ============================================================================
// P space
// ============================================================================

#[test]
fn suggest_p_ranks_significant_axes_first() {
    let handler = TestHandler;
    let engine =
        SubspaceEngine::eigensystem(handler, 1, SolverOptions::default()).unwrap();
    let solution = vec![vec![0.5, 0.0, 2.0, 0.1]];
    let residual = vec![vec![1.0, 5.0, 1.0, 0.01]];
    let suggested = engine.suggest_p(&solution, &residual, 3, 1e-6);
    // |x·r| per axis: 0.5, 0.0, 2.0, 0.001 -> order 2, 0, 3.
    assert_eq!(suggested, vec![2, 0, 3]);
}

#[test]
fn add_p_extends_the_subspace_and_keeps_iterating() {
    // Diagonally dominant matrix where single axes are good projector axes.
    let n = 8;
    let mut rows = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            rows[i][j] = if i == j { (i + 1) as f64 } else { 0.05 };
        }
    }
    let row_refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
    let matrix = DenseMatrix::from_rows(&row_refs);
    let handler = TestHandler;
    let mut engine =
        SubspaceEngine::eigensystem(handler, 1, SolverOptions::default().with_threshold(1e-9))
            .unwrap();

    // Seed the subspace with the two most important axes for the lowest
    // root, supplying the exact PP action block.
    let pvectors = vec![PVector::unit(0), PVector::unit(1)];
    let pp: Vec<f64> = vec![
        // row for new vector 0 against total P = {0, 1}
        matrix.entries[0],
        matrix.entries[n],
        // row for new vector 1
        matrix.entries[1],
        matrix.entries[n + 1],
    ];
    let mut params = vec![vec![0.0; n]];
    let mut actions = vec![vec![0.0; n]];
    engine
        .add_p(pvectors, &pp, &mut params, &mut actions)
        .unwrap();
    assert_eq!(engine.dimension_p(), 2);
    assert_eq!(engine.parameters_p().len(), engine.working_set().len());

    // The P-space estimate of the solution must already favour axis 0.
    let p_coefficients = &engine.parameters_p()[0];
    assert_eq!(p_coefficients.len(), 2);
    assert!(p_coefficients[0].abs() > p_coefficients[1].abs());

    // Continue with ordinary iterations; the action on the P part of the
    // returned solution is the caller's job, so recompute from scratch.
    let mut x = params[0].clone();
    if x.iter().all(|&v| v == 0.0) {
        x = unit_vector(n, 0);
    }
    let mut params = vec![x];
    let mut actions = vec![vec![0.0; n]];
    let mut converged = false;
    for _ in 0..30 {
        let nw = engine.working_set().len();
        for k in 0..nw {
            actions[k] = matrix.apply(&params[k]);
        }
        let n_work = engine.add_vector(&mut params, &mut actions).unwrap();
        let shifts = engine.working_set_eigenvalues();
        for k in 0..n_work {
            let lambda = shifts[k];
            for j in 0..n {
                params[k][j] -= actions[k][j] / (matrix.diagonal(j) - lambda + 1e-13);
            }
        }
        if engine.end_iteration(&mut params, &actions).unwrap() {
            converged = true;
            break;
        }
    }
    assert!(converged, "P-seeded eigensystem did not converge");
    let lowest = engine.eigenvalues()[0];
    assert!(
        (0.5..1.1).contains(&lowest),
        "lowest eigenvalue {lowest} out of the expected range"
    );
}

#[test]
fn roots_cannot_grow_after_the_first_call() {
    let handler = TestHandler;
    let mut engine =
        SubspaceEngine::eigensystem(handler, 2, SolverOptions::default()).unwrap();
    let mut params = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
    let mut actions = params.clone();
    // Three buffers against two roots is fine; the engine works on the
    // first two.
    engine.add_vector(&mut params, &mut actions).unwrap();

    let mut small_params = vec![vec![1.0, 0.0]];
    let mut small_actions = vec![vec![1.0, 0.0]];
    let result = engine.add_vector(&mut small_params, &mut small_actions);
    assert!(result.is_err(), "buffer smaller than roots must be rejected");
}

#[test]
fn parameter_action_length_mismatch_is_rejected() {
    let handler = TestHandler;
    let mut engine =
        SubspaceEngine::eigensystem(handler, 1, SolverOptions::default()).unwrap();
    let mut params = vec![vec![1.0, 0.0]];
    let mut actions: Vec<Vec<f64>> = Vec::new();
    assert!(engine.add_vector(&mut params, &mut actions).is_err());
}
