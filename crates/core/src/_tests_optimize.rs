#![cfg(test)]

use crate::_tests_engine::TestHandler;
use crate::engine::SubspaceEngine;
use crate::options::{OptimizeAlgorithm, SolverOptions};

/// Drive the optimiser: evaluate, add the value, apply the scaled-identity
/// preconditioner when asked, close the iteration. Returns the number of
/// `add_value` calls made.
fn minimise<F>(
    engine: &mut SubspaceEngine<TestHandler>,
    x: &mut Vec<f64>,
    h0_diag: &[f64],
    max_iterations: usize,
    mut objective: F,
) -> usize
where
    F: FnMut(&[f64]) -> (f64, Vec<f64>),
{
    let n = x.len();
    let mut iterations = 0;
    for _ in 0..max_iterations {
        let (f, mut g) = objective(x);
        iterations += 1;
        if engine.add_value(x, f, &mut g).unwrap() > 0 {
            for j in 0..n {
                x[j] -= g[j] / h0_diag[j];
            }
        }
        let residual = vec![g];
        if engine
            .end_iteration(std::slice::from_mut(x), &residual)
            .unwrap()
        {
            break;
        }
    }
    iterations
}

#[test]
fn lbfgs_minimises_a_diagonal_quadratic() {
    // f(x) = 1/2 x^T H x with H = diag(1..n); gradient norm below 1e-8
    // within 2n evaluations.
    let n = 8;
    let curvatures: Vec<f64> = (1..=n).map(|i| i as f64).collect();
    let handler = TestHandler;
    let mut engine = SubspaceEngine::optimize(
        handler,
        OptimizeAlgorithm::Lbfgs,
        true,
        SolverOptions::default().with_threshold(1e-8),
    );

    let mut x = vec![1.0; n];
    // Conservative H0: the largest curvature, so every step is a descent
    // step and the history supplies the missing curvature information.
    let h0 = vec![n as f64; n];
    let curvatures_for_eval = curvatures.clone();
    let iterations = minimise(&mut engine, &mut x, &h0, 2 * n, move |x| {
        let f = 0.5
            * x.iter()
                .zip(&curvatures_for_eval)
                .map(|(xi, hi)| hi * xi * xi)
                .sum::<f64>();
        let g = x
            .iter()
            .zip(&curvatures_for_eval)
            .map(|(xi, hi)| hi * xi)
            .collect();
        (f, g)
    });

    assert!(
        engine.errors()[0] < 1e-8,
        "gradient norm {} after {} evaluations",
        engine.errors()[0],
        iterations
    );
    assert!(iterations <= 2 * n);
    let g_norm: f64 = x
        .iter()
        .zip(&curvatures)
        .map(|(xi, hi)| (hi * xi).powi(2))
        .sum::<f64>()
        .sqrt();
    assert!(g_norm < 1e-6, "final iterate is not stationary: {g_norm}");
}

#[test]
fn lbfgs_value_history_decreases_overall() {
    let n = 8;
    let handler = TestHandler;
    let mut engine = SubspaceEngine::optimize(
        handler,
        OptimizeAlgorithm::Lbfgs,
        true,
        SolverOptions::default().with_threshold(1e-8),
    );
    let mut x = vec![1.0; n];
    let h0 = vec![n as f64; n];
    minimise(&mut engine, &mut x, &h0, 2 * n, |x| {
        let f = 0.5
            * x.iter()
                .enumerate()
                .map(|(i, xi)| (i + 1) as f64 * xi * xi)
                .sum::<f64>();
        let g = x
            .iter()
            .enumerate()
            .map(|(i, xi)| (i + 1) as f64 * xi)
            .collect();
        (f, g)
    });
    let values = engine.values();
    assert!(values.len() >= 2);
    assert!(
        values.last().unwrap() < values.first().unwrap(),
        "objective did not decrease: {values:?}"
    );
}

#[test]
fn trig_objective_reaches_the_separable_minimum() {
    // Sum of shifted sines over a stiff quadratic bowl; the objective is
    // separable so the reference minimum comes from per-coordinate Newton.
    let n = 2;
    let alpha = 7.0;
    let anharmonicity = 0.2;

    let objective = move |x: &[f64]| -> (f64, Vec<f64>) {
        let mut f = 0.0;
        let mut g = vec![0.0; x.len()];
        for (i, &xi) in x.iter().enumerate() {
            let t = xi - 1.0;
            let omega = (i + 1) as f64;
            f += (omega * t).sin()
                + 0.5 * alpha * omega * t * t
                + anharmonicity * t * t * t / 3.0;
            g[i] = omega * (omega * t).cos() + alpha * omega * t + anharmonicity * t * t;
        }
        (f, g)
    };

    // Per-coordinate Newton for the reference stationary point.
    let mut reference = vec![0.0; n];
    for i in 0..n {
        let omega = (i + 1) as f64;
        let mut t = 0.0;
        for _ in 0..100 {
            let g = omega * (omega * t).cos() + alpha * omega * t + anharmonicity * t * t;
            let h = -omega * omega * (omega * t).sin() + alpha * omega + 2.0 * anharmonicity * t;
            t -= g / h;
        }
        reference[i] = 1.0 + t;
    }
    let (f_min, _) = objective(&reference);

    let handler = TestHandler;
    let mut engine = SubspaceEngine::optimize(
        handler,
        OptimizeAlgorithm::Lbfgs,
        true,
        SolverOptions::default().with_threshold(1e-8),
    );
    let mut x = vec![1.0; n];
    x[0] = 0.0;
    let h0: Vec<f64> = (0..n).map(|i| alpha * (i + 1) as f64).collect();
    let iterations = minimise(&mut engine, &mut x, &h0, 20, objective);

    let (f_final, _) = objective(&x);
    assert!(
        f_final - f_min < 1e-6,
        "final value {f_final} is not within 1e-6 of the minimum {f_min} \
         (after {iterations} evaluations)"
    );
    assert!(iterations <= 20);
}

#[test]
fn null_algorithm_is_plain_preconditioned_descent() {
    // With the "null" algorithm the engine accepts every iterate and leaves
    // the update entirely to the caller's preconditioner.
    let n = 4;
    let handler = TestHandler;
    let mut engine = SubspaceEngine::optimize(
        handler,
        OptimizeAlgorithm::Null,
        true,
        SolverOptions::default().with_threshold(1e-8),
    );
    let mut x = vec![2.0; n];
    let h0 = vec![1.5; n];
    let iterations = minimise(&mut engine, &mut x, &h0, 60, |x| {
        let f = 0.5 * x.iter().map(|xi| xi * xi).sum::<f64>();
        (f, x.to_vec())
    });
    assert!(engine.errors()[0] < 1e-8, "descent did not converge");
    assert!(iterations <= 60);
}

#[test]
fn add_value_is_rejected_outside_optimize() {
    let handler = TestHandler;
    let mut engine =
        SubspaceEngine::eigensystem(handler, 1, SolverOptions::default()).unwrap();
    let mut x = vec![1.0, 0.0];
    let mut g = vec![0.0, 0.0];
    assert!(engine.add_value(&mut x, 1.0, &mut g).is_err());
}
