//! Equilibria of flows and fixed points of maps, with their linearization.

use crate::autodiff::{jacobian, Dual};
use crate::error::{ensure_input, AnalysisError, Result};
use crate::traits::DynamicalSystem;
use nalgebra::linalg::SVD;
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Flow,
    Map,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 25,
            damping: 1.0,
            tolerance: 1e-9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexNumber {
    pub re: f64,
    pub im: f64,
}

impl From<Complex<f64>> for ComplexNumber {
    fn from(value: Complex<f64>) -> Self {
        Self {
            re: value.re,
            im: value.im,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: ComplexNumber,
    pub vector: Vec<ComplexNumber>,
}

impl EigenPair {
    /// The eigenvector as a real unit vector when the eigenvalue is real.
    pub fn real_vector(&self, tolerance: f64) -> Option<Vec<f64>> {
        if self.value.im.abs() > tolerance {
            return None;
        }
        // Rotate the complex phase away so the dominant entry is real.
        let pivot = self
            .vector
            .iter()
            .max_by(|a, b| norm(a).total_cmp(&norm(b)))?;
        let scale = norm(pivot);
        if scale == 0.0 {
            return None;
        }
        let (cos, sin) = (pivot.re / scale, -pivot.im / scale);
        let real: Vec<f64> = self
            .vector
            .iter()
            .map(|c| c.re * cos - c.im * sin)
            .collect();
        let length = l2_norm(&real);
        (length > 0.0).then(|| real.iter().map(|v| v / length).collect())
    }
}

fn norm(c: &ComplexNumber) -> f64 {
    c.re.hypot(c.im)
}

/// A fixed point (or equilibrium) together with its local linearization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquilibriumResult {
    pub state: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
    /// Row-major Jacobian of the vector field or map at `state`.
    pub jacobian: Vec<f64>,
    pub eigenpairs: Vec<EigenPair>,
}

/// Damped Newton iteration on `f(x) = 0` (flows) or `f(x) - x = 0` (maps).
pub fn solve_equilibrium<S>(
    system: &S,
    kind: SystemKind,
    initial_guess: &[f64],
    settings: NewtonSettings,
) -> Result<EquilibriumResult>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual>,
{
    let dim = DynamicalSystem::<f64>::dimension(system);
    ensure_input!(dim > 0, "System has zero dimension.");
    ensure_input!(
        initial_guess.len() == dim,
        "Initial guess dimension mismatch. Expected {}, got {}.",
        dim,
        initial_guess.len()
    );
    ensure_input!(settings.max_steps > 0, "max_steps must be greater than zero.");
    ensure_input!(settings.damping > 0.0, "damping must be positive.");
    ensure_input!(settings.tolerance > 0.0, "tolerance must be positive.");

    let mut state = initial_guess.to_vec();
    let mut residual = vec![0.0; dim];
    evaluate_residual(system, kind, &state, &mut residual);
    let mut residual_norm = l2_norm(&residual);
    let mut iterations = 0usize;

    while residual_norm > settings.tolerance {
        if iterations >= settings.max_steps || !residual_norm.is_finite() {
            log::debug!(
                "Newton stalled after {} steps with residual {:e}",
                iterations,
                residual_norm
            );
            return Err(AnalysisError::NonConvergence {
                operation: "Newton fixed-point solve",
                limit: settings.max_steps,
            });
        }

        let jac = residual_jacobian(system, kind, &state);
        let delta = solve_linear_system(dim, &jac, &residual)?;
        for (x, dx) in state.iter_mut().zip(&delta) {
            *x -= settings.damping * dx;
        }

        iterations += 1;
        evaluate_residual(system, kind, &state, &mut residual);
        residual_norm = l2_norm(&residual);
    }

    let jac = jacobian(system, 0.0, &state);
    let eigenpairs = compute_eigenpairs(dim, &jac)?;

    Ok(EquilibriumResult {
        state,
        residual_norm,
        iterations,
        jacobian: jac,
        eigenpairs,
    })
}

fn evaluate_residual<S>(system: &S, kind: SystemKind, state: &[f64], out: &mut [f64])
where
    S: DynamicalSystem<f64> + ?Sized,
{
    system.apply(0.0, state, out);
    if kind == SystemKind::Map {
        for (o, x) in out.iter_mut().zip(state) {
            *o -= x;
        }
    }
}

/// Jacobian of the Newton residual: `Df` for flows, `Df - I` for maps.
fn residual_jacobian<S>(system: &S, kind: SystemKind, state: &[f64]) -> Vec<f64>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    let dim = state.len();
    let mut jac = jacobian(system, 0.0, state);
    if kind == SystemKind::Map {
        for i in 0..dim {
            jac[i * dim + i] -= 1.0;
        }
    }
    jac
}

fn solve_linear_system(dim: usize, jacobian: &[f64], residual: &[f64]) -> Result<Vec<f64>> {
    let j_matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let rhs = DVector::from_column_slice(residual);
    j_matrix
        .lu()
        .solve(&rhs)
        .map(|v| v.iter().copied().collect())
        .ok_or_else(|| AnalysisError::Linear("Jacobian is singular.".to_string()))
}

/// Eigenvalues from nalgebra, eigenvectors as the null direction of `J - λI`.
pub fn compute_eigenpairs(dim: usize, jacobian: &[f64]) -> Result<Vec<EigenPair>> {
    let matrix = DMatrix::from_row_slice(dim, dim, jacobian);
    let eigenvalues = matrix.complex_eigenvalues();
    let complex_matrix = matrix.map(|v| Complex::new(v, 0.0));

    let mut pairs = Vec::with_capacity(dim);
    for (idx, lambda) in eigenvalues.iter().enumerate() {
        let mut shifted = complex_matrix.clone();
        for i in 0..dim {
            shifted[(i, i)] -= *lambda;
        }

        let svd = SVD::new(shifted, false, true);
        let v_t = svd.v_t.ok_or_else(|| {
            AnalysisError::Linear(format!(
                "Failed to compute eigenvector for eigenvalue index {}",
                idx
            ))
        })?;
        // Singular values are sorted descending; the last right-singular vector spans the kernel.
        let row = v_t.row(v_t.nrows().saturating_sub(1));
        let mut vector: Vec<Complex<f64>> = row.iter().map(|c| c.conj()).collect();
        let length = vector.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
        if length > 0.0 {
            for entry in &mut vector {
                *entry /= length;
            }
        }

        pairs.push(EigenPair {
            value: ComplexNumber::from(*lambda),
            vector: vector.into_iter().map(ComplexNumber::from).collect(),
        });
    }
    Ok(pairs)
}

pub(crate) fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}
