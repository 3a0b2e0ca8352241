//! Lyapunov spectra from the variational equations.
//!
//! The base state is carried together with a deviation matrix whose columns
//! are evolved by the Jacobian. After every window the columns are
//! re-orthonormalized with modified Gram-Schmidt and the logarithm of each
//! column's length (after projection, before normalization) is accumulated.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::autodiff::{Dual, TangentSystem};
use crate::error::{ensure_input, AnalysisError, Result};
use crate::orbit::{advance, check_dimension, IntegrationSettings};
use crate::task::{CancelToken, ProgressSink, RunStatus};
use crate::traits::DynamicalSystem;

/// Columns at or below this length count as collapsed.
const DEGENERATE_NORM: f64 = 1e-300;

/// What to do when a deviation vector collapses onto the earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DegeneratePolicy {
    /// Replace the column with a fresh orthogonal unit vector and keep going.
    #[default]
    Skip,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LyapunovSettings {
    pub integration: IntegrationSettings,
    pub transient: usize,
    /// Number of re-orthonormalizations.
    pub iterations: usize,
    /// Integration steps between re-orthonormalizations. The default makes
    /// one window a unit of time at the default `dt`.
    pub steps_per_iteration: usize,
    pub degenerate: DegeneratePolicy,
}

impl Default for LyapunovSettings {
    fn default() -> Self {
        Self {
            integration: IntegrationSettings::default(),
            transient: 1_000,
            iterations: 1_000,
            steps_per_iteration: 100,
            degenerate: DegeneratePolicy::Skip,
        }
    }
}

impl LyapunovSettings {
    pub fn validate(&self) -> Result<()> {
        self.integration.validate()?;
        ensure_input!(
            self.iterations > 0,
            "Lyapunov computation requires at least one iteration."
        );
        ensure_input!(
            self.steps_per_iteration > 0,
            "steps_per_iteration must be at least 1."
        );
        Ok(())
    }

    /// Time covered by one window: integration time for flows, iterate count for maps.
    fn window(&self) -> f64 {
        let steps = self.steps_per_iteration as f64;
        if self.integration.stepper.is_flow() {
            steps * self.integration.dt
        } else {
            steps
        }
    }
}

/// Running estimate published after every outer iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyapunovProgress {
    pub iteration: usize,
    pub iterations: usize,
    pub exponents: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyapunovResult {
    /// One exponent per deviation column, in column order, per unit time:
    /// the summed log stretches divided by `iterations` times the window
    /// length. With a unit window this is the plain average over iterations.
    pub exponents: Vec<f64>,
    /// Outer iterations actually completed.
    pub iterations: usize,
    pub degenerate_events: usize,
    pub status: RunStatus,
}

impl LyapunovResult {
    pub fn largest(&self) -> Option<f64> {
        self.exponents.iter().copied().reduce(f64::max)
    }
}

/// Estimates the full Lyapunov spectrum starting from `initial`.
///
/// Setup errors and (under [`DegeneratePolicy::Fail`]) degenerate bases are
/// returned as errors. Cancellation yields an `Aborted` result holding the
/// estimate from the iterations completed so far.
pub fn lyapunov_spectrum<S>(
    system: &S,
    initial: &[f64],
    settings: &LyapunovSettings,
    progress: &mut dyn ProgressSink<LyapunovProgress>,
    cancel: &CancelToken,
) -> Result<LyapunovResult>
where
    S: DynamicalSystem<f64> + DynamicalSystem<Dual> + ?Sized,
{
    let dim = check_dimension(system, initial)?;
    settings.validate()?;

    let dt = settings.integration.dt;
    let mut t = settings.integration.t0;
    let mut base = initial.to_vec();
    let mut stepper = settings.integration.stepper.build(dim);
    advance(system, &mut stepper, &mut t, &mut base, dt, settings.transient)?;

    let aug_dim = dim + dim * dim;
    let mut augmented = vec![0.0; aug_dim];
    augmented[..dim].copy_from_slice(&base);
    for i in 0..dim {
        augmented[dim + i * dim + i] = 1.0;
    }

    let tangent = TangentSystem::new(system, dim);
    let mut stepper = settings.integration.stepper.build(aug_dim);
    let mut accum = vec![0.0; dim];
    let mut degenerate_events = 0usize;
    let window = settings.window();

    let mut completed = 0usize;
    let mut status = RunStatus::Complete;
    while completed < settings.iterations {
        if cancel.is_cancelled() {
            status = RunStatus::Aborted {
                reason: AnalysisError::Cancelled.to_string(),
            };
            break;
        }

        advance(
            &tangent,
            &mut stepper,
            &mut t,
            &mut augmented,
            dt,
            settings.steps_per_iteration,
        )?;

        let mut basis = DMatrix::from_row_slice(dim, dim, &augmented[dim..]);
        let collapsed = orthonormalize(&mut basis, &mut accum);
        for column in collapsed {
            match settings.degenerate {
                DegeneratePolicy::Fail => {
                    return Err(AnalysisError::DegenerateBasis {
                        column,
                        iteration: completed,
                    })
                }
                DegeneratePolicy::Skip => {
                    log::warn!(
                        "Deviation vector {} collapsed at iteration {}; re-seeding.",
                        column,
                        completed
                    );
                    degenerate_events += 1;
                }
            }
        }
        for i in 0..dim {
            for j in 0..dim {
                augmented[dim + i * dim + j] = basis[(i, j)];
            }
        }

        completed += 1;
        progress.report(&LyapunovProgress {
            iteration: completed,
            iterations: settings.iterations,
            exponents: normalize(&accum, completed, window),
        });
    }

    Ok(LyapunovResult {
        exponents: normalize(&accum, completed, window),
        iterations: completed,
        degenerate_events,
        status,
    })
}

fn normalize(accum: &[f64], iterations: usize, window: f64) -> Vec<f64> {
    if iterations == 0 {
        return vec![0.0; accum.len()];
    }
    let total = iterations as f64 * window;
    accum.iter().map(|sum| sum / total).collect()
}

/// Modified Gram-Schmidt over the columns of `basis`, in column order.
///
/// Adds `ln |w_j|` of every healthy column to `accum[j]`. Collapsed columns
/// are replaced by a unit vector orthogonal to the columns before them, add
/// nothing, and are returned.
fn orthonormalize(basis: &mut DMatrix<f64>, accum: &mut [f64]) -> Vec<usize> {
    let n = basis.ncols();
    let mut collapsed = Vec::new();
    for j in 0..n {
        for k in 0..j {
            let q = basis.column(k).clone_owned();
            let projection = q.dot(&basis.column(j));
            basis.column_mut(j).axpy(-projection, &q, 1.0);
        }

        let length = basis.column(j).norm();
        if length.is_finite() && length > DEGENERATE_NORM {
            accum[j] += length.ln();
            basis.column_mut(j).unscale_mut(length);
        } else {
            let seed = orthogonal_seed(basis, j);
            basis.set_column(j, &seed);
            collapsed.push(j);
        }
    }
    collapsed
}

/// The coordinate axis with the largest component outside span(columns < j), projected and normalized.
fn orthogonal_seed(basis: &DMatrix<f64>, j: usize) -> DVector<f64> {
    let n = basis.nrows();
    let mut best = DVector::zeros(n);
    let mut best_length = 0.0;
    for axis in 0..n {
        let mut candidate = DVector::zeros(n);
        candidate[axis] = 1.0;
        for k in 0..j {
            let q = basis.column(k);
            let projection = q.dot(&candidate);
            candidate.axpy(-projection, &q, 1.0);
        }
        let length = candidate.norm();
        if length > best_length {
            best_length = length;
            best = candidate;
        }
    }
    if best_length > 0.0 {
        best.unscale_mut(best_length);
    }
    best
}

/// Kaplan-Yorke (Lyapunov) dimension of a spectrum.
pub fn kaplan_yorke(exponents: &[f64]) -> f64 {
    if exponents.is_empty() {
        return 0.0;
    }
    let mut sorted = exponents.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));

    let mut partial = 0.0;
    let mut k = 0usize;
    for (idx, &lambda) in sorted.iter().enumerate() {
        let new_sum = partial + lambda;
        if new_sum >= 0.0 {
            partial = new_sum;
            k = idx + 1;
        } else {
            if lambda.abs() <= f64::EPSILON {
                return k as f64;
            }
            return k as f64 + partial / lambda.abs();
        }
    }

    k as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DoublingMap, HenonMap, Lorenz};
    use crate::task::FnSink;
    use crate::traits::Scalar;

    /// `(x, y) -> (x / 2, 0)`: the second direction is annihilated every step.
    struct Squash;

    impl<T: Scalar> DynamicalSystem<T> for Squash {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            out[0] = x[0] * T::lift(0.5);
            out[1] = T::zero();
        }
    }

    /// `x' = -x`: every deviation shrinks by `e^{-t}`.
    struct Decay;

    impl<T: Scalar> DynamicalSystem<T> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
            out[0] = -x[0];
        }
    }

    fn map_settings(transient: usize, iterations: usize) -> LyapunovSettings {
        LyapunovSettings {
            integration: IntegrationSettings::map(),
            transient,
            iterations,
            steps_per_iteration: 1,
            degenerate: DegeneratePolicy::Skip,
        }
    }

    #[test]
    fn default_window_is_one_time_unit() {
        let settings = LyapunovSettings {
            transient: 0,
            iterations: 50,
            ..LyapunovSettings::default()
        };
        assert!((settings.window() - 1.0).abs() < 1e-12);
        let result =
            lyapunov_spectrum(&Decay, &[1.0], &settings, &mut (), &CancelToken::new())
                .expect("spectrum");
        assert!((result.exponents[0] + 1.0).abs() < 1e-8, "{:?}", result.exponents);
    }

    #[test]
    fn exponents_are_per_unit_time_for_any_window() {
        let settings = LyapunovSettings {
            integration: IntegrationSettings {
                dt: 0.005,
                ..IntegrationSettings::default()
            },
            transient: 0,
            iterations: 40,
            steps_per_iteration: 7,
            ..LyapunovSettings::default()
        };
        let result =
            lyapunov_spectrum(&Decay, &[1.0], &settings, &mut (), &CancelToken::new())
                .expect("spectrum");
        assert!((result.exponents[0] + 1.0).abs() < 1e-8, "{:?}", result.exponents);
    }

    #[test]
    fn doubling_map_exponent_is_ln_two() {
        let result = lyapunov_spectrum(
            &DoublingMap,
            &[0.1234],
            &map_settings(1_000, 100_000),
            &mut (),
            &CancelToken::new(),
        )
        .expect("spectrum");
        let ln2 = std::f64::consts::LN_2;
        assert!(((result.exponents[0] - ln2) / ln2).abs() < 0.01);
        assert_eq!(result.iterations, 100_000);
        assert!(result.status.is_complete());
    }

    #[test]
    fn henon_spectrum_sums_to_log_determinant() {
        let map = HenonMap::default();
        let result = lyapunov_spectrum(
            &map,
            &[0.1, 0.1],
            &map_settings(1_000, 20_000),
            &mut (),
            &CancelToken::new(),
        )
        .expect("spectrum");
        // |det Df| = b everywhere.
        let sum: f64 = result.exponents.iter().sum();
        assert!((sum - map.b.ln()).abs() < 1e-6, "sum = {sum}");
        assert!(result.exponents[0] > 0.35 && result.exponents[0] < 0.48);
        assert!(kaplan_yorke(&result.exponents) > 1.0);
    }

    #[test]
    fn lorenz_has_a_positive_exponent_and_contracts_volume() {
        let lorenz = Lorenz::default();
        let settings = LyapunovSettings {
            iterations: 2_000,
            ..LyapunovSettings::default()
        };
        let result = lyapunov_spectrum(
            &lorenz,
            &[1.0, 1.0, 1.0],
            &settings,
            &mut (),
            &CancelToken::new(),
        )
        .expect("spectrum");
        assert!(result.exponents[0] > 0.5 && result.exponents[0] < 1.3);
        let sum: f64 = result.exponents.iter().sum();
        let trace = -(lorenz.sigma + 1.0 + lorenz.beta);
        assert!((sum - trace).abs() < 0.05, "sum = {sum}");
    }

    #[test]
    fn progress_is_reported_every_iteration() {
        let mut seen = Vec::new();
        let mut sink = FnSink(|p: &LyapunovProgress| seen.push(p.iteration));
        lyapunov_spectrum(
            &DoublingMap,
            &[0.3],
            &map_settings(0, 5),
            &mut sink,
            &CancelToken::new(),
        )
        .expect("spectrum");
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn degenerate_column_is_reseeded_or_fails() {
        let result = lyapunov_spectrum(
            &Squash,
            &[1.0, 1.0],
            &map_settings(0, 10),
            &mut (),
            &CancelToken::new(),
        )
        .expect("skip policy keeps going");
        assert_eq!(result.degenerate_events, 10);
        assert!((result.exponents[0] - 0.5f64.ln()).abs() < 1e-12);
        assert_eq!(result.exponents[1], 0.0);

        let settings = LyapunovSettings {
            degenerate: DegeneratePolicy::Fail,
            ..map_settings(0, 10)
        };
        let err = lyapunov_spectrum(&Squash, &[1.0, 1.0], &settings, &mut (), &CancelToken::new())
            .unwrap_err();
        assert_eq!(
            err,
            AnalysisError::DegenerateBasis {
                column: 1,
                iteration: 0
            }
        );
    }

    #[test]
    fn cancellation_returns_partial_estimate() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let mut sink = FnSink(move |p: &LyapunovProgress| {
            if p.iteration == 3 {
                canceller.cancel();
            }
        });
        let result = lyapunov_spectrum(
            &DoublingMap,
            &[0.3],
            &map_settings(0, 1_000),
            &mut sink,
            &token,
        )
        .expect("partial result");
        assert_eq!(result.iterations, 3);
        assert!(matches!(result.status, RunStatus::Aborted { .. }));
    }

    #[test]
    fn rejects_zero_iterations() {
        let err = lyapunov_spectrum(
            &DoublingMap,
            &[0.3],
            &map_settings(0, 0),
            &mut (),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(format!("{err}").contains("at least one iteration"));
    }

    #[test]
    fn kaplan_yorke_interpolates() {
        assert_eq!(kaplan_yorke(&[]), 0.0);
        let dim = kaplan_yorke(&[0.9, 0.0, -14.5]);
        assert!((dim - (2.0 + 0.9 / 14.5)).abs() < 1e-12);
    }
}
