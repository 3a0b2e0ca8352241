//! Local extrema of a scalar observable along an orbit.
//!
//! The detector looks at a sliding window of three consecutive samples. The
//! collectors advance the orbit one step per comparison and stop once enough
//! extrema were seen, so a bifurcation diagram can ask for "the next 64
//! maxima of z" without choosing an integration span up front.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_input, AnalysisError, Result};
use crate::orbit::{advance, check_dimension, is_finite_state, IntegrationSettings};
use crate::task::CancelToken;
use crate::traits::{DynamicalSystem, Steppable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtremumKind {
    Maximum,
    Minimum,
}

/// Which extrema a collector keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtremaFilter {
    #[default]
    Maxima,
    Minima,
    Both,
}

impl ExtremaFilter {
    fn accepts(self, kind: ExtremumKind) -> bool {
        match self {
            ExtremaFilter::Maxima => kind == ExtremumKind::Maximum,
            ExtremaFilter::Minima => kind == ExtremumKind::Minimum,
            ExtremaFilter::Both => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extremum {
    pub index: usize,
    pub value: f64,
    pub kind: ExtremumKind,
}

/// Strict three-point test on the middle sample.
pub fn classify(v0: f64, v1: f64, v2: f64) -> Option<ExtremumKind> {
    if v1 > v0 && v1 > v2 {
        Some(ExtremumKind::Maximum)
    } else if v1 < v0 && v1 < v2 {
        Some(ExtremumKind::Minimum)
    } else {
        None
    }
}

/// All interior extrema of `samples`, in order.
pub fn scan(samples: &[f64]) -> Vec<Extremum> {
    samples
        .windows(3)
        .enumerate()
        .filter_map(|(i, w)| {
            classify(w[0], w[1], w[2]).map(|kind| Extremum {
                index: i + 1,
                value: w[1],
                kind,
            })
        })
        .collect()
}

/// Consecutive pairs `(v_n, v_{n+1})`, e.g. the Lorenz map of successive z maxima.
pub fn successive_pairs(values: &[f64]) -> Vec<[f64; 2]> {
    values.windows(2).map(|w| [w[0], w[1]]).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtremaSettings {
    pub integration: IntegrationSettings,
    /// State coordinate whose extrema are collected.
    pub coordinate: usize,
    pub filter: ExtremaFilter,
    /// Steps discarded before the search starts.
    pub transient: usize,
    /// Number of extrema to collect.
    pub target: usize,
    /// Step budget for the search after the transient.
    pub max_steps: usize,
}

impl Default for ExtremaSettings {
    fn default() -> Self {
        Self {
            integration: IntegrationSettings::default(),
            coordinate: 0,
            filter: ExtremaFilter::Maxima,
            transient: 10_000,
            target: 64,
            max_steps: 2_000_000,
        }
    }
}

impl ExtremaSettings {
    pub fn validate(&self, dim: usize) -> Result<()> {
        self.integration.validate()?;
        ensure_input!(
            self.coordinate < dim,
            "Coordinate {} is out of range for a {}-dimensional system.",
            self.coordinate,
            dim
        );
        ensure_input!(self.target > 0, "Target extrema count must be positive.");
        ensure_input!(self.max_steps > 0, "max_steps must be positive.");
        Ok(())
    }
}

/// Collects `settings.target` extrema of one coordinate along a trajectory
/// (flow or map, chosen by `settings.integration.stepper`).
///
/// Stops with `NonConvergence` once `max_steps` steps produced too few
/// extrema, e.g. on a stable fixed point.
pub fn collect_extrema<S>(
    system: &S,
    initial: &[f64],
    settings: &ExtremaSettings,
    cancel: &CancelToken,
) -> Result<Vec<f64>>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    let dim = check_dimension(system, initial)?;
    settings.validate(dim)?;

    let dt = settings.integration.dt;
    let axis = settings.coordinate;
    let mut stepper = settings.integration.stepper.build(dim);
    let mut state = initial.to_vec();
    let mut t = settings.integration.t0;
    advance(system, &mut stepper, &mut t, &mut state, dt, settings.transient)?;

    let mut found = Vec::with_capacity(settings.target);
    let mut v0 = state[axis];
    stepper.step(&system, &mut t, &mut state, dt);
    let mut v1 = state[axis];

    for step in 0..settings.max_steps {
        if step % 4096 == 0 {
            cancel.check()?;
        }
        stepper.step(&system, &mut t, &mut state, dt);
        if !is_finite_state(&state) {
            return Err(AnalysisError::NumericOverflow {
                step: settings.transient + step + 2,
            });
        }
        let v2 = state[axis];
        if let Some(kind) = classify(v0, v1, v2) {
            if settings.filter.accepts(kind) {
                found.push(v1);
                if found.len() == settings.target {
                    return Ok(found);
                }
            }
        }
        v0 = v1;
        v1 = v2;
    }

    log::debug!(
        "Extrema search found {} of {} within {} steps",
        found.len(),
        settings.target,
        settings.max_steps
    );
    Err(AnalysisError::NonConvergence {
        operation: "extrema search",
        limit: settings.max_steps,
    })
}
