//! Trajectory generation for flows and orbit generation for maps.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_input, AnalysisError, Result};
use crate::solvers::{DiscreteMap, Stepper, StepperKind};
use crate::traits::{DynamicalSystem, Steppable};

/// Time-ordered samples of one run, states stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub dim: usize,
    pub times: Vec<f64>,
    pub states: Vec<f64>,
    /// Index of the first step whose state was non-finite; that state is not stored.
    pub diverged_at: Option<usize>,
}

impl Trajectory {
    fn with_capacity(dim: usize, samples: usize) -> Self {
        Self {
            dim,
            times: Vec::with_capacity(samples),
            states: Vec::with_capacity(samples * dim),
            diverged_at: None,
        }
    }

    fn push(&mut self, t: f64, state: &[f64]) {
        self.times.push(t);
        self.states.extend_from_slice(state);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn state(&self, index: usize) -> &[f64] {
        &self.states[index * self.dim..(index + 1) * self.dim]
    }

    pub fn last_state(&self) -> Option<&[f64]> {
        self.len().checked_sub(1).map(|i| self.state(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &[f64])> + '_ {
        self.times.iter().copied().zip(self.states.chunks(self.dim))
    }

    /// One coordinate over time.
    pub fn coordinate(&self, axis: usize) -> Vec<f64> {
        self.states.chunks(self.dim).map(|s| s[axis]).collect()
    }

    /// `(x, y)` pairs for a 2D projection onto two coordinates.
    pub fn project(&self, x_axis: usize, y_axis: usize) -> Vec<[f64; 2]> {
        self.states
            .chunks(self.dim)
            .map(|s| [s[x_axis], s[y_axis]])
            .collect()
    }

    pub fn diverged(&self) -> bool {
        self.diverged_at.is_some()
    }
}

/// Fixed-step integration settings shared by the flow-driven analyses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    pub stepper: StepperKind,
    pub dt: f64,
    pub t0: f64,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            stepper: StepperKind::Rk4,
            dt: 0.01,
            t0: 0.0,
        }
    }
}

impl IntegrationSettings {
    pub fn map() -> Self {
        Self {
            stepper: StepperKind::Discrete,
            dt: 1.0,
            t0: 0.0,
        }
    }

    /// Defaults for `stepper`: `dt = 0.01` for flows, unit steps for maps.
    pub fn for_stepper(stepper: StepperKind) -> Self {
        if stepper.is_flow() {
            Self::default()
        } else {
            Self::map()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure_input!(
            self.dt.is_finite() && self.dt > 0.0,
            "Step size dt must be positive, got {}.",
            self.dt
        );
        ensure_input!(self.t0.is_finite(), "Initial time must be finite.");
        Ok(())
    }
}

pub(crate) fn is_finite_state(state: &[f64]) -> bool {
    state.iter().all(|v| v.is_finite())
}

pub(crate) fn check_dimension<S>(system: &S, state: &[f64]) -> Result<usize>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    let dim = system.dimension();
    ensure_input!(dim > 0, "System has zero dimension.");
    ensure_input!(
        state.len() == dim,
        "Initial state dimension mismatch. Expected {}, got {}.",
        dim,
        state.len()
    );
    ensure_input!(is_finite_state(state), "Initial state must be finite.");
    Ok(dim)
}

/// Steps `state` forward `steps` times without recording, e.g. to discard a transient.
///
/// Fails with `NumericOverflow` as soon as the state stops being finite.
pub fn advance<S>(
    system: &S,
    stepper: &mut Stepper,
    t: &mut f64,
    state: &mut [f64],
    dt: f64,
    steps: usize,
) -> Result<()>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    for step in 0..steps {
        stepper.step(&system, t, state, dt);
        if !is_finite_state(state) {
            return Err(AnalysisError::NumericOverflow { step: step + 1 });
        }
    }
    Ok(())
}

/// Integrates `steps` steps and records all `steps + 1` states, the initial one included.
pub fn integrate<S>(
    system: &S,
    initial: &[f64],
    settings: IntegrationSettings,
    steps: usize,
) -> Result<Trajectory>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    sample_after_transient(system, initial, settings, 0, steps)
}

/// Discards `transient` steps, then records the next `steps + 1` states.
///
/// Divergence during the transient is an error; divergence while recording
/// truncates the trajectory and sets `diverged_at`.
pub fn sample_after_transient<S>(
    system: &S,
    initial: &[f64],
    settings: IntegrationSettings,
    transient: usize,
    steps: usize,
) -> Result<Trajectory>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    let dim = check_dimension(system, initial)?;
    settings.validate()?;

    let mut stepper = settings.stepper.build(dim);
    let mut state = initial.to_vec();
    let mut t = settings.t0;
    advance(system, &mut stepper, &mut t, &mut state, settings.dt, transient)?;

    let mut trajectory = Trajectory::with_capacity(dim, steps + 1);
    trajectory.push(t, &state);
    for step in 1..=steps {
        stepper.step(&system, &mut t, &mut state, settings.dt);
        if !is_finite_state(&state) {
            log::debug!("Trajectory diverged at step {}", step);
            trajectory.diverged_at = Some(step);
            break;
        }
        trajectory.push(t, &state);
    }
    Ok(trajectory)
}

/// Integrates until `stop(t, state)` holds or `max_steps` is exhausted.
///
/// Returns the trajectory (initial state included) and whether `stop` fired.
pub fn integrate_until<S, F>(
    system: &S,
    initial: &[f64],
    settings: IntegrationSettings,
    max_steps: usize,
    mut stop: F,
) -> Result<(Trajectory, bool)>
where
    S: DynamicalSystem<f64> + ?Sized,
    F: FnMut(f64, &[f64]) -> bool,
{
    let dim = check_dimension(system, initial)?;
    settings.validate()?;

    let mut stepper = settings.stepper.build(dim);
    let mut state = initial.to_vec();
    let mut t = settings.t0;
    let mut trajectory = Trajectory::with_capacity(dim, max_steps.min(1 << 16) + 1);
    trajectory.push(t, &state);
    if stop(t, &state) {
        return Ok((trajectory, true));
    }
    for step in 1..=max_steps {
        stepper.step(&system, &mut t, &mut state, settings.dt);
        if !is_finite_state(&state) {
            trajectory.diverged_at = Some(step);
            return Ok((trajectory, false));
        }
        trajectory.push(t, &state);
        if stop(t, &state) {
            return Ok((trajectory, true));
        }
    }
    Ok((trajectory, false))
}

/// Iterates a map `iterations` times; times are iterate indices.
pub fn iterate_map<S>(map: &S, initial: &[f64], iterations: usize) -> Result<Trajectory>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    iterate_map_after_transient(map, initial, 0, iterations)
}

/// Discards `transient` iterates, then records the next `iterations + 1` points.
pub fn iterate_map_after_transient<S>(
    map: &S,
    initial: &[f64],
    transient: usize,
    iterations: usize,
) -> Result<Trajectory>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    let dim = check_dimension(map, initial)?;
    let mut stepper = Stepper::Discrete(DiscreteMap::new(dim));
    let mut state = initial.to_vec();
    let mut n = 0.0;
    advance(map, &mut stepper, &mut n, &mut state, 1.0, transient)?;
    n = 0.0;

    let mut orbit = Trajectory::with_capacity(dim, iterations + 1);
    orbit.push(n, &state);
    for k in 1..=iterations {
        stepper.step(&map, &mut n, &mut state, 1.0);
        if !is_finite_state(&state) {
            orbit.diverged_at = Some(k);
            break;
        }
        orbit.push(n, &state);
    }
    Ok(orbit)
}
