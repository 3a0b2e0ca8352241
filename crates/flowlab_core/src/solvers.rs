use serde::{Deserialize, Serialize};

use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Classic Runge-Kutta 4th Order Solver.
///
/// The stage buffers are scratch space only; two calls with the same inputs
/// always produce the same output.
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            k3: vec![z; dim],
            k4: vec![z; dim],
            tmp: vec![z; dim],
        }
    }

    fn ensure_len(&mut self, dim: usize) {
        if self.tmp.len() != dim {
            *self = Self::new(dim);
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        self.ensure_len(state.len());
        let half = T::lift(0.5);
        let sixth = T::lift(1.0 / 6.0);
        let two = T::lift(2.0);
        let t0 = *t;

        system.apply(t0, state, &mut self.k1);

        for (tmp, (y, k)) in self.tmp.iter_mut().zip(state.iter().zip(&self.k1)) {
            *tmp = *y + dt * half * *k;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        for (tmp, (y, k)) in self.tmp.iter_mut().zip(state.iter().zip(&self.k2)) {
            *tmp = *y + dt * half * *k;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        for (tmp, (y, k)) in self.tmp.iter_mut().zip(state.iter().zip(&self.k3)) {
            *tmp = *y + dt * *k;
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

/// One RK4 step as a pure function: returns the state at `t + dt`.
pub fn rk4_step(system: &impl DynamicalSystem<f64>, state: &[f64], t: f64, dt: f64) -> Vec<f64> {
    let mut next = state.to_vec();
    let mut time = t;
    RK4::new(state.len()).step(system, &mut time, &mut next, dt);
    next
}

/// Discrete Map Stepper.
/// Evaluates x_{n+1} = f(x_n); `t` advances by `dt` so it counts iterates when dt = 1.
pub struct DiscreteMap<T: Scalar> {
    tmp: Vec<T>,
}

impl<T: Scalar> DiscreteMap<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for DiscreteMap<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        if self.tmp.len() != state.len() {
            self.tmp = vec![T::zero(); state.len()];
        }
        system.apply(*t, state, &mut self.tmp);
        state.copy_from_slice(&self.tmp);
        *t = *t + dt;
    }
}

/// Which update rule drives a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepperKind {
    #[default]
    Rk4,
    Discrete,
}

impl StepperKind {
    pub fn build(self, dim: usize) -> Stepper {
        match self {
            StepperKind::Rk4 => Stepper::Rk4(RK4::new(dim)),
            StepperKind::Discrete => Stepper::Discrete(DiscreteMap::new(dim)),
        }
    }

    pub fn is_flow(self) -> bool {
        matches!(self, StepperKind::Rk4)
    }
}

/// Runtime-selected stepper over `f64` states.
pub enum Stepper {
    Rk4(RK4<f64>),
    Discrete(DiscreteMap<f64>),
}

impl Steppable<f64> for Stepper {
    fn step(&mut self, system: &impl DynamicalSystem<f64>, t: &mut f64, state: &mut [f64], dt: f64) {
        match self {
            Stepper::Rk4(s) => s.step(system, t, state, dt),
            Stepper::Discrete(s) => s.step(system, t, state, dt),
        }
    }
}
