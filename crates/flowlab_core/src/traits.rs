use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

use crate::error::Result;

/// A trait for types that can be used as scalars in our dynamical systems.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts a plain coefficient into the scalar type.
    fn lift(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Represents a dynamical system (Flow or Map).
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field (flow) or map function.
    /// x: current state
    /// t: current time
    /// out: buffer to write the result (dx/dt or x_{n+1})
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

impl<T: Scalar, S: DynamicalSystem<T> + ?Sized> DynamicalSystem<T> for &S {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        (**self).apply(t, x, out)
    }
}

/// A discrete map whose inverse is available in closed form.
pub trait InvertibleMap: DynamicalSystem<f64> {
    /// Writes `f^{-1}(x)` into `out`.
    fn apply_inverse(&self, x: &[f64], out: &mut [f64]);
}

impl<S: InvertibleMap + ?Sized> InvertibleMap for &S {
    fn apply_inverse(&self, x: &[f64], out: &mut [f64]) {
        (**self).apply_inverse(x, out)
    }
}

/// Named real-valued coefficients that may change between runs.
pub trait Parameterized {
    fn param_names(&self) -> &'static [&'static str];

    fn param(&self, name: &str) -> Option<f64>;

    fn set_param(&mut self, name: &str, value: f64) -> Result<()>;
}

/// A trait for solvers that can step a system forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}

/// Adapts a closure `(t, x, out)` into a system of fixed dimension.
pub struct FnSystem<F> {
    dimension: usize,
    f: F,
}

impl<F> FnSystem<F>
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    pub fn new(dimension: usize, f: F) -> Self {
        Self { dimension, f }
    }
}

impl<F> DynamicalSystem<f64> for FnSystem<F>
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        (self.f)(t, x, out)
    }
}
