//! Catalog of flows and maps used by the experiments.
//!
//! Every model is written once, generically over [`Scalar`], so the same
//! definition is evaluated on `f64` for trajectories and on [`Dual`] for
//! Jacobians.
//!
//! [`Dual`]: crate::autodiff::Dual

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::equilibrium::SystemKind;
use crate::error::{AnalysisError, Result};
use crate::solvers::StepperKind;
use crate::traits::{DynamicalSystem, InvertibleMap, Parameterized, Scalar};

/// Implements [`Parameterized`] for a struct whose fields are all `f64` coefficients.
macro_rules! parameters {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl Parameterized for $ty {
            fn param_names(&self) -> &'static [&'static str] {
                &[$(stringify!($field)),+]
            }

            fn param(&self, name: &str) -> Option<f64> {
                match name {
                    $(stringify!($field) => Some(self.$field),)+
                    _ => None,
                }
            }

            fn set_param(&mut self, name: &str, value: f64) -> Result<()> {
                if !value.is_finite() {
                    return Err(AnalysisError::invalid(format!(
                        "Parameter '{}' must be finite, got {}.",
                        name, value
                    )));
                }
                match name {
                    $(stringify!($field) => self.$field = value,)+
                    _ => {
                        return Err(AnalysisError::invalid(format!(
                            "Unknown parameter '{}' for {}.",
                            name,
                            stringify!($ty)
                        )))
                    }
                }
                Ok(())
            }
        }
    };
}

/// `x'' = -ω² x`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HarmonicOscillator {
    pub omega: f64,
}

impl Default for HarmonicOscillator {
    fn default() -> Self {
        Self { omega: 1.0 }
    }
}

impl<T: Scalar> DynamicalSystem<T> for HarmonicOscillator {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let w = T::lift(self.omega);
        out[0] = x[1];
        out[1] = -w * w * x[0];
    }
}

parameters!(HarmonicOscillator { omega });

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lorenz {
    pub sigma: f64,
    pub rho: f64,
    pub beta: f64,
}

impl Default for Lorenz {
    fn default() -> Self {
        Self {
            sigma: 10.0,
            rho: 28.0,
            beta: 8.0 / 3.0,
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for Lorenz {
    fn dimension(&self) -> usize {
        3
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = T::lift(self.sigma) * (x[1] - x[0]);
        out[1] = x[0] * (T::lift(self.rho) - x[2]) - x[1];
        out[2] = x[0] * x[1] - T::lift(self.beta) * x[2];
    }
}

parameters!(Lorenz { sigma, rho, beta });

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rossler {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Default for Rossler {
    fn default() -> Self {
        Self {
            a: 0.2,
            b: 0.2,
            c: 5.7,
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for Rossler {
    fn dimension(&self) -> usize {
        3
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = -x[1] - x[2];
        out[1] = x[0] + T::lift(self.a) * x[1];
        out[2] = T::lift(self.b) + x[2] * (x[0] - T::lift(self.c));
    }
}

parameters!(Rossler { a, b, c });

/// Forced Duffing oscillator: `x'' + δx' + αx + βx³ = γ cos(ωt)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Duffing {
    pub delta: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub omega: f64,
}

impl Default for Duffing {
    fn default() -> Self {
        Self {
            delta: 0.3,
            alpha: -1.0,
            beta: 1.0,
            gamma: 0.5,
            omega: 1.2,
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for Duffing {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        let forcing = T::lift(self.gamma) * (T::lift(self.omega) * t).cos();
        out[0] = x[1];
        out[1] = forcing
            - T::lift(self.delta) * x[1]
            - T::lift(self.alpha) * x[0]
            - T::lift(self.beta) * x[0] * x[0] * x[0];
    }
}

parameters!(Duffing { delta, alpha, beta, gamma, omega });

/// Forced van der Pol oscillator: `x'' - μ(1 - x²)x' + x = A sin(ωt)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VanDerPol {
    pub mu: f64,
    pub amplitude: f64,
    pub omega: f64,
}

impl Default for VanDerPol {
    fn default() -> Self {
        Self {
            mu: 1.0,
            amplitude: 0.0,
            omega: 1.0,
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for VanDerPol {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        let one = T::one();
        out[0] = x[1];
        out[1] = T::lift(self.mu) * (one - x[0] * x[0]) * x[1] - x[0]
            + T::lift(self.amplitude) * (T::lift(self.omega) * t).sin();
    }
}

parameters!(VanDerPol { mu, amplitude, omega });

/// Driven RCSJ Josephson junction: `φ'' + βφ' + sin φ = i_dc + i_ac sin(ωt)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JosephsonJunction {
    pub damping: f64,
    pub i_dc: f64,
    pub i_ac: f64,
    pub omega: f64,
}

impl Default for JosephsonJunction {
    fn default() -> Self {
        Self {
            damping: 0.5,
            i_dc: 0.3,
            i_ac: 1.2,
            omega: 0.66,
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for JosephsonJunction {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        let drive = T::lift(self.i_dc) + T::lift(self.i_ac) * (T::lift(self.omega) * t).sin();
        out[0] = x[1];
        out[1] = drive - T::lift(self.damping) * x[1] - x[0].sin();
    }
}

parameters!(JosephsonJunction { damping, i_dc, i_ac, omega });

/// Two diffusively coupled Bonhoeffer–van der Pol cells, state `(x1, y1, x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoupledBvp {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub stimulus: f64,
    pub coupling: f64,
}

impl Default for CoupledBvp {
    fn default() -> Self {
        Self {
            a: 0.7,
            b: 0.8,
            c: 3.0,
            stimulus: -0.4,
            coupling: 0.1,
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for CoupledBvp {
    fn dimension(&self) -> usize {
        4
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let (a, b, c) = (T::lift(self.a), T::lift(self.b), T::lift(self.c));
        let z = T::lift(self.stimulus);
        let k = T::lift(self.coupling);
        let three = T::lift(3.0);
        for cell in 0..2 {
            let (xi, yi) = (x[2 * cell], x[2 * cell + 1]);
            let other = x[2 * (1 - cell)];
            out[2 * cell] = c * (xi - xi * xi * xi / three + yi + z) + k * (other - xi);
            out[2 * cell + 1] = -(xi - a + b * yi) / c;
        }
    }
}

parameters!(CoupledBvp { a, b, c, stimulus, coupling });

/// `x -> r x (1 - x)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticMap {
    pub r: f64,
}

impl Default for LogisticMap {
    fn default() -> Self {
        Self { r: 3.8 }
    }
}

impl<T: Scalar> DynamicalSystem<T> for LogisticMap {
    fn dimension(&self) -> usize {
        1
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = T::lift(self.r) * x[0] * (T::one() - x[0]);
    }
}

parameters!(LogisticMap { r });

/// `(x, y) -> (1 - a x² + y, b x)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HenonMap {
    pub a: f64,
    pub b: f64,
}

impl Default for HenonMap {
    fn default() -> Self {
        Self { a: 1.4, b: 0.3 }
    }
}

impl HenonMap {
    /// The two fixed points, `None` when they are complex.
    pub fn fixed_points(&self) -> Option<[[f64; 2]; 2]> {
        let (a, b) = (self.a, self.b);
        let disc = (1.0 - b) * (1.0 - b) + 4.0 * a;
        if disc < 0.0 || a == 0.0 {
            return None;
        }
        let root = disc.sqrt();
        let x_plus = (-(1.0 - b) + root) / (2.0 * a);
        let x_minus = (-(1.0 - b) - root) / (2.0 * a);
        Some([[x_plus, b * x_plus], [x_minus, b * x_minus]])
    }
}

impl<T: Scalar> DynamicalSystem<T> for HenonMap {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = T::one() - T::lift(self.a) * x[0] * x[0] + x[1];
        out[1] = T::lift(self.b) * x[0];
    }
}

impl InvertibleMap for HenonMap {
    fn apply_inverse(&self, x: &[f64], out: &mut [f64]) {
        let prev_x = x[1] / self.b;
        out[0] = prev_x;
        out[1] = x[0] - 1.0 + self.a * prev_x * prev_x;
    }
}

parameters!(HenonMap { a, b });

/// Chirikov standard map on `(θ, p)`, left unwrapped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandardMap {
    pub k: f64,
}

impl Default for StandardMap {
    fn default() -> Self {
        Self { k: 0.97 }
    }
}

impl<T: Scalar> DynamicalSystem<T> for StandardMap {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let p = x[1] + T::lift(self.k) * x[0].sin();
        out[0] = x[0] + p;
        out[1] = p;
    }
}

impl InvertibleMap for StandardMap {
    fn apply_inverse(&self, x: &[f64], out: &mut [f64]) {
        let theta = x[0] - x[1];
        out[0] = theta;
        out[1] = x[1] - self.k * theta.sin();
    }
}

parameters!(StandardMap { k });

/// `x -> 2x mod 1`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DoublingMap;

impl<T: Scalar> DynamicalSystem<T> for DoublingMap {
    fn dimension(&self) -> usize {
        1
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        out[0] = (T::lift(2.0) * x[0]) % T::one();
    }
}

impl Parameterized for DoublingMap {
    fn param_names(&self) -> &'static [&'static str] {
        &[]
    }

    fn param(&self, _name: &str) -> Option<f64> {
        None
    }

    fn set_param(&mut self, name: &str, _value: f64) -> Result<()> {
        Err(AnalysisError::invalid(format!(
            "Unknown parameter '{}' for DoublingMap.",
            name
        )))
    }
}

/// Runtime-selected model, built from a name plus named parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Model {
    Harmonic(HarmonicOscillator),
    Lorenz(Lorenz),
    Rossler(Rossler),
    Duffing(Duffing),
    VanDerPol(VanDerPol),
    Josephson(JosephsonJunction),
    CoupledBvp(CoupledBvp),
    Logistic(LogisticMap),
    Henon(HenonMap),
    Standard(StandardMap),
    Doubling(DoublingMap),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Model::Harmonic($inner) => $body,
            Model::Lorenz($inner) => $body,
            Model::Rossler($inner) => $body,
            Model::Duffing($inner) => $body,
            Model::VanDerPol($inner) => $body,
            Model::Josephson($inner) => $body,
            Model::CoupledBvp($inner) => $body,
            Model::Logistic($inner) => $body,
            Model::Henon($inner) => $body,
            Model::Standard($inner) => $body,
            Model::Doubling($inner) => $body,
        }
    };
}

impl Model {
    pub const NAMES: &'static [&'static str] = &[
        "harmonic",
        "lorenz",
        "rossler",
        "duffing",
        "van_der_pol",
        "josephson",
        "coupled_bvp",
        "logistic",
        "henon",
        "standard",
        "doubling",
    ];

    /// Builds a model with default coefficients, then applies `params` by name.
    pub fn from_name(name: &str, params: &BTreeMap<String, f64>) -> Result<Self> {
        let mut model = match name.to_ascii_lowercase().as_str() {
            "harmonic" => Model::Harmonic(HarmonicOscillator::default()),
            "lorenz" => Model::Lorenz(Lorenz::default()),
            "rossler" => Model::Rossler(Rossler::default()),
            "duffing" => Model::Duffing(Duffing::default()),
            "van_der_pol" | "vanderpol" => Model::VanDerPol(VanDerPol::default()),
            "josephson" => Model::Josephson(JosephsonJunction::default()),
            "coupled_bvp" | "bvp" => Model::CoupledBvp(CoupledBvp::default()),
            "logistic" => Model::Logistic(LogisticMap::default()),
            "henon" => Model::Henon(HenonMap::default()),
            "standard" => Model::Standard(StandardMap::default()),
            "doubling" => Model::Doubling(DoublingMap),
            other => {
                return Err(AnalysisError::invalid(format!(
                    "Unknown model '{}'. Expected one of: {}.",
                    other,
                    Self::NAMES.join(", ")
                )))
            }
        };
        for (key, value) in params {
            model.set_param(key, *value)?;
        }
        Ok(model)
    }

    pub fn kind(&self) -> SystemKind {
        match self {
            Model::Logistic(_) | Model::Henon(_) | Model::Standard(_) | Model::Doubling(_) => {
                SystemKind::Map
            }
            _ => SystemKind::Flow,
        }
    }

    pub fn stepper_kind(&self) -> StepperKind {
        match self.kind() {
            SystemKind::Flow => StepperKind::Rk4,
            SystemKind::Map => StepperKind::Discrete,
        }
    }

    /// The closed-form inverse, for maps that have one.
    pub fn as_invertible(&self) -> Option<&dyn InvertibleMap> {
        match self {
            Model::Henon(map) => Some(map),
            Model::Standard(map) => Some(map),
            _ => None,
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for Model {
    fn dimension(&self) -> usize {
        dispatch!(self, m => DynamicalSystem::<T>::dimension(m))
    }

    fn apply(&self, t: T, x: &[T], out: &mut [T]) {
        dispatch!(self, m => m.apply(t, x, out))
    }
}

impl Parameterized for Model {
    fn param_names(&self) -> &'static [&'static str] {
        dispatch!(self, m => m.param_names())
    }

    fn param(&self, name: &str) -> Option<f64> {
        dispatch!(self, m => m.param(name))
    }

    fn set_param(&mut self, name: &str, value: f64) -> Result<()> {
        dispatch!(self, m => m.set_param(name, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::jacobian;

    #[test]
    fn from_name_applies_named_parameters() {
        let mut params = BTreeMap::new();
        params.insert("rho".to_string(), 99.0);
        let model = Model::from_name("Lorenz", &params).expect("model");
        assert_eq!(model.param("rho"), Some(99.0));
        assert_eq!(model.param("sigma"), Some(10.0));
        assert_eq!(model.kind(), SystemKind::Flow);
        assert_eq!(DynamicalSystem::<f64>::dimension(&model), 3);
    }

    #[test]
    fn from_name_rejects_unknown_model_and_parameter() {
        let err = Model::from_name("pendulum", &BTreeMap::new()).unwrap_err();
        assert!(format!("{err}").contains("Unknown model"));

        let mut params = BTreeMap::new();
        params.insert("q".to_string(), 1.0);
        let err = Model::from_name("henon", &params).unwrap_err();
        assert!(format!("{err}").contains("Unknown parameter 'q'"));
    }

    #[test]
    fn set_param_rejects_non_finite_values() {
        let mut map = LogisticMap::default();
        assert!(map.set_param("r", f64::NAN).is_err());
        assert_eq!(map.r, 3.8);
    }

    #[test]
    fn henon_inverse_undoes_forward_map() {
        let map = HenonMap::default();
        let x = [0.3, -0.1];
        let mut forward = [0.0; 2];
        let mut back = [0.0; 2];
        map.apply(0.0, &x, &mut forward);
        map.apply_inverse(&forward, &mut back);
        assert!((back[0] - x[0]).abs() < 1e-14);
        assert!((back[1] - x[1]).abs() < 1e-14);
    }

    #[test]
    fn standard_inverse_undoes_forward_map() {
        let map = StandardMap { k: 1.3 };
        let x = [2.0, 0.4];
        let mut forward = [0.0; 2];
        let mut back = [0.0; 2];
        map.apply(0.0, &x, &mut forward);
        map.apply_inverse(&forward, &mut back);
        assert!((back[0] - x[0]).abs() < 1e-14);
        assert!((back[1] - x[1]).abs() < 1e-14);
    }

    #[test]
    fn henon_fixed_points_are_fixed() {
        let map = HenonMap::default();
        for point in map.fixed_points().expect("real fixed points") {
            let mut image = [0.0; 2];
            map.apply(0.0, &point, &mut image);
            assert!((image[0] - point[0]).abs() < 1e-12);
            assert!((image[1] - point[1]).abs() < 1e-12);
        }
    }

    #[test]
    fn coupled_bvp_jacobian_has_symmetric_coupling() {
        let model = CoupledBvp::default();
        let jac = jacobian(&model, 0.0, &[0.1, 0.2, -0.3, 0.4]);
        assert!((jac[2] - model.coupling).abs() < 1e-15);
        assert!((jac[2 * 4] - model.coupling).abs() < 1e-15);
    }
}
