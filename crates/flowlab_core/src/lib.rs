//! The `flowlab_core` crate is the numerical engine behind the flowlab experiments.
//! Models are written once, generically over [`traits::Scalar`], and evaluated both
//! on `f64` and on dual numbers so Jacobians come from automatic differentiation.
//!
//! Key components:
//! - **Traits**: `Scalar`, `DynamicalSystem` (flows and maps), `InvertibleMap`, `Parameterized`, `Steppable`.
//! - **Solvers**: the fixed-step RK4 integrator and the discrete-map iterator.
//! - **Analyses**: orbits, extrema, Poincaré sections, Lyapunov spectra, invariant
//!   manifolds and bisection for bifurcation points.
//! - **Sweeps**: resumable parameter sweeps with progress reporting and cancellation.
pub mod autodiff;
pub mod bisection;
pub mod config;
pub mod equilibrium;
pub mod error;
pub mod experiment;
pub mod extrema;
pub mod lyapunov;
pub mod manifold;
pub mod models;
pub mod orbit;
pub mod poincare;
pub mod solvers;
pub mod sweep;
pub mod table;
pub mod task;
pub mod traits;

pub use error::{AnalysisError, Result};
