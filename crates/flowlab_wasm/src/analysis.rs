//! Blocking analyses on a [`WasmSystem`], started from its current state.

use crate::system::WasmSystem;
use crate::{js_error, serialize};
use anyhow::{bail, Context};
use flowlab_core::bisection::{find_bifurcation, map_period_oracle, BisectionSettings, PeriodSettings};
use flowlab_core::equilibrium::{solve_equilibrium, NewtonSettings};
use flowlab_core::extrema::{collect_extrema, ExtremaSettings};
use flowlab_core::lyapunov::{lyapunov_spectrum, LyapunovSettings};
use flowlab_core::manifold::{saddle_directions, trace_manifold, ManifoldCurve, ManifoldSettings};
use flowlab_core::orbit::{sample_after_transient, IntegrationSettings, Trajectory};
use flowlab_core::poincare::{collect_crossings, Crossing, PoincareSettings, Section};
use flowlab_core::task::CancelToken;
use js_sys::Float64Array;
use serde_wasm_bindgen::from_value;
use wasm_bindgen::prelude::*;

impl WasmSystem {
    /// Integration settings for this system; `dt` only matters for flows.
    fn integration(&self, dt: f64) -> IntegrationSettings {
        let mut settings = IntegrationSettings::for_stepper(self.model.stepper_kind());
        if self.model.stepper_kind().is_flow() {
            settings.dt = dt;
        }
        settings.t0 = self.t;
        settings
    }

    pub(crate) fn trajectory(&self, transient: usize, steps: usize, dt: f64) -> anyhow::Result<Trajectory> {
        Ok(sample_after_transient(
            &self.model,
            &self.state,
            self.integration(dt),
            transient,
            steps,
        )?)
    }

    pub(crate) fn extrema(
        &self,
        coordinate: usize,
        transient: usize,
        target: usize,
        dt: f64,
    ) -> anyhow::Result<Vec<f64>> {
        let settings = ExtremaSettings {
            integration: self.integration(dt),
            coordinate,
            transient,
            target,
            ..ExtremaSettings::default()
        };
        settings.validate(self.dim())?;
        collect_extrema(&self.model, &self.state, &settings, &CancelToken::new())
            .context("Extrema search failed")
    }

    pub(crate) fn crossings(&self, section: Section, count: usize, dt: f64) -> anyhow::Result<Vec<Crossing>> {
        if self.is_map() {
            bail!("Poincaré sections need a flow; use the orbit of a map directly.");
        }
        let settings = PoincareSettings {
            integration: self.integration(dt),
            section,
            ..PoincareSettings::default()
        };
        collect_crossings(&self.model, &self.state, &settings, count, &CancelToken::new())
            .context("Poincaré section failed")
    }

    pub(crate) fn lyapunov(
        &self,
        transient: usize,
        iterations: usize,
        steps_per_iteration: usize,
        dt: f64,
    ) -> anyhow::Result<Vec<f64>> {
        let settings = LyapunovSettings {
            integration: self.integration(dt),
            transient,
            iterations,
            steps_per_iteration,
            ..LyapunovSettings::default()
        };
        let result = lyapunov_spectrum(&self.model, &self.state, &settings, &mut (), &CancelToken::new())
            .context("Lyapunov computation failed")?;
        Ok(result.exponents)
    }

    /// Newton-refines the current state to a saddle, then traces its manifold.
    pub(crate) fn manifold(&self, settings: &ManifoldSettings) -> anyhow::Result<Vec<ManifoldCurve>> {
        let Some(map) = self.model.as_invertible() else {
            bail!("Manifold tracing needs an invertible planar map.");
        };
        let saddle = solve_equilibrium(
            &self.model,
            self.model.kind(),
            &self.state,
            NewtonSettings::default(),
        )
        .context("Failed to locate the saddle point")?;
        let fixed_point = [saddle.state[0], saddle.state[1]];
        let directions = saddle_directions(&self.model, fixed_point)?;
        Ok(trace_manifold(
            map,
            fixed_point,
            directions.for_stability(settings.stability),
            settings,
            &mut (),
            &CancelToken::new(),
        )?)
    }

    pub(crate) fn period_doubling(
        &self,
        param: &str,
        period: usize,
        low: f64,
        high: f64,
        tolerance: f64,
    ) -> anyhow::Result<f64> {
        if !self.is_map() {
            bail!("Period estimation is only available for maps.");
        }
        let oracle = map_period_oracle(self.model, param, self.state.clone(), PeriodSettings::default());
        let settings = BisectionSettings {
            tolerance,
            ..BisectionSettings::default()
        };
        Ok(find_bifurcation(period, low, high, oracle, &settings, &CancelToken::new())?)
    }
}

#[wasm_bindgen]
impl WasmSystem {
    pub fn compute_trajectory(&self, transient: u32, steps: u32, dt: f64) -> Result<JsValue, JsValue> {
        let trajectory = self
            .trajectory(transient as usize, steps as usize, dt)
            .map_err(js_error)?;
        serialize(&trajectory)
    }

    pub fn compute_extrema(
        &self,
        coordinate: u32,
        transient: u32,
        target: u32,
        dt: f64,
    ) -> Result<Float64Array, JsValue> {
        let values = self
            .extrema(coordinate as usize, transient as usize, target as usize, dt)
            .map_err(js_error)?;
        Ok(Float64Array::from(values.as_slice()))
    }

    /// `section` is a serialized [`Section`], e.g. `{ type: "angle", theta: 0 }`.
    pub fn compute_poincare_section(&self, section: JsValue, count: u32, dt: f64) -> Result<JsValue, JsValue> {
        let section: Section = from_value(section)
            .map_err(|e| JsValue::from_str(&format!("Invalid section: {}", e)))?;
        let crossings = self.crossings(section, count as usize, dt).map_err(js_error)?;
        serialize(&crossings)
    }

    pub fn compute_lyapunov_exponents(
        &self,
        transient: u32,
        iterations: u32,
        steps_per_iteration: u32,
        dt: f64,
    ) -> Result<Float64Array, JsValue> {
        let exponents = self
            .lyapunov(
                transient as usize,
                iterations as usize,
                steps_per_iteration as usize,
                dt,
            )
            .map_err(js_error)?;
        Ok(Float64Array::from(exponents.as_slice()))
    }

    /// Uses the current state as the saddle guess. `settings` may be undefined.
    pub fn compute_manifold(&self, settings: JsValue) -> Result<JsValue, JsValue> {
        let settings: ManifoldSettings = if settings.is_undefined() || settings.is_null() {
            ManifoldSettings::default()
        } else {
            from_value(settings)
                .map_err(|e| JsValue::from_str(&format!("Invalid manifold settings: {}", e)))?
        };
        let curves = self.manifold(&settings).map_err(js_error)?;
        serialize(&curves)
    }

    pub fn find_period_doubling(
        &self,
        param: &str,
        period: u32,
        low: f64,
        high: f64,
        tolerance: f64,
    ) -> Result<f64, JsValue> {
        self.period_doubling(param, period as usize, low, high, tolerance)
            .map_err(js_error)
    }
}
