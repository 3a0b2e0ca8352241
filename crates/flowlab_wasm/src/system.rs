//! Core WASM system wrapper and low-level utilities.

use anyhow::{bail, Context};
use flowlab_core::autodiff::jacobian;
use flowlab_core::models::Model;
use flowlab_core::solvers::Stepper;
use flowlab_core::traits::{DynamicalSystem, Parameterized, Steppable};
use std::collections::BTreeMap;
use wasm_bindgen::prelude::*;

use crate::js_error;

#[wasm_bindgen]
pub struct WasmSystem {
    pub(crate) model: Model,
    pub(crate) state: Vec<f64>,
    pub(crate) t: f64,
    stepper: Stepper,
}

/// Instantiates `model_name` with the given parameter overrides.
pub(crate) fn build_model(
    model_name: &str,
    params: &[f64],
    param_names: &[String],
) -> anyhow::Result<Model> {
    if params.len() != param_names.len() {
        bail!(
            "Got {} parameter values for {} parameter names.",
            params.len(),
            param_names.len()
        );
    }
    let overrides: BTreeMap<String, f64> = param_names
        .iter()
        .cloned()
        .zip(params.iter().copied())
        .collect();
    Model::from_name(model_name, &overrides)
        .with_context(|| format!("Cannot build model '{}'", model_name))
}

impl WasmSystem {
    pub(crate) fn from_model(model: Model) -> Self {
        let dim = DynamicalSystem::<f64>::dimension(&model);
        WasmSystem {
            model,
            state: vec![0.0; dim],
            t: 0.0,
            stepper: model.stepper_kind().build(dim),
        }
    }

    pub(crate) fn dim(&self) -> usize {
        DynamicalSystem::<f64>::dimension(&self.model)
    }

    pub(crate) fn try_set_state(&mut self, state: &[f64]) -> anyhow::Result<()> {
        if state.len() != self.dim() {
            bail!(
                "State dimension mismatch. Expected {}, got {}.",
                self.dim(),
                state.len()
            );
        }
        self.state = state.to_vec();
        Ok(())
    }

    pub(crate) fn try_set_param(&mut self, name: &str, value: f64) -> anyhow::Result<()> {
        self.model
            .set_param(name, value)
            .with_context(|| format!("Failed to set '{}'", name))
    }
}

#[wasm_bindgen]
impl WasmSystem {
    #[wasm_bindgen(constructor)]
    pub fn new(
        model_name: &str,
        params: Vec<f64>,
        param_names: Vec<String>,
    ) -> Result<WasmSystem, JsValue> {
        console_error_panic_hook::set_once();
        let model = build_model(model_name, &params, &param_names).map_err(js_error)?;
        Ok(WasmSystem::from_model(model))
    }

    pub fn dimension(&self) -> usize {
        self.dim()
    }

    pub fn is_map(&self) -> bool {
        !self.model.stepper_kind().is_flow()
    }

    pub fn param_names(&self) -> Vec<String> {
        self.model
            .param_names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    pub fn get_param(&self, name: &str) -> Option<f64> {
        self.model.param(name)
    }

    pub fn set_param(&mut self, name: &str, value: f64) -> Result<(), JsValue> {
        self.try_set_param(name, value).map_err(js_error)
    }

    pub fn set_state(&mut self, state: &[f64]) -> Result<(), JsValue> {
        self.try_set_state(state).map_err(js_error)
    }

    pub fn get_state(&self) -> Vec<f64> {
        self.state.clone()
    }

    pub fn set_t(&mut self, t: f64) {
        self.t = t;
    }

    pub fn get_t(&self) -> f64 {
        self.t
    }

    /// One RK4 step of size `dt` for flows, one iterate for maps.
    pub fn step(&mut self, dt: f64) {
        self.stepper.step(&self.model, &mut self.t, &mut self.state, dt);
    }

    /// Row-major Jacobian at the current state.
    pub fn compute_jacobian(&self) -> Vec<f64> {
        jacobian(&self.model, self.t, &self.state)
    }
}
