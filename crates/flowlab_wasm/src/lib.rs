//! WebAssembly bindings for `flowlab_core`: a steppable [`WasmSystem`] with
//! blocking analyses, and [`WasmSweepRunner`] for sweeps driven in batches.

use flowlab_core::config::ExperimentConfig;
use flowlab_core::experiment::run_experiment as core_run_experiment;
use flowlab_core::models::Model;
use flowlab_core::task::CancelToken;
use serde::Serialize;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

mod analysis;
mod runners;
mod system;

pub use runners::WasmSweepRunner;
pub use system::WasmSystem;

/// Flattens an error chain into the message thrown on the JS side.
pub(crate) fn js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{:#}", err))
}

pub(crate) fn serialize<T: Serialize>(value: &T) -> Result<JsValue, JsValue> {
    to_value(value).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

#[wasm_bindgen]
pub fn model_names() -> Vec<String> {
    Model::NAMES.iter().map(|name| name.to_string()).collect()
}

/// Runs a serialized experiment to completion. Checkpoint files are not
/// available in the browser; resume sweeps through [`WasmSweepRunner`].
#[wasm_bindgen]
pub fn run_experiment(config: JsValue) -> Result<JsValue, JsValue> {
    console_error_panic_hook::set_once();
    let config: ExperimentConfig = from_value(config)
        .map_err(|e| JsValue::from_str(&format!("Invalid experiment: {}", e)))?;
    let output = core_run_experiment(&config, &mut (), &CancelToken::new()).map_err(js_error)?;
    serialize(&output)
}
