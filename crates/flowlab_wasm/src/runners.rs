//! Incremental parameter-sweep runner: the host calls `run_steps` from its
//! event loop until `is_done`, so long sweeps never block the page.

use crate::{js_error, serialize};
use anyhow::bail;
use flowlab_core::config::{Experiment, ExperimentConfig};
use flowlab_core::models::Model;
use flowlab_core::orbit::IntegrationSettings;
use flowlab_core::sweep::{
    BifurcationRecord, ExtremaEvaluator, LyapunovEvaluator, OrbitEvaluator, SweepOutcome,
    SweepProgress, SweepRunner,
};
use flowlab_core::task::CancelToken;
use serde_wasm_bindgen::from_value;
use wasm_bindgen::prelude::*;

pub(crate) enum SweepJob {
    Orbit(SweepRunner<OrbitEvaluator<Model>>),
    Extrema(SweepRunner<ExtremaEvaluator<Model>>),
    Lyapunov(SweepRunner<LyapunovEvaluator<Model>>),
}

macro_rules! with_runner {
    ($job:expr, $runner:ident => $body:expr) => {
        match $job {
            SweepJob::Orbit($runner) => $body,
            SweepJob::Extrema($runner) => $body,
            SweepJob::Lyapunov($runner) => $body,
        }
    };
}

impl SweepJob {
    /// Builds the sweep described by `config`, continuing after `records`.
    pub(crate) fn from_config(
        config: &ExperimentConfig,
        records: Vec<BifurcationRecord>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let model = config.build_model()?;
        let stepper = model.stepper_kind();
        let initial = config.initial.clone();

        let job = match &config.experiment {
            Experiment::OrbitDiagram {
                grid,
                integration,
                transient,
                samples,
                coordinate,
                ..
            } => {
                let integration = IntegrationSettings {
                    stepper,
                    ..integration.unwrap_or_else(|| IntegrationSettings::for_stepper(stepper))
                };
                let evaluator = OrbitEvaluator::new(
                    model,
                    &grid.param,
                    initial,
                    integration,
                    *coordinate,
                    *transient,
                    *samples,
                )?;
                SweepJob::Orbit(SweepRunner::resume(grid.clone(), evaluator, records)?)
            }
            Experiment::Bifurcation { grid, settings, .. } => {
                let mut settings = *settings;
                settings.integration.stepper = stepper;
                let evaluator = ExtremaEvaluator::new(model, &grid.param, initial, settings)?;
                SweepJob::Extrema(SweepRunner::resume(grid.clone(), evaluator, records)?)
            }
            Experiment::LyapunovSweep { grid, settings, .. } => {
                let mut settings = *settings;
                settings.integration.stepper = stepper;
                let evaluator = LyapunovEvaluator::new(model, &grid.param, initial, settings)?;
                SweepJob::Lyapunov(SweepRunner::resume(grid.clone(), evaluator, records)?)
            }
            other => bail!("Experiment {:?} is not a parameter sweep.", other),
        };
        Ok(job)
    }

    pub(crate) fn is_done(&self) -> bool {
        with_runner!(self, runner => runner.is_done())
    }

    pub(crate) fn run_steps(&mut self, batch_size: usize, cancel: &CancelToken) -> SweepProgress {
        with_runner!(self, runner => runner.run_steps(batch_size, cancel))
    }

    pub(crate) fn progress(&self) -> SweepProgress {
        with_runner!(self, runner => runner.progress())
    }

    /// Records so far, with the status they would have if the sweep stopped now.
    pub(crate) fn outcome(&self) -> SweepOutcome {
        with_runner!(self, runner => SweepOutcome {
            records: runner.records().to_vec(),
            status: runner.status(),
        })
    }
}

#[wasm_bindgen]
pub struct WasmSweepRunner {
    job: SweepJob,
    cancel: CancelToken,
}

#[wasm_bindgen]
impl WasmSweepRunner {
    /// `config` is a serialized experiment of kind `orbit_diagram`,
    /// `bifurcation` or `lyapunov_sweep`. `records` (optional) are the rows of
    /// an earlier, interrupted run of the same sweep.
    #[wasm_bindgen(constructor)]
    pub fn new(config: JsValue, records: JsValue) -> Result<WasmSweepRunner, JsValue> {
        console_error_panic_hook::set_once();

        let config: ExperimentConfig = from_value(config)
            .map_err(|e| JsValue::from_str(&format!("Invalid experiment: {}", e)))?;
        let records: Vec<BifurcationRecord> = if records.is_undefined() || records.is_null() {
            Vec::new()
        } else {
            from_value(records)
                .map_err(|e| JsValue::from_str(&format!("Invalid records: {}", e)))?
        };
        let job = SweepJob::from_config(&config, records).map_err(js_error)?;
        Ok(WasmSweepRunner {
            job,
            cancel: CancelToken::new(),
        })
    }

    pub fn is_done(&self) -> bool {
        self.job.is_done()
    }

    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        let progress = self.job.run_steps(batch_size.max(1) as usize, &self.cancel);
        serialize(&progress)
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        serialize(&self.job.progress())
    }

    pub fn get_result(&self) -> Result<JsValue, JsValue> {
        serialize(&self.job.outcome())
    }

    /// The point being evaluated finishes; the runner then reports done.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlab_core::task::RunStatus;

    fn orbit_config(points: usize) -> ExperimentConfig {
        ExperimentConfig::from_json(&format!(
            r#"{{
                "model": "logistic",
                "initial": [0.5],
                "experiment": {{
                    "kind": "orbit_diagram",
                    "grid": {{ "param": "r", "start": 2.8, "end": 4.0, "points": {points} }},
                    "transient": 300,
                    "samples": 16
                }}
            }}"#
        ))
        .expect("config")
    }

    #[test]
    fn batches_until_done() {
        let mut job = SweepJob::from_config(&orbit_config(10), Vec::new()).expect("job");
        let cancel = CancelToken::new();
        let mut batches = 0;
        while !job.is_done() {
            let progress = job.run_steps(3, &cancel);
            batches += 1;
            assert_eq!(progress.total_points, 10);
        }
        assert_eq!(batches, 4);
        let outcome = job.outcome();
        assert_eq!(outcome.records.len(), 10);
        assert_eq!(outcome.status, RunStatus::Complete);
        assert!(outcome.records.iter().all(|r| r.values.len() == 16));
    }

    #[test]
    fn resumed_job_continues_after_records() {
        let config = orbit_config(6);
        let mut full = SweepJob::from_config(&config, Vec::new()).expect("job");
        full.run_steps(6, &CancelToken::new());

        let head = full.outcome().records[..2].to_vec();
        let mut resumed = SweepJob::from_config(&config, head).expect("resume");
        assert_eq!(resumed.progress().current_point, 2);
        resumed.run_steps(10, &CancelToken::new());
        assert_eq!(resumed.outcome(), full.outcome());
    }

    #[test]
    fn cancelled_job_reports_aborted() {
        let mut job = SweepJob::from_config(&orbit_config(10), Vec::new()).expect("job");
        let cancel = CancelToken::new();
        job.run_steps(2, &cancel);
        cancel.cancel();
        job.run_steps(5, &cancel);
        assert!(job.is_done());
        assert!(matches!(job.outcome().status, RunStatus::Aborted { .. }));
        assert_eq!(job.outcome().records.len(), 2);
    }

    #[test]
    fn rejects_non_sweep_experiments() {
        let config = ExperimentConfig::from_json(
            r#"{
                "model": "henon",
                "initial": [0.1, 0.1],
                "experiment": { "kind": "trajectory", "steps": 10 }
            }"#,
        )
        .expect("config");
        let err = SweepJob::from_config(&config, Vec::new()).err().expect("error");
        assert!(format!("{err:#}").contains("not a parameter sweep"));
    }
}
