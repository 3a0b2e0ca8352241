//! Parameter sweeps: bifurcation diagrams and Lyapunov exponents versus a
//! control parameter.
//!
//! A [`SweepRunner`] walks a [`ParameterGrid`] in order and asks a
//! [`PointEvaluator`] for the values to record at each point. Every point
//! starts from the same initial state, so a sweep resumed from saved records
//! produces exactly the records an uninterrupted sweep would have.

use serde::{Deserialize, Serialize};

use crate::autodiff::Dual;
use crate::error::{ensure_input, AnalysisError, Result};
use crate::extrema::{collect_extrema, ExtremaSettings};
use crate::lyapunov::{lyapunov_spectrum, LyapunovSettings};
use crate::orbit::{check_dimension, sample_after_transient, IntegrationSettings};
use crate::task::{spawn_task, CancelToken, ProgressSink, RunStatus, TaskHandle};
use crate::traits::{DynamicalSystem, Parameterized};

/// Evenly spaced values of one named parameter, both ends included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterGrid {
    pub param: String,
    pub start: f64,
    pub end: f64,
    pub points: usize,
}

impl ParameterGrid {
    pub fn new(param: impl Into<String>, start: f64, end: f64, points: usize) -> Result<Self> {
        let grid = Self {
            param: param.into(),
            start,
            end,
            points,
        };
        grid.validate()?;
        Ok(grid)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_input!(!self.param.is_empty(), "Sweep parameter name is empty.");
        ensure_input!(
            self.start.is_finite() && self.end.is_finite(),
            "Sweep range must be finite."
        );
        ensure_input!(self.points > 0, "Sweep needs at least one point.");
        Ok(())
    }

    pub fn value(&self, index: usize) -> f64 {
        if self.points <= 1 {
            return self.start;
        }
        let fraction = index as f64 / (self.points - 1) as f64;
        self.start + fraction * (self.end - self.start)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.points).map(|i| self.value(i))
    }
}

/// Values recorded at one parameter value; empty for a failed point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BifurcationRecord {
    pub param: f64,
    pub values: Vec<f64>,
}

/// Computes what a sweep records at one parameter value.
pub trait PointEvaluator {
    fn param_name(&self) -> &str;

    fn evaluate(&mut self, param: f64, cancel: &CancelToken) -> Result<Vec<f64>>;
}

fn prepared<M>(model: &M, param: &str, value: f64) -> Result<M>
where
    M: Parameterized + Clone,
{
    let mut system = model.clone();
    system.set_param(param, value)?;
    Ok(system)
}

fn check_param<M: Parameterized>(model: &M, param: &str) -> Result<()> {
    ensure_input!(
        model.param(param).is_some(),
        "Unknown sweep parameter '{}'. Available: {}.",
        param,
        model.param_names().join(", ")
    );
    Ok(())
}

/// Records the last `samples` values of one coordinate after a transient,
/// the classic bifurcation diagram of a map.
pub struct OrbitEvaluator<M> {
    model: M,
    param: String,
    initial: Vec<f64>,
    integration: IntegrationSettings,
    coordinate: usize,
    transient: usize,
    samples: usize,
}

impl<M> OrbitEvaluator<M>
where
    M: DynamicalSystem<f64> + Parameterized + Clone,
{
    pub fn new(
        model: M,
        param: &str,
        initial: Vec<f64>,
        integration: IntegrationSettings,
        coordinate: usize,
        transient: usize,
        samples: usize,
    ) -> Result<Self> {
        check_param(&model, param)?;
        let dim = check_dimension(&model, &initial)?;
        integration.validate()?;
        ensure_input!(
            coordinate < dim,
            "Coordinate {} is out of range for a {}-dimensional system.",
            coordinate,
            dim
        );
        ensure_input!(samples > 0, "Samples per point must be positive.");
        Ok(Self {
            model,
            param: param.to_string(),
            initial,
            integration,
            coordinate,
            transient,
            samples,
        })
    }
}

impl<M> PointEvaluator for OrbitEvaluator<M>
where
    M: DynamicalSystem<f64> + Parameterized + Clone,
{
    fn param_name(&self) -> &str {
        &self.param
    }

    fn evaluate(&mut self, param: f64, cancel: &CancelToken) -> Result<Vec<f64>> {
        cancel.check()?;
        let system = prepared(&self.model, &self.param, param)?;
        let orbit = sample_after_transient(
            &system,
            &self.initial,
            self.integration,
            self.transient,
            self.samples - 1,
        )?;
        if let Some(step) = orbit.diverged_at {
            return Err(AnalysisError::NumericOverflow {
                step: self.transient + step,
            });
        }
        Ok(orbit.coordinate(self.coordinate))
    }
}

/// Records successive extrema of one coordinate, e.g. z-maxima of a flow.
pub struct ExtremaEvaluator<M> {
    model: M,
    param: String,
    initial: Vec<f64>,
    settings: ExtremaSettings,
}

impl<M> ExtremaEvaluator<M>
where
    M: DynamicalSystem<f64> + Parameterized + Clone,
{
    pub fn new(model: M, param: &str, initial: Vec<f64>, settings: ExtremaSettings) -> Result<Self> {
        check_param(&model, param)?;
        let dim = check_dimension(&model, &initial)?;
        settings.validate(dim)?;
        Ok(Self {
            model,
            param: param.to_string(),
            initial,
            settings,
        })
    }
}

impl<M> PointEvaluator for ExtremaEvaluator<M>
where
    M: DynamicalSystem<f64> + Parameterized + Clone,
{
    fn param_name(&self) -> &str {
        &self.param
    }

    fn evaluate(&mut self, param: f64, cancel: &CancelToken) -> Result<Vec<f64>> {
        let system = prepared(&self.model, &self.param, param)?;
        collect_extrema(&system, &self.initial, &self.settings, cancel)
    }
}

/// Records the Lyapunov spectrum at every parameter value.
pub struct LyapunovEvaluator<M> {
    model: M,
    param: String,
    initial: Vec<f64>,
    settings: LyapunovSettings,
}

impl<M> LyapunovEvaluator<M>
where
    M: DynamicalSystem<f64> + DynamicalSystem<Dual> + Parameterized + Clone,
{
    pub fn new(
        model: M,
        param: &str,
        initial: Vec<f64>,
        settings: LyapunovSettings,
    ) -> Result<Self> {
        check_param(&model, param)?;
        check_dimension(&model, &initial)?;
        settings.validate()?;
        Ok(Self {
            model,
            param: param.to_string(),
            initial,
            settings,
        })
    }
}

impl<M> PointEvaluator for LyapunovEvaluator<M>
where
    M: DynamicalSystem<f64> + DynamicalSystem<Dual> + Parameterized + Clone,
{
    fn param_name(&self) -> &str {
        &self.param
    }

    fn evaluate(&mut self, param: f64, cancel: &CancelToken) -> Result<Vec<f64>> {
        let system = prepared(&self.model, &self.param, param)?;
        let result = lyapunov_spectrum(&system, &self.initial, &self.settings, &mut (), cancel)?;
        if result.status.is_complete() {
            Ok(result.exponents)
        } else {
            Err(AnalysisError::Cancelled)
        }
    }
}

/// Snapshot published after every evaluated point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepProgress {
    pub done: bool,
    pub current_point: usize,
    pub total_points: usize,
    pub gaps: usize,
    /// The record just produced, if any.
    pub latest: Option<BifurcationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub records: Vec<BifurcationRecord>,
    pub status: RunStatus,
}

/// Incremental sweep driver; call [`run_steps`](Self::run_steps) until [`is_done`](Self::is_done).
pub struct SweepRunner<E> {
    grid: ParameterGrid,
    evaluator: E,
    records: Vec<BifurcationRecord>,
    gaps: Vec<usize>,
    aborted: Option<String>,
}

impl<E: PointEvaluator> SweepRunner<E> {
    pub fn new(grid: ParameterGrid, evaluator: E) -> Result<Self> {
        Self::resume(grid, evaluator, Vec::new())
    }

    /// Continues a sweep from previously saved records; the next point
    /// evaluated is `records.len()`.
    pub fn resume(
        grid: ParameterGrid,
        evaluator: E,
        records: Vec<BifurcationRecord>,
    ) -> Result<Self> {
        grid.validate()?;
        ensure_input!(
            grid.param == evaluator.param_name(),
            "Grid sweeps '{}' but the evaluator varies '{}'.",
            grid.param,
            evaluator.param_name()
        );
        ensure_input!(
            records.len() <= grid.points,
            "Checkpoint holds {} records but the grid has only {} points.",
            records.len(),
            grid.points
        );
        let scale = grid.start.abs().max(grid.end.abs()).max(1.0);
        let mut gaps = Vec::new();
        for (index, record) in records.iter().enumerate() {
            let expected = grid.value(index);
            ensure_input!(
                (record.param - expected).abs() <= 1e-9 * scale,
                "Checkpoint record {} has parameter {} but the grid expects {}.",
                index,
                record.param,
                expected
            );
            if record.values.is_empty() {
                gaps.push(index);
            }
        }
        if !records.is_empty() {
            log::debug!(
                "Resuming sweep of '{}' at point {} of {}",
                grid.param,
                records.len(),
                grid.points
            );
        }
        Ok(Self {
            grid,
            evaluator,
            records,
            gaps,
            aborted: None,
        })
    }

    pub fn is_done(&self) -> bool {
        self.aborted.is_some() || self.records.len() >= self.grid.points
    }

    /// Evaluates up to `batch_size` further points.
    pub fn run_steps(&mut self, batch_size: usize, cancel: &CancelToken) -> SweepProgress {
        let mut latest = None;
        for _ in 0..batch_size {
            if self.is_done() {
                break;
            }
            if cancel.is_cancelled() {
                self.abort(AnalysisError::Cancelled);
                break;
            }
            let index = self.records.len();
            let param = self.grid.value(index);
            let values = match self.evaluator.evaluate(param, cancel) {
                Ok(values) => values,
                Err(err) if err.is_recoverable() => {
                    log::warn!(
                        "Sweep point {} ({} = {}) failed: {}",
                        index,
                        self.grid.param,
                        param,
                        err
                    );
                    self.gaps.push(index);
                    Vec::new()
                }
                Err(err) => {
                    self.abort(err);
                    break;
                }
            };
            let record = BifurcationRecord { param, values };
            latest = Some(record.clone());
            self.records.push(record);
        }
        SweepProgress {
            latest,
            ..self.progress()
        }
    }

    fn abort(&mut self, err: AnalysisError) {
        log::warn!(
            "Sweep of '{}' aborted at point {}: {}",
            self.grid.param,
            self.records.len(),
            err
        );
        self.aborted = Some(err.to_string());
    }

    pub fn progress(&self) -> SweepProgress {
        SweepProgress {
            done: self.is_done(),
            current_point: self.records.len(),
            total_points: self.grid.points,
            gaps: self.gaps.len(),
            latest: None,
        }
    }

    pub fn records(&self) -> &[BifurcationRecord] {
        &self.records
    }

    pub fn status(&self) -> RunStatus {
        match &self.aborted {
            Some(reason) => RunStatus::Aborted {
                reason: reason.clone(),
            },
            None if self.records.len() < self.grid.points => RunStatus::Aborted {
                reason: format!(
                    "Sweep stopped at point {} of {}.",
                    self.records.len(),
                    self.grid.points
                ),
            },
            None => RunStatus::from_gaps(self.gaps.clone()),
        }
    }

    pub fn into_outcome(self) -> SweepOutcome {
        let status = self.status();
        SweepOutcome {
            records: self.records,
            status,
        }
    }

    /// Runs to completion, reporting after every point.
    pub fn run(
        mut self,
        progress: &mut dyn ProgressSink<SweepProgress>,
        cancel: &CancelToken,
    ) -> SweepOutcome {
        while !self.is_done() {
            let snapshot = self.run_steps(1, cancel);
            progress.report(&snapshot);
        }
        self.into_outcome()
    }
}

/// Runs a sweep on a background thread.
pub fn spawn_sweep<E>(runner: SweepRunner<E>) -> TaskHandle<SweepProgress, SweepOutcome>
where
    E: PointEvaluator + Send + 'static,
{
    spawn_task(move |progress, cancel| runner.run(progress, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogisticMap, Rossler};
    use crate::table::{read_records, write_records};

    fn logistic_orbits() -> OrbitEvaluator<LogisticMap> {
        OrbitEvaluator::new(
            LogisticMap::default(),
            "r",
            vec![0.5],
            IntegrationSettings::map(),
            0,
            1_000,
            16,
        )
        .expect("evaluator")
    }

    #[test]
    fn grid_includes_both_ends() {
        let grid = ParameterGrid::new("r", 2.8, 4.0, 5).unwrap();
        let values: Vec<f64> = grid.values().collect();
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], 2.8);
        assert!((values[4] - 4.0).abs() < 1e-15);
        assert_eq!(ParameterGrid::new("r", 1.0, 2.0, 1).unwrap().value(0), 1.0);
        assert!(ParameterGrid::new("r", 1.0, 2.0, 0).is_err());
    }

    #[test]
    fn logistic_diagram_doubles_period() {
        let grid = ParameterGrid::new("r", 2.8, 3.2, 2).unwrap();
        let outcome = SweepRunner::new(grid, logistic_orbits())
            .unwrap()
            .run(&mut (), &CancelToken::new());
        assert!(outcome.status.is_complete());
        let distinct = |values: &[f64]| {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            sorted.dedup_by(|a, b| (*a - *b).abs() < 1e-6);
            sorted.len()
        };
        assert_eq!(distinct(&outcome.records[0].values), 1);
        assert_eq!(distinct(&outcome.records[1].values), 2);
    }

    #[test]
    fn resumed_sweep_matches_uninterrupted_run() {
        let grid = ParameterGrid::new("r", 2.8, 4.0, 100).unwrap();
        let full = SweepRunner::new(grid.clone(), logistic_orbits())
            .unwrap()
            .run(&mut (), &CancelToken::new());

        let mut first_half = SweepRunner::new(grid.clone(), logistic_orbits()).unwrap();
        first_half.run_steps(50, &CancelToken::new());
        assert!(!first_half.is_done());
        let mut checkpoint = Vec::new();
        write_records(&mut checkpoint, first_half.records()).unwrap();

        let restored = read_records(checkpoint.as_slice()).unwrap();
        assert_eq!(restored.len(), 50);
        let resumed = SweepRunner::resume(grid, logistic_orbits(), restored)
            .unwrap()
            .run(&mut (), &CancelToken::new());

        assert_eq!(resumed.records, full.records);
        assert_eq!(resumed.status, full.status);
    }

    #[test]
    fn failed_points_become_gaps() {
        let settings = ExtremaSettings {
            integration: IntegrationSettings::map(),
            transient: 100,
            target: 4,
            max_steps: 500,
            ..ExtremaSettings::default()
        };
        let evaluator =
            ExtremaEvaluator::new(LogisticMap::default(), "r", vec![0.3], settings).unwrap();
        let grid = ParameterGrid::new("r", 3.5, 4.5, 3).unwrap();
        let outcome = SweepRunner::new(grid, evaluator)
            .unwrap()
            .run(&mut (), &CancelToken::new());
        // Above r = 4 the orbit escapes the unit interval and overflows.
        assert_eq!(outcome.status, RunStatus::Partial { gaps: vec![2] });
        assert_eq!(outcome.records.len(), 3);
        assert!(outcome.records[2].values.is_empty());
        assert_eq!(outcome.records[0].values.len(), 4);
    }

    #[test]
    fn setup_errors_fail_before_any_work() {
        let err = OrbitEvaluator::new(
            LogisticMap::default(),
            "rho",
            vec![0.5],
            IntegrationSettings::map(),
            0,
            10,
            10,
        )
        .err()
        .expect("unknown parameter");
        assert!(format!("{err}").contains("Unknown sweep parameter"));

        let grid = ParameterGrid::new("r", 2.8, 4.0, 3).unwrap();
        let bad_checkpoint = vec![BifurcationRecord {
            param: 3.0,
            values: vec![0.5],
        }];
        let err = SweepRunner::resume(grid, logistic_orbits(), bad_checkpoint)
            .err()
            .expect("mismatched checkpoint");
        assert!(format!("{err}").contains("Checkpoint record 0"));
    }

    #[test]
    fn rossler_extrema_sweep_records_maxima() {
        let settings = ExtremaSettings {
            coordinate: 0,
            transient: 5_000,
            target: 8,
            ..ExtremaSettings::default()
        };
        let evaluator =
            ExtremaEvaluator::new(Rossler::default(), "c", vec![1.0, 1.0, 0.0], settings).unwrap();
        let grid = ParameterGrid::new("c", 4.0, 6.0, 3).unwrap();
        let mut reports = 0;
        let outcome = SweepRunner::new(grid, evaluator).unwrap().run(
            &mut crate::task::FnSink(|_: &SweepProgress| reports += 1),
            &CancelToken::new(),
        );
        assert!(outcome.status.is_complete());
        assert_eq!(reports, 3);
        assert!(outcome.records.iter().all(|r| r.values.len() == 8));
    }

    #[test]
    fn lyapunov_sweep_tracks_chaos_onset() {
        let settings = LyapunovSettings {
            integration: IntegrationSettings::map(),
            transient: 1_000,
            iterations: 20_000,
            steps_per_iteration: 1,
            ..LyapunovSettings::default()
        };
        let evaluator =
            LyapunovEvaluator::new(LogisticMap::default(), "r", vec![0.3], settings).unwrap();
        let grid = ParameterGrid::new("r", 3.2, 4.0, 2).unwrap();
        let outcome = SweepRunner::new(grid, evaluator)
            .unwrap()
            .run(&mut (), &CancelToken::new());
        assert!(outcome.status.is_complete());
        assert!(outcome.records[0].values[0] < 0.0);
        let chaotic = outcome.records[1].values[0];
        assert!((chaotic - std::f64::consts::LN_2).abs() < 0.05, "lambda = {chaotic}");
    }

    #[test]
    fn background_sweep_can_be_cancelled() {
        let grid = ParameterGrid::new("r", 2.8, 4.0, 100_000).unwrap();
        let runner = SweepRunner::new(grid, logistic_orbits()).unwrap();
        let handle = spawn_sweep(runner);
        handle.cancel();
        let outcome = handle.wait().expect("outcome");
        assert!(matches!(outcome.status, RunStatus::Aborted { .. }));
        assert!(outcome.records.len() < 100_000);
    }
}
