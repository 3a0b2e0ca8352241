//! Runs an [`ExperimentConfig`] end to end.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::bisection::{find_bifurcation, map_period_oracle};
use crate::config::{Experiment, ExperimentConfig};
use crate::equilibrium::{solve_equilibrium, NewtonSettings};
use crate::extrema::collect_extrema;
use crate::lyapunov::{lyapunov_spectrum, LyapunovResult};
use crate::manifold::{saddle_directions, trace_manifold, ManifoldCurve};
use crate::orbit::{sample_after_transient, IntegrationSettings, Trajectory};
use crate::poincare::{collect_crossings, stroboscopic_section, Crossing};
use crate::sweep::{
    ExtremaEvaluator, LyapunovEvaluator, OrbitEvaluator, PointEvaluator, SweepOutcome,
    SweepRunner,
};
use crate::table::{load_checkpoint, save_checkpoint};
use crate::task::{CancelToken, FnSink, ProgressSink};

/// Coarse progress shared by every experiment kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExperimentProgress {
    pub done: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum ExperimentOutput {
    Trajectory(Trajectory),
    Extrema(Vec<f64>),
    Crossings(Vec<Crossing>),
    Samples(Vec<Vec<f64>>),
    Lyapunov(LyapunovResult),
    Manifold(Vec<ManifoldCurve>),
    Sweep(SweepOutcome),
    BifurcationPoint(f64),
}

/// Runs `config` to completion. Long experiments report through `progress`
/// and stop early once `cancel` fires.
pub fn run_experiment(
    config: &ExperimentConfig,
    progress: &mut dyn ProgressSink<ExperimentProgress>,
    cancel: &CancelToken,
) -> Result<ExperimentOutput> {
    config.validate()?;
    let model = config.build_model()?;
    let initial = config.initial.as_slice();
    let stepper = model.stepper_kind();
    log::debug!("Running {:?} on {}", config.experiment, config.model);

    let output = match &config.experiment {
        Experiment::Trajectory {
            integration,
            transient,
            steps,
        } => {
            let integration = IntegrationSettings {
                stepper,
                ..*integration
            };
            ExperimentOutput::Trajectory(sample_after_transient(
                &model,
                initial,
                integration,
                *transient,
                *steps,
            )?)
        }
        Experiment::Extrema { settings } => {
            let mut settings = *settings;
            settings.integration.stepper = stepper;
            ExperimentOutput::Extrema(collect_extrema(&model, initial, &settings, cancel)?)
        }
        Experiment::Poincare { settings, count } => ExperimentOutput::Crossings(collect_crossings(
            &model, initial, settings, *count, cancel,
        )?),
        Experiment::Stroboscopic {
            period,
            steps_per_period,
            transient_periods,
            count,
        } => ExperimentOutput::Samples(stroboscopic_section(
            &model,
            initial,
            *period,
            *steps_per_period,
            *transient_periods,
            *count,
            cancel,
        )?),
        Experiment::Lyapunov { settings } => {
            let mut settings = *settings;
            settings.integration.stepper = stepper;
            let total = settings.iterations;
            let mut sink = FnSink(|p: &crate::lyapunov::LyapunovProgress| {
                progress.report(&ExperimentProgress {
                    done: p.iteration,
                    total,
                })
            });
            ExperimentOutput::Lyapunov(lyapunov_spectrum(
                &model, initial, &settings, &mut sink, cancel,
            )?)
        }
        Experiment::Manifold {
            settings,
            fixed_point_guess,
        } => {
            let map = model
                .as_invertible()
                .ok_or_else(|| anyhow!("Model '{}' has no inverse.", config.model))?;
            let saddle = solve_equilibrium(
                &model,
                model.kind(),
                fixed_point_guess,
                NewtonSettings::default(),
            )
            .context("Failed to locate the saddle point")?;
            let fixed_point = [saddle.state[0], saddle.state[1]];
            let directions = saddle_directions(&model, fixed_point)?;
            let total = settings.max_points;
            let mut sink = FnSink(|p: &crate::manifold::ManifoldProgress| {
                progress.report(&ExperimentProgress {
                    done: p.points,
                    total,
                })
            });
            ExperimentOutput::Manifold(trace_manifold(
                map,
                fixed_point,
                directions.for_stability(settings.stability),
                settings,
                &mut sink,
                cancel,
            )?)
        }
        Experiment::Bifurcation {
            grid,
            settings,
            checkpoint,
            checkpoint_every,
        } => {
            let mut settings = *settings;
            settings.integration.stepper = stepper;
            let evaluator =
                ExtremaEvaluator::new(model, &grid.param, config.initial.clone(), settings)?;
            let records = match checkpoint {
                Some(path) => load_checkpoint(path)?,
                None => Vec::new(),
            };
            let runner = SweepRunner::resume(grid.clone(), evaluator, records)?;
            ExperimentOutput::Sweep(run_checkpointed(
                runner,
                checkpoint.as_deref(),
                *checkpoint_every,
                progress,
                cancel,
            )?)
        }
        Experiment::OrbitDiagram {
            grid,
            integration,
            transient,
            samples,
            coordinate,
            checkpoint,
            checkpoint_every,
        } => {
            let integration = IntegrationSettings {
                stepper,
                ..integration.unwrap_or_else(|| IntegrationSettings::for_stepper(stepper))
            };
            let evaluator = OrbitEvaluator::new(
                model,
                &grid.param,
                config.initial.clone(),
                integration,
                *coordinate,
                *transient,
                *samples,
            )?;
            let records = match checkpoint {
                Some(path) => load_checkpoint(path)?,
                None => Vec::new(),
            };
            let runner = SweepRunner::resume(grid.clone(), evaluator, records)?;
            ExperimentOutput::Sweep(run_checkpointed(
                runner,
                checkpoint.as_deref(),
                *checkpoint_every,
                progress,
                cancel,
            )?)
        }
        Experiment::LyapunovSweep {
            grid,
            settings,
            checkpoint,
            checkpoint_every,
        } => {
            let mut settings = *settings;
            settings.integration.stepper = stepper;
            let evaluator =
                LyapunovEvaluator::new(model, &grid.param, config.initial.clone(), settings)?;
            let records = match checkpoint {
                Some(path) => load_checkpoint(path)?,
                None => Vec::new(),
            };
            let runner = SweepRunner::resume(grid.clone(), evaluator, records)?;
            ExperimentOutput::Sweep(run_checkpointed(
                runner,
                checkpoint.as_deref(),
                *checkpoint_every,
                progress,
                cancel,
            )?)
        }
        Experiment::BifurcationPoint {
            param,
            period,
            low,
            high,
            bisection,
            period_settings,
        } => {
            let oracle = map_period_oracle(model, param, config.initial.clone(), *period_settings);
            ExperimentOutput::BifurcationPoint(find_bifurcation(
                *period, *low, *high, oracle, bisection, cancel,
            )?)
        }
    };
    Ok(output)
}

/// Drives a sweep, writing the checkpoint every `every` points and once more at the end.
fn run_checkpointed<E: PointEvaluator>(
    mut runner: SweepRunner<E>,
    checkpoint: Option<&std::path::Path>,
    every: usize,
    progress: &mut dyn ProgressSink<ExperimentProgress>,
    cancel: &CancelToken,
) -> Result<SweepOutcome> {
    while !runner.is_done() {
        let snapshot = runner.run_steps(every.max(1), cancel);
        progress.report(&ExperimentProgress {
            done: snapshot.current_point,
            total: snapshot.total_points,
        });
        if let Some(path) = checkpoint {
            save_checkpoint(path, runner.records())?;
        }
    }
    Ok(runner.into_outcome())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RunStatus;

    fn config(json: &str) -> ExperimentConfig {
        ExperimentConfig::from_json(json).expect("config")
    }

    #[test]
    fn runs_henon_manifold_from_guess() {
        let config = config(
            r#"{
                "model": "henon",
                "initial": [0.0, 0.0],
                "experiment": {
                    "kind": "manifold",
                    "fixed_point_guess": [0.6, 0.2],
                    "settings": { "direction": "plus", "max_points": 200 }
                }
            }"#,
        );
        match run_experiment(&config, &mut (), &CancelToken::new()).expect("run") {
            ExperimentOutput::Manifold(curves) => {
                assert_eq!(curves.len(), 1);
                assert_eq!(curves[0].points.len(), 200);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn map_trajectory_uses_discrete_stepper() {
        let config = config(
            r#"{
                "model": "logistic",
                "params": { "r": 2.5 },
                "initial": [0.2],
                "experiment": { "kind": "trajectory", "transient": 500, "steps": 3 }
            }"#,
        );
        match run_experiment(&config, &mut (), &CancelToken::new()).expect("run") {
            ExperimentOutput::Trajectory(traj) => {
                assert_eq!(traj.len(), 4);
                assert!(traj.coordinate(0).iter().all(|x| (x - 0.6).abs() < 1e-9));
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn checkpointed_orbit_diagram_resumes_from_file() {
        let path = std::env::temp_dir().join(format!(
            "flowlab_experiment_checkpoint_{}.tsv",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();
        let json = format!(
            r#"{{
                "model": "logistic",
                "initial": [0.5],
                "experiment": {{
                    "kind": "orbit_diagram",
                    "grid": {{ "param": "r", "start": 2.8, "end": 4.0, "points": 20 }},
                    "transient": 200,
                    "samples": 8,
                    "checkpoint": {:?},
                    "checkpoint_every": 5
                }}
            }}"#,
            path.display().to_string()
        );
        let config = config(&json);

        let mut reports = Vec::new();
        let first = run_experiment(
            &config,
            &mut FnSink(|p: &ExperimentProgress| reports.push(p.done)),
            &CancelToken::new(),
        )
        .expect("first run");
        assert_eq!(reports, vec![5, 10, 15, 20]);

        // A second run finds a complete checkpoint and has nothing left to evaluate.
        let second = run_experiment(&config, &mut (), &CancelToken::new()).expect("second run");
        std::fs::remove_file(&path).ok();
        match (first, second) {
            (ExperimentOutput::Sweep(a), ExperimentOutput::Sweep(b)) => {
                assert_eq!(a.status, RunStatus::Complete);
                assert_eq!(a.records, b.records);
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn lyapunov_sweep_resumes_from_checkpoint() {
        let path = std::env::temp_dir().join(format!(
            "flowlab_lyapunov_checkpoint_{}.tsv",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();
        let json = format!(
            r#"{{
                "model": "logistic",
                "initial": [0.3],
                "experiment": {{
                    "kind": "lyapunov_sweep",
                    "grid": {{ "param": "r", "start": 3.0, "end": 4.0, "points": 6 }},
                    "settings": {{ "transient": 100, "iterations": 500, "steps_per_iteration": 1 }},
                    "checkpoint": {:?},
                    "checkpoint_every": 2
                }}
            }}"#,
            path.display().to_string()
        );
        let config = config(&json);

        // Stop after the first batch; the checkpoint then holds two rows.
        let cancel = CancelToken::new();
        let interrupted = run_experiment(
            &config,
            &mut FnSink(|_: &ExperimentProgress| cancel.cancel()),
            &cancel,
        )
        .expect("interrupted run");
        match interrupted {
            ExperimentOutput::Sweep(outcome) => {
                assert_eq!(outcome.records.len(), 2);
                assert!(matches!(outcome.status, RunStatus::Aborted { .. }));
            }
            other => panic!("unexpected output {other:?}"),
        }
        assert_eq!(load_checkpoint(&path).expect("checkpoint").len(), 2);

        let resumed = run_experiment(&config, &mut (), &CancelToken::new()).expect("resume");
        std::fs::remove_file(&path).ok();
        let fresh = {
            let mut config = config.clone();
            if let Experiment::LyapunovSweep { checkpoint, .. } = &mut config.experiment {
                *checkpoint = None;
            }
            run_experiment(&config, &mut (), &CancelToken::new()).expect("fresh")
        };
        match (resumed, fresh) {
            (ExperimentOutput::Sweep(a), ExperimentOutput::Sweep(b)) => {
                assert_eq!(a.status, RunStatus::Complete);
                assert_eq!(a.records, b.records);
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn flow_orbit_diagram_uses_configured_step() {
        let config = config(
            r#"{
                "model": "rossler",
                "initial": [1.0, 1.0, 0.0],
                "experiment": {
                    "kind": "orbit_diagram",
                    "grid": { "param": "c", "start": 4.0, "end": 5.0, "points": 2 },
                    "integration": { "dt": 0.02 },
                    "transient": 100,
                    "samples": 4
                }
            }"#,
        );
        let output = run_experiment(&config, &mut (), &CancelToken::new()).expect("run");
        let outcome = match output {
            ExperimentOutput::Sweep(outcome) => outcome,
            other => panic!("unexpected output {other:?}"),
        };
        assert_eq!(outcome.status, RunStatus::Complete);
        // Same samples as a direct run with dt = 0.02 from the same start.
        let mut model = crate::models::Model::from_name("rossler", &Default::default()).unwrap();
        crate::traits::Parameterized::set_param(&mut model, "c", 4.0).unwrap();
        let direct = sample_after_transient(
            &model,
            &[1.0, 1.0, 0.0],
            IntegrationSettings {
                dt: 0.02,
                ..IntegrationSettings::default()
            },
            100,
            3,
        )
        .unwrap();
        assert_eq!(outcome.records[0].values, direct.coordinate(0));
    }

    #[test]
    fn bifurcation_point_of_logistic_map() {
        let config = config(
            r#"{
                "model": "logistic",
                "initial": [0.5],
                "experiment": {
                    "kind": "bifurcation_point",
                    "param": "r",
                    "period": 2,
                    "low": 3.2,
                    "high": 3.5,
                    "bisection": { "tolerance": 1e-4 }
                }
            }"#,
        );
        match run_experiment(&config, &mut (), &CancelToken::new()).expect("run") {
            ExperimentOutput::BifurcationPoint(r) => {
                // Period two gives way to period four at r = 1 + sqrt(6).
                assert!((r - (1.0 + 6f64.sqrt())).abs() < 0.01, "r = {r}");
            }
            other => panic!("unexpected output {other:?}"),
        }
    }
}
