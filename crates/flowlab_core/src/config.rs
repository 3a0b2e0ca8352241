//! Experiment descriptions loaded from JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::bisection::{BisectionSettings, PeriodSettings};
use crate::extrema::ExtremaSettings;
use crate::lyapunov::LyapunovSettings;
use crate::manifold::ManifoldSettings;
use crate::models::Model;
use crate::orbit::IntegrationSettings;
use crate::poincare::PoincareSettings;
use crate::sweep::ParameterGrid;

/// Visible window of a 2D plot, handed to the renderer as is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlotBounds {
    pub x0: f64,
    pub xf: f64,
    pub y0: f64,
    pub yf: f64,
}

impl Default for PlotBounds {
    fn default() -> Self {
        Self {
            x0: -1.0,
            xf: 1.0,
            y0: -1.0,
            yf: 1.0,
        }
    }
}

impl PlotBounds {
    pub fn validate(&self) -> Result<()> {
        if ![self.x0, self.xf, self.y0, self.yf].iter().all(|v| v.is_finite()) {
            bail!("Plot bounds must be finite.");
        }
        if self.x0 >= self.xf {
            bail!("Plot bounds cross: x0 ({}) must be below xf ({}).", self.x0, self.xf);
        }
        if self.y0 >= self.yf {
            bail!("Plot bounds cross: y0 ({}) must be below yf ({}).", self.y0, self.yf);
        }
        Ok(())
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x0 && x <= self.xf && y >= self.y0 && y <= self.yf
    }
}

/// What to compute for the configured model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Experiment {
    Trajectory {
        #[serde(default)]
        integration: IntegrationSettings,
        #[serde(default)]
        transient: usize,
        steps: usize,
    },
    Extrema {
        #[serde(default)]
        settings: ExtremaSettings,
    },
    Poincare {
        #[serde(default)]
        settings: PoincareSettings,
        count: usize,
    },
    Stroboscopic {
        period: f64,
        steps_per_period: usize,
        #[serde(default)]
        transient_periods: usize,
        count: usize,
    },
    Lyapunov {
        #[serde(default)]
        settings: LyapunovSettings,
    },
    Manifold {
        #[serde(default)]
        settings: ManifoldSettings,
        /// Starting guess for the saddle; refined by Newton's method.
        fixed_point_guess: Vec<f64>,
    },
    Bifurcation {
        grid: ParameterGrid,
        #[serde(default)]
        settings: ExtremaSettings,
        /// Checkpoint table; an existing file resumes the sweep.
        #[serde(default)]
        checkpoint: Option<PathBuf>,
        /// Points between checkpoint writes.
        #[serde(default = "default_checkpoint_every")]
        checkpoint_every: usize,
    },
    OrbitDiagram {
        grid: ParameterGrid,
        /// Step size and start time; defaults to unit steps for maps and
        /// `dt = 0.01` for flows. The stepper always follows the model.
        #[serde(default)]
        integration: Option<IntegrationSettings>,
        #[serde(default)]
        transient: usize,
        samples: usize,
        #[serde(default)]
        coordinate: usize,
        #[serde(default)]
        checkpoint: Option<PathBuf>,
        #[serde(default = "default_checkpoint_every")]
        checkpoint_every: usize,
    },
    LyapunovSweep {
        grid: ParameterGrid,
        #[serde(default)]
        settings: LyapunovSettings,
        #[serde(default)]
        checkpoint: Option<PathBuf>,
        #[serde(default = "default_checkpoint_every")]
        checkpoint_every: usize,
    },
    BifurcationPoint {
        param: String,
        period: usize,
        low: f64,
        high: f64,
        #[serde(default)]
        bisection: BisectionSettings,
        #[serde(default)]
        period_settings: PeriodSettings,
    },
}

fn default_checkpoint_every() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub model: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    pub initial: Vec<f64>,
    pub experiment: Experiment,
    #[serde(default)]
    pub bounds: Option<PlotBounds>,
}

impl ExperimentConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid experiment JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read experiment {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("In experiment {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize experiment")
    }

    /// Instantiates the model with its configured parameters.
    pub fn build_model(&self) -> Result<Model> {
        Model::from_name(&self.model, &self.params)
            .with_context(|| format!("Cannot build model '{}'", self.model))
    }

    /// Checks everything that can be checked without running the experiment.
    pub fn validate(&self) -> Result<()> {
        let model = self.build_model()?;
        let dim = crate::traits::DynamicalSystem::<f64>::dimension(&model);
        if self.initial.len() != dim {
            bail!(
                "Initial state has {} entries but model '{}' has dimension {}.",
                self.initial.len(),
                self.model,
                dim
            );
        }
        if let Some(bounds) = &self.bounds {
            bounds.validate()?;
        }

        match &self.experiment {
            Experiment::Trajectory { integration, .. } => integration.validate()?,
            Experiment::Extrema { settings } => settings.validate(dim)?,
            Experiment::Poincare { settings, count } => {
                settings.integration.validate()?;
                if *count == 0 {
                    bail!("Poincaré experiment needs a positive crossing count.");
                }
            }
            Experiment::Stroboscopic {
                period,
                steps_per_period,
                count,
                ..
            } => {
                if !(period.is_finite() && *period > 0.0) || *steps_per_period == 0 || *count == 0
                {
                    bail!("Stroboscopic section needs a positive period, steps_per_period and count.");
                }
            }
            Experiment::Lyapunov { settings } | Experiment::LyapunovSweep { settings, .. } => {
                settings.validate()?
            }
            Experiment::Manifold {
                settings,
                fixed_point_guess,
            } => {
                settings.validate()?;
                if model.as_invertible().is_none() {
                    bail!("Model '{}' has no inverse; manifolds need an invertible map.", self.model);
                }
                if fixed_point_guess.len() != dim {
                    bail!("Fixed point guess must have {} entries.", dim);
                }
            }
            Experiment::Bifurcation { settings, .. } => settings.validate(dim)?,
            Experiment::OrbitDiagram {
                integration,
                samples,
                coordinate,
                ..
            } => {
                if let Some(integration) = integration {
                    integration.validate()?;
                }
                if *samples == 0 || *coordinate >= dim {
                    bail!("Orbit diagram needs samples > 0 and a coordinate below {}.", dim);
                }
            }
            Experiment::BifurcationPoint {
                param, low, high, ..
            } => {
                if model.kind() != crate::equilibrium::SystemKind::Map {
                    bail!("Bifurcation point search estimates map periods; '{}' is a flow.", self.model);
                }
                if crate::traits::Parameterized::param(&model, param).is_none() {
                    bail!("Unknown parameter '{}' for model '{}'.", param, self.model);
                }
                if low.is_nan() || high.is_nan() || low >= high {
                    bail!("Bifurcation bracket must satisfy low < high.");
                }
            }
        }

        if let Experiment::Bifurcation { grid, checkpoint_every, .. }
        | Experiment::OrbitDiagram { grid, checkpoint_every, .. }
        | Experiment::LyapunovSweep { grid, checkpoint_every, .. } = &self.experiment
        {
            grid.validate()?;
            if *checkpoint_every == 0 {
                bail!("checkpoint_every must be positive.");
            }
        }
        Ok(())
    }
}
