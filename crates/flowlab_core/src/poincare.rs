//! Poincaré sections of flows.
//!
//! A section is described by a signed distance that increases through zero
//! on a positive crossing. The finder steps with the fixed integration step
//! until the sign changes in the positive direction, then bisects the length
//! of the final step until the crossing state lies within tolerance of the
//! section.

use std::f64::consts::{PI, TAU};

use serde::{Deserialize, Serialize};

use crate::error::{ensure_input, AnalysisError, Result};
use crate::orbit::{advance, check_dimension, is_finite_state, IntegrationSettings};
use crate::solvers::{StepperKind, RK4};
use crate::task::CancelToken;
use crate::traits::{DynamicalSystem, Steppable};

const REFINE_MAX_ITERS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Section {
    /// Half-plane at polar angle `theta` in the (x0, x1) plane, crossed counter-clockwise.
    Angle { theta: f64 },
    /// Hyperplane `normal · x = offset`, crossed along `normal`.
    Plane { normal: Vec<f64>, offset: f64 },
}

impl Section {
    /// Signed distance from the section; angles are wrapped into `(-π, π]`.
    pub fn distance(&self, state: &[f64]) -> f64 {
        match self {
            Section::Angle { theta } => wrap_angle(state[1].atan2(state[0]) - theta),
            Section::Plane { normal, offset } => {
                normal.iter().zip(state).map(|(n, x)| n * x).sum::<f64>() - offset
            }
        }
    }

    /// Rate of change of the distance along the flow.
    pub fn crossing_speed(&self, state: &[f64], velocity: &[f64]) -> f64 {
        match self {
            Section::Angle { .. } => {
                let (x, y) = (state[0], state[1]);
                let r2 = x * x + y * y;
                if r2 == 0.0 {
                    0.0
                } else {
                    (x * velocity[1] - y * velocity[0]) / r2
                }
            }
            Section::Plane { normal, .. } => {
                normal.iter().zip(velocity).map(|(n, v)| n * v).sum()
            }
        }
    }

    fn validate(&self, dim: usize) -> Result<()> {
        match self {
            Section::Angle { theta } => {
                ensure_input!(dim >= 2, "Angular sections need at least two coordinates.");
                ensure_input!(theta.is_finite(), "Section angle must be finite.");
            }
            Section::Plane { normal, offset } => {
                ensure_input!(
                    normal.len() == dim,
                    "Section normal has dimension {}, system has {}.",
                    normal.len(),
                    dim
                );
                ensure_input!(
                    normal.iter().any(|n| *n != 0.0) && offset.is_finite(),
                    "Section normal must be non-zero and offset finite."
                );
            }
        }
        Ok(())
    }

    /// Jumps larger than this are wrap-arounds of the angle, not crossings.
    fn max_jump(&self) -> f64 {
        match self {
            Section::Angle { .. } => PI / 2.0,
            Section::Plane { .. } => f64::INFINITY,
        }
    }
}

fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoincareSettings {
    pub integration: IntegrationSettings,
    pub section: Section,
    pub tolerance: f64,
    pub transient: usize,
    /// Step budget for each individual crossing search.
    pub max_steps_per_crossing: usize,
}

impl Default for PoincareSettings {
    fn default() -> Self {
        Self {
            integration: IntegrationSettings::default(),
            section: Section::Angle { theta: 0.0 },
            tolerance: 1e-4,
            transient: 0,
            max_steps_per_crossing: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crossing {
    pub time: f64,
    pub state: Vec<f64>,
}

/// Running position of a section search: the trajectory can be resumed
/// from the last crossing.
struct SectionCursor<'a, S: ?Sized> {
    system: &'a S,
    settings: &'a PoincareSettings,
    stepper: RK4<f64>,
    velocity: Vec<f64>,
    state: Vec<f64>,
    t: f64,
    steps: usize,
}

impl<'a, S> SectionCursor<'a, S>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    fn new(system: &'a S, initial: &[f64], settings: &'a PoincareSettings) -> Result<Self> {
        let dim = check_dimension(system, initial)?;
        settings.integration.validate()?;
        ensure_input!(
            settings.integration.stepper == StepperKind::Rk4,
            "Poincaré sections are defined for flows only."
        );
        settings.section.validate(dim)?;
        ensure_input!(settings.tolerance > 0.0, "Tolerance must be positive.");
        ensure_input!(
            settings.max_steps_per_crossing > 0,
            "max_steps_per_crossing must be positive."
        );

        let mut stepper = settings.integration.stepper.build(dim);
        let mut state = initial.to_vec();
        let mut t = settings.integration.t0;
        advance(
            system,
            &mut stepper,
            &mut t,
            &mut state,
            settings.integration.dt,
            settings.transient,
        )?;

        Ok(Self {
            system,
            settings,
            stepper: RK4::new(dim),
            velocity: vec![0.0; dim],
            state,
            t,
            steps: settings.transient,
        })
    }

    fn next_crossing(&mut self, cancel: &CancelToken) -> Result<Crossing> {
        let section = &self.settings.section;
        let dt = self.settings.integration.dt;
        let mut prev_distance = section.distance(&self.state);

        for step in 0..self.settings.max_steps_per_crossing {
            if step % 4096 == 0 {
                cancel.check()?;
            }
            let before = self.state.clone();
            let t_before = self.t;
            self.stepper.step(&self.system, &mut self.t, &mut self.state, dt);
            self.steps += 1;
            if !is_finite_state(&self.state) {
                return Err(AnalysisError::NumericOverflow { step: self.steps });
            }

            let distance = section.distance(&self.state);
            let crossed = prev_distance < 0.0
                && distance >= 0.0
                && distance - prev_distance < section.max_jump();
            prev_distance = distance;
            if !crossed {
                continue;
            }

            self.system.apply(self.t, &self.state, &mut self.velocity);
            if section.crossing_speed(&self.state, &self.velocity) <= 0.0 {
                continue;
            }
            return self.refine(&before, t_before);
        }

        Err(AnalysisError::NonConvergence {
            operation: "Poincaré crossing search",
            limit: self.settings.max_steps_per_crossing,
        })
    }

    /// Bisects the last step length `h ∈ [0, dt]` until the partial step lands on the section.
    ///
    /// The cursor itself stays at the end of the full step, past the section,
    /// so the next search cannot find the same crossing again.
    fn refine(&mut self, before: &[f64], t_before: f64) -> Result<Crossing> {
        let section = &self.settings.section;
        let tolerance = self.settings.tolerance;
        let mut lo = 0.0;
        let mut hi = self.t - t_before;
        let mut h = hi;
        let mut candidate = self.state.clone();
        let mut candidate_t = self.t;

        for _ in 0..REFINE_MAX_ITERS {
            let distance = section.distance(&candidate);
            if distance.abs() <= tolerance {
                return Ok(Crossing {
                    time: candidate_t,
                    state: candidate,
                });
            }
            if distance < 0.0 {
                lo = h;
            } else {
                hi = h;
            }
            h = 0.5 * (lo + hi);
            candidate.copy_from_slice(before);
            candidate_t = t_before;
            self.stepper
                .step(&self.system, &mut candidate_t, &mut candidate, h);
        }

        Err(AnalysisError::NonConvergence {
            operation: "Poincaré crossing refinement",
            limit: REFINE_MAX_ITERS,
        })
    }
}

/// The next positive crossing of the section starting from `initial`.
pub fn find_crossing<S>(
    system: &S,
    initial: &[f64],
    settings: &PoincareSettings,
    cancel: &CancelToken,
) -> Result<Crossing>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    SectionCursor::new(system, initial, settings)?.next_crossing(cancel)
}

/// `count` successive positive crossings along one trajectory.
pub fn collect_crossings<S>(
    system: &S,
    initial: &[f64],
    settings: &PoincareSettings,
    count: usize,
    cancel: &CancelToken,
) -> Result<Vec<Crossing>>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    let mut cursor = SectionCursor::new(system, initial, settings)?;
    let mut crossings = Vec::with_capacity(count);
    for _ in 0..count {
        crossings.push(cursor.next_crossing(cancel)?);
    }
    Ok(crossings)
}

/// First-return pairs `(c_n, c_{n+1})` of one coordinate of successive crossings.
pub fn first_return_pairs(crossings: &[Crossing], coordinate: usize) -> Vec<[f64; 2]> {
    crossings
        .windows(2)
        .map(|w| [w[0].state[coordinate], w[1].state[coordinate]])
        .collect()
}

/// Radial distance in the (x0, x1) plane of each crossing, the usual
/// coordinate for return maps on an angular section.
pub fn radii(crossings: &[Crossing]) -> Vec<f64> {
    crossings
        .iter()
        .map(|c| c.state[0].hypot(c.state[1]))
        .collect()
}

/// Samples a periodically forced flow once per forcing period.
///
/// `steps_per_period` RK4 steps make up one period, so the sampling phase
/// never drifts.
pub fn stroboscopic_section<S>(
    system: &S,
    initial: &[f64],
    period: f64,
    steps_per_period: usize,
    transient_periods: usize,
    count: usize,
    cancel: &CancelToken,
) -> Result<Vec<Vec<f64>>>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    let dim = check_dimension(system, initial)?;
    ensure_input!(
        period.is_finite() && period > 0.0,
        "Forcing period must be positive."
    );
    ensure_input!(steps_per_period > 0, "steps_per_period must be positive.");

    let dt = period / steps_per_period as f64;
    let mut stepper = StepperKind::Rk4.build(dim);
    let mut state = initial.to_vec();
    let mut samples = Vec::with_capacity(count);

    for k in 0..transient_periods + count {
        cancel.check()?;
        // Restart the clock from the period count so rounding never accumulates.
        let mut t = k as f64 * period;
        advance(system, &mut stepper, &mut t, &mut state, dt, steps_per_period)?;
        if k >= transient_periods {
            samples.push(state.clone());
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Duffing, HarmonicOscillator, Rossler};

    #[test]
    fn wrap_angle_stays_in_half_open_interval() {
        assert!((wrap_angle(3.0 * PI) - PI).abs() < 1e-12);
        assert!((wrap_angle(-PI) - PI).abs() < 1e-12);
        assert!((wrap_angle(0.5) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn rotation_crosses_positive_x_axis_each_period() {
        let ccw = crate::traits::FnSystem::new(2, |_t, x: &[f64], out: &mut [f64]| {
            out[0] = -x[1];
            out[1] = x[0];
        });
        let settings = PoincareSettings {
            section: Section::Angle { theta: 0.0 },
            ..PoincareSettings::default()
        };
        let crossings =
            collect_crossings(&ccw, &[0.0, -1.0], &settings, 3, &CancelToken::new()).unwrap();
        assert_eq!(crossings.len(), 3);
        for (k, crossing) in crossings.iter().enumerate() {
            assert!(settings.section.distance(&crossing.state).abs() <= 1e-4);
            assert!((crossing.state[0] - 1.0).abs() < 1e-6);
            let expected = PI / 2.0 + k as f64 * TAU;
            assert!((crossing.time - expected).abs() < 1e-3, "t = {}", crossing.time);
        }
    }

    #[test]
    fn clockwise_rotation_never_crosses_positively() {
        let settings = PoincareSettings {
            max_steps_per_crossing: 5_000,
            ..PoincareSettings::default()
        };
        let err = find_crossing(
            &HarmonicOscillator::default(),
            &[1.0, 0.5],
            &settings,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::NonConvergence { .. }));
    }

    #[test]
    fn rossler_plane_section_lands_on_plane() {
        let settings = PoincareSettings {
            section: Section::Plane {
                normal: vec![0.0, 1.0, 0.0],
                offset: 0.0,
            },
            tolerance: 1e-8,
            transient: 5_000,
            ..PoincareSettings::default()
        };
        let crossings = collect_crossings(
            &Rossler::default(),
            &[1.0, 1.0, 0.0],
            &settings,
            10,
            &CancelToken::new(),
        )
        .unwrap();
        for crossing in &crossings {
            assert!(crossing.state[1].abs() <= 1e-8);
        }
        let pairs = first_return_pairs(&crossings, 0);
        assert_eq!(pairs.len(), 9);
    }

    #[test]
    fn rejects_maps_and_bad_sections() {
        let settings = PoincareSettings {
            integration: IntegrationSettings::map(),
            ..PoincareSettings::default()
        };
        let err = find_crossing(
            &HarmonicOscillator::default(),
            &[1.0, 0.0],
            &settings,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(format!("{err}").contains("flows only"));

        let settings = PoincareSettings {
            section: Section::Plane {
                normal: vec![1.0],
                offset: 0.0,
            },
            ..PoincareSettings::default()
        };
        let err = find_crossing(
            &HarmonicOscillator::default(),
            &[1.0, 0.0],
            &settings,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(format!("{err}").contains("normal"));
    }

    #[test]
    fn stroboscopic_samples_once_per_period() {
        let duffing = Duffing::default();
        let period = TAU / duffing.omega;
        let samples = stroboscopic_section(
            &duffing,
            &[0.1, 0.0],
            period,
            200,
            10,
            25,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(samples.len(), 25);
        assert!(samples.iter().all(|s| s.len() == 2 && s.iter().all(|v| v.is_finite())));
    }
}
