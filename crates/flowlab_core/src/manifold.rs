//! One-dimensional stable and unstable manifolds of planar saddle maps.
//!
//! A branch is grown point by point. Besides the curve itself the tracer
//! keeps a cursor on the curve built so far; the next point is the image of
//! the point a little further along the cursor. The advance is halved until
//! the image lands within `max_gap` of the previous point, so consecutive
//! points never lie further apart than that, however strongly the map
//! stretches the curve.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::autodiff::{jacobian, Dual};
use crate::equilibrium::compute_eigenpairs;
use crate::error::{ensure_input, AnalysisError, Result};
use crate::task::{CancelToken, ProgressSink, RunStatus};
use crate::traits::{DynamicalSystem, InvertibleMap};

const EIG_IM_TOL: f64 = 1e-8;
const SEED_BISECT_ITERS: usize = 80;
const PROGRESS_STRIDE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ManifoldStability {
    /// Traced with the map itself.
    #[default]
    Unstable,
    /// Traced with the inverse map.
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ManifoldDirection {
    Plus,
    Minus,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManifoldBounds {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl ManifoldBounds {
    fn contains(&self, point: &Vector2<f64>) -> bool {
        (0..2).all(|i| point[i] >= self.min[i] && point[i] <= self.max[i])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifoldSettings {
    pub stability: ManifoldStability,
    pub direction: ManifoldDirection,
    /// Offset of the seed point from the saddle along the eigenvector.
    pub eps: f64,
    pub max_gap: f64,
    /// Points per branch, the saddle included.
    pub max_points: usize,
    /// Halvings allowed while placing a single point.
    pub max_subdivisions: usize,
    pub bounds: Option<ManifoldBounds>,
}

impl Default for ManifoldSettings {
    fn default() -> Self {
        Self {
            stability: ManifoldStability::Unstable,
            direction: ManifoldDirection::Both,
            eps: 1e-5,
            max_gap: 0.01,
            max_points: 1_000,
            max_subdivisions: 60,
            bounds: None,
        }
    }
}

impl ManifoldSettings {
    pub fn validate(&self) -> Result<()> {
        ensure_input!(
            self.eps.is_finite() && self.eps > 0.0,
            "Seed offset eps must be positive."
        );
        ensure_input!(
            self.max_gap.is_finite() && self.max_gap > 0.0,
            "max_gap must be positive."
        );
        ensure_input!(
            self.eps <= self.max_gap,
            "Seed offset eps ({}) must not exceed max_gap ({}).",
            self.eps,
            self.max_gap
        );
        ensure_input!(self.max_points >= 2, "max_points must be at least 2.");
        ensure_input!(self.max_subdivisions > 0, "max_subdivisions must be positive.");
        if let Some(bounds) = &self.bounds {
            ensure_input!(
                bounds.min[0] < bounds.max[0] && bounds.min[1] < bounds.max[1],
                "Manifold bounds must have min < max in both coordinates."
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifoldTermination {
    PointLimit,
    LeftBounds,
    SubdivisionLimit,
    NonFinite,
    Cancelled,
}

impl ManifoldTermination {
    pub fn as_str(self) -> &'static str {
        match self {
            ManifoldTermination::PointLimit => "point_limit",
            ManifoldTermination::LeftBounds => "left_bounds",
            ManifoldTermination::SubdivisionLimit => "subdivision_limit",
            ManifoldTermination::NonFinite => "non_finite",
            ManifoldTermination::Cancelled => "cancelled",
        }
    }
}

/// One traced branch. `points[0]` is the saddle itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifoldCurve {
    pub direction: ManifoldDirection,
    pub points: Vec<[f64; 2]>,
    /// Whether the square of the map was traced (negative eigenvalue).
    pub squared: bool,
    pub termination: ManifoldTermination,
    pub status: RunStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifoldProgress {
    pub direction: ManifoldDirection,
    pub points: usize,
}

/// Eigen-directions of a planar saddle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaddleDirections {
    pub stable_value: f64,
    pub stable: [f64; 2],
    pub unstable_value: f64,
    pub unstable: [f64; 2],
}

impl SaddleDirections {
    pub fn for_stability(&self, stability: ManifoldStability) -> [f64; 2] {
        match stability {
            ManifoldStability::Unstable => self.unstable,
            ManifoldStability::Stable => self.stable,
        }
    }
}

/// Real eigenpairs of the map's Jacobian at `fixed_point`, which must be a saddle.
pub fn saddle_directions<S>(map: &S, fixed_point: [f64; 2]) -> Result<SaddleDirections>
where
    S: DynamicalSystem<Dual> + ?Sized,
{
    ensure_input!(
        map.dimension() == 2,
        "Manifold tracing needs a planar map, got dimension {}.",
        map.dimension()
    );
    let jac = jacobian(map, 0.0, &fixed_point);
    let pairs = compute_eigenpairs(2, &jac)?;

    let mut stable = None;
    let mut unstable = None;
    for pair in &pairs {
        if pair.value.im.abs() > EIG_IM_TOL {
            continue;
        }
        let Some(vector) = pair.real_vector(EIG_IM_TOL) else {
            continue;
        };
        let direction = [vector[0], vector[1]];
        let modulus = pair.value.re.abs();
        if modulus < 1.0 {
            stable = Some((pair.value.re, direction));
        } else if modulus > 1.0 {
            unstable = Some((pair.value.re, direction));
        }
    }

    match (stable, unstable) {
        (Some((stable_value, stable)), Some((unstable_value, unstable))) => Ok(SaddleDirections {
            stable_value,
            stable,
            unstable_value,
            unstable,
        }),
        _ => Err(AnalysisError::invalid(format!(
            "Fixed point ({}, {}) is not a hyperbolic saddle.",
            fixed_point[0], fixed_point[1]
        ))),
    }
}

/// Traces the requested branches of the stable or unstable manifold of the
/// saddle `fixed_point` along `direction`.
///
/// Stopping on the point limit or leaving the bounds box is a complete run;
/// exhausting the subdivision budget, a non-finite image or cancellation
/// ends the branch with an `Aborted` status and keeps the points produced.
pub fn trace_manifold<S>(
    map: &S,
    fixed_point: [f64; 2],
    direction: [f64; 2],
    settings: &ManifoldSettings,
    progress: &mut dyn ProgressSink<ManifoldProgress>,
    cancel: &CancelToken,
) -> Result<Vec<ManifoldCurve>>
where
    S: InvertibleMap + ?Sized,
{
    ensure_input!(
        map.dimension() == 2,
        "Manifold tracing needs a planar map, got dimension {}.",
        map.dimension()
    );
    settings.validate()?;
    let saddle = Vector2::from(fixed_point);
    let axis = Vector2::from(direction);
    let length = axis.norm();
    ensure_input!(
        saddle.iter().all(|v| v.is_finite()) && length.is_finite() && length > 0.0,
        "Saddle point and direction must be finite, with a non-zero direction."
    );
    let axis = axis / length;

    let branches: &[ManifoldDirection] = match settings.direction {
        ManifoldDirection::Both => &[ManifoldDirection::Plus, ManifoldDirection::Minus],
        ManifoldDirection::Plus => &[ManifoldDirection::Plus],
        ManifoldDirection::Minus => &[ManifoldDirection::Minus],
    };

    let mut curves = Vec::with_capacity(branches.len());
    for &branch in branches {
        let sign = if branch == ManifoldDirection::Minus {
            -1.0
        } else {
            1.0
        };
        let tracer = BranchTracer::new(map, settings, saddle, axis * sign)?;
        curves.push(tracer.grow(branch, progress, cancel));
    }
    Ok(curves)
}

struct BranchTracer<'a, S: ?Sized> {
    map: &'a S,
    settings: &'a ManifoldSettings,
    /// Number of map applications per traced step (2 when the eigenvalue is negative).
    power: usize,
    points: Vec<Vector2<f64>>,
    /// Cumulative arc length along `points`.
    arc: Vec<f64>,
}

impl<'a, S> BranchTracer<'a, S>
where
    S: InvertibleMap + ?Sized,
{
    fn new(
        map: &'a S,
        settings: &'a ManifoldSettings,
        saddle: Vector2<f64>,
        axis: Vector2<f64>,
    ) -> Result<Self> {
        let seed = saddle + axis * settings.eps;
        let mut tracer = Self {
            map,
            settings,
            power: 1,
            points: vec![saddle, seed],
            arc: vec![0.0, settings.eps],
        };
        let image = tracer.image(&seed);
        ensure_input!(
            image.iter().all(|v| v.is_finite()),
            "Map image of the seed point is not finite."
        );
        if (image - saddle).dot(&axis) < 0.0 {
            tracer.power = 2;
        }
        let spread = (tracer.image(&seed) - saddle).norm();
        ensure_input!(
            spread > settings.eps,
            "Direction is not expanding under the traced map; check the stability and eigenvector."
        );
        Ok(tracer)
    }

    fn traced(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let mut out = [0.0; 2];
        match self.settings.stability {
            ManifoldStability::Unstable => self.map.apply(0.0, point.as_slice(), &mut out),
            ManifoldStability::Stable => self.map.apply_inverse(point.as_slice(), &mut out),
        }
        Vector2::from(out)
    }

    fn image(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let mut current = *point;
        for _ in 0..self.power {
            current = self.traced(&current);
        }
        current
    }

    /// Point at arc length `s` along the polyline, by linear interpolation.
    fn point_at(&self, s: f64) -> Vector2<f64> {
        let last = self.points.len() - 1;
        if s >= self.arc[last] {
            return self.points[last];
        }
        let segment = match self.arc.partition_point(|&a| a <= s) {
            0 => 0,
            i => i - 1,
        };
        let span = self.arc[segment + 1] - self.arc[segment];
        let t = if span > 0.0 {
            (s - self.arc[segment]) / span
        } else {
            0.0
        };
        self.points[segment] + (self.points[segment + 1] - self.points[segment]) * t
    }

    fn push(&mut self, point: Vector2<f64>) {
        let last = self.points[self.points.len() - 1];
        let total = self.arc[self.arc.len() - 1];
        self.arc.push(total + (point - last).norm());
        self.points.push(point);
    }

    /// Arc position on the first segment whose image is the seed point.
    fn seed_preimage(&self) -> f64 {
        let saddle = self.points[0];
        let target = self.settings.eps;
        let (mut lo, mut hi) = (0.0, self.settings.eps);
        for _ in 0..SEED_BISECT_ITERS {
            let mid = 0.5 * (lo + hi);
            if (self.image(&self.point_at(mid)) - saddle).norm() < target {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }

    fn grow(
        mut self,
        branch: ManifoldDirection,
        progress: &mut dyn ProgressSink<ManifoldProgress>,
        cancel: &CancelToken,
    ) -> ManifoldCurve {
        let max_gap = self.settings.max_gap;
        let mut cursor = self.seed_preimage();
        let mut step = cursor.max(f64::MIN_POSITIVE);

        let termination = 'trace: loop {
            if self.points.len() >= self.settings.max_points {
                break ManifoldTermination::PointLimit;
            }
            if cancel.is_cancelled() {
                break ManifoldTermination::Cancelled;
            }
            if self.points.len() % PROGRESS_STRIDE == 0 {
                progress.report(&ManifoldProgress {
                    direction: branch,
                    points: self.points.len(),
                });
            }

            let last = self.points[self.points.len() - 1];
            let mut h = step;
            for _ in 0..self.settings.max_subdivisions {
                let candidate = self.image(&self.point_at(cursor + h));
                if !candidate.iter().all(|v| v.is_finite()) {
                    break 'trace ManifoldTermination::NonFinite;
                }
                let gap = (candidate - last).norm();
                if gap <= max_gap {
                    if let Some(bounds) = &self.settings.bounds {
                        if !bounds.contains(&candidate) {
                            break 'trace ManifoldTermination::LeftBounds;
                        }
                    }
                    self.push(candidate);
                    cursor += h;
                    step = if gap < 0.25 * max_gap { 2.0 * h } else { h };
                    continue 'trace;
                }
                h *= 0.5;
            }
            log::debug!(
                "Manifold branch {:?} exhausted {} subdivisions at point {}",
                branch,
                self.settings.max_subdivisions,
                self.points.len()
            );
            break ManifoldTermination::SubdivisionLimit;
        };

        progress.report(&ManifoldProgress {
            direction: branch,
            points: self.points.len(),
        });

        let status = match termination {
            ManifoldTermination::PointLimit | ManifoldTermination::LeftBounds => {
                RunStatus::Complete
            }
            ManifoldTermination::SubdivisionLimit => RunStatus::Aborted {
                reason: AnalysisError::NonConvergence {
                    operation: "manifold subdivision",
                    limit: self.settings.max_subdivisions,
                }
                .to_string(),
            },
            ManifoldTermination::NonFinite => RunStatus::Aborted {
                reason: AnalysisError::NumericOverflow {
                    step: self.points.len(),
                }
                .to_string(),
            },
            ManifoldTermination::Cancelled => RunStatus::Aborted {
                reason: AnalysisError::Cancelled.to_string(),
            },
        };

        ManifoldCurve {
            direction: branch,
            points: self.points.iter().map(|p| [p[0], p[1]]).collect(),
            squared: self.power == 2,
            termination,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HenonMap;

    fn max_gap(points: &[[f64; 2]]) -> f64 {
        points
            .windows(2)
            .map(|w| (w[1][0] - w[0][0]).hypot(w[1][1] - w[0][1]))
            .fold(0.0, f64::max)
    }

    fn henon_saddle() -> (HenonMap, [f64; 2], SaddleDirections) {
        let map = HenonMap { a: 1.4, b: 0.3 };
        let saddle = map.fixed_points().expect("real fixed points")[0];
        let directions = saddle_directions(&map, saddle).expect("saddle");
        (map, saddle, directions)
    }

    #[test]
    fn henon_saddle_has_negative_unstable_eigenvalue() {
        let (_, _, directions) = henon_saddle();
        assert!(directions.unstable_value < -1.0);
        assert!(directions.stable_value.abs() < 1.0);
    }

    #[test]
    fn henon_unstable_manifold_respects_gap() {
        let (map, saddle, directions) = henon_saddle();
        let settings = ManifoldSettings {
            direction: ManifoldDirection::Plus,
            max_points: 1_000,
            max_gap: 0.01,
            ..ManifoldSettings::default()
        };
        let curves = trace_manifold(
            &map,
            saddle,
            directions.unstable,
            &settings,
            &mut (),
            &CancelToken::new(),
        )
        .expect("trace");
        let curve = &curves[0];
        assert_eq!(curve.points.len(), 1_000);
        assert!(curve.squared);
        assert_eq!(curve.termination, ManifoldTermination::PointLimit);
        assert!(curve.status.is_complete());
        assert!(max_gap(&curve.points) <= 0.01);
        assert!(curve.points.iter().all(|p| p[0].abs() < 2.0 && p[1].abs() < 1.0));
    }

    #[test]
    fn long_unstable_branch_completes_within_gap() {
        let (map, saddle, directions) = henon_saddle();
        let settings = ManifoldSettings {
            direction: ManifoldDirection::Plus,
            max_points: 20_000,
            max_gap: 0.01,
            ..ManifoldSettings::default()
        };
        let curves = trace_manifold(
            &map,
            saddle,
            directions.unstable,
            &settings,
            &mut (),
            &CancelToken::new(),
        )
        .expect("trace");
        let curve = &curves[0];
        assert!(
            !matches!(curve.status, RunStatus::Aborted { .. }),
            "status = {:?}",
            curve.status
        );
        assert_eq!(curve.termination, ManifoldTermination::PointLimit);
        assert_eq!(curve.points.len(), 20_000);
        assert!(max_gap(&curve.points) <= 0.01 + 1e-12);
        assert!(curve.points.iter().all(|p| p[0].abs() < 2.0 && p[1].abs() < 1.0));
    }

    #[test]
    fn unstable_manifold_points_map_near_the_curve() {
        let (map, saddle, directions) = henon_saddle();
        let settings = ManifoldSettings {
            direction: ManifoldDirection::Minus,
            max_points: 300,
            ..ManifoldSettings::default()
        };
        let curves = trace_manifold(
            &map,
            saddle,
            directions.unstable,
            &settings,
            &mut (),
            &CancelToken::new(),
        )
        .expect("trace");
        let points = &curves[0].points;
        // f flips branches, so the second iterate of an early point lies further along this one.
        let mut once = [0.0; 2];
        let mut image = [0.0; 2];
        DynamicalSystem::<f64>::apply(&map, 0.0, &points[20], &mut once);
        DynamicalSystem::<f64>::apply(&map, 0.0, &once, &mut image);
        let nearest = points
            .iter()
            .map(|p| (p[0] - image[0]).hypot(p[1] - image[1]))
            .fold(f64::INFINITY, f64::min);
        assert!(nearest < 0.01, "nearest = {nearest}");
    }

    #[test]
    fn stable_manifold_uses_inverse_and_bounds() {
        let (map, saddle, directions) = henon_saddle();
        let settings = ManifoldSettings {
            stability: ManifoldStability::Stable,
            direction: ManifoldDirection::Both,
            max_points: 5_000,
            bounds: Some(ManifoldBounds {
                min: [-3.0, -3.0],
                max: [3.0, 3.0],
            }),
            ..ManifoldSettings::default()
        };
        let curves = trace_manifold(
            &map,
            saddle,
            directions.stable,
            &settings,
            &mut (),
            &CancelToken::new(),
        )
        .expect("trace");
        assert_eq!(curves.len(), 2);
        for curve in &curves {
            assert!(!curve.squared);
            assert!(curve.points.len() > 2);
            assert!(max_gap(&curve.points) <= 0.01);
        }
    }

    #[test]
    fn wrong_stability_is_rejected() {
        let (map, saddle, directions) = henon_saddle();
        let settings = ManifoldSettings {
            stability: ManifoldStability::Stable,
            ..ManifoldSettings::default()
        };
        let err = trace_manifold(
            &map,
            saddle,
            directions.unstable,
            &settings,
            &mut (),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(format!("{err}").contains("not expanding"));
    }

    #[test]
    fn cancelled_trace_keeps_seed() {
        let (map, saddle, directions) = henon_saddle();
        let token = CancelToken::new();
        token.cancel();
        let curves = trace_manifold(
            &map,
            saddle,
            directions.unstable,
            &ManifoldSettings::default(),
            &mut (),
            &token,
        )
        .expect("trace");
        for curve in curves {
            assert_eq!(curve.points.len(), 2);
            assert_eq!(curve.termination, ManifoldTermination::Cancelled);
            assert!(matches!(curve.status, RunStatus::Aborted { .. }));
        }
    }
}
