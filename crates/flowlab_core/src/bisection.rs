//! Locating period-doubling points by bisection on the control parameter.
//!
//! The caller supplies an oracle mapping a parameter value to the period of
//! the attractor found there. Bisection keeps `oracle(low) <= period <
//! oracle(high)` and returns the midpoint of the final bracket.

use serde::{Deserialize, Serialize};

use crate::error::{ensure_input, AnalysisError, Result};
use crate::orbit::check_dimension;
use crate::task::CancelToken;
use crate::traits::{DynamicalSystem, Parameterized};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BisectionSettings {
    /// Stop once the bracket is narrower than this.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for BisectionSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 100,
        }
    }
}

/// Bisects `[a1, a2]` for the parameter where the oracle's period first exceeds `period`.
///
/// The bracket must satisfy `a1 < a2` and `oracle(a1) <= period <= oracle(a2)`.
/// Stops when the bracket is narrower than the tolerance, when both ends
/// report the same period, or after `max_iterations` (the midpoint is
/// returned either way).
pub fn find_bifurcation<F>(
    period: usize,
    a1: f64,
    a2: f64,
    mut oracle: F,
    settings: &BisectionSettings,
    cancel: &CancelToken,
) -> Result<f64>
where
    F: FnMut(f64) -> usize,
{
    ensure_input!(
        a1.is_finite() && a2.is_finite() && a1 < a2,
        "Bisection needs a finite bracket with a1 < a2, got [{}, {}].",
        a1,
        a2
    );
    ensure_input!(
        settings.tolerance.is_finite() && settings.tolerance > 0.0,
        "Bisection tolerance must be positive."
    );

    let (mut low, mut high) = (a1, a2);
    let mut low_period = oracle(low);
    let mut high_period = oracle(high);
    if !(low_period <= period && period <= high_period) {
        return Err(AnalysisError::InvalidBracket { period, low, high });
    }

    for iteration in 0..settings.max_iterations {
        cancel.check()?;
        if high - low < settings.tolerance || low_period == high_period {
            log::debug!(
                "Bisection for period {} stopped after {} iterations at [{}, {}]",
                period,
                iteration,
                low,
                high
            );
            return Ok(0.5 * (low + high));
        }

        let mid = 0.5 * (low + high);
        let mid_period = oracle(mid);
        if mid_period <= period {
            low = mid;
            low_period = mid_period;
        } else {
            high = mid;
            high_period = mid_period;
        }
    }

    log::warn!(
        "Bisection for period {} hit {} iterations; bracket [{}, {}] is still wider than {}",
        period,
        settings.max_iterations,
        low,
        high,
        settings.tolerance
    );
    Ok(0.5 * (low + high))
}

/// Settings for [`estimate_map_period`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodSettings {
    pub transient: usize,
    pub max_period: usize,
    pub tolerance: f64,
}

impl Default for PeriodSettings {
    fn default() -> Self {
        Self {
            transient: 20_000,
            max_period: 64,
            tolerance: 1e-6,
        }
    }
}

/// Smallest `k <= max_period` with `|f^k(x) - x|∞ <= tolerance` after the transient.
///
/// `None` for chaotic or long-period attractors and for orbits that diverge.
pub fn estimate_map_period<S>(map: &S, initial: &[f64], settings: &PeriodSettings) -> Option<usize>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    check_dimension(map, initial).ok()?;
    let mut state = initial.to_vec();
    let mut next = vec![0.0; state.len()];
    for _ in 0..settings.transient {
        map.apply(0.0, &state, &mut next);
        std::mem::swap(&mut state, &mut next);
    }
    if !state.iter().all(|v| v.is_finite()) {
        return None;
    }

    let anchor = state.clone();
    for k in 1..=settings.max_period {
        map.apply(0.0, &state, &mut next);
        std::mem::swap(&mut state, &mut next);
        let distance = anchor
            .iter()
            .zip(&state)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        if distance <= settings.tolerance {
            return Some(k);
        }
    }
    None
}

/// Oracle for [`find_bifurcation`] that sets `param` on a copy of `model`
/// and estimates the map's period. Unresolved periods count as `usize::MAX`.
pub fn map_period_oracle<M>(
    model: M,
    param: &str,
    initial: Vec<f64>,
    settings: PeriodSettings,
) -> impl FnMut(f64) -> usize
where
    M: DynamicalSystem<f64> + Parameterized + Clone,
{
    let param = param.to_string();
    move |value| {
        let mut system = model.clone();
        if let Err(err) = system.set_param(&param, value) {
            log::warn!("Period oracle could not set '{}': {}", param, err);
            return usize::MAX;
        }
        estimate_map_period(&system, &initial, &settings).unwrap_or(usize::MAX)
    }
}
