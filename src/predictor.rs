//! Linear extrapolation of the observed epochs.
//!
//! The average epoch is assumed to repeat until the target epoch count is
//! reached. Warm-up epochs and learning-rate schedules are not modelled.

use crate::epoch::Epoch;
use crate::utils::errors::{Result, TrackerError};

/// Duration and energy of a number of epochs, PUE applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub epochs: u32,
    pub duration_s: f64,
    pub energy_kwh: f64,
}

/// Totals over the given epochs.
pub fn actual(epochs: &[Epoch], pue: f64) -> Projection {
    Projection {
        epochs: epochs.len() as u32,
        duration_s: epochs.iter().map(|e| e.duration.as_secs_f64()).sum(),
        energy_kwh: epochs.iter().map(Epoch::energy_kwh).sum::<f64>() * pue,
    }
}

/// Projects the cost of `target` epochs from the average observed epoch.
pub fn project(epochs: &[Epoch], target: u32, pue: f64) -> Result<Projection> {
    if epochs.is_empty() {
        return Err(TrackerError::InsufficientData);
    }
    let observed = actual(epochs, pue);
    let scale = f64::from(target) / f64::from(observed.epochs);
    Ok(Projection {
        epochs: target,
        duration_s: observed.duration_s * scale,
        energy_kwh: observed.energy_kwh * scale,
    })
}
