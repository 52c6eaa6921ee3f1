//! Epoch accounting shared between the sampler task and the tracker.
//!
//! Power readings are integrated with the rectangle rule: a reading taken at
//! `t` is held over the interval since the previous reading of the same
//! component (or since the epoch start, whichever is later). Readings taken
//! while no epoch is open are dropped.

use crate::utils::errors::{Result, TrackerError};
use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

pub const JOULES_PER_KWH: f64 = 3_600_000.0;

/// Energy of one component during one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentEnergy {
    pub component: String,
    pub devices: Vec<String>,
    /// Joules per device, in `devices` order
    pub joules: Vec<f64>,
}

impl ComponentEnergy {
    pub fn total_joules(&self) -> f64 {
        self.joules.iter().sum()
    }

    pub fn average_power(&self, duration: Duration) -> Vec<f64> {
        let seconds = duration.as_secs_f64();
        self.joules
            .iter()
            .map(|joules| if seconds > 0.0 { joules / seconds } else { 0.0 })
            .collect()
    }
}

/// A closed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    pub index: u32,
    pub started_at: DateTime<Local>,
    pub duration: Duration,
    pub components: Vec<ComponentEnergy>,
}

impl Epoch {
    pub fn energy_joules(&self) -> f64 {
        self.components.iter().map(ComponentEnergy::total_joules).sum()
    }

    pub fn energy_kwh(&self) -> f64 {
        self.energy_joules() / JOULES_PER_KWH
    }
}

#[derive(Debug)]
struct OpenEpoch {
    index: u32,
    start: Instant,
    started_at: DateTime<Local>,
    joules: Vec<Vec<f64>>,
}

/// Component name and devices, fixed once monitoring starts.
pub type Layout = Vec<(String, Vec<String>)>;

#[derive(Debug, Default)]
pub struct EpochLedger {
    layout: Layout,
    open: Option<OpenEpoch>,
    closed: Vec<Epoch>,
    last_sample: Vec<Option<Instant>>,
    last_power: Vec<Option<Vec<f64>>>,
    fault: Option<TrackerError>,
}

impl EpochLedger {
    pub fn new(layout: Layout) -> Self {
        let components = layout.len();
        Self {
            layout,
            open: None,
            closed: Vec::new(),
            last_sample: vec![None; components],
            last_power: vec![None; components],
            fault: None,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Opens the next epoch and returns its 1-based index.
    pub fn open(&mut self, at: Instant, started_at: DateTime<Local>) -> Result<u32> {
        if let Some(open) = &self.open {
            return Err(TrackerError::InvalidState {
                operation: "start an epoch",
                state: format!("inside epoch {}", open.index),
            });
        }
        let index = self.closed.len() as u32 + 1;
        self.open = Some(OpenEpoch {
            index,
            start: at,
            started_at,
            joules: self
                .layout
                .iter()
                .map(|(_, devices)| vec![0.0; devices.len()])
                .collect(),
        });
        Ok(index)
    }

    /// Folds one reading of component `component` taken at `at`.
    pub fn fold(&mut self, component: usize, at: Instant, watts: &[f64]) {
        let previous = self.last_sample.get_mut(component).and_then(|slot| slot.replace(at));
        if let Some(slot) = self.last_power.get_mut(component) {
            *slot = Some(watts.to_vec());
        }

        let Some(open) = self.open.as_mut() else {
            return;
        };
        let from = previous.map_or(open.start, |previous| previous.max(open.start));
        let seconds = at.saturating_duration_since(from).as_secs_f64();
        if let Some(joules) = open.joules.get_mut(component) {
            for (acc, power) in joules.iter_mut().zip(watts) {
                // Negative readings never drain an accumulator
                *acc += power.max(0.0) * seconds;
            }
        }
    }

    /// Last successful reading of a component, if any.
    pub fn last_power(&self, component: usize) -> Option<&[f64]> {
        self.last_power.get(component)?.as_deref()
    }

    /// Joules accumulated so far by the open epoch, per component.
    pub fn open_energy(&self) -> Option<Vec<f64>> {
        self.open
            .as_ref()
            .map(|open| open.joules.iter().map(|j| j.iter().sum()).collect())
    }

    pub fn close(&mut self, at: Instant) -> Result<&Epoch> {
        let open = self.open.take().ok_or(TrackerError::InvalidState {
            operation: "end an epoch",
            state: "outside an epoch".to_string(),
        })?;
        let components = self
            .layout
            .iter()
            .zip(open.joules)
            .map(|((component, devices), joules)| ComponentEnergy {
                component: component.clone(),
                devices: devices.clone(),
                joules,
            })
            .collect();
        self.closed.push(Epoch {
            index: open.index,
            started_at: open.started_at,
            duration: at.saturating_duration_since(open.start),
            components,
        });
        Ok(&self.closed[self.closed.len() - 1])
    }

    /// Drops the open epoch without recording it.
    pub fn discard_open(&mut self) -> Option<u32> {
        self.open.take().map(|open| open.index)
    }

    pub fn closed(&self) -> &[Epoch] {
        &self.closed
    }

    pub fn set_fault(&mut self, error: TrackerError) {
        if self.fault.is_none() {
            self.fault = Some(error);
        }
    }

    pub fn take_fault(&mut self) -> Option<TrackerError> {
        self.fault.take()
    }
}
