use crate::collectors::EnergyCollector;
use crate::utils::errors::{Result, TrackerError};
use async_trait::async_trait;
use log::info;

/// A device drawing a constant share of its nominal power. Useful on hosts
/// without supported hardware and in tests.
#[derive(Debug, Clone)]
pub struct SimulatedCollector {
    device: String,
    watts: f64,
    utilization: f64,
}

impl SimulatedCollector {
    pub fn new(device: impl Into<String>, watts: f64, utilization: f64) -> Result<Self> {
        let device = device.into();
        if device.trim().is_empty() {
            return Err(TrackerError::InvalidConfig(
                "simulated device name must be non-empty".to_string(),
            ));
        }
        if !watts.is_finite() || watts < 0.0 {
            return Err(TrackerError::InvalidConfig(
                "simulated device watts must be a non-negative number".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&utilization) {
            return Err(TrackerError::InvalidConfig(
                "simulated device utilization must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(Self {
            device,
            watts,
            utilization,
        })
    }

    /// Power reported on every poll.
    pub fn effective_watts(&self) -> f64 {
        self.watts * self.utilization
    }
}

#[async_trait]
impl EnergyCollector for SimulatedCollector {
    fn name(&self) -> &str {
        "simulated"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn init(&mut self) -> Result<()> {
        info!(
            "Using simulated device {} drawing {:.2}W (at {:.0}% utilization)",
            self.device,
            self.effective_watts(),
            self.utilization * 100.0
        );
        Ok(())
    }

    fn devices(&self) -> Vec<String> {
        vec![self.device.clone()]
    }

    async fn power_usage(&mut self) -> Result<Vec<f64>> {
        Ok(vec![self.effective_watts()])
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
