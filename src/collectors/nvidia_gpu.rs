use crate::collectors::EnergyCollector;
use crate::utils::errors::{Result, TrackerError};
use crate::utils::psutils::collect_process_tree;
use async_trait::async_trait;
use log::{debug, info, warn};
use nvml_wrapper::Nvml;
use std::collections::HashSet;

pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// NVIDIA GPUs read through NVML.
pub struct NvidiaGpu {
    pids: Vec<u32>,
    devices_by_pid: bool,
    nvml: Option<Nvml>,
    device_ids: Vec<u32>,
    device_names: Vec<String>,
}

impl NvidiaGpu {
    pub fn new(pids: Vec<u32>, devices_by_pid: bool) -> Self {
        Self {
            pids,
            devices_by_pid,
            nvml: None,
            device_ids: Vec::new(),
            device_names: Vec::new(),
        }
    }

    /// GPUs running at least one of the monitored processes or their children.
    fn indices_by_pid(&self, nvml: &Nvml, count: u32) -> Vec<u32> {
        let monitored: HashSet<u32> = collect_process_tree(&self.pids).into_iter().collect();
        (0..count)
            .filter(|&index| {
                let Ok(device) = nvml.device_by_index(index) else {
                    return false;
                };
                let compute = device.running_compute_processes().unwrap_or_default();
                let graphics = device.running_graphics_processes().unwrap_or_default();
                compute
                    .iter()
                    .chain(graphics.iter())
                    .any(|process| monitored.contains(&process.pid))
            })
            .collect()
    }
}

impl Default for NvidiaGpu {
    fn default() -> Self {
        Self::new(vec![std::process::id()], false)
    }
}

/// Parses a `CUDA_VISIBLE_DEVICES` value. `None` means every GPU is visible.
pub fn parse_visible_devices(value: Option<&str>) -> Option<Vec<u32>> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    value
        .split(',')
        .map(|index| index.trim().parse::<u32>().ok())
        .collect()
}

#[async_trait]
impl EnergyCollector for NvidiaGpu {
    fn name(&self) -> &str {
        "nvml"
    }

    fn is_available(&self) -> bool {
        Nvml::init()
            .and_then(|nvml| nvml.device_count())
            .map(|count| count > 0)
            .unwrap_or(false)
    }

    async fn init(&mut self) -> Result<()> {
        let nvml = Nvml::init().map_err(|e| TrackerError::unavailable("gpu", e))?;
        let count = nvml
            .device_count()
            .map_err(|e| TrackerError::unavailable("gpu", e))?;

        let device_ids = if self.devices_by_pid {
            self.indices_by_pid(&nvml, count)
        } else {
            let visible = std::env::var(VISIBLE_DEVICES_ENV).ok();
            match parse_visible_devices(visible.as_deref()) {
                Some(indices) => indices.into_iter().filter(|&i| i < count).collect(),
                None => (0..count).collect(),
            }
        };

        let mut device_names = Vec::with_capacity(device_ids.len());
        for &index in &device_ids {
            let name = nvml
                .device_by_index(index)
                .and_then(|device| device.name())
                .map_err(|e| TrackerError::unavailable("gpu", e))?;
            device_names.push(name);
        }

        if device_ids.is_empty() {
            // Dropping the handle shuts NVML down again
            return Err(TrackerError::unavailable("gpu", "no NVIDIA GPUs selected"));
        }

        info!("NVIDIA GPU energy reading for devices: {:?}", device_ids);
        self.nvml = Some(nvml);
        self.device_ids = device_ids;
        self.device_names = device_names;
        Ok(())
    }

    fn devices(&self) -> Vec<String> {
        self.device_names.clone()
    }

    async fn power_usage(&mut self) -> Result<Vec<f64>> {
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| TrackerError::measurement("gpu", "NVML is not initialized"))?;

        let mut watts = Vec::with_capacity(self.device_ids.len());
        for &index in &self.device_ids {
            let milliwatts = nvml
                .device_by_index(index)
                .and_then(|device| device.power_usage())
                .map_err(|e| TrackerError::measurement("gpu", e))?;
            watts.push(milliwatts as f64 / 1000.0);
        }
        debug!("NVML power (W): {:?}", watts);
        Ok(watts)
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(nvml) = self.nvml.take() {
            if let Err(e) = nvml.shutdown() {
                warn!("NVML shutdown failed: {}", e);
            }
        }
        self.device_ids.clear();
        Ok(())
    }
}
