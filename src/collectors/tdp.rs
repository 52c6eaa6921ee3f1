use crate::collectors::EnergyCollector;
use crate::utils::errors::Result;
use async_trait::async_trait;
use log::{info, warn};
use sysinfo::System;

/// Share of TDP assumed to be drawn under load.
pub const TDP_UTILIZATION: f64 = 0.5;

/// Thermal design power (W) of common server and desktop CPUs.
pub const CPU_TDP_REGISTRY: &[(&str, f64)] = &[
    ("Intel Core i5-9600K", 95.0),
    ("Intel Core i7-9700K", 95.0),
    ("Intel Core i9-9900K", 95.0),
    ("Intel Core i5-12600K", 125.0),
    ("Intel Core i7-12700K", 125.0),
    ("Intel Core i9-12900K", 125.0),
    ("Intel Core i7-13700K", 125.0),
    ("Intel Core i9-13900K", 125.0),
    ("Intel Xeon E5-2680 v4", 120.0),
    ("Intel Xeon Gold 6248", 150.0),
    ("Intel Xeon Gold 6338", 205.0),
    ("Intel Xeon Platinum 8280", 205.0),
    ("Intel Xeon Platinum 8380", 270.0),
    ("AMD Ryzen 5 5600X", 65.0),
    ("AMD Ryzen 7 5800X", 105.0),
    ("AMD Ryzen 9 5950X", 105.0),
    ("AMD Ryzen 9 7950X", 170.0),
    ("AMD EPYC 7542", 225.0),
    ("AMD EPYC 7742", 225.0),
    ("AMD EPYC 7763", 280.0),
];

/// Normalizes a CPU brand string: drops the clock suffix and trademark marks.
fn normalize_brand(brand: &str) -> String {
    let without_freq = brand.split('@').next().unwrap_or(brand);
    without_freq
        .replace("(R)", "")
        .replace("(TM)", "")
        .split_whitespace()
        .filter(|word| !word.eq_ignore_ascii_case("cpu") && !word.eq_ignore_ascii_case("processor"))
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// Looks `brand` up by exact name, then for a registry entry whose words all
/// appear, in order, within the normalized brand.
pub fn find_matching_tdp(brand: &str, registry: &[(&str, f64)]) -> Option<f64> {
    if let Some((_, tdp)) = registry.iter().find(|(name, _)| *name == brand) {
        return Some(*tdp);
    }
    let wanted = normalize_brand(brand);
    let wanted: Vec<&str> = wanted.split_whitespace().collect();
    if wanted.is_empty() {
        return None;
    }
    registry
        .iter()
        .find(|(name, _)| {
            let name = normalize_brand(name);
            let name: Vec<&str> = name.split_whitespace().collect();
            !name.is_empty() && wanted.windows(name.len()).any(|window| window == name.as_slice())
        })
        .map(|(_, tdp)| *tdp)
}

pub fn average_tdp(registry: &[(&str, f64)]) -> f64 {
    if registry.is_empty() {
        return 0.0;
    }
    registry.iter().map(|(_, tdp)| tdp).sum::<f64>() / registry.len() as f64
}

/// Constant CPU power estimated from TDP, for hosts without energy counters.
pub struct TdpEstimate {
    brand: Option<String>,
    watts: f64,
}

impl TdpEstimate {
    /// Estimate for a known brand string instead of the detected one.
    pub fn with_brand(brand: impl Into<String>) -> Self {
        Self {
            brand: Some(brand.into()),
            watts: 0.0,
        }
    }

    fn detect_brand() -> Option<String> {
        let mut system = System::new();
        system.refresh_cpu_all();
        system
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
    }
}

impl Default for TdpEstimate {
    fn default() -> Self {
        Self {
            brand: None,
            watts: 0.0,
        }
    }
}

#[async_trait]
impl EnergyCollector for TdpEstimate {
    fn name(&self) -> &str {
        "tdp-estimate"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn init(&mut self) -> Result<()> {
        if self.brand.is_none() {
            self.brand = Self::detect_brand();
        }
        let brand = match &self.brand {
            Some(brand) => brand.clone(),
            None => {
                warn!("Failed to detect CPU. Falling back to generic CPU estimate.");
                self.brand = Some("Unknown CPU".to_string());
                "Unknown CPU".to_string()
            }
        };

        match find_matching_tdp(&brand, CPU_TDP_REGISTRY) {
            Some(tdp) => {
                self.watts = tdp * TDP_UTILIZATION;
                info!("Using TDP of {:.2}W for {}", self.watts, brand);
            }
            None => {
                self.watts = average_tdp(CPU_TDP_REGISTRY) * TDP_UTILIZATION;
                warn!(
                    "No matching TDP found for CPU: {}. Using average TDP of {:.2}W as fallback.",
                    brand, self.watts
                );
            }
        }
        Ok(())
    }

    fn devices(&self) -> Vec<String> {
        vec![self.brand.clone().unwrap_or_else(|| "Unknown CPU".to_string())]
    }

    async fn power_usage(&mut self) -> Result<Vec<f64>> {
        Ok(vec![self.watts])
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
