use crate::collectors::EnergyCollector;
use crate::utils::errors::{Result, TrackerError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;

/// How long one `powermetrics` sample is reused.
const SAMPLE_TTL: Duration = Duration::from_secs(1);

/// Runs the privileged `powermetrics` tool and caches its latest sample.
#[derive(Default)]
pub struct PowerMetricsSource {
    latest: Mutex<Option<(Instant, String)>>,
}

impl PowerMetricsSource {
    pub fn is_supported() -> bool {
        cfg!(target_os = "macos")
    }

    pub async fn sample(&self) -> Result<String> {
        let mut latest = self.latest.lock().await;
        if let Some((taken, output)) = latest.as_ref() {
            if taken.elapsed() <= SAMPLE_TTL {
                return Ok(output.clone());
            }
        }

        let output = Command::new("sudo")
            .args(["powermetrics", "-n", "1", "-i", "1000", "--samplers", "all"])
            .output()
            .await
            .map_err(|e| TrackerError::measurement("powermetrics", e))?;
        if !output.status.success() {
            return Err(TrackerError::measurement(
                "powermetrics",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        *latest = Some((Instant::now(), text.clone()));
        Ok(text)
    }
}

/// Reads `<label> Power: <n> mW` from a sample, in watts. Missing lines read
/// as zero.
pub fn parse_power(output: &str, label: &str) -> f64 {
    let needle = format!("{label} Power: ");
    output
        .lines()
        .find_map(|line| {
            let rest = &line[line.find(&needle)? + needle.len()..];
            rest.trim().strip_suffix("mW")?.trim().parse::<f64>().ok()
        })
        .map(|milliwatts| milliwatts / 1000.0)
        .unwrap_or(0.0)
}

/// Apple Silicon CPU power.
pub struct PowerMetricsCpu {
    source: Arc<PowerMetricsSource>,
}

impl PowerMetricsCpu {
    pub fn new(source: Arc<PowerMetricsSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl EnergyCollector for PowerMetricsCpu {
    fn name(&self) -> &str {
        "powermetrics-cpu"
    }

    fn is_available(&self) -> bool {
        PowerMetricsSource::is_supported()
    }

    async fn init(&mut self) -> Result<()> {
        if !PowerMetricsSource::is_supported() {
            return Err(TrackerError::unavailable("cpu", "powermetrics requires macOS"));
        }
        Ok(())
    }

    fn devices(&self) -> Vec<String> {
        vec!["CPU".to_string()]
    }

    async fn power_usage(&mut self) -> Result<Vec<f64>> {
        let output = self.source.sample().await?;
        Ok(vec![parse_power(&output, "CPU")])
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Apple Silicon GPU and Neural Engine power.
pub struct PowerMetricsGpu {
    source: Arc<PowerMetricsSource>,
}

impl PowerMetricsGpu {
    pub fn new(source: Arc<PowerMetricsSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl EnergyCollector for PowerMetricsGpu {
    fn name(&self) -> &str {
        "powermetrics-gpu"
    }

    fn is_available(&self) -> bool {
        PowerMetricsSource::is_supported()
    }

    async fn init(&mut self) -> Result<()> {
        if !PowerMetricsSource::is_supported() {
            return Err(TrackerError::unavailable("gpu", "powermetrics requires macOS"));
        }
        Ok(())
    }

    fn devices(&self) -> Vec<String> {
        vec!["GPU".to_string(), "ANE".to_string()]
    }

    async fn power_usage(&mut self) -> Result<Vec<f64>> {
        let output = self.source.sample().await?;
        Ok(vec![parse_power(&output, "GPU"), parse_power(&output, "ANE")])
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
