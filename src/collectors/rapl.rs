use crate::collectors::EnergyCollector;
use crate::utils::errors::{Result, TrackerError};
use async_trait::async_trait;
use log::{debug, info};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const RAPL_DIR: &str = "/sys/class/powercap";

/// One `energy_uj` counter and its last reading in microjoules.
#[derive(Debug)]
struct Counter {
    path: PathBuf,
    max_range: u64,
    last: u64,
}

/// A package or dram domain, backed by its own counter or by the sum of its
/// sub-zone counters when the domain exposes none.
#[derive(Debug)]
struct Domain {
    device: String,
    counters: Vec<Counter>,
}

/// Intel RAPL energy counters read through the powercap sysfs interface.
pub struct Rapl {
    pub rapl_path: PathBuf,
    domains: Vec<Domain>,
    last_read: Option<Instant>,
}

impl Rapl {
    pub fn new(rapl_path: Option<PathBuf>) -> Self {
        let rapl_path = rapl_path.unwrap_or_else(|| PathBuf::from(RAPL_DIR));
        Self {
            rapl_path,
            domains: Vec::new(),
            last_read: None,
        }
    }

    fn discover(&self) -> Result<Vec<Domain>> {
        let mut zones: Vec<String> = fs::read_dir(&self.rapl_path)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| parse_zone(name).is_some())
            .collect();
        zones.sort();

        let mut domains = Vec::new();
        for zone in &zones {
            let zone_path = self.rapl_path.join(zone);
            let name = fs::read_to_string(zone_path.join("name"))?.trim().to_string();
            if name == "psys" || !(name.contains("package") || name.contains("dram")) {
                continue;
            }
            let Some((package, _)) = parse_zone(zone) else {
                continue;
            };
            let device = if name.contains("package") {
                format!("cpu:{package}")
            } else {
                format!("{name}:{package}")
            };

            let counters = if zone_path.join("energy_uj").exists() {
                vec![open_counter(&zone_path)?]
            } else {
                // No counter of its own: sum the sub-zones
                let prefix = format!("{zone}:");
                let mut parts: Vec<String> = fs::read_dir(&zone_path)?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().to_string())
                    .filter(|part| part.starts_with(&prefix))
                    .collect();
                parts.sort();
                parts
                    .iter()
                    .map(|part| open_counter(&zone_path.join(part)))
                    .collect::<Result<Vec<_>>>()?
            };

            if counters.is_empty() {
                continue;
            }
            domains.push(Domain { device, counters });
        }
        Ok(domains)
    }
}

impl Default for Rapl {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Splits `intel-rapl:N` / `intel-rapl:N:M` into its package and sub-zone.
fn parse_zone(name: &str) -> Option<(u32, Option<u32>)> {
    let rest = name.strip_prefix("intel-rapl:")?;
    let mut parts = rest.split(':');
    let package = parts.next()?.parse().ok()?;
    let sub = match parts.next() {
        Some(sub) => Some(sub.parse().ok()?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((package, sub))
}

fn read_microjoules(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => TrackerError::measurement(
            "cpu",
            format!("permission denied reading {}", path.display()),
        ),
        _ => TrackerError::Io(e),
    })?;
    text.trim()
        .parse()
        .map_err(|_| TrackerError::measurement("cpu", format!("unparseable counter in {}", path.display())))
}

fn open_counter(zone_path: &Path) -> Result<Counter> {
    let path = zone_path.join("energy_uj");
    let max_range = fs::read_to_string(zone_path.join("max_energy_range_uj"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(u64::MAX);
    let last = read_microjoules(&path)?;
    Ok(Counter {
        path,
        max_range,
        last,
    })
}

/// Counter increase between two readings. A decrease means the counter
/// wrapped at `max_range`.
pub fn counter_delta(before: u64, after: u64, max_range: u64) -> u64 {
    if after >= before {
        after - before
    } else {
        max_range.saturating_sub(before) + after
    }
}

#[async_trait]
impl EnergyCollector for Rapl {
    fn name(&self) -> &str {
        "rapl"
    }

    fn is_available(&self) -> bool {
        fs::read_dir(&self.rapl_path)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .any(|entry| parse_zone(&entry.file_name().to_string_lossy()).is_some())
            })
            .unwrap_or(false)
    }

    async fn init(&mut self) -> Result<()> {
        let domains = self
            .discover()
            .map_err(|e| TrackerError::unavailable("cpu", e))?;
        if domains.is_empty() {
            return Err(TrackerError::unavailable(
                "cpu",
                format!("no package or dram domains under {}", self.rapl_path.display()),
            ));
        }
        info!(
            "RAPL reading from {}: {:?}",
            self.rapl_path.display(),
            domains.iter().map(|d| &d.device).collect::<Vec<_>>()
        );
        self.domains = domains;
        self.last_read = Some(Instant::now());
        Ok(())
    }

    fn devices(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.device.clone()).collect()
    }

    async fn power_usage(&mut self) -> Result<Vec<f64>> {
        let now = Instant::now();
        let elapsed = self
            .last_read
            .map(|last| now.duration_since(last).as_secs_f64())
            .unwrap_or(0.0);

        let mut watts = Vec::with_capacity(self.domains.len());
        for domain in &mut self.domains {
            let mut microjoules = 0u64;
            for counter in &mut domain.counters {
                let current = read_microjoules(&counter.path)?;
                microjoules += counter_delta(counter.last, current, counter.max_range);
                counter.last = current;
            }
            let power = if elapsed > 0.0 {
                microjoules as f64 / 1_000_000.0 / elapsed
            } else {
                0.0
            };
            watts.push(power);
        }
        self.last_read = Some(now);
        debug!("RAPL power (W): {:?}", watts);
        Ok(watts)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.last_read = None;
        Ok(())
    }
}
