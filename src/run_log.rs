//! The two files written for every tracked run.
//!
//! `<pid>_<timestamp>_carbontracker.log` holds one JSON object per line and is
//! what the parser reads back. `<pid>_<timestamp>_carbontracker_output.log`
//! holds the same results formatted for people.

use crate::consumption::Consumption;
use crate::epoch::{Epoch, Layout};
use crate::intensity::CarbonIntensity;
use crate::utils::errors::Result;
use crate::utils::timefmt::format_duration;
use chrono::{DateTime, Local, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;
pub const RAW_SUFFIX: &str = "_carbontracker.log";
pub const OUTPUT_SUFFIX: &str = "_carbontracker_output.log";

const FILE_DATE_FORMAT: &str = "%Y-%m-%dT%H%M%SZ";
const LINE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const MESSAGE_PREFIX: &str = "CarbonTracker: ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDevices {
    pub component: String,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentUsage {
    pub component: String,
    /// Joules per device
    pub energy_j: Vec<f64>,
    /// Average watts per device
    pub avg_power_w: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEvent {
    Header {
        version: u32,
        crate_version: String,
        pid: u32,
        user: String,
        pue: f64,
        update_interval_s: f64,
    },
    Components {
        components: Vec<ComponentDevices>,
    },
    Epoch {
        index: u32,
        duration_s: f64,
        components: Vec<ComponentUsage>,
    },
    Intensity(CarbonIntensity),
    Prediction(Consumption),
    Actual(Consumption),
    Stopped {
        early_stop: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Local>,
    pub event: LogEvent,
}

impl LogEvent {
    pub fn epoch(epoch: &Epoch) -> Self {
        LogEvent::Epoch {
            index: epoch.index,
            duration_s: epoch.duration.as_secs_f64(),
            components: epoch
                .components
                .iter()
                .map(|usage| ComponentUsage {
                    component: usage.component.clone(),
                    energy_j: usage.joules.clone(),
                    avg_power_w: usage.average_power(epoch.duration),
                })
                .collect(),
        }
    }

    pub fn components(layout: &Layout) -> Self {
        LogEvent::Components {
            components: layout
                .iter()
                .map(|(component, devices)| ComponentDevices {
                    component: component.clone(),
                    devices: devices.clone(),
                })
                .collect(),
        }
    }
}

/// `Actual consumption for 2 epoch(s):` followed by time, energy, CO2eq and
/// equivalents, one per tab-indented line.
pub fn format_consumption(title: &str, consumption: &Consumption, precision: usize) -> String {
    let mut text = format!(
        "{title}\n\tTime:\t{}\n\tEnergy:\t{:.p$} kWh\n\tCO2eq:\t{:.p$} g",
        format_duration(consumption.duration_s),
        consumption.energy_kwh,
        consumption.co2eq_g,
        p = precision
    );
    if !consumption.equivalents.is_empty() {
        text.push_str("\n\tThis is equivalent to:");
        for equivalent in &consumption.equivalents {
            text.push_str(&format!("\n\t{:.p$} {}", equivalent.value, equivalent.unit, p = precision));
        }
    }
    text
}

/// `GPU with device(s) A, B. CPU with device(s) cpu:0.`
pub fn format_components(layout: &Layout) -> String {
    let mut parts = vec!["The following components were found:".to_string()];
    for (component, devices) in layout {
        parts.push(format!(
            "{} with device(s) {}.",
            component.to_uppercase(),
            devices.join(", ")
        ));
    }
    parts.join(" ")
}

struct LogFiles {
    raw: File,
    output: File,
    raw_path: PathBuf,
    output_path: PathBuf,
}

/// Opens a fresh `(raw, output)` pair, adding a counter to the name when a
/// run with the same pid and second already exists.
fn open_pair(log_dir: &Path, pid: u32, now: DateTime<Utc>) -> Result<LogFiles> {
    fs::create_dir_all(log_dir)?;
    let stamp = now.format(FILE_DATE_FORMAT);
    let mut attempt = 0u32;
    loop {
        let prefix = match attempt {
            0 => format!("{pid}_{stamp}"),
            n => format!("{pid}_{stamp}.{n}"),
        };
        let raw_path = log_dir.join(format!("{prefix}{RAW_SUFFIX}"));
        let output_path = log_dir.join(format!("{prefix}{OUTPUT_SUFFIX}"));
        let raw = match OpenOptions::new().write(true).create_new(true).open(&raw_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let output = OpenOptions::new().append(true).create(true).open(&output_path)?;
        return Ok(LogFiles {
            raw,
            output,
            raw_path,
            output_path,
        });
    }
}

/// Writes the run's event stream and its human-readable companion. Without a
/// log directory only console output is produced.
pub struct RunLogger {
    files: Option<LogFiles>,
    verbose: u8,
    precision: usize,
}

impl RunLogger {
    pub fn create(log_dir: Option<&Path>, verbose: u8, precision: usize) -> Result<Self> {
        let files = match log_dir {
            Some(dir) => {
                let files = open_pair(dir, std::process::id(), Utc::now())?;
                debug!("Logging run to {:?}", files.raw_path);
                Some(files)
            }
            None => None,
        };
        Ok(Self {
            files,
            verbose,
            precision,
        })
    }

    pub fn raw_path(&self) -> Option<&Path> {
        self.files.as_ref().map(|files| files.raw_path.as_path())
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.files.as_ref().map(|files| files.output_path.as_path())
    }

    /// Appends one event to the raw log and flushes it.
    pub fn record(&mut self, event: LogEvent) -> Result<()> {
        let Some(files) = self.files.as_mut() else {
            return Ok(());
        };
        let entry = LogEntry {
            time: Local::now(),
            event,
        };
        let line = serde_json::to_string(&entry).map_err(io::Error::from)?;
        writeln!(files.raw, "{line}")?;
        files.raw.flush()?;
        Ok(())
    }

    /// Writes a message to the output log, and to stdout when `verbose`
    /// reaches `level`.
    pub fn output(&mut self, message: &str, level: u8) -> Result<()> {
        if self.verbose >= level {
            println!("{MESSAGE_PREFIX}{message}");
        }
        let Some(files) = self.files.as_mut() else {
            return Ok(());
        };
        writeln!(
            files.output,
            "{} - {MESSAGE_PREFIX}{message}",
            Local::now().format(LINE_DATE_FORMAT)
        )?;
        files.output.flush()?;
        Ok(())
    }

    pub fn consumption(&mut self, title: &str, consumption: &Consumption) -> Result<()> {
        let text = format_consumption(title, consumption, self.precision);
        self.output(&format!("\n{text}"), 1)
    }
}
