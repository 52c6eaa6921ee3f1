//! Reading runs back from their raw logs.

use crate::consumption::{Consumption, Equivalent};
use crate::intensity::CarbonIntensity;
use crate::run_log::{ComponentDevices, ComponentUsage, LogEntry, LogEvent, RAW_SUFFIX, SCHEMA_VERSION};
use crate::utils::errors::{Result, TrackerError};
use itertools::multiunzip;
use log::warn;
use polars::prelude::*;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    pub index: u32,
    pub duration_s: f64,
    pub components: Vec<ComponentUsage>,
}

/// Everything one raw log says about its run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub path: PathBuf,
    pub pid: u32,
    pub user: String,
    pub pue: f64,
    pub components: Vec<ComponentDevices>,
    pub epochs: Vec<EpochRecord>,
    pub intensities: Vec<CarbonIntensity>,
    pub prediction: Option<Consumption>,
    pub actual: Option<Consumption>,
    /// Also set when the log ends without a `stopped` event
    pub early_stop: bool,
}

fn format_error(path: &Path, line: usize, message: impl ToString) -> TrackerError {
    TrackerError::LogFormat {
        path: path.to_path_buf(),
        line,
        message: message.to_string(),
    }
}

pub fn parse_log(path: &Path) -> Result<RunRecord> {
    let content = fs::read_to_string(path)?;
    // Every entry ends with a newline; a last line without one was cut off
    let complete = content.ends_with('\n');
    let mut lines = content
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line))
        .filter(|(_, line)| !line.trim().is_empty())
        .peekable();

    let (line_no, first) = lines
        .next()
        .ok_or_else(|| format_error(path, 0, "empty log"))?;
    let header: LogEntry =
        serde_json::from_str(first).map_err(|e| format_error(path, line_no, e))?;
    let LogEvent::Header {
        version, pid, user, pue, ..
    } = header.event
    else {
        return Err(format_error(path, line_no, "log does not start with a header"));
    };
    if version != SCHEMA_VERSION {
        return Err(format_error(
            path,
            line_no,
            format!("unsupported schema version {version}"),
        ));
    }

    let mut run = RunRecord {
        path: path.to_path_buf(),
        pid,
        user,
        pue,
        components: Vec::new(),
        epochs: Vec::new(),
        intensities: Vec::new(),
        prediction: None,
        actual: None,
        early_stop: true,
    };
    while let Some((line_no, line)) = lines.next() {
        let entry: LogEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) if !complete && lines.peek().is_none() => {
                warn!("{}: ignoring truncated line {}: {}", path.display(), line_no, e);
                break;
            }
            Err(e) => return Err(format_error(path, line_no, e)),
        };
        match entry.event {
            LogEvent::Header { .. } => {
                return Err(format_error(path, line_no, "duplicate header"));
            }
            LogEvent::Components { components } => run.components = components,
            LogEvent::Epoch {
                index,
                duration_s,
                components,
            } => run.epochs.push(EpochRecord {
                index,
                duration_s,
                components,
            }),
            LogEvent::Intensity(intensity) => run.intensities.push(intensity),
            LogEvent::Prediction(prediction) => run.prediction = Some(prediction),
            LogEvent::Actual(actual) => run.actual = Some(actual),
            LogEvent::Stopped { early_stop } => run.early_stop = early_stop,
        }
    }
    Ok(run)
}

/// Raw logs in `log_dir`, sorted by name.
pub fn raw_logs(log_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let is_raw = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(RAW_SUFFIX));
        if is_raw && path.is_file() {
            logs.push(path);
        }
    }
    logs.sort();
    Ok(logs)
}

/// Parses every raw log in `log_dir`. Logs that cannot be parsed are logged
/// and left out.
pub fn parse_all_logs(log_dir: &Path) -> Result<Vec<RunRecord>> {
    let mut runs = Vec::new();
    for path in raw_logs(log_dir)? {
        match parse_log(&path) {
            Ok(run) => runs.push(run),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }
    Ok(runs)
}

/// The raw log modified last, if any.
pub fn most_recent_log(log_dir: &Path) -> Result<Option<PathBuf>> {
    let mut newest = None;
    for path in raw_logs(log_dir)? {
        let modified = fs::metadata(&path)?.modified()?;
        if newest.as_ref().is_none_or(|(time, _)| modified >= *time) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// One row per run: file | pid | epochs | early_stop | duration_s |
/// energy_kwh | co2eq_g. Runs without an actual result are left out.
pub fn runs_frame(runs: &[RunRecord]) -> Result<DataFrame> {
    let (files, pids, epochs, early_stops, durations, energies, co2eqs): (
        Vec<String>,
        Vec<u32>,
        Vec<u32>,
        Vec<bool>,
        Vec<f64>,
        Vec<f64>,
        Vec<f64>,
    ) = multiunzip(runs.iter().filter_map(|run| {
        let actual = run.actual.as_ref()?;
        Some((
            run.path.display().to_string(),
            run.pid,
            actual.epochs,
            run.early_stop,
            actual.duration_s,
            actual.energy_kwh,
            actual.co2eq_g,
        ))
    }));

    df![
        "file" => files,
        "pid" => pids,
        "epochs" => epochs,
        "early_stop" => early_stops,
        "duration_s" => durations,
        "energy_kwh" => energies,
        "co2eq_g" => co2eqs,
    ]
    .map_err(|e| TrackerError::Frame(format!("Failed to create runs DataFrame: {}", e)))
}

fn column_sum(frame: &DataFrame, name: &str) -> Result<f64> {
    let column = frame
        .column(name)
        .map_err(|e| TrackerError::Frame(format!("Failed to access {} column: {}", name, e)))?;
    let values = column
        .f64()
        .map_err(|e| TrackerError::Frame(format!("{} column is not f64: {}", name, e)))?;
    Ok(values.iter().flatten().filter(|v| v.is_finite()).sum())
}

/// Combined actual consumption of every run in a directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub runs: usize,
    pub energy_kwh: f64,
    pub co2eq_g: f64,
    pub equivalents: Vec<Equivalent>,
}

pub fn aggregate(runs: &[RunRecord]) -> Result<Aggregate> {
    let frame = runs_frame(runs)?;
    let mut equivalents: Vec<Equivalent> = Vec::new();
    for equivalent in runs
        .iter()
        .filter_map(|run| run.actual.as_ref())
        .flat_map(|actual| &actual.equivalents)
    {
        match equivalents.iter_mut().find(|e| e.unit == equivalent.unit) {
            Some(total) => total.value += equivalent.value,
            None => equivalents.push(equivalent.clone()),
        }
    }
    Ok(Aggregate {
        runs: frame.height(),
        energy_kwh: column_sum(&frame, "energy_kwh")?,
        co2eq_g: column_sum(&frame, "co2eq_g")?,
        equivalents,
    })
}

pub fn aggregate_consumption(log_dir: &Path) -> Result<Aggregate> {
    aggregate(&parse_all_logs(log_dir)?)
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The training of models in this work is estimated to use {:.3} kWh of electricity contributing to {:.3} kg of CO2eq.",
            self.energy_kwh,
            self.co2eq_g / 1000.0
        )?;
        if !self.equivalents.is_empty() {
            let equivalents = self
                .equivalents
                .iter()
                .map(|e| format!("{:.3} {}", e.value, e.unit))
                .collect::<Vec<_>>()
                .join(" or ");
            write!(f, " This is equivalent to {equivalents}.")?;
        }
        write!(f, " Measured by carbon-tracker.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::io::Write;

    fn line(event: LogEvent) -> String {
        serde_json::to_string(&LogEntry {
            time: Local::now(),
            event,
        })
        .unwrap()
    }

    fn header(version: u32) -> LogEvent {
        LogEvent::Header {
            version,
            crate_version: "0.1.0".to_string(),
            pid: 42,
            user: "alice".to_string(),
            pue: 1.58,
            update_interval_s: 10.0,
        }
    }

    fn actual(energy_kwh: f64, co2eq_g: f64) -> Consumption {
        Consumption {
            epochs: 2,
            duration_s: 20.0,
            energy_kwh,
            co2eq_g,
            intensity_g_per_kwh: co2eq_g / energy_kwh,
            equivalents: vec![Equivalent {
                value: co2eq_g / 120.4,
                unit: "km travelled by car".to_string(),
            }],
        }
    }

    fn write_log(dir: &Path, name: &str, events: Vec<LogEvent>) -> PathBuf {
        let path = dir.join(format!("{name}{RAW_SUFFIX}"));
        let mut file = fs::File::create(&path).unwrap();
        for event in events {
            writeln!(file, "{}", line(event)).unwrap();
        }
        path
    }

    #[test]
    fn test_parse_complete_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            "42_2024-03-26T105926Z",
            vec![
                header(SCHEMA_VERSION),
                LogEvent::Components {
                    components: vec![ComponentDevices {
                        component: "cpu".to_string(),
                        devices: vec!["cpu:0".to_string()],
                    }],
                },
                LogEvent::Epoch {
                    index: 1,
                    duration_s: 10.0,
                    components: vec![ComponentUsage {
                        component: "cpu".to_string(),
                        energy_j: vec![500.0],
                        avg_power_w: vec![50.0],
                    }],
                },
                LogEvent::Actual(actual(0.5, 100.0)),
                LogEvent::Stopped { early_stop: false },
            ],
        );
        let run = parse_log(&path).unwrap();
        assert_eq!(run.pid, 42);
        assert_eq!(run.user, "alice");
        assert_eq!(run.components[0].devices, vec!["cpu:0"]);
        assert_eq!(run.epochs.len(), 1);
        assert_eq!(run.epochs[0].components[0].avg_power_w, vec![50.0]);
        assert_eq!(run.actual, Some(actual(0.5, 100.0)));
        assert!(run.prediction.is_none());
        assert!(!run.early_stop);
    }

    #[test]
    fn test_missing_stop_means_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(dir.path(), "1_a", vec![header(SCHEMA_VERSION)]);
        assert!(parse_log(&path).unwrap().early_stop);
    }

    #[test]
    fn test_rejects_malformed_logs() {
        let dir = tempfile::tempdir().unwrap();
        let unknown = write_log(dir.path(), "1_a", vec![header(SCHEMA_VERSION + 1)]);
        assert!(matches!(parse_log(&unknown), Err(TrackerError::LogFormat { line: 1, .. })));

        let headless = write_log(dir.path(), "2_a", vec![LogEvent::Stopped { early_stop: false }]);
        assert!(parse_log(&headless).is_err());

        let garbled = dir.path().join(format!("3_a{RAW_SUFFIX}"));
        fs::write(&garbled, format!("{}\nnot json\n", line(header(SCHEMA_VERSION)))).unwrap();
        assert!(matches!(parse_log(&garbled), Err(TrackerError::LogFormat { line: 2, .. })));

        let empty = dir.path().join(format!("4_a{RAW_SUFFIX}"));
        fs::write(&empty, "").unwrap();
        assert!(parse_log(&empty).is_err());
    }

    #[test]
    fn test_truncated_last_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("5_a{RAW_SUFFIX}"));
        let epoch = line(LogEvent::Epoch {
            index: 1,
            duration_s: 10.0,
            components: Vec::new(),
        });
        let cut = line(LogEvent::Actual(actual(0.5, 100.0)));
        fs::write(
            &path,
            format!("{}\n{}\n{}", line(header(SCHEMA_VERSION)), epoch, &cut[..cut.len() / 2]),
        )
        .unwrap();

        let run = parse_log(&path).unwrap();
        assert_eq!(run.epochs.len(), 1);
        assert!(run.actual.is_none());
        assert!(run.early_stop);
    }

    #[test]
    fn test_aggregate_skips_unreadable_logs() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "1_a",
            vec![
                header(SCHEMA_VERSION),
                LogEvent::Actual(actual(0.5, 100.0)),
                LogEvent::Stopped { early_stop: false },
            ],
        );
        // Killed before the header was written
        fs::write(dir.path().join(format!("2_a{RAW_SUFFIX}")), "").unwrap();
        // Written by a newer version
        write_log(
            dir.path(),
            "3_a",
            vec![header(SCHEMA_VERSION + 1), LogEvent::Actual(actual(9.0, 900.0))],
        );
        // Cut off inside the header
        let head = line(header(SCHEMA_VERSION));
        fs::write(dir.path().join(format!("4_a{RAW_SUFFIX}")), &head[..10]).unwrap();

        assert_eq!(parse_all_logs(dir.path()).unwrap().len(), 1);
        let total = aggregate_consumption(dir.path()).unwrap();
        assert_eq!(total.runs, 1);
        assert!((total.energy_kwh - 0.5).abs() < 1e-12);
        assert!((total.co2eq_g - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_raw_logs_ignore_output_files() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), "2_b", vec![header(SCHEMA_VERSION)]);
        write_log(dir.path(), "1_a", vec![header(SCHEMA_VERSION)]);
        fs::write(dir.path().join("1_a_carbontracker_output.log"), "text").unwrap();
        fs::write(dir.path().join("notes.txt"), "text").unwrap();

        let logs = raw_logs(dir.path()).unwrap();
        let names: Vec<_> = logs
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["1_a_carbontracker.log", "2_b_carbontracker.log"]);
        assert!(most_recent_log(dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_aggregate_sums_actual_results() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "1_a",
            vec![header(SCHEMA_VERSION), LogEvent::Actual(actual(0.5, 100.0))],
        );
        write_log(
            dir.path(),
            "2_a",
            vec![
                header(SCHEMA_VERSION),
                LogEvent::Actual(actual(1.5, 500.0)),
                LogEvent::Stopped { early_stop: false },
            ],
        );
        // Interrupted before any actual result
        write_log(dir.path(), "3_a", vec![header(SCHEMA_VERSION)]);

        let total = aggregate_consumption(dir.path()).unwrap();
        assert_eq!(total.runs, 2);
        assert!((total.energy_kwh - 2.0).abs() < 1e-12);
        assert!((total.co2eq_g - 600.0).abs() < 1e-9);
        assert_eq!(total.equivalents.len(), 1);
        assert!((total.equivalents[0].value - 600.0 / 120.4).abs() < 1e-9);

        assert_eq!(
            total.to_string(),
            "The training of models in this work is estimated to use 2.000 kWh of electricity contributing to 0.600 kg of CO2eq. This is equivalent to 4.983 km travelled by car. Measured by carbon-tracker."
        );
    }

    #[test]
    fn test_empty_directory_aggregates_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let total = aggregate_consumption(dir.path()).unwrap();
        assert_eq!(total.runs, 0);
        assert_eq!(total.energy_kwh, 0.0);
        assert!(total.to_string().contains("0.000 kWh"));
    }
}
