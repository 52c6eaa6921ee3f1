use crate::collectors::{CollectorContext, ComponentKind};
use crate::component::{create_components, init_components, parse_filter, shutdown_components, Component};
use crate::confirm::ConfirmGate;
use crate::consumption::Consumption;
use crate::epoch::{Epoch, EpochLedger, Layout};
use crate::intensity::{IntensityContext, IntensityResolver};
use crate::predictor::{self, Projection};
use crate::run_log::{format_components, LogEvent, RunLogger, SCHEMA_VERSION};
use crate::sampler::Sampler;
use crate::utils::errors::{Result, TrackerError};
use crate::utils::psutils::current_username;
use chrono::Local;
use log::{debug, error, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

/// Power usage effectiveness of an average data center (Uptime Institute, 2023).
pub const DEFAULT_PUE: f64 = 1.58;

/// An epoch count that may also mean "every epoch".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochLimit {
    All,
    Count(u32),
}

impl EpochLimit {
    fn resolve(self, epochs: u32) -> u32 {
        match self {
            EpochLimit::All | EpochLimit::Count(0) => epochs,
            EpochLimit::Count(n) => n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Epochs the whole training is expected to run
    pub epochs: u32,
    /// Epochs observed before the total is predicted
    pub epochs_before_pred: EpochLimit,
    /// Epochs monitored before the actual result is reported
    pub monitor_epochs: EpochLimit,
    pub update_interval: Duration,
    pub interpretable: bool,
    pub stop_and_confirm: bool,
    pub ignore_errors: bool,
    /// `all` or a comma-separated list such as `cpu,gpu`
    pub components: String,
    pub devices_by_pid: bool,
    /// Monitored processes; the current process when empty
    pub pids: Vec<u32>,
    pub log_dir: Option<PathBuf>,
    pub verbose: u8,
    pub decimal_precision: usize,
    pub pue: f64,
}

impl TrackerConfig {
    pub fn new(epochs: u32) -> Self {
        Self {
            epochs,
            epochs_before_pred: EpochLimit::Count(1),
            monitor_epochs: EpochLimit::Count(1),
            update_interval: Duration::from_secs(10),
            interpretable: true,
            stop_and_confirm: false,
            ignore_errors: false,
            components: "all".to_string(),
            devices_by_pid: false,
            pids: Vec::new(),
            log_dir: None,
            verbose: 1,
            decimal_precision: 6,
            pue: DEFAULT_PUE,
        }
    }

    pub fn with_epochs_before_pred(mut self, limit: EpochLimit) -> Self {
        self.epochs_before_pred = limit;
        self
    }

    pub fn with_monitor_epochs(mut self, limit: EpochLimit) -> Self {
        self.monitor_epochs = limit;
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_interpretable(mut self, interpretable: bool) -> Self {
        self.interpretable = interpretable;
        self
    }

    pub fn with_stop_and_confirm(mut self, stop_and_confirm: bool) -> Self {
        self.stop_and_confirm = stop_and_confirm;
        self
    }

    pub fn with_ignore_errors(mut self, ignore_errors: bool) -> Self {
        self.ignore_errors = ignore_errors;
        self
    }

    pub fn with_components(mut self, components: impl Into<String>) -> Self {
        self.components = components.into();
        self
    }

    pub fn with_devices_by_pid(mut self, devices_by_pid: bool) -> Self {
        self.devices_by_pid = devices_by_pid;
        self
    }

    pub fn with_pids(mut self, pids: Vec<u32>) -> Self {
        self.pids = pids;
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_decimal_precision(mut self, precision: usize) -> Self {
        self.decimal_precision = precision;
        self
    }

    pub fn with_pue(mut self, pue: f64) -> Self {
        self.pue = pue;
        self
    }

    /// Epoch count at which the prediction is made.
    pub fn prediction_epoch(&self) -> u32 {
        self.epochs_before_pred.resolve(self.epochs)
    }

    /// Epoch count at which monitoring ends; never before the prediction.
    pub fn final_epoch(&self) -> u32 {
        self.monitor_epochs
            .resolve(self.epochs)
            .max(self.prediction_epoch())
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(TrackerError::InvalidConfig("epochs must be at least 1".to_string()));
        }
        if self.update_interval.is_zero() {
            return Err(TrackerError::InvalidConfig(
                "update interval must be positive".to_string(),
            ));
        }
        if !self.pue.is_finite() || self.pue <= 0.0 {
            return Err(TrackerError::InvalidConfig(format!(
                "PUE must be a positive number, got {}",
                self.pue
            )));
        }
        parse_filter(&self.components)?;
        Ok(())
    }

    fn collector_context(&self) -> CollectorContext {
        let pids = if self.pids.is_empty() {
            vec![std::process::id()]
        } else {
            self.pids.clone()
        };
        CollectorContext {
            pids,
            devices_by_pid: self.devices_by_pid,
            ..CollectorContext::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Running,
    Finished,
    Stopped,
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackerState::Idle => "idle",
            TrackerState::Running => "running",
            TrackerState::Finished => "finished",
            TrackerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Built-in components for `config`, one per requested kind that has a
/// backend on this host.
pub fn builtin_components(config: &TrackerConfig) -> Result<Vec<Component>> {
    create_components(&config.components, &config.collector_context())
}

/// Tracks the energy and carbon footprint of a training loop, epoch by epoch.
///
/// The tracker owns a small tokio runtime running the sampler. Drive it from
/// plain threads, not from inside another runtime.
pub struct Tracker {
    config: TrackerConfig,
    runtime: Runtime,
    /// Components waiting for the first epoch
    pending: Vec<Component>,
    ledger: Arc<Mutex<EpochLedger>>,
    sampler: Option<Sampler>,
    resolver: IntensityResolver,
    logger: Option<RunLogger>,
    gate: ConfirmGate,
    state: TrackerState,
    prediction: Option<Consumption>,
    actual: Option<Consumption>,
}

impl Tracker {
    /// Tracker over the built-in collectors with the default intensity
    /// context.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let components = builtin_components(&config)?;
        Self::create_with_collectors(config, components, IntensityContext::default())
    }

    /// Tracker over explicit components and intensity sources.
    pub fn create_with_collectors(
        config: TrackerConfig,
        components: Vec<Component>,
        intensity: IntensityContext,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("carbon-tracker-sampler")
            .enable_all()
            .build()?;
        Ok(Self {
            config,
            runtime,
            pending: components,
            ledger: Arc::new(Mutex::new(EpochLedger::default())),
            sampler: None,
            resolver: IntensityResolver::new(intensity),
            logger: None,
            gate: ConfirmGate::new(),
            state: TrackerState::Idle,
            prediction: None,
            actual: None,
        })
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Closed epochs so far.
    pub fn epochs(&self) -> Vec<Epoch> {
        self.lock_ledger().closed().to_vec()
    }

    /// Monitored components and their devices; empty until the first epoch.
    pub fn components(&self) -> Layout {
        self.lock_ledger().layout().clone()
    }

    /// Handle used to answer the `stop_and_confirm` pause from another thread.
    /// Without one, the question is asked on stdin.
    pub fn confirm_gate(&self) -> ConfirmGate {
        self.gate.clone()
    }

    pub fn prediction(&self) -> Option<&Consumption> {
        self.prediction.as_ref()
    }

    pub fn actual(&self) -> Option<&Consumption> {
        self.actual.as_ref()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.logger.as_ref().and_then(RunLogger::raw_path)
    }

    fn lock_ledger(&self) -> MutexGuard<'_, EpochLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn invalid_state(&self, operation: &'static str) -> TrackerError {
        TrackerError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    fn record(&mut self, event: LogEvent) {
        if let Some(logger) = self.logger.as_mut() {
            if let Err(e) = logger.record(event) {
                warn!("Failed to write run log: {}", e);
            }
        }
    }

    fn output(&mut self, message: &str, level: u8) {
        if let Some(logger) = self.logger.as_mut() {
            if let Err(e) = logger.output(message, level) {
                warn!("Failed to write output log: {}", e);
            }
        }
    }

    /// Starts the next epoch and returns its 1-based index. The first call
    /// initializes the components, opens the log and starts sampling.
    pub fn epoch_start(&mut self) -> Result<u32> {
        match self.state {
            TrackerState::Idle => self.begin()?,
            TrackerState::Running => self.check_sampler()?,
            TrackerState::Finished | TrackerState::Stopped => {
                return Err(self.invalid_state("start an epoch"));
            }
        }
        let index = self.lock_ledger().open(Instant::now(), Local::now())?;
        info!("Epoch {} started.", index);
        Ok(index)
    }

    fn begin(&mut self) -> Result<()> {
        let components = std::mem::take(&mut self.pending);
        let mut components = match self.runtime.block_on(init_components(components)) {
            Ok(components) => components,
            Err(e) => {
                self.state = TrackerState::Stopped;
                error!("{}", e);
                return Err(e);
            }
        };

        let logger = RunLogger::create(
            self.config.log_dir.as_deref(),
            self.config.verbose,
            self.config.decimal_precision,
        );
        let logger = match logger {
            Ok(logger) => logger,
            Err(e) => {
                self.runtime.block_on(shutdown_components(&mut components));
                self.state = TrackerState::Stopped;
                return Err(e);
            }
        };
        self.logger = Some(logger);

        let layout: Layout = components
            .iter()
            .map(|c| (c.kind().to_string(), c.devices().to_vec()))
            .collect();
        self.record(LogEvent::Header {
            version: SCHEMA_VERSION,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            user: current_username(),
            pue: self.config.pue,
            update_interval_s: self.config.update_interval.as_secs_f64(),
        });
        self.record(LogEvent::components(&layout));
        debug!(
            "Carbon intensity fetchers: {:?}",
            self.resolver.context().fetcher_names()
        );
        let found = format_components(&layout);
        info!("{}", found);
        self.output(&found, 1);
        self.output(
            &format!(
                "Only predicted and actual consumptions are multiplied by a PUE coefficient of {}.",
                self.config.pue
            ),
            2,
        );

        *self.lock_ledger() = EpochLedger::new(layout);
        let _guard = self.runtime.enter();
        self.sampler = Some(Sampler::spawn(
            components,
            Arc::clone(&self.ledger),
            self.config.update_interval,
            self.config.ignore_errors,
        ));
        self.state = TrackerState::Running;
        Ok(())
    }

    /// Finalizes the run if the sampler stopped on a measurement error.
    fn check_sampler(&mut self) -> Result<()> {
        let fault = self.lock_ledger().take_fault();
        match fault {
            Some(fault) => {
                self.finalize(true);
                Err(fault)
            }
            None => Ok(()),
        }
    }

    /// Ends the current epoch. Reports the prediction and the actual
    /// consumption when their epoch counts are reached.
    pub fn epoch_end(&mut self) -> Result<()> {
        if self.state != TrackerState::Running {
            return Err(self.invalid_state("end an epoch"));
        }
        if let Some(sampler) = &self.sampler {
            self.runtime.block_on(sampler.flush());
        }
        self.check_sampler()?;

        let epoch = self.lock_ledger().close(Instant::now())?.clone();
        info!("Epoch {} ended.", epoch.index);
        for usage in &epoch.components {
            info!(
                "Average power usage (W) for {}: {:?}",
                usage.component,
                usage.average_power(epoch.duration)
            );
        }
        self.record(LogEvent::epoch(&epoch));

        let count = epoch.index;
        let predict = count == self.config.prediction_epoch();
        if count == self.config.final_epoch() {
            self.report_actual();
            // A prediction for exactly the monitored epochs would repeat the actual
            if predict && self.config.epochs != count {
                self.report_prediction()?;
            }
            self.finalize(false);
            return Ok(());
        }
        if predict {
            self.report_prediction()?;
            if self.config.stop_and_confirm && !self.await_confirmation() {
                info!("Session ended by user.");
                self.finalize(true);
                return Err(TrackerError::ConfirmationDeclined);
            }
        }
        Ok(())
    }

    fn await_confirmation(&mut self) -> bool {
        if !self.gate.is_shared() && !self.gate.is_answered() {
            let gate = self.gate.clone();
            thread::spawn(move || {
                if let Err(e) = gate.prompt_stdin() {
                    warn!("Failed to read confirmation: {}", e);
                    gate.decline();
                }
            });
        }
        self.gate.wait()
    }

    fn report(&mut self, title: String, projection: Projection, forecast: Option<Duration>) -> Consumption {
        let intensity = self.runtime.block_on(self.resolver.resolve(forecast));
        info!("{}", intensity.message);
        self.output(&intensity.message, 2);
        self.record(LogEvent::Intensity(intensity.clone()));

        let consumption = Consumption::new(
            projection.epochs,
            projection.duration_s,
            projection.energy_kwh,
            intensity.g_per_kwh,
            self.config.interpretable,
        );
        if let Some(logger) = self.logger.as_mut() {
            if let Err(e) = logger.consumption(&title, &consumption) {
                warn!("Failed to write output log: {}", e);
            }
        }
        consumption
    }

    fn report_prediction(&mut self) -> Result<()> {
        let projection = predictor::project(self.lock_ledger().closed(), self.config.epochs, self.config.pue)?;
        let title = format!("Predicted consumption for {} epoch(s):", projection.epochs);
        let forecast = Duration::from_secs_f64(projection.duration_s.max(0.0));
        let prediction = self.report(title, projection, Some(forecast));
        self.record(LogEvent::Prediction(prediction.clone()));
        self.prediction = Some(prediction);
        Ok(())
    }

    fn report_actual(&mut self) {
        let projection = predictor::actual(self.lock_ledger().closed(), self.config.pue);
        let title = format!("Actual consumption for {} epoch(s):", projection.epochs);
        let actual = self.report(title, projection, None);
        self.record(LogEvent::Actual(actual.clone()));
        self.actual = Some(actual);
    }

    /// Stops sampling and closes the log. An early stop drops the open epoch
    /// and reports the epochs closed so far.
    fn finalize(&mut self, early_stop: bool) {
        if let Some(mut sampler) = self.sampler.take() {
            self.runtime.block_on(sampler.stop());
        }
        let (interrupted, closed) = {
            let mut ledger = self.lock_ledger();
            (ledger.discard_open(), ledger.closed().len())
        };
        if early_stop {
            if let Some(index) = interrupted {
                info!("Epoch {} was interrupted and is not counted.", index);
            }
            if closed > 0 && self.actual.is_none() {
                self.report_actual();
            }
            self.output(
                &format!(
                    "Training was interrupted before all {} epochs were monitored.",
                    self.config.final_epoch()
                ),
                1,
            );
        }
        self.record(LogEvent::Stopped { early_stop });
        self.output("Finished monitoring.", 1);
        self.state = if early_stop {
            TrackerState::Stopped
        } else {
            TrackerState::Finished
        };
        info!("Monitoring {}.", self.state);
    }

    /// Stops monitoring. Epochs closed so far are reported as an early stop.
    /// Calling it again, or after monitoring finished, does nothing.
    pub fn stop(&mut self) {
        match self.state {
            TrackerState::Idle => {
                self.pending.clear();
                self.state = TrackerState::Stopped;
            }
            TrackerState::Running => self.finalize(true),
            TrackerState::Finished | TrackerState::Stopped => {}
        }
    }

    /// Kinds of the components that are or will be monitored.
    pub fn component_kinds(&self) -> Vec<ComponentKind> {
        if self.state == TrackerState::Idle {
            return self.pending.iter().map(Component::kind).collect();
        }
        self.components()
            .iter()
            .filter_map(|(name, _)| ComponentKind::from_name(name))
            .collect()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if self.state == TrackerState::Running {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::SimulatedCollector;
    use crate::component::tests::{BrokenCollector, FailingCollector};
    use crate::intensity::{FixedLocation, Location, StaticFetcher, Validity};
    use crate::parser::{parse_all_logs, parse_log};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INTERVAL: Duration = Duration::from_millis(10);

    fn intensity() -> IntensityContext {
        IntensityContext::new()
            .with_location(FixedLocation(Location::new("Copenhagen, Denmark").with_country("DK")))
            .with_fetcher(StaticFetcher::new("static", 82.0))
    }

    fn simulated() -> Vec<Component> {
        vec![
            Component::new(
                ComponentKind::Gpu,
                Box::new(SimulatedCollector::new("Sim GPU", 300.0, 0.5).unwrap()),
            ),
            Component::new(
                ComponentKind::Cpu,
                Box::new(SimulatedCollector::new("Sim CPU", 100.0, 0.5).unwrap()),
            ),
        ]
    }

    fn config(epochs: u32, log_dir: &Path) -> TrackerConfig {
        TrackerConfig::new(epochs)
            .with_update_interval(INTERVAL)
            .with_log_dir(log_dir)
            .with_verbose(0)
            .with_pue(1.0)
    }

    fn run_epoch(tracker: &mut Tracker) -> Result<()> {
        tracker.epoch_start()?;
        thread::sleep(Duration::from_millis(30));
        tracker.epoch_end()
    }

    #[test]
    fn test_config_normalization() {
        let config = TrackerConfig::new(10);
        assert_eq!((config.prediction_epoch(), config.final_epoch()), (1, 1));

        let config = TrackerConfig::new(10).with_epochs_before_pred(EpochLimit::Count(0));
        assert_eq!((config.prediction_epoch(), config.final_epoch()), (10, 10));

        let config = TrackerConfig::new(10)
            .with_epochs_before_pred(EpochLimit::Count(3))
            .with_monitor_epochs(EpochLimit::Count(2));
        assert_eq!(config.final_epoch(), 3);

        let config = TrackerConfig::new(10).with_monitor_epochs(EpochLimit::All);
        assert_eq!((config.prediction_epoch(), config.final_epoch()), (1, 10));
    }

    #[test]
    fn test_config_validation() {
        assert!(TrackerConfig::new(0).validate().is_err());
        assert!(TrackerConfig::new(1).with_update_interval(Duration::ZERO).validate().is_err());
        assert!(TrackerConfig::new(1).with_pue(f64::NAN).validate().is_err());
        assert!(TrackerConfig::new(1).with_components("tpu").validate().is_err());
        assert!(TrackerConfig::new(1).with_components("cpu, gpu").validate().is_ok());
    }

    #[test]
    fn test_single_epoch_reports_actual_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker =
            Tracker::create_with_collectors(config(1, dir.path()), simulated(), intensity()).unwrap();
        run_epoch(&mut tracker).unwrap();

        assert_eq!(tracker.state(), TrackerState::Finished);
        assert!(tracker.prediction().is_none());
        let epochs = tracker.epochs();
        assert_eq!(epochs.len(), 1);
        let actual = tracker.actual().unwrap().clone();
        assert_eq!(actual.epochs, 1);
        assert!(actual.energy_kwh > 0.0);
        assert!((actual.energy_kwh - epochs[0].energy_kwh()).abs() < 1e-15);
        assert!((actual.co2eq_g - actual.energy_kwh * 82.0).abs() < 1e-15);

        let run = parse_log(tracker.log_path().unwrap()).unwrap();
        assert!(!run.early_stop);
        assert_eq!(run.actual, Some(actual));
        assert!(run.prediction.is_none());
        assert_eq!(run.epochs.len(), 1);
        assert_eq!(run.components.len(), 2);
        assert_eq!(run.components[0].devices, vec!["Sim GPU"]);
        assert_eq!(run.intensities[0].validity, Validity::Measured);
        assert!((run.epochs[0].duration_s - epochs[0].duration.as_secs_f64()).abs() < 1e-9);
    }

    #[test]
    fn test_prediction_before_actual() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(10, dir.path())
            .with_epochs_before_pred(EpochLimit::Count(2))
            .with_monitor_epochs(EpochLimit::Count(3));
        let mut tracker = Tracker::create_with_collectors(config, simulated(), intensity()).unwrap();

        run_epoch(&mut tracker).unwrap();
        assert!(tracker.prediction().is_none());
        run_epoch(&mut tracker).unwrap();
        let prediction = tracker.prediction().unwrap().clone();
        let observed: f64 = tracker.epochs().iter().map(Epoch::energy_kwh).sum();
        assert_eq!(prediction.epochs, 10);
        assert!((prediction.energy_kwh - observed * 5.0).abs() < 1e-12);
        assert_eq!(tracker.state(), TrackerState::Running);

        run_epoch(&mut tracker).unwrap();
        assert_eq!(tracker.state(), TrackerState::Finished);
        assert_eq!(tracker.actual().unwrap().epochs, 3);

        let run = parse_log(tracker.log_path().unwrap()).unwrap();
        assert_eq!(run.prediction, Some(prediction));
        assert_eq!(run.epochs.len(), 3);
        assert!(!run.early_stop);
    }

    #[test]
    fn test_coinciding_boundaries_report_both() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker =
            Tracker::create_with_collectors(config(4, dir.path()), simulated(), intensity()).unwrap();
        run_epoch(&mut tracker).unwrap();
        assert_eq!(tracker.state(), TrackerState::Finished);
        assert_eq!(tracker.actual().unwrap().epochs, 1);
        assert_eq!(tracker.prediction().unwrap().epochs, 4);
    }

    #[test]
    fn test_stop_mid_epoch_is_early_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(5, dir.path()).with_monitor_epochs(EpochLimit::All);
        let mut tracker = Tracker::create_with_collectors(config, simulated(), intensity()).unwrap();
        run_epoch(&mut tracker).unwrap();
        run_epoch(&mut tracker).unwrap();
        tracker.epoch_start().unwrap();
        thread::sleep(Duration::from_millis(20));
        tracker.stop();
        tracker.stop();

        assert_eq!(tracker.state(), TrackerState::Stopped);
        assert_eq!(tracker.epochs().len(), 2);
        let runs = parse_all_logs(dir.path()).unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].early_stop);
        assert_eq!(runs[0].actual.as_ref().unwrap().epochs, 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_no_components_writes_no_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let components = vec![Component::new(
            ComponentKind::Gpu,
            Box::new(BrokenCollector {
                shutdowns: Arc::clone(&shutdowns),
            }),
        )];
        let mut tracker =
            Tracker::create_with_collectors(config(1, &log_dir), components, intensity()).unwrap();
        assert!(matches!(tracker.epoch_start(), Err(TrackerError::AllHandlersUnavailable)));
        assert_eq!(tracker.state(), TrackerState::Stopped);
        assert!(!log_dir.exists());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lifecycle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker =
            Tracker::create_with_collectors(config(1, dir.path()), simulated(), intensity()).unwrap();
        assert!(matches!(tracker.epoch_end(), Err(TrackerError::InvalidState { .. })));
        tracker.epoch_start().unwrap();
        assert!(matches!(tracker.epoch_start(), Err(TrackerError::InvalidState { .. })));
        tracker.epoch_end().unwrap();
        assert_eq!(tracker.state(), TrackerState::Finished);
        assert!(matches!(tracker.epoch_start(), Err(TrackerError::InvalidState { .. })));
        tracker.stop();
        assert_eq!(tracker.state(), TrackerState::Finished);
    }

    #[test]
    fn test_stop_before_start_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let mut tracker =
            Tracker::create_with_collectors(config(3, &log_dir), simulated(), intensity()).unwrap();
        assert_eq!(tracker.component_kinds(), vec![ComponentKind::Gpu, ComponentKind::Cpu]);
        tracker.stop();
        assert_eq!(tracker.state(), TrackerState::Stopped);
        assert!(!log_dir.exists());
    }

    #[test]
    fn test_measurement_error_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let components = vec![Component::new(
            ComponentKind::Cpu,
            Box::new(FailingCollector {
                watts: 20.0,
                good_reads: 1,
                shutdowns: Arc::clone(&shutdowns),
            }),
        )];
        let config = config(3, dir.path()).with_monitor_epochs(EpochLimit::All);
        let mut tracker = Tracker::create_with_collectors(config, components, intensity()).unwrap();

        let result = run_epoch(&mut tracker);
        assert!(matches!(result, Err(TrackerError::Measurement { .. })));
        assert_eq!(tracker.state(), TrackerState::Stopped);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let run = parse_log(tracker.log_path().unwrap()).unwrap();
        assert!(run.early_stop);
        assert!(run.epochs.is_empty());
    }

    #[test]
    fn test_ignored_errors_keep_running() {
        let dir = tempfile::tempdir().unwrap();
        let components = vec![Component::new(
            ComponentKind::Cpu,
            Box::new(FailingCollector {
                watts: 20.0,
                good_reads: 1,
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }),
        )];
        let config = config(2, dir.path())
            .with_monitor_epochs(EpochLimit::All)
            .with_ignore_errors(true);
        let mut tracker = Tracker::create_with_collectors(config, components, intensity()).unwrap();
        run_epoch(&mut tracker).unwrap();
        run_epoch(&mut tracker).unwrap();
        assert_eq!(tracker.state(), TrackerState::Finished);
        assert!(tracker.actual().unwrap().energy_kwh > 0.0);
    }

    #[test]
    fn test_declined_confirmation_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(5, dir.path())
            .with_monitor_epochs(EpochLimit::All)
            .with_stop_and_confirm(true);
        let mut tracker = Tracker::create_with_collectors(config, simulated(), intensity()).unwrap();
        let gate = tracker.confirm_gate();
        let answer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            gate.decline();
        });

        assert!(matches!(run_epoch(&mut tracker), Err(TrackerError::ConfirmationDeclined)));
        answer.join().unwrap();
        assert_eq!(tracker.state(), TrackerState::Stopped);
        let run = parse_log(tracker.log_path().unwrap()).unwrap();
        assert!(run.early_stop);
        assert_eq!(run.prediction.unwrap().epochs, 5);
        assert_eq!(run.actual.unwrap().epochs, 1);
    }

    #[test]
    fn test_confirmed_training_continues() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(3, dir.path())
            .with_monitor_epochs(EpochLimit::All)
            .with_stop_and_confirm(true);
        let mut tracker = Tracker::create_with_collectors(config, simulated(), intensity()).unwrap();
        tracker.confirm_gate().confirm();

        run_epoch(&mut tracker).unwrap();
        assert_eq!(tracker.state(), TrackerState::Running);
        run_epoch(&mut tracker).unwrap();
        run_epoch(&mut tracker).unwrap();
        assert_eq!(tracker.state(), TrackerState::Finished);
    }

    #[test]
    fn test_drop_finalizes_running_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(5, dir.path()).with_monitor_epochs(EpochLimit::All);
        let mut tracker = Tracker::create_with_collectors(config, simulated(), intensity()).unwrap();
        run_epoch(&mut tracker).unwrap();
        drop(tracker);

        let runs = parse_all_logs(dir.path()).unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].early_stop);
        assert_eq!(runs[0].actual.as_ref().unwrap().epochs, 1);
    }

    #[test]
    fn test_without_log_dir_nothing_is_written() {
        let config = TrackerConfig::new(1)
            .with_update_interval(INTERVAL)
            .with_verbose(0);
        let mut tracker = Tracker::create_with_collectors(config, simulated(), intensity()).unwrap();
        run_epoch(&mut tracker).unwrap();
        assert!(tracker.log_path().is_none());
        assert_eq!(tracker.state(), TrackerState::Finished);
    }
}
