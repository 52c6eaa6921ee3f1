use crate::component::{shutdown_components, Component};
use crate::epoch::EpochLedger;
use crate::utils::errors::Result;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Requests from the tracker to the sampling task.
#[derive(Debug)]
pub enum SamplerCommand {
    /// Sample now and acknowledge once the readings are folded
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Handle to the background task polling every component.
pub struct Sampler {
    commands: mpsc::Sender<SamplerCommand>,
    /// Track whether the sampling loop is still alive
    is_running: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl Sampler {
    /// Moves `components` into a new task on the current tokio runtime. The
    /// task owns them until it exits and shuts them down on the way out.
    pub fn spawn(
        components: Vec<Component>,
        ledger: Arc<Mutex<EpochLedger>>,
        interval: Duration,
        ignore_errors: bool,
    ) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let is_running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run_sampling_loop(
            components,
            ledger,
            rx,
            Arc::clone(&is_running),
            interval,
            ignore_errors,
        ));
        info!("Sampling started in background every {:?}", interval);
        Self {
            commands: tx,
            is_running,
            task_handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Takes one extra sample and waits until it is folded into the ledger.
    /// Returns false when the loop has already exited.
    pub async fn flush(&self) -> bool {
        let (reply, done) = oneshot::channel();
        if self.commands.send(SamplerCommand::Flush(reply)).await.is_err() {
            return false;
        }
        done.await.is_ok()
    }

    /// Stops the loop and waits until every component has been shut down.
    pub async fn stop(&mut self) {
        let _ = self.commands.send(SamplerCommand::Stop).await;
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Sampling task ended abnormally: {}", e);
            }
        }
        self.is_running.store(false, Ordering::Relaxed);
    }
}

/// Polls every component once and folds the readings into the ledger.
async fn sample_once(
    components: &mut [Component],
    ledger: &Mutex<EpochLedger>,
    ignore_errors: bool,
) -> Result<()> {
    for (index, component) in components.iter_mut().enumerate() {
        let reading = component.power_usage().await;
        let at = Instant::now();
        let mut ledger = ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let watts = match reading {
            Ok(watts) => watts,
            Err(e) if ignore_errors => {
                warn!("Ignoring failed {} reading: {}", component.kind(), e);
                ledger
                    .last_power(index)
                    .map(<[f64]>::to_vec)
                    .unwrap_or_else(|| vec![0.0; component.devices().len()])
            }
            Err(e) => return Err(e),
        };
        debug!("{} power: {:?} W", component.kind(), watts);
        ledger.fold(index, at, &watts);
    }
    Ok(())
}

async fn run_sampling_loop(
    mut components: Vec<Component>,
    ledger: Arc<Mutex<EpochLedger>>,
    mut commands: mpsc::Receiver<SamplerCommand>,
    is_running: Arc<AtomicBool>,
    interval: Duration,
    ignore_errors: bool,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut iteration: u64 = 0;

    while is_running.load(Ordering::Relaxed) {
        let reply = tokio::select! {
            _ = ticker.tick() => None,
            command = commands.recv() => match command {
                Some(SamplerCommand::Flush(reply)) => Some(reply),
                Some(SamplerCommand::Stop) | None => break,
            },
        };
        iteration += 1;

        if let Err(e) = sample_once(&mut components, &ledger, ignore_errors).await {
            error!("Sampling stopped: {}", e);
            ledger
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .set_fault(e);
            break;
        }
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    is_running.store(false, Ordering::Relaxed);
    shutdown_components(&mut components).await;
    debug!("Sampling stopped after {} iterations", iteration);
}
