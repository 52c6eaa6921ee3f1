pub mod nvidia_gpu;
pub mod powermetrics;
pub mod rapl;
pub mod simulated;
pub mod tdp;

use crate::utils::errors::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub use nvidia_gpu::NvidiaGpu;
pub use powermetrics::{PowerMetricsCpu, PowerMetricsGpu, PowerMetricsSource};
pub use rapl::Rapl;
pub use simulated::SimulatedCollector;
pub use tdp::TdpEstimate;

/// Hardware component a collector reports for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    Gpu,
    Cpu,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 2] = [ComponentKind::Gpu, ComponentKind::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Gpu => "gpu",
            ComponentKind::Cpu => "cpu",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gpu" => Some(ComponentKind::Gpu),
            "cpu" => Some(ComponentKind::Cpu),
            _ => None,
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the built-in collectors need to know about the monitored workload.
#[derive(Clone, Default)]
pub struct CollectorContext {
    /// Processes whose GPUs are monitored when `devices_by_pid` is set
    pub pids: Vec<u32>,
    pub devices_by_pid: bool,
    /// Shared `powermetrics` sampler, so CPU and GPU read the same sample
    pub powermetrics: Arc<PowerMetricsSource>,
}

pub type CollectorFactory = fn(&CollectorContext) -> Box<dyn EnergyCollector>;

fn rapl(_: &CollectorContext) -> Box<dyn EnergyCollector> {
    Box::new(Rapl::default())
}

fn powermetrics_cpu(ctx: &CollectorContext) -> Box<dyn EnergyCollector> {
    Box::new(PowerMetricsCpu::new(Arc::clone(&ctx.powermetrics)))
}

fn tdp_estimate(_: &CollectorContext) -> Box<dyn EnergyCollector> {
    Box::new(TdpEstimate::default())
}

fn nvidia_gpu(ctx: &CollectorContext) -> Box<dyn EnergyCollector> {
    Box::new(NvidiaGpu::new(ctx.pids.clone(), ctx.devices_by_pid))
}

fn powermetrics_gpu(ctx: &CollectorContext) -> Box<dyn EnergyCollector> {
    Box::new(PowerMetricsGpu::new(Arc::clone(&ctx.powermetrics)))
}

/// Backends for `kind` in priority order.
pub fn builtin_factories(kind: ComponentKind) -> Vec<CollectorFactory> {
    match kind {
        ComponentKind::Cpu => vec![
            rapl as CollectorFactory,
            powermetrics_cpu,
            tdp_estimate,
        ],
        ComponentKind::Gpu => vec![nvidia_gpu as CollectorFactory, powermetrics_gpu],
    }
}

/// A source of power readings for one component.
///
/// Construction must be cheap and side-effect free; native resources are
/// acquired in `init` and released in `shutdown`.
#[async_trait]
pub trait EnergyCollector: Send + Sync + 'static {
    /// Backend name used in logs
    fn name(&self) -> &str;

    /// Check if this collector type is available on the system
    fn is_available(&self) -> bool;

    /// Acquire resources and discover devices
    async fn init(&mut self) -> Result<()>;

    /// Device names, in the order `power_usage` reports them
    fn devices(&self) -> Vec<String>;

    /// Current power draw in watts per device
    async fn power_usage(&mut self) -> Result<Vec<f64>>;

    /// Release resources; must be safe to call more than once
    async fn shutdown(&mut self) -> Result<()>;
}
