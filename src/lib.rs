pub mod utils {
    pub mod errors;
    pub mod logger;
    pub mod psutils;
    pub mod timefmt;
}

// Hardware collectors
pub mod collectors;
pub mod component;

pub mod confirm;
pub mod consumption;
pub mod epoch;
pub mod intensity;
pub mod parser;
pub mod predictor;
pub mod run_log;
pub mod sampler;
pub mod tracker;

pub use collectors::{CollectorContext, ComponentKind, EnergyCollector};
pub use component::Component;
pub use confirm::ConfirmGate;
pub use consumption::Consumption;
pub use intensity::{CarbonIntensity, IntensityContext, IntensityFetcher, Validity};
pub use tracker::{EpochLimit, Tracker, TrackerConfig, TrackerState};
pub use utils::errors::{Result, TrackerError};
