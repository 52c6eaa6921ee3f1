pub mod fetcher;
pub mod location;

pub use fetcher::{IntensityFetcher, StaticFetcher};
pub use location::{FixedLocation, Location, LocationProvider};

use crate::utils::errors::{Result, TrackerError};
use crate::utils::timefmt::format_duration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Average carbon intensity for EU-28 in 2017 (EEA), gCO2/kWh.
pub const EU_28_2017_CARBON_INTENSITY: f64 = 294.2060978;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How a carbon intensity value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Validity {
    Measured,
    Forecast,
    AverageFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarbonIntensity {
    pub g_per_kwh: f64,
    pub validity: Validity,
    pub location: Option<String>,
    pub message: String,
}

/// Everything the resolver needs: where to look and what to fall back on.
#[derive(Clone)]
pub struct IntensityContext {
    location: Option<Arc<dyn LocationProvider>>,
    fetchers: Vec<Arc<dyn IntensityFetcher>>,
    timeout: Duration,
    fallback_g_per_kwh: f64,
    fallback_label: String,
}

impl Default for IntensityContext {
    fn default() -> Self {
        Self {
            location: None,
            fetchers: Vec::new(),
            timeout: DEFAULT_FETCH_TIMEOUT,
            fallback_g_per_kwh: EU_28_2017_CARBON_INTENSITY,
            fallback_label: "EU-28 in 2017".to_string(),
        }
    }
}

impl IntensityContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(mut self, provider: impl LocationProvider + 'static) -> Self {
        self.location = Some(Arc::new(provider));
        self
    }

    /// Appends a fetcher; earlier fetchers take priority.
    pub fn with_fetcher(mut self, fetcher: impl IntensityFetcher + 'static) -> Self {
        self.fetchers.push(Arc::new(fetcher));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fallback(mut self, g_per_kwh: f64, label: impl Into<String>) -> Self {
        self.fallback_g_per_kwh = g_per_kwh;
        self.fallback_label = label.into();
        self
    }

    pub fn fetcher_names(&self) -> Vec<String> {
        self.fetchers.iter().map(|f| f.name().to_string()).collect()
    }
}

/// Resolves carbon intensity through the context's fetchers in priority
/// order. Never fails: when nothing answers, the fallback average is used.
pub struct IntensityResolver {
    context: IntensityContext,
    location: OnceCell<Option<Location>>,
}

impl IntensityResolver {
    pub fn new(context: IntensityContext) -> Self {
        Self {
            context,
            location: OnceCell::new(),
        }
    }

    pub fn context(&self) -> &IntensityContext {
        &self.context
    }

    /// Location of this host, looked up on first use only.
    pub async fn location(&self) -> Option<&Location> {
        self.location
            .get_or_init(|| async {
                let provider = self.context.location.as_ref()?;
                match self.bounded("location", provider.locate()).await {
                    Ok(location) => Some(location),
                    Err(e) => {
                        warn!("{}", e);
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    /// Current intensity, or the forecast average over `forecast_over` when
    /// the chosen fetcher offers forecasts.
    pub async fn resolve(&self, forecast_over: Option<Duration>) -> CarbonIntensity {
        let Some(location) = self.location().await else {
            return self.fallback("Failed to retrieve location based on IP. ");
        };

        for fetcher in &self.context.fetchers {
            if !fetcher.suitable(location) {
                debug!("Skipping intensity fetcher {}: not suitable", fetcher.name());
                continue;
            }
            if let Some(duration) = forecast_over.filter(|_| fetcher.supports_forecast()) {
                let reading = self.bounded(fetcher.name(), fetcher.forecast(location, duration)).await;
                if let Some(g_per_kwh) = accept(fetcher.name(), reading) {
                    return CarbonIntensity {
                        g_per_kwh,
                        validity: Validity::Forecast,
                        location: Some(location.address.clone()),
                        message: format!(
                            "Carbon intensity for the next {} is predicted to be {:.2} gCO2/kWh at detected location: {}.",
                            format_duration(duration.as_secs_f64()),
                            g_per_kwh,
                            location.address
                        ),
                    };
                }
                debug!("No forecast from {}; using its current reading", fetcher.name());
            }
            let reading = self.bounded(fetcher.name(), fetcher.carbon_intensity(location)).await;
            if let Some(g_per_kwh) = accept(fetcher.name(), reading) {
                return CarbonIntensity {
                    g_per_kwh,
                    validity: Validity::Measured,
                    location: Some(location.address.clone()),
                    message: format!(
                        "Current carbon intensity is {:.2} gCO2/kWh at detected location: {}.",
                        g_per_kwh, location.address
                    ),
                };
            }
        }
        self.fallback("")
    }

    /// Runs `future` under the context timeout.
    async fn bounded<T>(
        &self,
        name: &str,
        future: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.context.timeout, future)
            .await
            .map_err(|_| TrackerError::Fetch {
                fetcher: name.to_string(),
                message: format!("timed out after {:?}", self.context.timeout),
            })?
    }

    fn fallback(&self, prefix: &str) -> CarbonIntensity {
        let g_per_kwh = self.context.fallback_g_per_kwh;
        CarbonIntensity {
            g_per_kwh,
            validity: Validity::AverageFallback,
            location: None,
            message: format!(
                "{prefix}Location specific carbon intensity could not be fetched. Used average carbon intensity for {} of {:.2} gCO2/kWh.",
                self.context.fallback_label, g_per_kwh
            ),
        }
    }
}

/// A usable reading: finite and non-negative. Anything else is logged.
fn accept(fetcher: &str, reading: Result<f64>) -> Option<f64> {
    match reading {
        Ok(g_per_kwh) if g_per_kwh.is_finite() && g_per_kwh >= 0.0 => Some(g_per_kwh),
        Ok(g_per_kwh) => {
            warn!("Intensity fetcher {} returned an invalid value: {}", fetcher, g_per_kwh);
            None
        }
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}
