use crate::intensity::location::Location;
use crate::utils::errors::{Result, TrackerError};
use async_trait::async_trait;
use std::time::Duration;

/// A source of grid carbon intensity (gCO2/kWh) for some locations.
#[async_trait]
pub trait IntensityFetcher: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this fetcher covers `location`.
    fn suitable(&self, location: &Location) -> bool;

    fn supports_forecast(&self) -> bool {
        false
    }

    /// Current intensity at `location`.
    async fn carbon_intensity(&self, location: &Location) -> Result<f64>;

    /// Average intensity predicted over the next `duration`.
    async fn forecast(&self, _location: &Location, _duration: Duration) -> Result<f64> {
        Err(TrackerError::Fetch {
            fetcher: self.name().to_string(),
            message: "forecasts are not supported".to_string(),
        })
    }
}

/// Fetcher returning fixed values, for offline use and tests.
#[derive(Debug, Clone)]
pub struct StaticFetcher {
    name: String,
    g_per_kwh: f64,
    forecast_g_per_kwh: Option<f64>,
    countries: Option<Vec<String>>,
}

impl StaticFetcher {
    pub fn new(name: impl Into<String>, g_per_kwh: f64) -> Self {
        Self {
            name: name.into(),
            g_per_kwh,
            forecast_g_per_kwh: None,
            countries: None,
        }
    }

    /// Restricts the fetcher to locations in one of `countries`.
    pub fn for_countries<I, S>(mut self, countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.countries = Some(countries.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_forecast(mut self, g_per_kwh: f64) -> Self {
        self.forecast_g_per_kwh = Some(g_per_kwh);
        self
    }
}

#[async_trait]
impl IntensityFetcher for StaticFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn suitable(&self, location: &Location) -> bool {
        match &self.countries {
            Some(countries) => countries.iter().any(|country| location.in_country(country)),
            None => true,
        }
    }

    fn supports_forecast(&self) -> bool {
        self.forecast_g_per_kwh.is_some()
    }

    async fn carbon_intensity(&self, _location: &Location) -> Result<f64> {
        Ok(self.g_per_kwh)
    }

    async fn forecast(&self, _location: &Location, _duration: Duration) -> Result<f64> {
        self.forecast_g_per_kwh.ok_or_else(|| TrackerError::Fetch {
            fetcher: self.name.clone(),
            message: "no forecast configured".to_string(),
        })
    }
}
