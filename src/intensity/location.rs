use crate::utils::errors::Result;
use async_trait::async_trait;

/// Where the workload runs, as reported by a location provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub address: String,
    /// ISO 3166-1 alpha-2 code, e.g. `DK`
    pub country: Option<String>,
}

impl Location {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            country: None,
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn in_country(&self, country: &str) -> bool {
        self.country
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(country))
    }
}

/// Resolves the location of this host (typically by IP geolocation).
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn locate(&self) -> Result<Location>;
}

/// A location known in advance.
#[derive(Debug, Clone)]
pub struct FixedLocation(pub Location);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn locate(&self) -> Result<Location> {
        Ok(self.0.clone())
    }
}
