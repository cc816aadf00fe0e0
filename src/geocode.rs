use crate::config::GeocoderConfig;
use crate::error::BoxError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Address to map pin.
#[async_trait]
pub trait Geocode: Send + Sync {
    async fn geocode(&self, address: &str) -> Option<Coordinates>;
}

#[derive(Debug, Deserialize)]
struct Place {
    lat: String,
    lon: String,
}

/// First hit of a Nominatim `/search?format=json` response.
fn first_place(body: &str) -> Result<Option<Coordinates>, serde_json::Error> {
    let places: Vec<Place> = serde_json::from_str(body)?;
    Ok(places.into_iter().next().and_then(|p| {
        Some(Coordinates {
            latitude: p.lat.parse().ok()?,
            longitude: p.lon.parse().ok()?,
        })
    }))
}

/// OpenStreetMap Nominatim client. Sleeps after every request to stay
/// inside the public instance's one-request-per-second policy.
pub struct Nominatim {
    client: Client,
    base_url: String,
    locality: String,
    delay: Duration,
}

impl Nominatim {
    pub fn new(cfg: &GeocoderConfig) -> Result<Self, BoxError> {
        let client = Client::builder().user_agent(cfg.user_agent.as_str()).build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            locality: cfg.locality_suffix.clone(),
            delay: Duration::from_millis(cfg.delay_ms),
        })
    }

    async fn search(&self, query: &str) -> Result<Option<Coordinates>, BoxError> {
        let url = format!(
            "{}/search?format=json&limit=1&q={}",
            self.base_url,
            urlencoding::encode(query)
        );
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(first_place(&body)?)
    }
}

#[async_trait]
impl Geocode for Nominatim {
    async fn geocode(&self, address: &str) -> Option<Coordinates> {
        let query = format!("{address}, {}", self.locality);
        let result = self.search(&query).await;
        tokio::time::sleep(self.delay).await;

        match result {
            Ok(Some(coords)) => {
                debug!(address = %query, lat = coords.latitude, lon = coords.longitude, "Geocoded");
                Some(coords)
            }
            Ok(None) => {
                error!(address = %query, "No coordinates found");
                None
            }
            Err(e) => {
                error!(address = %query, error = %e, "Geocoding request failed");
                None
            }
        }
    }
}
