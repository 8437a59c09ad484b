//! Weather Company hourly forecast client.
//!
//! One GET per lookup against a URL template containing `{latitude}` and
//! `{longitude}`, with `language` and `units` query parameters and HTTP basic
//! auth. Non-2xx replies are returned as-is so the classifier can map the
//! status; only transport and body-decoding failures are errors.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::AppError;
use crate::services::forecast::ProviderResponse;
use crate::store::models::Location;

/// Request timeout for the provider.
const WEATHER_TIMEOUT_SECS: u64 = 10;

/// Source of raw hourly forecasts for a location.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch(&self, location: Location) -> Result<ProviderResponse, AppError>;
}

/// Client for the Weather Company hourly forecast API.
#[derive(Debug, Clone)]
pub struct WeatherClient {
    client: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
    language: String,
    units: String,
}

impl WeatherClient {
    pub fn new(
        endpoint: &str,
        username: &str,
        password: &str,
        language: &str,
        units: &str,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEATHER_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            language: language.to_string(),
            units: units.to_string(),
        })
    }

    fn url_for(&self, location: Location) -> String {
        // Two decimal places is ~1 km, finer than the provider's grid
        self.endpoint
            .replace("{latitude}", &format!("{:.2}", location.latitude))
            .replace("{longitude}", &format!("{:.2}", location.longitude))
    }
}

#[async_trait]
impl ForecastSource for WeatherClient {
    async fn fetch(&self, location: Location) -> Result<ProviderResponse, AppError> {
        let url = self.url_for(location);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("language", self.language.as_str()),
                ("units", self.units.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                AppError::ProviderUnavailable(format!("weather request failed: {}", e))
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            if !status.is_success() {
                tracing::warn!("Weather provider returned HTTP {} for {}", status, url);
            }
            return Ok(ProviderResponse {
                status: status.as_u16(),
                body: None,
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            AppError::ProviderUnavailable(format!("weather JSON parse error: {}", e))
        })?;

        Ok(ProviderResponse {
            status: status.as_u16(),
            body: Some(body),
        })
    }
}
