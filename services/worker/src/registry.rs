//! Vehicle registry lookups.
//!
//! The processor only depends on [`VehicleRegistry`]; [`DvlaClient`] talks to
//! the DVLA vehicle enquiry API.

use crate::config::RegistryConfig;
use crate::plate::VehicleAttributes;
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument};

/// Errors from a registry lookup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry has no vehicle for this plate.
    #[error("vehicle not found in registry")]
    NotFound,

    /// The registry answered with an unexpected status.
    #[error("registry API error ({status}): {body}")]
    Unexpected { status: u16, body: String },

    /// No usable API key in the registry configuration.
    #[error("registry API key not configured")]
    MissingApiKey,

    /// The HTTP request itself failed (network, DNS, TLS, timeout, decoding).
    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl RegistryError {
    /// True when the registry authoritatively reported the plate unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Source of vehicle details for a normalized plate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VehicleRegistry: Send + Sync {
    async fn lookup(&self, plate: &str) -> Result<VehicleAttributes, RegistryError>;
}

/// DVLA vehicle enquiry API client.
pub struct DvlaClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl DvlaClient {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let api_key = config.key().ok_or(RegistryError::MissingApiKey)?.to_string();
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl VehicleRegistry for DvlaClient {
    #[instrument(skip(self))]
    async fn lookup(&self, plate: &str) -> Result<VehicleAttributes, RegistryError> {
        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({ "registrationNumber": plate }))
            .send()
            .await?;

        let status = response.status();
        debug!(status = status.as_u16(), "Registry responded");

        // 400 is returned for registrations that cannot exist.
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Err(RegistryError::NotFound);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RegistryError::Unexpected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<VehicleAttributes>().await?)
    }
}
