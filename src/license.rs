use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

pub static DEFAULT_API_ENDPOINT: &str = "https://replicated.app";
static PLATFORM_EXCHANGE_PATH: &str = "license/platform/exchange";

/// Body shared by the exchange endpoint and the upstream licensing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseData {
    #[serde(rename = "licenseData")]
    pub license_data: SecretString,
}

/// Turns a platform license into the license document the application installs.
#[async_trait]
pub trait LicenseExchanger: Send + Sync {
    async fn exchange(&self, platform_license: &SecretString) -> Result<SecretString>;
}

#[derive(Debug, Clone)]
pub struct LicenseClient {
    http_client: Client,
    api_endpoint: String,
}

impl LicenseClient {
    pub fn new(http_client: Client, api_endpoint: impl Into<String>) -> Self {
        Self {
            http_client,
            api_endpoint: api_endpoint.into(),
        }
    }

    pub fn api_endpoint(&self) -> &str {
        &self.api_endpoint
    }

    fn exchange_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_endpoint.trim_end_matches('/'),
            PLATFORM_EXCHANGE_PATH
        )
    }
}

#[async_trait]
impl LicenseExchanger for LicenseClient {
    async fn exchange(&self, platform_license: &SecretString) -> Result<SecretString> {
        let url = self.exchange_url();
        info!("Exchanging platform license at {}", url);

        let payload = LicenseData {
            license_data: platform_license.clone(),
        };
        let response = self
            .http_client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send platform license exchange request")?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            anyhow::bail!(
                "Licensing service {} returned error status {} while exchanging platform license",
                self.api_endpoint,
                status
            );
        }

        let license = response
            .text()
            .await
            .context("Failed to read exchanged license from response body")?;
        Ok(license.into())
    }
}
