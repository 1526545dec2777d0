use crate::domain::{
    Device, DevicePage, DeviceProfile, DeviceRegistry, DeviceService, DomainError, DomainResult,
};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

const API_BASE_PATH: [&str; 2] = ["api", "v3"];

#[derive(Deserialize)]
struct DeviceResponse {
    device: Device,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultiDevicesResponse {
    #[serde(default)]
    total_count: u32,
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Deserialize)]
struct DeviceServiceResponse {
    service: DeviceService,
}

#[derive(Deserialize)]
struct DeviceProfileResponse {
    profile: DeviceProfile,
}

/// [`DeviceRegistry`] backed by the core metadata REST API
pub struct MetadataHttpClient {
    http: reqwest::Client,
    base_url: Url,
}

impl MetadataHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> DomainResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| DomainError::Registry(format!("invalid metadata url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DomainError::Registry(format!(
                "metadata url {} cannot carry a path",
                base_url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DomainError::Registry(format!("failed to build http client: {}", e)))?;

        Ok(Self { http, base_url })
    }

    /// `<base>/api/v3/<segments...>` with every segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(API_BASE_PATH).extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        not_found: impl FnOnce() -> DomainError,
    ) -> DomainResult<T> {
        debug!(url = %url, "querying metadata");

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DomainError::Registry(format!("request to {} failed: {}", url, e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(not_found()),
            status if status.is_success() => response
                .json::<T>()
                .await
                .map_err(|e| DomainError::Registry(format!("invalid response from {}: {}", url, e))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DomainError::Registry(format!(
                    "metadata responded {} for {}: {}",
                    status, url, body
                )))
            }
        }
    }
}

#[async_trait]
impl DeviceRegistry for MetadataHttpClient {
    #[instrument(skip(self))]
    async fn device_by_name(&self, name: &str) -> DomainResult<Device> {
        let url = self.endpoint(&["device", "name", name]);
        let response: DeviceResponse = self
            .get_json(url, || DomainError::DeviceNotFound(name.to_string()))
            .await?;
        Ok(response.device)
    }

    #[instrument(skip(self))]
    async fn all_devices(&self, offset: i32, limit: i32) -> DomainResult<DevicePage> {
        let mut url = self.endpoint(&["device", "all"]);
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string());

        let response: MultiDevicesResponse = self
            .get_json(url, || {
                DomainError::Registry("device listing endpoint not found".to_string())
            })
            .await?;
        Ok(DevicePage {
            devices: response.devices,
            total_count: response.total_count,
        })
    }

    #[instrument(skip(self))]
    async fn device_service_by_name(&self, name: &str) -> DomainResult<DeviceService> {
        let url = self.endpoint(&["deviceservice", "name", name]);
        let response: DeviceServiceResponse = self
            .get_json(url, || DomainError::DeviceServiceNotFound(name.to_string()))
            .await?;
        Ok(response.service)
    }

    #[instrument(skip(self))]
    async fn device_profile_by_name(&self, name: &str) -> DomainResult<DeviceProfile> {
        let url = self.endpoint(&["deviceprofile", "name", name]);
        let response: DeviceProfileResponse = self
            .get_json(url, || DomainError::DeviceProfileNotFound(name.to_string()))
            .await?;
        Ok(response.profile)
    }
}
