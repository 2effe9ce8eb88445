//! HTTP client for the Equinix Metal (formerly Packet) REST API

use super::metal::{DeviceCreateRequest, IpReservation, MetalApi, MetalDevice};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Default API endpoint
pub const DEFAULT_METAL_API_URL: &str = "https://api.equinix.com/metal/v1";

const AUTH_HEADER: &str = "X-Auth-Token";
const BACKEND: &str = "packet";
const PAGE_SIZE: u32 = 1000;

#[derive(Deserialize)]
struct IpReservationList {
    ip_addresses: Vec<IpReservation>,
}

#[derive(Deserialize)]
struct AvailableAddresses {
    available: Vec<String>,
}

#[derive(Deserialize)]
struct DeviceList {
    devices: Vec<MetalDevice>,
}

/// Token-authenticated client for the bare-metal API
#[derive(Debug, Clone)]
pub struct MetalHttpClient {
    client: Client,
    base_url: String,
    token: String,
}

impl MetalHttpClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(AUTH_HEADER, &self.token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = self.authorized(request).send().await?;
        debug!(operation, status = %response.status(), "Metal API call");
        Ok(response)
    }

    async fn expect_json<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::cloud(BACKEND, operation, format!("{}: {}", status, body)));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl MetalApi for MetalHttpClient {
    async fn list_ip_reservations(&self, project_id: &str) -> Result<Vec<IpReservation>> {
        let url = self.url(&format!("/projects/{}/ips", project_id));
        let response = self.send("ProjectIPs.List", self.client.get(&url)).await?;
        let list: IpReservationList = Self::expect_json("ProjectIPs.List", response).await?;
        Ok(list.ip_addresses)
    }

    async fn available_addresses(&self, reservation_id: &str, cidr: u8) -> Result<Vec<String>> {
        let url = self.url(&format!("/ips/{}/available", reservation_id));
        let request = self.client.get(&url).query(&[("cidr", cidr)]);
        let response = self.send("ProjectIPs.AvailableAddresses", request).await?;
        let available: AvailableAddresses =
            Self::expect_json("ProjectIPs.AvailableAddresses", response).await?;
        Ok(available.available)
    }

    async fn create_device(&self, request: DeviceCreateRequest) -> Result<MetalDevice> {
        let url = self.url(&format!("/projects/{}/devices", request.project_id));
        let response = self
            .send("Devices.Create", self.client.post(&url).json(&request))
            .await?;
        Self::expect_json("Devices.Create", response).await
    }

    async fn list_devices(&self, project_id: &str) -> Result<Vec<MetalDevice>> {
        let url = self.url(&format!("/projects/{}/devices", project_id));
        let request = self.client.get(&url).query(&[("per_page", PAGE_SIZE)]);
        let response = self.send("Devices.List", request).await?;
        let list: DeviceList = Self::expect_json("Devices.List", response).await?;
        Ok(list.devices)
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<MetalDevice>> {
        let url = self.url(&format!("/devices/{}", device_id));
        let response = self.send("Devices.Get", self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::expect_json("Devices.Get", response).await.map(Some)
    }

    async fn assign_ip(&self, device_id: &str, address: &str) -> Result<()> {
        let url = self.url(&format!("/devices/{}/ips", device_id));
        let body = serde_json::json!({ "address": address });
        let response = self
            .send("DeviceIPs.Assign", self.client.post(&url).json(&body))
            .await?;
        let _: serde_json::Value = Self::expect_json("DeviceIPs.Assign", response).await?;
        Ok(())
    }

    async fn delete_device(&self, device_id: &str) -> Result<()> {
        let url = self.url(&format!("/devices/{}", device_id));
        let response = self.send("Devices.Delete", self.client.delete(&url)).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::not_found("Device", device_id)),
            status => Err(Error::cloud(BACKEND, "Devices.Delete", status)),
        }
    }
}
