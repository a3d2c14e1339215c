//! HTTP client for the TDVMS portal
//!
//! Covers the two inventory endpoints (network list and station list) and the
//! data request service that e-mails a download link back for each request.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::batch::Batch;
use crate::catalog::{DeviceType, InventorySource, InventoryStation, Network};
use crate::config::PortalConfig;
use crate::error::{DlTdvmsError, PortalError};
use crate::selection::{DataFormat, RequestConfig, TIME_FORMAT};

type Result<T> = std::result::Result<T, DlTdvmsError>;

/// Portal result code: a previous request from this address is still running
const RESULT_BUSY: i64 = 111;
/// Portal result code: unspecified failure
const RESULT_GENERAL_ERROR: i64 = 110;

/// Locally generated handle for one submission.
///
/// The portal does not return an id of its own, so the token is built from
/// the config identity, batch index and submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestToken(pub String);

impl RequestToken {
    pub fn new(config_id: &str, batch_index: usize) -> Self {
        Self(format!(
            "{}:{}:{}",
            config_id,
            batch_index,
            Utc::now().timestamp()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of a `GetData` request
#[derive(Debug, Clone, Serialize)]
pub struct DataRequest {
    pub start_time: String,
    pub end_time: String,
    pub data_type: DataFormat,
    pub instrument: bool,
    pub networks: Vec<String>,
    pub stations: Vec<String>,
    pub location: Vec<Option<String>>,
    pub device_codes: Vec<DeviceType>,
    pub components: Vec<[&'static str; 3]>,
    pub e_mail: String,
    #[serde(skip)]
    pub token: RequestToken,
}

impl DataRequest {
    pub fn new(config_id: &str, batch: &Batch, request: &RequestConfig, email: &str) -> Self {
        Self {
            start_time: request.start.format(TIME_FORMAT).to_string(),
            end_time: request.end.format(TIME_FORMAT).to_string(),
            data_type: batch.data_format,
            instrument: batch.data_format == DataFormat::Inventory,
            networks: batch.stations.iter().map(|s| s.network.clone()).collect(),
            stations: batch.stations.iter().map(|s| s.code.clone()).collect(),
            location: vec![None; batch.len()],
            device_codes: batch.stations.iter().map(|s| s.device).collect(),
            components: vec![["Z", "N", "E"]; batch.len()],
            e_mail: email.to_string(),
            token: RequestToken::new(config_id, batch.index),
        }
    }
}

/// Something that accepts data requests
#[async_trait]
pub trait RequestPortal: Send + Sync {
    /// Send one request. Returning `Ok` means the portal accepted it.
    async fn submit(&self, request: &DataRequest) -> Result<RequestToken>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(rename = "Result")]
    result: Option<i64>,
}

#[derive(Debug, Serialize)]
struct StationQuery<'a> {
    netcodes: &'a [String],
    #[serde(rename = "deviceCode")]
    device_code: &'a str,
    component: &'a str,
}

/// reqwest-backed portal client
#[derive(Clone)]
pub struct PortalClient {
    http: reqwest::Client,
    config: PortalConfig,
}

impl PortalClient {
    pub fn new(config: PortalConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PortalError::from_reqwest(&config.api_base, e, config.request_timeout))?;
        Ok(Self { http, config })
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/Data/{}", self.config.api_base.trim_end_matches('/'), endpoint)
    }

    fn service_url(&self) -> String {
        format!("{}/GetData", self.config.service_base.trim_end_matches('/'))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        response: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> Result<T> {
        let timeout = self.config.request_timeout;
        let response = response.map_err(|e| PortalError::from_reqwest(url, e, timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortalError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| PortalError::from_reqwest(url, e, timeout))?;
        serde_json::from_slice(&body).map_err(|e| {
            PortalError::UnexpectedResponse(format!("{} returned invalid JSON: {}", url, e)).into()
        })
    }
}

#[async_trait]
impl InventorySource for PortalClient {
    async fn networks(&self) -> Result<Vec<Network>> {
        let url = self.api_url("GetNetworks");
        tracing::info!("Fetching network list");
        let response = self.http.get(&url).send().await;
        self.read_json(&url, response).await
    }

    async fn stations(&self, networks: &[String]) -> Result<Vec<InventoryStation>> {
        let url = self.api_url("GetStations");
        tracing::info!(networks = networks.len(), "Fetching station list");
        let query = StationQuery {
            netcodes: networks,
            device_code: "",
            component: "",
        };
        let response = self.http.post(&url).json(&query).send().await;
        self.read_json(&url, response).await
    }
}

#[async_trait]
impl RequestPortal for PortalClient {
    async fn submit(&self, request: &DataRequest) -> Result<RequestToken> {
        let url = self.service_url();
        let timeout = self.config.request_timeout;

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| PortalError::from_reqwest(&url, e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PortalError::Status {
                url,
                status: status.as_u16(),
            }
            .into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PortalError::from_reqwest(&url, e, timeout))?;
        match serde_json::from_slice::<SubmitResponse>(&body) {
            Ok(SubmitResponse {
                result: Some(RESULT_BUSY),
            }) => Err(PortalError::Busy.into()),
            Ok(SubmitResponse {
                result: Some(RESULT_GENERAL_ERROR),
            }) => Err(PortalError::Rejected.into()),
            Ok(parsed) => {
                tracing::debug!(code = ?parsed.result, "Portal accepted request");
                Ok(request.token.clone())
            }
            Err(e) => {
                // the request reached the portal; treating it as failed would
                // risk a duplicate submission
                tracing::warn!("Portal accepted request with an unreadable body: {}", e);
                Ok(request.token.clone())
            }
        }
    }
}
