//! Controller transport
//!
//! The batch flasher board is driven through a small HTTP interface: a status
//! array, a port selector, a firmware upload, a console buffer and a reboot
//! switch. [`Controller`] is the seam the orchestration talks to;
//! [`HttpController`] is the production implementation and
//! [`crate::testing::MockBoard`] the scripted one used in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use uf2b_core::StatusSnapshot;

use crate::config::FlashConfig;
use crate::error::{FlashError, Result};

/// One request to the controller
///
/// Every variant answers with the full status array.
#[derive(Debug, Clone)]
pub enum Request {
    /// Fetch the status array
    Status,
    /// Power and select one port; `device == capacity` deselects all
    Select { device: usize },
    /// Upload a firmware image to the selected port
    Upload { device: usize, image: Bytes },
}

impl Request {
    /// Device the request concerns, if any
    pub fn device(&self) -> Option<usize> {
        match self {
            Self::Status => None,
            Self::Select { device } | Self::Upload { device, .. } => Some(*device),
        }
    }

    /// Short name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Select { .. } => "select",
            Self::Upload { .. } => "upload",
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Select { device } => write!(f, "select {}", device),
            Self::Upload { device, image } => write!(f, "upload {} bytes to {}", image.len(), device),
        }
    }
}

/// How the controller should come back after a reboot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootMode {
    /// Restart the controller application
    Application,
    /// Drop into the ROM bootloader
    Bootsel,
}

impl RebootMode {
    fn query_value(self) -> &'static str {
        match self {
            Self::Application => "0",
            Self::Bootsel => "1",
        }
    }
}

/// Transport to a batch flasher controller
#[async_trait]
pub trait Controller: Send + Sync {
    /// Number of USB ports on the board
    fn capacity(&self) -> usize;

    /// Execute a request and return the status array it answered with
    async fn execute(&self, request: &Request) -> Result<StatusSnapshot>;

    /// Drain the board console buffer
    async fn board_output(&self) -> Result<String>;

    /// Reboot the controller
    async fn reboot(&self, mode: RebootMode) -> Result<()>;
}

/// HTTP controller client
#[derive(Debug, Clone)]
pub struct HttpController {
    client: Client,
    base_url: Url,
    config: FlashConfig,
}

impl HttpController {
    /// Create a new controller client from configuration
    pub fn new(config: FlashConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeouts.request())
            .connect_timeout(config.timeouts.connect())
            .build()?;

        let base_url = Url::parse(&config.connection.base_url)?;

        info!("Controller client created for {}", base_url);

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// Create a controller client with default paths and timeouts
    pub fn connect(base_url: &str) -> Result<Self> {
        Self::new(FlashConfig::builder(base_url).build())
    }

    /// Get the configuration
    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    #[instrument(skip(self))]
    async fn fetch_status(&self) -> Result<StatusSnapshot> {
        let url = self.build_url(&self.config.endpoints.status)?;
        let response = self.client.get(url).send().await?;
        self.handle_response(response).await
    }

    #[instrument(skip(self))]
    async fn select(&self, device: usize) -> Result<StatusSnapshot> {
        let mut url = self.build_url(&self.config.endpoints.select)?;
        url.query_pairs_mut()
            .append_pair(&self.config.endpoints.select_param, &device.to_string());
        debug!("Selecting device via {}", url);

        let response = self.client.get(url).send().await?;
        self.handle_response(response).await
    }

    #[instrument(skip(self, image), fields(bytes = image.len()))]
    async fn upload(&self, device: usize, image: &Bytes) -> Result<StatusSnapshot> {
        let url = self.build_url(&self.config.endpoints.flash)?;
        info!("Uploading {} bytes for device {} to {}", image.len(), device, url);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/uf2")
            .header("Content-Length", image.len())
            .timeout(self.config.timeouts.upload())
            .body(image.clone())
            .send()
            .await?;
        self.handle_response(response).await
    }

    fn build_url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Decode a status array response
    async fn handle_response(&self, response: reqwest::Response) -> Result<StatusSnapshot> {
        let status = response.status();

        if status.is_success() {
            let values: Vec<i64> = response
                .json()
                .await
                .map_err(|e| FlashError::Parse(e.to_string()))?;
            Ok(StatusSnapshot::from_values(&values, self.capacity())?)
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| format!("HTTP {}", status));
            Err(FlashError::server_error(status.as_u16(), message))
        }
    }
}

#[async_trait]
impl Controller for HttpController {
    fn capacity(&self) -> usize {
        self.config.devices.capacity
    }

    async fn execute(&self, request: &Request) -> Result<StatusSnapshot> {
        match request {
            Request::Status => self.fetch_status().await,
            Request::Select { device } => self.select(*device).await,
            Request::Upload { device, image } => self.upload(*device, image).await,
        }
    }

    #[instrument(skip(self))]
    async fn board_output(&self) -> Result<String> {
        let url = self.build_url(&self.config.endpoints.stdout)?;
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(response.text().await?)
        } else {
            Err(FlashError::server_error(
                status.as_u16(),
                format!("Console read failed: HTTP {}", status),
            ))
        }
    }

    #[instrument(skip(self))]
    async fn reboot(&self, mode: RebootMode) -> Result<()> {
        let mut url = self.build_url(&self.config.endpoints.reboot)?;
        url.query_pairs_mut()
            .append_pair("bootsel", mode.query_value());
        info!("Rebooting controller ({:?})", mode);

        // The controller resets before it answers, so a dropped connection is
        // the expected outcome.
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) if !response.status().is_success() => Err(FlashError::server_error(
                response.status().as_u16(),
                "Reboot rejected",
            )),
            Ok(_) => Ok(()),
            Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                warn!("Reboot request ended without a response: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
