//! Client for the chain's F3 fast-finality subprotocol RPC surface.
//!
//! The facilitator consumes four read-only methods: `Filecoin.F3GetProgress`
//! (the active instance/round/phase), `F3GetCertificate` /
//! `F3GetLatestCertificate` (finality certificates per decided instance),
//! and `F3GetManifest` (network parameters, logged at startup). The poller
//! in [`crate::fcr`] drives them; this module is pure transport and wire
//! types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::FacilitatorError;

/// GPBFT phase within a round. An instance decides one tipset; rounds retry
/// within an instance; phases within a round run in this order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Phase {
    #[default]
    Initial,
    Quality,
    Converge,
    Prepare,
    Commit,
    Decide,
    Terminated,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initial => "INITIAL",
            Phase::Quality => "QUALITY",
            Phase::Converge => "CONVERGE",
            Phase::Prepare => "PREPARE",
            Phase::Commit => "COMMIT",
            Phase::Decide => "DECIDE",
            Phase::Terminated => "TERMINATED",
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        phase as u8
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Phase::Initial,
            1 => Phase::Quality,
            2 => Phase::Converge,
            3 => Phase::Prepare,
            4 => Phase::Commit,
            5 => Phase::Decide,
            6 => Phase::Terminated,
            other => return Err(format!("unknown GPBFT phase {other}")),
        })
    }
}

/// One `F3GetProgress` sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct F3Progress {
    #[serde(rename = "ID")]
    pub instance: u64,
    #[serde(rename = "Round", default)]
    pub round: u64,
    #[serde(rename = "Phase", default)]
    pub phase: Phase,
}

/// A tipset entry in a certificate's chain segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EcTipset {
    #[serde(rename = "Epoch")]
    pub epoch: u64,
}

/// A finality certificate for a decided instance. Once it exists, every
/// tipset with epoch at or below the finalized height is final.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct F3Certificate {
    #[serde(rename = "GPBFTInstance")]
    pub instance: u64,
    #[serde(rename = "ECChain", default)]
    pub ec_chain: Vec<EcTipset>,
}

impl F3Certificate {
    /// Maximum epoch in the certified chain segment.
    pub fn finalized_height(&self) -> u64 {
        self.ec_chain.iter().map(|t| t.epoch).max().unwrap_or(0)
    }
}

/// Read-only F3 RPC surface. One production implementation
/// ([`HttpF3Client`]); tests substitute doubles.
#[async_trait]
pub trait F3Client: Send + Sync {
    async fn get_progress(&self) -> Result<F3Progress, FacilitatorError>;
    async fn get_certificate(
        &self,
        instance: u64,
    ) -> Result<Option<F3Certificate>, FacilitatorError>;
    async fn get_latest_certificate(&self) -> Result<Option<F3Certificate>, FacilitatorError>;
    async fn get_manifest(&self) -> Result<serde_json::Value, FacilitatorError>;
}

/// JSON-RPC 2.0 client over HTTP.
pub struct HttpF3Client {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl HttpF3Client {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, FacilitatorError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| FacilitatorError::Chain(format!("{method} request failed: {e}")))?;

        let envelope: RpcEnvelope<T> = response
            .json()
            .await
            .map_err(|e| FacilitatorError::Chain(format!("{method} response parse failed: {e}")))?;

        if let Some(error) = envelope.error {
            return Err(FacilitatorError::Chain(format!(
                "{method} rpc error {}: {}",
                error.code, error.message
            )));
        }
        Ok(envelope.result)
    }
}

#[async_trait]
impl F3Client for HttpF3Client {
    async fn get_progress(&self) -> Result<F3Progress, FacilitatorError> {
        self.call("Filecoin.F3GetProgress", serde_json::json!([]))
            .await?
            .ok_or_else(|| FacilitatorError::Chain("F3GetProgress returned null".to_string()))
    }

    async fn get_certificate(
        &self,
        instance: u64,
    ) -> Result<Option<F3Certificate>, FacilitatorError> {
        self.call("Filecoin.F3GetCertificate", serde_json::json!([instance]))
            .await
    }

    async fn get_latest_certificate(&self) -> Result<Option<F3Certificate>, FacilitatorError> {
        self.call("Filecoin.F3GetLatestCertificate", serde_json::json!([]))
            .await
    }

    async fn get_manifest(&self) -> Result<serde_json::Value, FacilitatorError> {
        self.call("Filecoin.F3GetManifest", serde_json::json!([]))
            .await?
            .ok_or_else(|| FacilitatorError::Chain("F3GetManifest returned null".to_string()))
    }
}
