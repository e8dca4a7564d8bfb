use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::codec::{Position, RangeMeasurement};
use crate::config::BackendConfig;
use crate::messages::{DeviceStatus, LocationReading, TelemetryRecord};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend returned {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Where finished records go. Delivery is one-shot: the dispatcher drops a
/// record whose send fails.
#[async_trait]
pub trait BackendSink: Send + Sync {
    async fn send(&self, record: &TelemetryRecord) -> Result<(), BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct RecordMessage<'a> {
    name: &'a str,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<LocationMessage<'a>>,
    status: DeviceStatus,
    time: f64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum LocationMessage<'a> {
    Decoded {
        mode: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<&'a Position>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ranging: Option<&'a [RangeMeasurement]>,
    },
    /// Raw payload hex for frames that did not decode.
    Raw(&'a str),
}

fn message(record: &TelemetryRecord) -> RecordMessage<'_> {
    let location = record.location.as_ref().map(|reading| match reading {
        LocationReading::Decoded(sample) => LocationMessage::Decoded {
            mode: sample.mode(),
            position: sample.position(),
            ranging: sample.ranging(),
        },
        LocationReading::Raw(hex) => LocationMessage::Raw(hex),
    });
    RecordMessage {
        name: &record.identity.name,
        id: record.identity.id.to_string(),
        operation: record.operation.as_deref(),
        location,
        status: record.status,
        time: record.time,
    }
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(HttpBackend {
            client,
            endpoint: config.endpoint(),
        })
    }
}

#[async_trait]
impl BackendSink for HttpBackend {
    async fn send(&self, record: &TelemetryRecord) -> Result<(), BackendError> {
        debug!(
            "posting record for {} ({:?})",
            record.identity.id, record.status
        );
        let response = self
            .client
            .post(&self.endpoint)
            .json(&message(record))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status));
        }
        Ok(())
    }
}
