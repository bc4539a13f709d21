use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

use super::SinkError;
use super::hec::{HEC_PROBE_TIMEOUT, authorization_header, build_client, is_accepted, parse_url, truncate_body};
use crate::domain::{DestinationKind, HecConfig, StorageConfig};

const PROBE_MESSAGE: &str = "Source OK - Test message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDestinationRequest {
    pub source_name: String,
    #[serde(default)]
    pub source_ip: String,
    pub destination: DestinationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDestinationResponse {
    pub success: bool,
    pub message: String,
}

impl TestDestinationResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// One-shot reachability check for a destination, independent of any running source.
#[derive(Debug, Clone, Default)]
pub struct DestinationProbe;

impl DestinationProbe {
    pub fn new() -> Self {
        Self
    }

    /// Decodes a raw request body; malformed input is reported as a failed test.
    pub async fn test_json(&self, body: &str) -> TestDestinationResponse {
        match serde_json::from_str::<TestDestinationRequest>(body) {
            Ok(request) => self.test(&request).await,
            Err(e) => TestDestinationResponse::failed(format!("invalid request: {e}")),
        }
    }

    pub async fn test(&self, request: &TestDestinationRequest) -> TestDestinationResponse {
        if let Err(e) = request.destination.validate() {
            return TestDestinationResponse::failed(e.to_string());
        }

        let result = match &request.destination {
            DestinationKind::Storage(config) => test_storage(config).await,
            DestinationKind::Hec(config) => test_hec(config, request).await,
        };

        match result {
            Ok(message) => {
                tracing::info!(
                    source = %request.source_name,
                    destination = request.destination.type_name(),
                    "Destination test succeeded"
                );
                TestDestinationResponse::ok(message)
            }
            Err(e) => {
                tracing::warn!(
                    source = %request.source_name,
                    destination = request.destination.type_name(),
                    error = %e,
                    "Destination test failed"
                );
                TestDestinationResponse::failed(e.to_string())
            }
        }
    }
}

async fn test_storage(config: &StorageConfig) -> Result<String, SinkError> {
    fs::create_dir_all(&config.path).await?;

    let probe_path = config.path.join(format!(".relay_probe_{}", Uuid::new_v4()));
    let content = format!("probe {}", Utc::now().to_rfc3339());
    let outcome = write_read_compare(&probe_path, content.as_bytes()).await;
    remove_test_file(&probe_path).await;
    outcome?;

    Ok(format!("storage path {} is writable", config.path.display()))
}

/// Returns false, with a warning, when the file is still there afterwards.
async fn remove_test_file(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove storage test file");
            false
        }
    }
}

async fn write_read_compare(path: &Path, content: &[u8]) -> Result<(), SinkError> {
    fs::write(path, content).await?;
    let read_back = fs::read(path).await?;
    if read_back != content {
        return Err(SinkError::IoError(std::io::Error::other(
            "probe file content did not match",
        )));
    }
    Ok(())
}

async fn test_hec(config: &HecConfig, request: &TestDestinationRequest) -> Result<String, SinkError> {
    if request.source_ip.trim().is_empty() {
        return Err(SinkError::InvalidConfiguration(
            "source_ip is required to test an HEC destination".to_string(),
        ));
    }

    let url = parse_url(&config.url)?;
    let client = build_client(config, HEC_PROBE_TIMEOUT)?;
    let payload = json!({
        "time": Utc::now().timestamp(),
        "event": {
            "message": PROBE_MESSAGE,
            "source_ip": request.source_ip,
            "source_name": request.source_name,
            "test": true,
        },
        "source": request.source_name,
    });

    let response = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, authorization_header(config)?)
        .json(&payload)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout(HEC_PROBE_TIMEOUT)
            } else {
                SinkError::NetworkError(e)
            }
        })?;

    let status = response.status();
    if is_accepted(status) {
        return Ok(format!("HEC endpoint accepted test event ({})", status.as_u16()));
    }

    let body = response.text().await.unwrap_or_default();
    Err(SinkError::HttpStatus {
        status: status.as_u16(),
        message: truncate_body(&body),
    })
}
