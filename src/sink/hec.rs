use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::io::Write;
use std::time::Duration;
use url::Url;

use super::serialization::{HecEvent, serialize_json_array, serialize_ndjson};
use super::{DeliveryReceipt, Sink, SinkError};
use crate::domain::{Batch, HecConfig, HecFormat};

pub const HEC_BATCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEC_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str = concat!("rask-syslog-relay/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 200;

/// Only these two statuses count as accepted by a collector.
pub fn is_accepted(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::ACCEPTED
}

pub fn build_client(config: &HecConfig, timeout: Duration) -> Result<Client, SinkError> {
    ClientBuilder::new()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(!config.verify_tls)
        .build()
        .map_err(|e| SinkError::InvalidConfiguration(format!("failed to build HTTP client: {e}")))
}

pub fn parse_url(raw: &str) -> Result<Url, SinkError> {
    let url: Url = raw
        .parse()
        .map_err(|e| SinkError::InvalidConfiguration(format!("invalid HEC URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SinkError::InvalidConfiguration(format!(
            "unsupported HEC URL scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

pub fn authorization_header(config: &HecConfig) -> Result<HeaderValue, SinkError> {
    if config.api_key.trim().is_empty() {
        return Err(SinkError::InvalidConfiguration("HEC api_key is empty".to_string()));
    }
    let mut value = HeaderValue::from_str(&format!("{} {}", config.token_scheme, config.api_key))
        .map_err(|e| SinkError::InvalidConfiguration(format!("invalid HEC token: {e}")))?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Posts batches to an HTTP event collector.
#[derive(Debug, Clone)]
pub struct HecSink {
    client: Client,
    url: Url,
    headers: HeaderMap,
    format: HecFormat,
    compress: bool,
}

impl HecSink {
    pub fn new(config: &HecConfig) -> Result<Self, SinkError> {
        Self::with_timeout(config, HEC_BATCH_TIMEOUT)
    }

    pub fn with_timeout(config: &HecConfig, timeout: Duration) -> Result<Self, SinkError> {
        let url = parse_url(&config.url)?;
        let client = build_client(config, timeout)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, authorization_header(config)?);
        if config.compress {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        Ok(Self {
            client,
            url,
            headers,
            format: config.format,
            compress: config.compress,
        })
    }

    pub fn encode_body(&self, batch: &Batch) -> Result<Vec<u8>, SinkError> {
        let records: Vec<HecEvent<'_>> = batch.events().iter().map(HecEvent::from).collect();
        let body = match self.format {
            HecFormat::Ndjson => serialize_ndjson(&records)?,
            HecFormat::Array => serialize_json_array(&records)?,
        };

        if !self.compress {
            return Ok(body);
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::fast());
        encoder.write_all(&body)?;
        Ok(encoder.finish()?)
    }
}

impl Sink for HecSink {
    fn kind(&self) -> &'static str {
        "hec"
    }

    async fn deliver(&mut self, batch: &Batch) -> Result<DeliveryReceipt, SinkError> {
        if batch.is_empty() {
            return Ok(DeliveryReceipt::default());
        }

        let body = self.encode_body(batch)?;
        let bytes = body.len();
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(SinkError::from_reqwest)?;

        let status = response.status();
        if is_accepted(status) {
            return Ok(DeliveryReceipt {
                events: batch.len(),
                bytes,
                status: Some(status.as_u16()),
            });
        }

        let message = response.text().await.unwrap_or_default();
        Err(SinkError::HttpStatus {
            status: status.as_u16(),
            message: truncate_body(&message),
        })
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
