//! AWS SQS adapter using the HTTP query API.
//!
//! Talks to SQS over plain HTTP instead of the AWS SDK: requests are
//! signed with AWS Signature V4 and responses parsed from XML, which
//! keeps the transport transparent and lets the parsers be unit tested
//! against fixture responses.
//!
//! Queue URLs are resolved once per logical name and cached. A missing
//! queue is created on first use, so producers and consumers never need
//! a provisioning step. Message bodies travel as the encoded JSON text
//! itself.

use crate::backend::QueueBackend;
use crate::config::{AckMode, BackendType, QueueOptions, SqsConfig};
use crate::error::QueueError;
use crate::message::{
    decode_payload, encode_payload, DeliveredMessage, DeliveryHandle, Payload, QueueName,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const BACKEND: &str = "sqs";
const API_VERSION: &str = "2012-11-05";
const MAX_BATCH: usize = 10;
const MAX_WAIT_SECONDS: u64 = 20;

// ============================================================================
// Error Types
// ============================================================================

/// SQS-specific errors, mapped into [`QueueError`] at the trait boundary
#[derive(Debug, thiserror::Error)]
pub enum SqsError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("SQS service error {code}: {message}")]
    Service { code: String, message: String },

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("XML parsing error: {0}")]
    Xml(String),
}

impl SqsError {
    /// Check if the error is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::Network(_) => true,
            Self::Service { .. } => true, // throttling and 5xx dominate here
            Self::QueueNotFound(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::Xml(_) => false,
        }
    }

    fn into_queue_error(self) -> QueueError {
        match self {
            Self::Network(message) => QueueError::ConnectionFailed { message },
            Self::InvalidReceipt(receipt) => QueueError::HandleNotFound { receipt },
            other => {
                let transient = other.is_transient();
                QueueError::Backend {
                    backend: BACKEND,
                    message: other.to_string(),
                    transient,
                }
            }
        }
    }
}

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer.
///
/// Builds the canonical request, derives the signing key through the
/// four-level HMAC chain, and returns the headers to attach:
/// `Authorization`, `x-amz-date`, and `host`.
#[derive(Clone)]
pub(crate) struct AwsV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl AwsV4Signer {
    pub(crate) fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            access_key,
            secret_key,
            region,
            service: "sqs".to_string(),
        }
    }

    pub(crate) fn sign_request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> HashMap<String, String> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let mut canonical_query = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>();
        canonical_query.sort();
        let canonical_query = canonical_query.join("&");

        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let signed_headers = "host;x-amz-date";
        let payload_hash = format!("{:x}", Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, canonical_query, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let canonical_request_hash = format!("{:x}", Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm, amz_date, credential_scope, canonical_request_hash
        );

        let signature = self.calculate_signature(&string_to_sign, &date_stamp);
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), authorization);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("host".to_string(), host.to_string());
        headers
    }

    /// Derive the signing key and sign: the key chain is
    /// date, region, service, then the literal "aws4_request".
    pub(crate) fn calculate_signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ============================================================================
// Signed HTTP transport
// ============================================================================

/// The signed-request plumbing, cloneable so fire-and-forget deletes
/// can run detached from the backend.
#[derive(Clone)]
struct SqsTransport {
    http_client: HttpClient,
    signer: AwsV4Signer,
    endpoint: String,
}

impl SqsTransport {
    async fn request(&self, params: &HashMap<String, String>) -> Result<String, SqsError> {
        let host = self
            .endpoint
            .strip_prefix("https://")
            .or_else(|| self.endpoint.strip_prefix("http://"))
            .unwrap_or(&self.endpoint);
        let timestamp = Utc::now();
        let auth_headers = self
            .signer
            .sign_request("POST", host, "/", params, "", &timestamp);

        let query_string = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{}/?{}", self.endpoint, query_string);

        let mut request = self.http_client.post(&url);
        for (key, value) in auth_headers {
            request = request.header(&key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::Network(format!("request timeout: {}", e))
            } else if e.is_connect() {
                SqsError::Network(format!("connection failed: {}", e))
            } else {
                SqsError::Network(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SqsError::Network(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16()));
        }
        Ok(body)
    }
}

fn base_params(action: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert("Action".to_string(), action.to_string());
    params.insert("Version".to_string(), API_VERSION.to_string());
    params
}

// ============================================================================
// XML response parsing
// ============================================================================

/// Extract the text content of the first occurrence of `element`
pub(crate) fn parse_element_text(xml: &str, element: &str) -> Result<String, SqsError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == element.as_bytes() => {
                inside = true;
            }
            Ok(Event::Text(e)) if inside => {
                return e
                    .unescape()
                    .map(|s| s.into_owned())
                    .map_err(|e| SqsError::Xml(e.to_string()));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SqsError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Err(SqsError::Xml(format!("{} not found in response", element)))
}

/// One message out of a ReceiveMessage response
pub(crate) struct RawSqsMessage {
    pub(crate) body: String,
    pub(crate) receipt_handle: String,
}

/// Parse a ReceiveMessage XML response into its body/receipt pairs
pub(crate) fn parse_receive_response(xml: &str) -> Result<Vec<RawSqsMessage>, SqsError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut in_message = false;
    let mut in_receipt_handle = false;
    let mut in_body = false;
    let mut current_receipt: Option<String> = None;
    let mut current_body: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = true;
                    current_receipt = None;
                    current_body = None;
                }
                b"ReceiptHandle" if in_message => in_receipt_handle = true,
                b"Body" if in_message => in_body = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.unescape().ok().map(|s| s.into_owned());
                if in_receipt_handle {
                    current_receipt = text;
                    in_receipt_handle = false;
                } else if in_body {
                    current_body = text;
                    in_body = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Message" => {
                in_message = false;
                if let (Some(body), Some(receipt_handle)) =
                    (current_body.take(), current_receipt.take())
                {
                    messages.push(RawSqsMessage {
                        body,
                        receipt_handle,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SqsError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

/// Parse a failure response and map the service error code
pub(crate) fn parse_error_response(xml: &str, status_code: u16) -> SqsError {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut error_code = None;
    let mut error_message = None;
    let mut in_error = false;
    let mut in_code = false;
    let mut in_message = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Error" => in_error = true,
                b"Code" if in_error => in_code = true,
                b"Message" if in_error => in_message = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_code {
                    error_code = e.unescape().ok().map(|s| s.into_owned());
                    in_code = false;
                } else if in_message {
                    error_message = e.unescape().ok().map(|s| s.into_owned());
                    in_message = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Error" => {
                in_error = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    let code = error_code.unwrap_or_else(|| "Unknown".to_string());
    let message = error_message.unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            SqsError::QueueNotFound(message)
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => SqsError::InvalidReceipt(message),
        _ if status_code == 401 || status_code == 403 => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ => SqsError::Service { code, message },
    }
}

// ============================================================================
// SQS Backend
// ============================================================================

/// SQS queue backend.
///
/// Thread-safe; internal state is the queue URL cache behind an `RwLock`.
pub struct SqsBackend {
    transport: SqsTransport,
    config: SqsConfig,
    options: QueueOptions,
    queue_url_cache: Arc<RwLock<HashMap<QueueName, String>>>,
}

impl fmt::Debug for SqsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsBackend")
            .field("region", &self.config.region)
            .field("endpoint", &self.transport.endpoint)
            .finish()
    }
}

impl SqsBackend {
    pub fn new(config: SqsConfig, options: QueueOptions) -> Result<Self, QueueError> {
        if config.region.trim().is_empty() {
            return Err(crate::error::ConfigurationError::Missing {
                key: "sqs.region".to_string(),
            }
            .into());
        }
        let (access_key, secret_key) = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access), Some(secret)) => (access.clone(), secret.clone()),
            _ => {
                return Err(crate::error::ConfigurationError::Missing {
                    key: "sqs.access_key_id / sqs.secret_access_key".to_string(),
                }
                .into())
            }
        };

        let endpoint = match &config.endpoint {
            Some(endpoint) => {
                crate::config::validate_endpoint(endpoint, "sqs.endpoint", &["http", "https"])?;
                endpoint.trim_end_matches('/').to_string()
            }
            None => format!("https://sqs.{}.amazonaws.com", config.region),
        };

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        let signer = AwsV4Signer::new(access_key, secret_key, config.region.clone());
        Ok(Self {
            transport: SqsTransport {
                http_client,
                signer,
                endpoint,
            },
            config,
            options,
            queue_url_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Resolve and cache the queue URL, creating the queue when it does
    /// not exist yet. CreateQueue on an existing queue returns its URL,
    /// so concurrent first resolutions converge.
    async fn queue_url(&self, queue: &QueueName) -> Result<String, SqsError> {
        {
            let cache = self.queue_url_cache.read().await;
            if let Some(url) = cache.get(queue) {
                return Ok(url.clone());
            }
        }

        let mut params = base_params("GetQueueUrl");
        params.insert("QueueName".to_string(), queue.as_str().to_string());
        let url = match self.transport.request(&params).await {
            Ok(response) => parse_element_text(&response, "QueueUrl")?,
            Err(SqsError::QueueNotFound(_)) => {
                debug!(queue = %queue, "queue missing, creating");
                let mut params = base_params("CreateQueue");
                params.insert("QueueName".to_string(), queue.as_str().to_string());
                let response = self.transport.request(&params).await?;
                parse_element_text(&response, "QueueUrl")?
            }
            Err(err) => return Err(err),
        };

        let mut cache = self.queue_url_cache.write().await;
        cache.insert(queue.clone(), url.clone());
        Ok(url)
    }

    async fn delete_message(
        transport: &SqsTransport,
        queue_url: &str,
        receipt: &str,
    ) -> Result<(), SqsError> {
        let mut params = base_params("DeleteMessage");
        params.insert("QueueUrl".to_string(), queue_url.to_string());
        params.insert("ReceiptHandle".to_string(), receipt.to_string());
        transport.request(&params).await.map(|_| ())
    }
}

#[async_trait]
impl QueueBackend for SqsBackend {
    async fn connect_producer(&self) -> Result<(), QueueError> {
        // Stateless HTTP transport; nothing to establish up front
        Ok(())
    }

    async fn send(&self, queue: &QueueName, payload: &Payload) -> Result<(), QueueError> {
        let queue_url = self
            .queue_url(queue)
            .await
            .map_err(SqsError::into_queue_error)?;
        let body = encode_payload(payload)?;

        let mut params = base_params("SendMessage");
        params.insert("QueueUrl".to_string(), queue_url);
        params.insert("MessageBody".to_string(), body);
        self.transport
            .request(&params)
            .await
            .map_err(SqsError::into_queue_error)?;
        Ok(())
    }

    async fn connect_consumer(
        &self,
        _queue: Option<&QueueName>,
        _group: Option<&str>,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &QueueName,
        max: usize,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let queue_url = self
            .queue_url(queue)
            .await
            .map_err(SqsError::into_queue_error)?;

        // Long polling replaces the local empty-queue sleep here
        let wait_seconds = self.options.empty_poll_wait.as_secs().min(MAX_WAIT_SECONDS);

        let mut params = base_params("ReceiveMessage");
        params.insert("QueueUrl".to_string(), queue_url.clone());
        params.insert(
            "MaxNumberOfMessages".to_string(),
            max.clamp(1, MAX_BATCH).to_string(),
        );
        params.insert("WaitTimeSeconds".to_string(), wait_seconds.to_string());
        params.insert(
            "VisibilityTimeout".to_string(),
            self.config.visibility_timeout.to_string(),
        );

        let response = self
            .transport
            .request(&params)
            .await
            .map_err(SqsError::into_queue_error)?;
        let raw_messages =
            parse_receive_response(&response).map_err(SqsError::into_queue_error)?;

        let auto_ack = self.options.ack_mode == AckMode::Auto;
        let mut delivered = Vec::with_capacity(raw_messages.len());
        for raw in raw_messages {
            let payload = match decode_payload(raw.body.as_bytes()) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(queue = %queue, error = %err, "skipping undecodable message");
                    continue;
                }
            };
            let handle = if auto_ack {
                // Settle immediately; the caller never sees a receipt
                Self::delete_message(&self.transport, &queue_url, &raw.receipt_handle)
                    .await
                    .map_err(SqsError::into_queue_error)?;
                DeliveryHandle::None
            } else {
                DeliveryHandle::Sqs {
                    queue: queue.clone(),
                    receipt: raw.receipt_handle,
                }
            };
            delivered.push(DeliveredMessage::new(handle, payload));
        }
        Ok(delivered)
    }

    async fn acknowledge(
        &self,
        _queue: &QueueName,
        handle: &DeliveryHandle,
    ) -> Result<(), QueueError> {
        let (queue, receipt) = match handle {
            DeliveryHandle::None => return Ok(()),
            DeliveryHandle::Sqs { queue, receipt } => (queue, receipt.clone()),
            other => {
                return Err(QueueError::HandleNotFound {
                    receipt: format!("{:?}", other),
                })
            }
        };
        let queue_url = self
            .queue_url(queue)
            .await
            .map_err(SqsError::into_queue_error)?;

        if self.config.async_remove {
            // Fire and forget: the visibility timeout covers a lost delete
            let transport = self.transport.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                if let Err(err) = Self::delete_message(&transport, &queue_url, &receipt).await {
                    warn!(queue = %queue, error = %err, "async message delete failed");
                }
            });
            return Ok(());
        }

        Self::delete_message(&self.transport, &queue_url, &receipt)
            .await
            .map_err(SqsError::into_queue_error)
    }

    async fn length(&self, queue: &QueueName) -> Result<u64, QueueError> {
        let queue_url = self
            .queue_url(queue)
            .await
            .map_err(SqsError::into_queue_error)?;

        let mut params = base_params("GetQueueAttributes");
        params.insert("QueueUrl".to_string(), queue_url);
        params.insert(
            "AttributeName.1".to_string(),
            "ApproximateNumberOfMessages".to_string(),
        );
        let response = self
            .transport
            .request(&params)
            .await
            .map_err(SqsError::into_queue_error)?;

        let value =
            parse_element_text(&response, "Value").map_err(SqsError::into_queue_error)?;
        value.parse::<u64>().map_err(|_| {
            SqsError::Xml(format!("non-numeric queue length '{}'", value)).into_queue_error()
        })
    }

    async fn delete_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let queue_url = self
            .queue_url(queue)
            .await
            .map_err(SqsError::into_queue_error)?;

        let mut params = base_params("DeleteQueue");
        params.insert("QueueUrl".to_string(), queue_url);
        self.transport
            .request(&params)
            .await
            .map_err(SqsError::into_queue_error)?;

        self.queue_url_cache.write().await.remove(queue);
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Sqs
    }
}

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;
