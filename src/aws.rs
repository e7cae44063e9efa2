//! Minimal AWS JSON-protocol client with SigV4 request signing.
//!
//! SQS and DynamoDB both speak the `x-amz-json-1.0` protocol: a POST of a
//! JSON body to the service endpoint with an `X-Amz-Target` header naming
//! the operation. This module implements just that, signed with SigV4, on
//! top of a blocking HTTP client. It is shared by the SQS stream and the
//! DynamoDB state manager.

use std::thread;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{CdcError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Static AWS credentials
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Connection settings shared by the AWS-backed components
#[derive(Clone)]
pub struct AwsClientConfig {
    pub region: String,
    pub endpoint_url: String,
    pub credentials: AwsCredentials,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl AwsClientConfig {
    pub fn new(region: String, endpoint_url: String, credentials: AwsCredentials) -> Self {
        AwsClientConfig {
            region,
            endpoint_url,
            credentials,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(5),
        }
    }
}

const RETRY_ATTEMPTS: u32 = 3;

/// Blocking client for one AWS service
pub struct AwsJsonClient {
    http: reqwest::blocking::Client,
    config: AwsClientConfig,
    /// SigV4 service name, e.g. `sqs` or `dynamodb`
    service: &'static str,
}

impl AwsJsonClient {
    pub fn new(service: &'static str, config: AwsClientConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| CdcError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(AwsJsonClient { http, config, service })
    }

    /// POST a JSON operation and return the decoded JSON response.
    ///
    /// Transport errors, 5xx and 429 responses are retried up to three
    /// times; other non-success statuses fail immediately with the
    /// service's error type in the message.
    pub fn post(&self, target: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let payload = serde_json::to_string(body)
            .map_err(|e| CdcError::Processing(format!("Failed to encode {} request: {}", target, e)))?;

        let mut last_error = String::new();
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.post_once(target, &payload) {
                Ok(response) => return Ok(response),
                Err(RequestFailure::Retriable(msg)) => {
                    log::warn!("{} attempt {}/{} failed: {}", target, attempt, RETRY_ATTEMPTS, msg);
                    last_error = msg;
                    if attempt < RETRY_ATTEMPTS {
                        thread::sleep(Duration::from_millis(100 * u64::from(attempt)));
                    }
                }
                Err(RequestFailure::Terminal(msg)) => {
                    return Err(CdcError::Stream(msg));
                }
            }
        }
        Err(CdcError::Stream(format!(
            "{} failed after {} attempts: {}",
            target, RETRY_ATTEMPTS, last_error
        )))
    }

    fn post_once(&self, target: &str, payload: &str) -> std::result::Result<serde_json::Value, RequestFailure> {
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let host = host_of(&self.config.endpoint_url);

        let authorization = sign_request(
            &self.config.credentials,
            &self.config.region,
            self.service,
            &host,
            target,
            &amz_date,
            payload,
        );

        let response = self
            .http
            .post(&self.config.endpoint_url)
            .header("Content-Type", "application/x-amz-json-1.0")
            .header("X-Amz-Target", target)
            .header("X-Amz-Date", &amz_date)
            .header("Authorization", authorization)
            .body(payload.to_string())
            .send()
            .map_err(|e| RequestFailure::Retriable(format!("transport error: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| RequestFailure::Retriable(format!("failed to read response: {}", e)))?;

        if status.is_success() {
            if text.is_empty() {
                return Ok(serde_json::Value::Null);
            }
            serde_json::from_str(&text)
                .map_err(|e| RequestFailure::Terminal(format!("invalid JSON response: {}", e)))
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(RequestFailure::Retriable(format!("HTTP {}: {}", status, text)))
        } else {
            let error_type = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("__type").and_then(|t| t.as_str()).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            Err(RequestFailure::Terminal(format!(
                "{} returned HTTP {} ({}): {}",
                target, status, error_type, text
            )))
        }
    }
}

enum RequestFailure {
    Retriable(String),
    Terminal(String),
}

fn host_of(endpoint_url: &str) -> String {
    endpoint_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Build the SigV4 `Authorization` header value for an `x-amz-json-1.0` POST.
fn sign_request(
    credentials: &AwsCredentials,
    region: &str,
    service: &str,
    host: &str,
    target: &str,
    amz_date: &str,
    payload: &str,
) -> String {
    let date = &amz_date[..8];
    let signed_headers = "content-type;host;x-amz-date;x-amz-target";

    let canonical_headers = format!(
        "content-type:application/x-amz-json-1.0\nhost:{}\nx-amz-date:{}\nx-amz-target:{}\n",
        host, amz_date, target
    );
    let canonical_request = format!(
        "POST\n/\n\n{}\n{}\n{}",
        canonical_headers,
        signed_headers,
        sha256_hex(payload)
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(&canonical_request)
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        date,
    );
    let k_region = hmac_sha256(&k_date, region);
    let k_service = hmac_sha256(&k_region, service);
    let k_signing = hmac_sha256(&k_service, "aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, &string_to_sign));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key_id, scope, signed_headers, signature
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
        }
    }

    #[test]
    fn test_host_of_strips_scheme_and_slash() {
        assert_eq!(host_of("https://sqs.eu-west-1.amazonaws.com/"), "sqs.eu-west-1.amazonaws.com");
        assert_eq!(host_of("http://localhost:4566"), "localhost:4566");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = sign_request(
            &credentials(),
            "eu-west-1",
            "sqs",
            "sqs.eu-west-1.amazonaws.com",
            "AmazonSQS.SendMessageBatch",
            "20250331T123005Z",
            "{}",
        );
        let b = sign_request(
            &credentials(),
            "eu-west-1",
            "sqs",
            "sqs.eu-west-1.amazonaws.com",
            "AmazonSQS.SendMessageBatch",
            "20250331T123005Z",
            "{}",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_varies_with_payload() {
        let a = sign_request(
            &credentials(),
            "eu-west-1",
            "sqs",
            "host",
            "AmazonSQS.SendMessageBatch",
            "20250331T123005Z",
            "{\"a\":1}",
        );
        let b = sign_request(
            &credentials(),
            "eu-west-1",
            "sqs",
            "host",
            "AmazonSQS.SendMessageBatch",
            "20250331T123005Z",
            "{\"a\":2}",
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_authorization_header_shape() {
        let auth = sign_request(
            &credentials(),
            "eu-west-1",
            "dynamodb",
            "host",
            "DynamoDB_20120810.GetItem",
            "20250331T123005Z",
            "{}",
        );
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20250331/eu-west-1/dynamodb/aws4_request"));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date;x-amz-target"));
        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
