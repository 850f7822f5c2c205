//! Amazon S3 blob store.
//!
//! Implements [`BlobStore`] with the S3 REST API: a collection is a bucket,
//! an object is an object. Requests are path-style
//! (`https://s3.<region>.amazonaws.com/<bucket>/<key>`) so that S3-compatible
//! services (MinIO, LocalStack) work through `endpoint_url` without DNS
//! tricks, and are signed with AWS Signature Version 4 using the pure-Rust
//! `hmac` + `sha2` crates.
//!
//! # Configuration
//!
//! ```toml
//! [blob]
//! backend = "s3"
//!
//! [blob.s3]
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! Read once when the store is built:
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (for temporary credentials / IAM roles)
//!
//! # Error classification
//!
//! HTTP 429, 5xx (including `SlowDown`) and network failures are
//! `Transient`; every other failure is `Permanent`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};

use code_analyzer_core::adapters::{AdapterError, AdapterResult, BlobStore};
use code_analyzer_core::models::CollectionName;

use crate::config::S3Config;

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

pub struct S3BlobStore {
    client: reqwest::Client,
    creds: AwsCredentials,
    region: String,
    scheme: &'static str,
    host: String,
}

impl S3BlobStore {
    pub fn new(config: &S3Config) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        let (scheme, host) = s3_endpoint(config);
        Ok(Self {
            client: reqwest::Client::new(),
            creds,
            region: config.region.clone(),
            scheme,
            host,
        })
    }

    /// Send a signed path-style request for `bucket` or `bucket/key`.
    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: Option<&str>,
        body: Vec<u8>,
    ) -> AdapterResult<reqwest::Response> {
        let canonical_uri = match key {
            Some(key) => format!("/{}/{}", uri_encode(bucket), encode_key(key)),
            None => format!("/{}", uri_encode(bucket)),
        };
        let url = format!("{}://{}{}", self.scheme, self.host, canonical_uri);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let authorization = authorization_header(
            &self.creds,
            &self.region,
            method.as_str(),
            &canonical_uri,
            &mut headers,
            &payload_hash,
            &amz_date,
            &date_stamp,
        );

        let mut req_builder = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req_builder = req_builder.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req_builder = req_builder.body(body);
        }

        req_builder.send().await.map_err(|e| {
            AdapterError::transient(format!("S3 {} {} failed: {}", method, canonical_uri, e))
        })
    }
}

/// Classify a non-success S3 response.
fn s3_error(operation: &str, target: &str, status: u16, body: &str) -> AdapterError {
    let code = extract_xml_value(body, "Code").unwrap_or_default();
    let message = format!("S3 {} failed (HTTP {} {}) for '{}'", operation, status, code, target);
    if status == 429 || (500..600).contains(&status) || code == "SlowDown" {
        AdapterError::transient(message)
    } else {
        AdapterError::permanent(message)
    }
}

async fn failure(operation: &str, target: &str, resp: reqwest::Response) -> AdapterError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    s3_error(operation, target, status, &body)
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn create_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        let body = if self.region == "us-east-1" {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.region
            )
            .into_bytes()
        };
        let resp = self
            .send(Method::PUT, collection.as_str(), None, body)
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if extract_xml_value(&text, "Code").as_deref() == Some("BucketAlreadyOwnedByYou") {
            tracing::debug!(bucket = %collection, "bucket already exists");
            return Ok(());
        }
        Err(s3_error("CreateBucket", collection.as_str(), status, &text))
    }

    async fn delete_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        let resp = self
            .send(Method::DELETE, collection.as_str(), None, Vec::new())
            .await?;
        if resp.status().is_success() || resp.status().as_u16() == 404 {
            return Ok(());
        }
        Err(failure("DeleteBucket", collection.as_str(), resp).await)
    }

    async fn put_object(
        &self,
        collection: &CollectionName,
        key: &str,
        bytes: Vec<u8>,
    ) -> AdapterResult<()> {
        let resp = self
            .send(Method::PUT, collection.as_str(), Some(key), bytes)
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }
        Err(failure("PutObject", &format!("{}/{}", collection, key), resp).await)
    }

    async fn get_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<Vec<u8>> {
        let target = format!("{}/{}", collection, key);
        let resp = self
            .send(Method::GET, collection.as_str(), Some(key), Vec::new())
            .await?;
        if !resp.status().is_success() {
            return Err(failure("GetObject", &target, resp).await);
        }
        let bytes = resp.bytes().await.map_err(|e| {
            AdapterError::transient(format!("S3 GetObject body for '{}': {}", target, e))
        })?;
        Ok(bytes.to_vec())
    }

    async fn delete_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<()> {
        let resp = self
            .send(Method::DELETE, collection.as_str(), Some(key), Vec::new())
            .await?;
        if resp.status().is_success() || resp.status().as_u16() == 404 {
            return Ok(());
        }
        Err(failure("DeleteObject", &format!("{}/{}", collection, key), resp).await)
    }
}

// ============ AWS SigV4 Helpers ============

/// Scheme and host for path-style requests.
///
/// A custom `endpoint_url` (MinIO, LocalStack, etc.) keeps its scheme;
/// otherwise the regional endpoint `s3.<region>.amazonaws.com` is used.
fn s3_endpoint(config: &S3Config) -> (&'static str, String) {
    match config.endpoint_url {
        Some(ref endpoint) => {
            let scheme = if endpoint.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            (scheme, host)
        }
        None => ("https", format!("s3.{}.amazonaws.com", config.region)),
    }
}

/// Build the `Authorization` header value. Sorts `headers` in place.
#[allow(clippy::too_many_arguments)]
fn authorization_header(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    canonical_uri: &str,
    headers: &mut [(String, String)],
    payload_hash: &str,
    amz_date: &str,
    date_stamp: &str,
) -> String {
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Encode an object key segment by segment, keeping the `/` separators.
fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}
