//! Blob storage for uploaded originals.
//!
//! Two backends implement [`BlobStore`]:
//!
//! - [`FsBlobStore`]: one file per key under a root directory.
//! - [`S3BlobStore`]: any S3-compatible object store (AWS S3, MinIO,
//!   LocalStack) via the S3 REST API, signed with AWS Signature V4 using
//!   `hmac` + `sha2`.
//!
//! # Environment Variables
//!
//! The S3 backend reads credentials from the environment:
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional
//!
//! # Storage keys
//!
//! Keys are generated by [`storage_key`]: a 16-hex-digit prefix derived from
//! the upload time and document id, followed by the sanitized filename. Keys
//! never contain path separators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::{Config, S3BlobConfig};

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, content: &[u8], content_type: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove the blob. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Time-limited direct download URL, when the backend supports one.
    fn presigned_read_url(&self, key: &str) -> Result<Option<String>>;
}

/// Build the blob store named by `[blob] backend`.
pub fn open_blob_store(config: &Config) -> Result<Arc<dyn BlobStore>> {
    match config.blob.backend.as_str() {
        "fs" => Ok(Arc::new(FsBlobStore::new(config.blob.root.clone()))),
        "s3" => {
            let s3 = config
                .blob
                .s3
                .clone()
                .context("blob.s3 section is required when blob.backend = \"s3\"")?;
            Ok(Arc::new(S3BlobStore::new(s3)?))
        }
        other => bail!("Unknown blob backend: '{}'", other),
    }
}

/// Collision-resistant key for a new upload.
pub fn storage_key(document_id: &str, filename: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_be_bytes());
    hasher.update(document_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}_{}", &digest[..16], sanitize_filename(filename))
}

/// Map every character outside `[A-Za-z0-9.-]` to `_`.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('.')
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        bail!("invalid storage key: {:?}", key);
    }
    Ok(())
}

// ============ Filesystem backend ============

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, content: &[u8], _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create blob root {}", self.root.display()))?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write blob {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob {}", path.display()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob {}", path.display())),
        }
    }

    fn presigned_read_url(&self, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

// ============ AWS Credentials ============

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

// ============ S3 backend ============

pub struct S3BlobStore {
    config: S3BlobConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

/// Where requests for an object go: the URL to call and the pieces the
/// signature covers.
struct ObjectTarget {
    url: String,
    host: String,
    canonical_uri: String,
}

impl S3BlobStore {
    pub fn new(config: S3BlobConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            config,
            creds,
            client,
        })
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix, key)
    }

    /// Virtual-hosted style for AWS; path style for custom endpoints
    /// (MinIO, LocalStack).
    fn target(&self, key: &str) -> ObjectTarget {
        let encoded_key = self
            .object_key(key)
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");

        match self.config.endpoint_url {
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
                let canonical_uri = format!("/{}/{}", uri_encode(&self.config.bucket), encoded_key);
                ObjectTarget {
                    url: format!("{}://{}{}", scheme, host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!(
                    "{}.s3.{}.amazonaws.com",
                    self.config.bucket, self.config.region
                );
                let canonical_uri = format!("/{}", encoded_key);
                ObjectTarget {
                    url: format!("https://{}{}", host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    /// Header-signed request for `method` on `key` with the given payload.
    fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> reqwest::RequestBuilder {
        let target = self.target(key);
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
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
            method.as_str(),
            target.canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let signature = self.sign(&canonical_request, &amz_date, &date_stamp, &credential_scope);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut req = self
            .client
            .request(method, &target.url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        req
    }

    fn sign(
        &self,
        canonical_request: &str,
        amz_date: &str,
        date_stamp: &str,
        credential_scope: &str,
    ) -> String {
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            date_stamp,
            &self.config.region,
            "s3",
        );
        hex_hmac_sha256(&signing_key, string_to_sign.as_bytes())
    }

    /// Query-string presigned GET URL valid for `ttl`.
    fn presign_get(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> String {
        let target = self.target(key);
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let credential = format!("{}/{}", self.creds.access_key_id, credential_scope);

        let mut params = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            ("X-Amz-Credential".to_string(), credential),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), ttl.as_secs().to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref token) = self.creds.session_token {
            params.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_query = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            target.canonical_uri, canonical_query, target.host
        );
        let signature = self.sign(&canonical_request, &amz_date, &date_stamp, &credential_scope);

        format!(
            "{}?{}&X-Amz-Signature={}",
            target.url, canonical_query, signature
        )
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, content: &[u8], content_type: &str) -> Result<()> {
        check_key(key)?;
        let resp = self
            .signed_request(reqwest::Method::PUT, key, content, Utc::now())
            .header("Content-Type", content_type)
            .body(content.to_vec())
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{}/{}", self.config.bucket, key))?;
        if !resp.status().is_success() {
            bail!("S3 PutObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        check_key(key)?;
        let resp = self
            .signed_request(reqwest::Method::GET, key, b"", Utc::now())
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.config.bucket, key))?;
        if !resp.status().is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let resp = self
            .signed_request(reqwest::Method::DELETE, key, b"", Utc::now())
            .send()
            .await
            .with_context(|| format!("Failed to delete s3://{}/{}", self.config.bucket, key))?;
        // S3 answers 204 for both existing and missing keys.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            bail!("S3 DeleteObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(())
    }

    fn presigned_read_url(&self, key: &str) -> Result<Option<String>> {
        check_key(key)?;
        let ttl = Duration::from_secs(self.config.presign_ttl_secs);
        Ok(Some(self.presign_get(key, ttl, Utc::now())))
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

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

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_replaces_separators_and_spaces() {
        assert_eq!(sanitize_filename("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_filename("my report (v2).pdf"), "my_report__v2_.pdf");
    }

    #[test]
    fn storage_keys_differ_for_same_filename() {
        let a = storage_key("doc-a", "notes.txt");
        let b = storage_key("doc-b", "notes.txt");
        assert_ne!(a, b);
        assert!(a.ends_with("_notes.txt"));
        assert_eq!(a.split('_').next().unwrap().len(), 16);
        assert!(check_key(&a).is_ok());
    }

    #[test]
    fn rejects_traversal_keys() {
        assert!(check_key("../x").is_err());
        assert!(check_key("a/b").is_err());
        assert!(check_key("").is_err());
    }

    #[tokio::test]
    async fn fs_store_roundtrip_and_idempotent_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().join("blobs"));
        store.put("k_a.txt", b"hello", "text/plain").await.unwrap();
        assert_eq!(store.get("k_a.txt").await.unwrap(), b"hello");
        store.delete("k_a.txt").await.unwrap();
        assert!(store.get("k_a.txt").await.is_err());
        store.delete("k_a.txt").await.unwrap();
        assert!(store.presigned_read_url("k_a.txt").unwrap().is_none());
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("hello"), "hello");
        assert_eq!(uri_encode("hello world"), "hello%20world");
        assert_eq!(uri_encode("a/b"), "a%2Fb");
        assert_eq!(uri_encode("file.md"), "file.md");
    }

    #[test]
    fn test_derive_signing_key() {
        // Known test vector from AWS documentation
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(&key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn presigned_url_carries_signature_and_expiry() {
        let store = S3BlobStore {
            config: S3BlobConfig {
                bucket: "docs".into(),
                region: "us-east-1".into(),
                prefix: "uploads/".into(),
                endpoint_url: Some("http://localhost:9000".into()),
                presign_ttl_secs: 900,
            },
            creds: AwsCredentials {
                access_key_id: "AKIDEXAMPLE".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
            client: reqwest::Client::new(),
        };
        let url = store.presign_get("abc_a.pdf", Duration::from_secs(900), Utc::now());
        assert!(url.starts_with("http://localhost:9000/docs/uploads/abc_a.pdf?"));
        assert!(url.contains("X-Amz-Expires=900"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Credential=AKIDEXAMPLE%2F"));
    }
}
