//! S3 object store.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication,
//! using path-style addressing (`<endpoint>/<bucket>/<key>`) so that the same
//! code works against AWS and S3-compatible services (MinIO, LocalStack).
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for AWS signing, with
//! no C library dependencies like `aws-lc-sys`.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)
//!
//! # Pagination
//!
//! [`ObjectStore::list`] follows the `ListObjectsV2` continuation token until
//! the listing is complete, 1000 keys per page.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};

use super::ObjectStore;
use crate::config::S3StoreConfig;

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

pub struct S3ObjectStore {
    config: S3StoreConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
    scheme: String,
    host: String,
}

impl S3ObjectStore {
    /// Create a store for `config`, reading credentials from the environment.
    ///
    /// `request_timeout` bounds every individual HTTP request.
    pub fn from_env(config: S3StoreConfig, request_timeout: Duration) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        let (scheme, host) = endpoint(&config);
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build S3 HTTP client")?;

        Ok(Self {
            config,
            creds,
            client,
            scheme,
            host,
        })
    }

    fn canonical_uri(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("/{}/{}", uri_encode(&self.config.bucket), encode_key(key)),
            None => format!("/{}", uri_encode(&self.config.bucket)),
        }
    }

    /// Sign and send one request. Non-2xx responses become errors.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let canonical_uri = self.canonical_uri(key);

        let mut sorted_params = query;
        sorted_params.sort();
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(&body);
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort();

        let authorization = authorization_header(
            &self.creds,
            &self.config.region,
            method.as_str(),
            &canonical_uri,
            &canonical_querystring,
            &headers,
            &payload_hash,
            now,
        );

        let mut url = format!("{}://{}{}", self.scheme, self.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req_builder = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);

        if let Some(ref token) = self.creds.session_token {
            req_builder = req_builder.header("x-amz-security-token", token);
        }
        if !body.is_empty() || method == Method::PUT {
            req_builder = req_builder.body(body);
        }

        let target = format!("s3://{}/{}", self.config.bucket, key.unwrap_or(""));
        let resp = req_builder
            .send()
            .await
            .with_context(|| format!("S3 {} {} failed", method, target))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 {} {} failed (HTTP {}): {}",
                method,
                target,
                status,
                body.chars().take(500).collect::<String>()
            );
        }

        Ok(resp)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn location(&self) -> String {
        format!("s3://{}", self.config.bucket)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query_params.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.send(Method::GET, None, query_params, Vec::new()).await?;
            let xml_body = resp
                .text()
                .await
                .context("Failed to read ListObjectsV2 response")?;
            let page = parse_list_page(&xml_body);
            keys.extend(page.keys);

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                (true, None) => bail!("S3 listing truncated without a continuation token"),
                (false, _) => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.send(Method::PUT, Some(key), Vec::new(), body).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self.send(Method::GET, Some(key), Vec::new(), Vec::new()).await?;
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of s3://{}/{}", self.config.bucket, key))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.send(Method::DELETE, Some(key), Vec::new(), Vec::new())
            .await?;
        Ok(())
    }
}

// ============ AWS SigV4 Helpers ============

/// Scheme and host (with port, if any) for the configured endpoint.
///
/// Without a custom `endpoint_url` this is the regional AWS endpoint
/// `s3.<region>.amazonaws.com` over HTTPS.
fn endpoint(config: &S3StoreConfig) -> (String, String) {
    match config.endpoint_url {
        Some(ref url) => {
            let (scheme, rest) = if let Some(rest) = url.strip_prefix("http://") {
                ("http", rest)
            } else if let Some(rest) = url.strip_prefix("https://") {
                ("https", rest)
            } else {
                ("https", url.as_str())
            };
            (scheme.to_string(), rest.trim_end_matches('/').to_string())
        }
        None => (
            "https".to_string(),
            format!("s3.{}.amazonaws.com", config.region),
        ),
    }
}

/// Build the `Authorization` header value for one request.
///
/// `headers` must be lowercase and sorted by name; every one of them is
/// signed.
#[allow(clippy::too_many_arguments)]
fn authorization_header(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    canonical_uri: &str,
    canonical_querystring: &str,
    headers: &[(String, String)],
    payload_hash: &str,
    now: DateTime<Utc>,
) -> String {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri,
        canonical_querystring,
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

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

/// URI-encode a string per RFC 3986. Only `A-Z a-z 0-9 - _ . ~` pass through.
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

/// Encode an object key segment by segment, keeping `/` literal.
fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

// ============ XML Parsing (minimal, no extra deps) ============

/// One page of a `ListObjectsV2` response.
#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

fn parse_list_page(xml: &str) -> ListPage {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken").map(|t| xml_unescape(&t));

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            let key = xml_unescape(&key);
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(key);
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    ListPage {
        keys,
        is_truncated,
        next_token,
    }
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn s3_config(endpoint_url: Option<&str>) -> S3StoreConfig {
        S3StoreConfig {
            bucket: "ndb".to_string(),
            region: "us-west-2".to_string(),
            endpoint_url: endpoint_url.map(str::to_string),
        }
    }

    #[test]
    fn test_signing_key_matches_aws_example() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("ndb_1"), "ndb_1");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(encode_key("checkpoints/ndb_1/a b.json"), "checkpoints/ndb_1/a%20b.json");
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            endpoint(&s3_config(None)),
            ("https".to_string(), "s3.us-west-2.amazonaws.com".to_string())
        );
        assert_eq!(
            endpoint(&s3_config(Some("http://localhost:9000/"))),
            ("http".to_string(), "localhost:9000".to_string())
        );
        assert_eq!(
            endpoint(&s3_config(Some("minio.internal"))),
            ("https".to_string(), "minio.internal".to_string())
        );
    }

    #[test]
    fn test_authorization_header_shape() {
        let creds = AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let payload_hash = hex_sha256(b"");
        let headers = vec![
            ("host".to_string(), "s3.us-west-2.amazonaws.com".to_string()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), "20240301T120000Z".to_string()),
        ];

        let auth = authorization_header(
            &creds,
            "us-west-2",
            "GET",
            "/ndb",
            "list-type=2",
            &headers,
            &payload_hash,
            now,
        );
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240301/us-west-2/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let signature = auth.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);

        // Any change to the request changes the signature.
        let other = authorization_header(
            &creds,
            "us-west-2",
            "GET",
            "/ndb",
            "list-type=2&prefix=checkpoints%2F",
            &headers,
            &payload_hash,
            now,
        );
        assert_ne!(auth, other);
    }

    #[test]
    fn test_parse_list_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>ndb</Name>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=</NextContinuationToken>
  <Contents><Key>checkpoints/ndb_1/chunks.json</Key><Size>10</Size></Contents>
  <Contents><Key>checkpoints/ndb_1/</Key><Size>0</Size></Contents>
  <Contents><Key>checkpoints/ndb_1/a&amp;b.json</Key><Size>3</Size></Contents>
</ListBucketResult>"#;

        let page = parse_list_page(xml);
        assert!(page.is_truncated);
        assert_eq!(
            page.next_token.as_deref(),
            Some("1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=")
        );
        assert_eq!(
            page.keys,
            vec![
                "checkpoints/ndb_1/chunks.json".to_string(),
                "checkpoints/ndb_1/a&b.json".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_empty_listing() {
        let xml = "<ListBucketResult><IsTruncated>false</IsTruncated><KeyCount>0</KeyCount></ListBucketResult>";
        assert_eq!(parse_list_page(xml), ListPage::default());
    }
}
