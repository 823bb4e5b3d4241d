//! Alibaba Cloud RDS backup queries.
//!
//! Talks to the RDS RPC-style OpenAPI directly over `reqwest`, signing each
//! request with HMAC-SHA1 (signature version 1.0).

use crate::error::BackupError;
use crate::models::{BackupRecord, BlankRecord};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use sha1::Sha1;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const API_VERSION: &str = "2014-08-15";
const DESCRIBE_BACKUPS: &str = "DescribeBackups";

/// Unreserved characters per RFC 3986 stay literal, everything else is %XX
const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Looks up the most recent backup of a database instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupQuerier: Send + Sync {
    /// Latest backup, or a blank record when the instance has none
    async fn latest_backup(&self, instance_id: &str) -> Result<BackupRecord, BackupError>;
}

/// Access key pair for the RDS OpenAPI
#[derive(Clone)]
pub struct AliyunCredentials {
    pub access_key_id: String,
    pub access_key_secret: String,
}

impl std::fmt::Debug for AliyunCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliyunCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .finish()
    }
}

/// Alibaba Cloud RDS OpenAPI client
pub struct AliyunRdsClient {
    http: reqwest::Client,
    endpoint: String,
    credentials: Option<AliyunCredentials>,
}

impl AliyunRdsClient {
    /// `endpoint` is a host name such as `rds.aliyuncs.com` or a full base URL.
    /// Missing credentials are reported on the first query.
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        credentials: Option<AliyunCredentials>,
    ) -> Self {
        let endpoint = endpoint.into();
        let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", endpoint.trim_end_matches('/'))
        };

        if credentials.is_none() {
            warn!("Alibaba Cloud credentials are not configured");
        }
        info!(endpoint = %endpoint, "Alibaba Cloud RDS client initialized");

        Self {
            http,
            endpoint,
            credentials,
        }
    }

    /// Build the full signed query string for an RPC action
    fn signed_query(
        &self,
        credentials: &AliyunCredentials,
        action: &'static str,
        parameters: &[(&str, &str)],
        timestamp: DateTime<Utc>,
        nonce: &str,
    ) -> Result<String, BackupError> {
        let timestamp = timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let mut params: BTreeMap<&str, &str> = BTreeMap::from([
            ("AccessKeyId", credentials.access_key_id.as_str()),
            ("Action", action),
            ("Format", "JSON"),
            ("SignatureMethod", "HMAC-SHA1"),
            ("SignatureNonce", nonce),
            ("SignatureVersion", "1.0"),
            ("Timestamp", timestamp.as_str()),
            ("Version", API_VERSION),
        ]);
        params.extend(parameters.iter().copied());

        let canonical = canonicalize(&params);
        let signature = sign(&credentials.access_key_secret, &string_to_sign("GET", &canonical))
            .map_err(|e| BackupError::upstream(action, format!("failed to sign request: {e}")))?;
        Ok(format!("{}&Signature={}", canonical, percent_encode(&signature)))
    }

    async fn call(
        &self,
        action: &'static str,
        parameters: &[(&str, &str)],
    ) -> Result<String, BackupError> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            BackupError::upstream(
                action,
                "missing required environment variables: ALIBABA_CLOUD_ACCESS_KEY_ID or ALIBABA_CLOUD_ACCESS_KEY_SECRET",
            )
        })?;

        let nonce = Uuid::new_v4().to_string();
        let query = self.signed_query(credentials, action, parameters, Utc::now(), &nonce)?;
        let url = format!("{}/?{}", self.endpoint, query);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BackupError::upstream(action, format!("API request error: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackupError::upstream(action, format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(BackupError::upstream(action, api_error_message(status, &body)));
        }

        Ok(body)
    }
}

#[async_trait]
impl BackupQuerier for AliyunRdsClient {
    #[instrument(skip(self))]
    async fn latest_backup(&self, instance_id: &str) -> Result<BackupRecord, BackupError> {
        let body = self
            .call(DESCRIBE_BACKUPS, &[("DBInstanceId", instance_id)])
            .await?;
        let record = parse_describe_backups(&body)?;

        if record.is_blank() {
            debug!(instance_id, "No backups returned");
        }
        Ok(record)
    }
}

#[derive(Debug, Deserialize)]
struct DescribeBackupsResponse {
    #[serde(rename = "Items", default)]
    items: BackupItems,
}

#[derive(Debug, Deserialize, Default)]
struct BackupItems {
    #[serde(rename = "Backup", default)]
    backup: Vec<BackupRecord>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "Code")]
    code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "RequestId")]
    request_id: Option<String>,
}

/// The API lists backups newest first; the first item is taken as latest
fn parse_describe_backups(body: &str) -> Result<BackupRecord, BackupError> {
    let response: DescribeBackupsResponse = serde_json::from_str(body).map_err(|e| {
        BackupError::upstream(DESCRIBE_BACKUPS, format!("malformed response: {e}"))
    })?;

    Ok(response.items.backup.into_iter().next().unwrap_or_default())
}

fn api_error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody {
            code: Some(code),
            message,
            request_id,
        }) => format!(
            "API request error: {} ({}), status: {}, request id: {}",
            message.unwrap_or_default(),
            code,
            status.as_u16(),
            request_id.unwrap_or_default()
        ),
        _ => format!("API request error: status: {}, body: {}", status.as_u16(), body),
    }
}

fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, RFC3986).to_string()
}

/// Sorted `key=value` pairs, each side percent-encoded, joined with `&`
fn canonicalize(params: &BTreeMap<&str, &str>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn string_to_sign(method: &str, canonical_query: &str) -> String {
    format!(
        "{}&{}&{}",
        method,
        percent_encode("/"),
        percent_encode(canonical_query)
    )
}

fn sign(access_key_secret: &str, string_to_sign: &str) -> Result<String, hmac::digest::InvalidLength> {
    let key = format!("{access_key_secret}&");
    let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credentials() -> AliyunCredentials {
        AliyunCredentials {
            access_key_id: "testid".to_string(),
            access_key_secret: "testsecret".to_string(),
        }
    }

    #[test]
    fn test_percent_encode_rfc3986() {
        assert_eq!(percent_encode("a b*c~d-e_f.g"), "a%20b%2Ac~d-e_f.g");
        assert_eq!(percent_encode("2016-02-23T12:46:24Z"), "2016-02-23T12%3A46%3A24Z");
        assert_eq!(percent_encode("/"), "%2F");
    }

    #[test]
    fn test_string_to_sign() {
        let params = BTreeMap::from([
            ("Version", "2014-05-26"),
            ("AccessKeyId", "testid"),
            ("Action", "DescribeRegions"),
            ("Timestamp", "2016-02-23T12:46:24Z"),
        ]);

        let canonical = canonicalize(&params);
        assert_eq!(
            canonical,
            "AccessKeyId=testid&Action=DescribeRegions&Timestamp=2016-02-23T12%3A46%3A24Z&Version=2014-05-26"
        );
        assert_eq!(
            string_to_sign("GET", &canonical),
            "GET&%2F&AccessKeyId%3Dtestid%26Action%3DDescribeRegions%26Timestamp%3D2016-02-23T12%253A46%253A24Z%26Version%3D2014-05-26"
        );
    }

    #[test]
    fn test_signature_is_base64_sha1() {
        let signature = sign("testsecret", "GET&%2F&Action%3DDescribeBackups").unwrap();
        assert_eq!(signature.len(), 28);
        assert_eq!(STANDARD.decode(&signature).unwrap().len(), 20);
        assert_ne!(signature, sign("othersecret", "GET&%2F&Action%3DDescribeBackups").unwrap());
    }

    #[test]
    fn test_signature_matches_documented_vector() {
        // DescribeRegions example from the Alibaba Cloud RPC signature documentation
        let params = BTreeMap::from([
            ("AccessKeyId", "testid"),
            ("Action", "DescribeRegions"),
            ("Format", "XML"),
            ("SignatureMethod", "HMAC-SHA1"),
            ("SignatureNonce", "3ee8c1b8-83d3-44af-a94f-4e0ad82fd6cf"),
            ("SignatureVersion", "1.0"),
            ("Timestamp", "2016-02-23T12:46:24Z"),
            ("Version", "2014-05-26"),
        ]);

        let sts = string_to_sign("GET", &canonicalize(&params));
        assert_eq!(
            sts,
            "GET&%2F&AccessKeyId%3Dtestid%26Action%3DDescribeRegions%26Format%3DXML\
             %26SignatureMethod%3DHMAC-SHA1%26SignatureNonce%3D3ee8c1b8-83d3-44af-a94f-4e0ad82fd6cf\
             %26SignatureVersion%3D1.0%26Timestamp%3D2016-02-23T12%253A46%253A24Z\
             %26Version%3D2014-05-26"
        );
        assert_eq!(sign("testsecret", &sts).unwrap(), "OLeaidS1JvxuMvnyHOwuJ+uX5qY=");
    }

    #[test]
    fn test_signed_query_contains_common_parameters() {
        let client = AliyunRdsClient::new(reqwest::Client::new(), "rds.aliyuncs.com", None);
        let at = Utc.with_ymd_and_hms(2024, 3, 20, 10, 0, 0).unwrap();
        let query = client.signed_query(
            &credentials(),
            DESCRIBE_BACKUPS,
            &[("DBInstanceId", "rm-bp1234567890")],
            at,
            "nonce-1",
        )
        .unwrap();

        assert!(query.starts_with("AccessKeyId=testid&Action=DescribeBackups&DBInstanceId=rm-bp1234567890&Format=JSON"));
        assert!(query.contains("SignatureMethod=HMAC-SHA1"));
        assert!(query.contains("SignatureNonce=nonce-1"));
        assert!(query.contains("Timestamp=2024-03-20T10%3A00%3A00Z"));
        assert!(query.contains("Version=2014-08-15"));
        assert!(query.contains("&Signature="));
        assert_eq!(client.endpoint, "https://rds.aliyuncs.com");
    }

    #[test]
    fn test_parse_takes_first_backup() {
        let body = r#"{
            "RequestId": "1A6B0B1E",
            "TotalRecordCount": 2,
            "Items": {"Backup": [
                {"BackupStartTime": "2024-03-20T02:00:00Z",
                 "BackupDownloadURL": "https://public/newest.xb",
                 "BackupIntranetDownloadURL": "https://internal/newest.xb"},
                {"BackupStartTime": "2024-03-19T02:00:00Z",
                 "BackupDownloadURL": "https://public/older.xb",
                 "BackupIntranetDownloadURL": "https://internal/older.xb"}
            ]}
        }"#;

        let record = parse_describe_backups(body).unwrap();
        assert_eq!(record.start_time, "2024-03-20T02:00:00Z");
        assert_eq!(record.download_url, "https://public/newest.xb");
        assert_eq!(record.intranet_download_url, "https://internal/newest.xb");
    }

    #[test]
    fn test_parse_empty_list_is_blank() {
        let body = r#"{"RequestId": "1A6B0B1E", "TotalRecordCount": 0, "Items": {"Backup": []}}"#;
        assert_eq!(parse_describe_backups(body).unwrap(), BackupRecord::default());
    }

    #[test]
    fn test_parse_malformed_body_is_upstream_error() {
        let err = parse_describe_backups("<html>").unwrap_err();
        assert!(matches!(err, BackupError::Upstream { operation: "DescribeBackups", .. }));
    }

    #[test]
    fn test_api_error_message_keeps_vendor_text() {
        let body = r#"{"RequestId":"R1","HostId":"rds.aliyuncs.com","Code":"InvalidDBInstanceId.NotFound","Message":"Specified instance does not exist."}"#;
        let message = api_error_message(reqwest::StatusCode::NOT_FOUND, body);
        assert!(message.contains("Specified instance does not exist."));
        assert!(message.contains("InvalidDBInstanceId.NotFound"));
        assert!(message.contains("404"));
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_latest_backup_over_http() {
        use axum::extract::Query;
        use std::collections::HashMap;

        let router = axum::Router::new().route(
            "/",
            axum::routing::get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params["Action"], "DescribeBackups");
                assert_eq!(params["DBInstanceId"], "rm-bp1234567890");
                assert!(params.contains_key("Signature"));
                r#"{"Items": {"Backup": [{"BackupStartTime": "2024-03-20T02:00:00Z",
                    "BackupDownloadURL": "https://public/newest.xb"}]}}"#
            }),
        );
        let base = serve(router).await;

        let client = AliyunRdsClient::new(reqwest::Client::new(), base, Some(credentials()));
        let record = client.latest_backup("rm-bp1234567890").await.unwrap();
        assert_eq!(record.download_url, "https://public/newest.xb");
        assert_eq!(record.intranet_download_url, "");
    }

    #[tokio::test]
    async fn test_vendor_error_status_is_upstream_error() {
        let router = axum::Router::new().route(
            "/",
            axum::routing::get(|| async {
                (
                    axum::http::StatusCode::FORBIDDEN,
                    r#"{"RequestId":"R1","Code":"Forbidden.RAM","Message":"User not authorized to operate on the specified resource."}"#,
                )
            }),
        );
        let base = serve(router).await;

        let client = AliyunRdsClient::new(reqwest::Client::new(), base, Some(credentials()));
        let err = client.latest_backup("rm-bp1234567890").await.unwrap_err();
        assert!(matches!(err, BackupError::Upstream { operation: "DescribeBackups", .. }));
        assert!(err.to_string().contains("Forbidden.RAM"));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_without_request() {
        let client = AliyunRdsClient::new(reqwest::Client::new(), "http://127.0.0.1:9", None);
        let err = client.latest_backup("rm-bp1234567890").await.unwrap_err();
        assert!(err.to_string().contains("ALIBABA_CLOUD_ACCESS_KEY_ID"));
    }
}
