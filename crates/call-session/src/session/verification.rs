//! In-call biometric verification.
//!
//! The decision itself belongs to an external [`VerificationOracle`]. The
//! session keeps one [`VerificationRecord`] per kind for the lifetime of the
//! call; records are advisory and never affect media.

use crate::errors::VerificationError;
use crate::media::ImageCapture;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Request timeout of the HTTP oracle.
const ORACLE_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiometricKind {
    Face,
    Fingerprint,
}

impl BiometricKind {
    pub const ALL: [BiometricKind; 2] = [BiometricKind::Face, BiometricKind::Fingerprint];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BiometricKind::Face => "face",
            BiometricKind::Fingerprint => "fingerprint",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "face" => Some(BiometricKind::Face),
            "fingerprint" => Some(BiometricKind::Fingerprint),
            _ => None,
        }
    }
}

impl fmt::Display for BiometricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub kind: BiometricKind,
    pub verified: bool,
    pub timestamp: DateTime<Utc>,
}

/// Latest record per kind, reset when the call ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationRecords {
    face: Option<VerificationRecord>,
    fingerprint: Option<VerificationRecord>,
}

impl VerificationRecords {
    #[must_use]
    pub fn get(&self, kind: BiometricKind) -> Option<&VerificationRecord> {
        match kind {
            BiometricKind::Face => self.face.as_ref(),
            BiometricKind::Fingerprint => self.fingerprint.as_ref(),
        }
    }

    /// Store `record`, replacing any earlier one of the same kind.
    pub fn record(&mut self, record: VerificationRecord) {
        match record.kind {
            BiometricKind::Face => self.face = Some(record),
            BiometricKind::Fingerprint => self.fingerprint = Some(record),
        }
    }

    pub fn reset(&mut self) {
        self.face = None;
        self.fingerprint = None;
    }

    #[must_use]
    pub fn all(&self) -> Vec<VerificationRecord> {
        BiometricKind::ALL
            .iter()
            .filter_map(|kind| self.get(*kind).cloned())
            .collect()
    }
}

/// External decision function: does this capture pass for `kind`?
#[async_trait]
pub trait VerificationOracle: Send + Sync + 'static {
    async fn verify(
        &self,
        kind: BiometricKind,
        capture: &ImageCapture,
    ) -> Result<bool, VerificationError>;
}

/// Oracle used when no verification service is configured. Every request
/// fails, so no record is ever written.
#[derive(Debug, Default, Clone)]
pub struct UnavailableOracle;

#[async_trait]
impl VerificationOracle for UnavailableOracle {
    async fn verify(
        &self,
        _kind: BiometricKind,
        _capture: &ImageCapture,
    ) -> Result<bool, VerificationError> {
        Err(VerificationError::Oracle(
            "no verification service configured".to_string(),
        ))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    kind: BiometricKind,
    /// Base64 of the encoded frame.
    image: String,
    mime_type: &'a str,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    verified: bool,
}

/// Oracle behind an HTTP endpoint: `POST {endpoint}` with the capture,
/// answered by `{"verified": bool}`.
#[derive(Debug, Clone)]
pub struct HttpVerificationOracle {
    client: Client,
    endpoint: String,
}

impl HttpVerificationOracle {
    /// # Errors
    ///
    /// Returns `VerificationError::Oracle` if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, VerificationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(ORACLE_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| VerificationError::Oracle(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl VerificationOracle for HttpVerificationOracle {
    #[instrument(skip_all, name = "cs.verify.http", fields(kind = %kind))]
    async fn verify(
        &self,
        kind: BiometricKind,
        capture: &ImageCapture,
    ) -> Result<bool, VerificationError> {
        let request = VerifyRequest {
            kind,
            image: STANDARD.encode(&capture.data),
            mime_type: &capture.mime_type,
            width: capture.width,
            height: capture.height,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "cs.verify", error = %e, "Verification request failed");
                VerificationError::Oracle("verification service unreachable".to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(target: "cs.verify", status = %status, "Verification service returned error");
            return Err(VerificationError::Oracle(format!(
                "verification service returned {status}"
            )));
        }

        let body: VerifyResponse = response.json().await.map_err(|e| {
            warn!(target: "cs.verify", error = %e, "Failed to parse verification response");
            VerificationError::Oracle("malformed verification response".to_string())
        })?;

        debug!(target: "cs.verify", verified = body.verified, "Verification answered");
        Ok(body.verified)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn capture() -> ImageCapture {
        ImageCapture::from_vp8(Bytes::from_static(&[
            0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x80, 0x02, 0xe0, 0x01,
        ]))
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(BiometricKind::from_name("Face"), Some(BiometricKind::Face));
        assert_eq!(
            BiometricKind::from_name("fingerprint"),
            Some(BiometricKind::Fingerprint)
        );
        assert_eq!(BiometricKind::from_name("iris"), None);
        assert_eq!(
            serde_json::to_value(BiometricKind::Fingerprint).unwrap(),
            json!("fingerprint")
        );
    }

    #[test]
    fn test_records_replace_and_reset() {
        let mut records = VerificationRecords::default();
        assert!(records.all().is_empty());

        records.record(VerificationRecord {
            kind: BiometricKind::Face,
            verified: false,
            timestamp: Utc::now(),
        });
        records.record(VerificationRecord {
            kind: BiometricKind::Face,
            verified: true,
            timestamp: Utc::now(),
        });

        assert!(records.get(BiometricKind::Face).unwrap().verified);
        assert!(records.get(BiometricKind::Fingerprint).is_none());
        assert_eq!(records.all().len(), 1);

        records.reset();
        assert_eq!(records, VerificationRecords::default());
    }

    #[tokio::test]
    async fn test_http_oracle_posts_capture() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(body_partial_json(json!({
                "kind": "face",
                "mimeType": "video/VP8",
                "width": 640,
                "height": 480
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"verified": true})))
            .expect(1)
            .mount(&server)
            .await;

        let oracle = HttpVerificationOracle::new(format!("{}/verify", server.uri())).unwrap();

        assert!(oracle.verify(BiometricKind::Face, &capture()).await.unwrap());
    }

    #[tokio::test]
    async fn test_http_oracle_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"verified": false})))
            .mount(&server)
            .await;

        let oracle = HttpVerificationOracle::new(server.uri()).unwrap();

        assert!(!oracle
            .verify(BiometricKind::Fingerprint, &capture())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_http_oracle_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let oracle = HttpVerificationOracle::new(server.uri()).unwrap();

        assert!(matches!(
            oracle.verify(BiometricKind::Face, &capture()).await,
            Err(VerificationError::Oracle(_))
        ));
    }

    #[tokio::test]
    async fn test_http_oracle_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("yes"))
            .mount(&server)
            .await;

        let oracle = HttpVerificationOracle::new(server.uri()).unwrap();

        assert!(oracle.verify(BiometricKind::Face, &capture()).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_oracle_always_errors() {
        assert!(UnavailableOracle
            .verify(BiometricKind::Face, &capture())
            .await
            .is_err());
    }
}
