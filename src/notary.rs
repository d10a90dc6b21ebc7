//! Client-side view of the external notary service.
//!
//! The notary receives a self-contained description of one HTTP request
//! (method, url, folded headers, body, transcript limits) and returns a
//! proof artifact. This module owns that wire format and the trait the
//! scheduler calls through, so tests can swap the HTTP client for a mock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capture::CapturedRequest;
use crate::error::Error;

/// Upper bound on the transcript size a single notarization may cover.
pub const MAX_TRANSCRIPT_SIZE: u64 = 16384;

/// Resolved endpoints and transcript limits for one notarization attempt.
///
/// Read from the settings store at dequeue time so settings changes apply
/// to the next request without a restart.
#[derive(Debug, Clone)]
pub struct NotarySettings {
    pub notary_url: String,
    pub proxy_url: String,
    pub max_sent: u64,
    pub max_recv: u64,
}

/// The self-contained notarization request sent to the notary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotarizeRequest {
    pub url: String,
    pub method: String,
    /// Folded request headers, one value per name.
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub max_sent_data: u64,
    pub max_recv_data: u64,
    pub max_transcript_size: u64,
    pub notary_url: String,
    pub websocket_proxy_url: String,
    /// Header values to redact from the published transcript.
    #[serde(default)]
    pub secret_headers: Vec<String>,
    /// Response substrings to redact from the published transcript.
    #[serde(default)]
    pub secret_resps: Vec<String>,
}

/// The notary's reply for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotarizeResponse {
    /// `"success"` on a completed proof, anything else is a failure.
    pub status: String,
    #[serde(default)]
    pub proof: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NotarizeResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

impl NotarizeRequest {
    /// Builds the notarization payload from a captured request.
    ///
    /// Headers are folded into a single-value map. A `Host` header derived
    /// from the URL is seeded first so a captured `Host` wins if present,
    /// then `Accept-Encoding: identity` and `Connection: close` are forced
    /// so the notarized transcript stays uncompressed and single-use.
    pub fn from_captured(
        captured: &CapturedRequest,
        settings: &NotarySettings,
    ) -> crate::Result<Self> {
        let url = url::Url::parse(&captured.url)?;
        let host = url
            .host_str()
            .ok_or(Error::Generic("captured url has no host"))?;

        let mut headers = BTreeMap::new();
        headers.insert("Host".to_owned(), host.to_owned());
        for header in &captured.request_headers {
            headers.insert(header.name.clone(), header.value.clone());
        }
        headers
            .insert("Accept-Encoding".to_owned(), "identity".to_owned());
        headers.insert("Connection".to_owned(), "close".to_owned());

        Ok(Self {
            url: captured.url.clone(),
            method: captured.method.clone(),
            headers,
            body: captured.request_body.clone(),
            max_sent_data: settings.max_sent,
            max_recv_data: settings.max_recv,
            max_transcript_size: MAX_TRANSCRIPT_SIZE,
            notary_url: settings.notary_url.clone(),
            websocket_proxy_url: settings.proxy_url.clone(),
            secret_headers: Vec::new(),
            secret_resps: Vec::new(),
        })
    }
}

/// Performs notarizations against an external notary.
///
/// The scheduler only ever talks to this trait, which keeps the external
/// call swappable in tests.
#[async_trait::async_trait]
pub trait Notarizer: Send + Sync {
    /// Submit one request for notarization and wait for the outcome.
    async fn notarize(
        &self,
        request: NotarizeRequest,
    ) -> crate::Result<NotarizeResponse>;

    /// Verify a previously produced proof artifact.
    async fn verify(&self, proof: String) -> crate::Result<bool>;
}

/// A [`Notarizer`] backed by the notary's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpNotarizer {
    client: reqwest::Client,
    /// Endpoint used for proof verification; notarizations carry their
    /// own endpoint in the request.
    api: String,
}

impl HttpNotarizer {
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api: api.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notarizer for HttpNotarizer {
    #[tracing::instrument(skip(self, request), fields(url = %request.url))]
    async fn notarize(
        &self,
        request: NotarizeRequest,
    ) -> crate::Result<NotarizeResponse> {
        let endpoint = format!("{}/notarize", request.notary_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&request)
            .send()
            .await?
            .json::<NotarizeResponse>()
            .await?;
        Ok(response)
    }

    async fn verify(&self, proof: String) -> crate::Result<bool> {
        #[derive(Serialize)]
        struct VerifyRequest {
            proof: String,
        }
        #[derive(Deserialize)]
        struct VerifyResponse {
            valid: bool,
        }
        let endpoint = format!("{}/verify", self.api);
        let response = self
            .client
            .post(&endpoint)
            .json(&VerifyRequest { proof })
            .send()
            .await?
            .json::<VerifyResponse>()
            .await?;
        Ok(response.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Header;

    fn settings() -> NotarySettings {
        NotarySettings {
            notary_url: "http://0.0.0.0:7047".into(),
            proxy_url: "wss://notary.pse.dev/proxy".into(),
            max_sent: 4096,
            max_recv: 16384,
        }
    }

    #[test]
    fn folds_headers_and_forces_connection_headers() {
        let captured = CapturedRequest {
            request_id: "r1".into(),
            url: "https://x.com/i/api/1.1/dm/user_updates.json".into(),
            method: "GET".into(),
            request_headers: vec![
                Header::new("Cookie", "auth=1"),
                Header::new("Accept-Encoding", "gzip, br"),
                Header::new("Connection", "keep-alive"),
            ],
            ..Default::default()
        };
        let req =
            NotarizeRequest::from_captured(&captured, &settings()).unwrap();
        assert_eq!(req.headers.get("Host").unwrap(), "x.com");
        assert_eq!(req.headers.get("Cookie").unwrap(), "auth=1");
        // overridden regardless of what the browser sent.
        assert_eq!(req.headers.get("Accept-Encoding").unwrap(), "identity");
        assert_eq!(req.headers.get("Connection").unwrap(), "close");
        assert_eq!(req.max_transcript_size, MAX_TRANSCRIPT_SIZE);
    }

    #[test]
    fn captured_host_header_wins_over_derived() {
        let captured = CapturedRequest {
            request_id: "r1".into(),
            url: "https://x.com/home".into(),
            method: "GET".into(),
            request_headers: vec![Header::new("Host", "api.x.com")],
            ..Default::default()
        };
        let req =
            NotarizeRequest::from_captured(&captured, &settings()).unwrap();
        assert_eq!(req.headers.get("Host").unwrap(), "api.x.com");
    }

    #[test]
    fn rejects_url_without_host() {
        let captured = CapturedRequest {
            request_id: "r1".into(),
            url: "data:text/plain,hello".into(),
            method: "GET".into(),
            ..Default::default()
        };
        assert!(
            NotarizeRequest::from_captured(&captured, &settings()).is_err()
        );
    }
}
