//! HTTP access to the peer service that owns assets, components, repairs and products.
//!
//! Every call carries the configured timeout and is attempted exactly once; a slow or
//! unreachable peer surfaces as a [`PeerError`] that the probe turns into a fail-closed
//! verification failure.

use common::config::PeerConfig;
use common::model::ContextEntityType;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("could not reach {url}: {message}")]
    Connect { url: String, message: String },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("unusable response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("invalid peer URL: {0}")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl PeerError {
    /// Whether the failure leaves the peer's answer unknown, as opposed to a local
    /// misconfiguration.
    pub fn is_verification_failure(&self) -> bool {
        !matches!(self, PeerError::InvalidUrl(_) | PeerError::Client(_))
    }

    fn from_reqwest(url: &Url, err: reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            PeerError::Timeout { url }
        } else if err.is_decode() {
            PeerError::Decode {
                url,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            PeerError::Status {
                url,
                status: status.as_u16(),
            }
        } else {
            PeerError::Connect {
                url,
                message: err.to_string(),
            }
        }
    }
}

/// One page of a filtered list query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    /// Total matching records according to the envelope, when it carries one.
    pub count: Option<u64>,
    pub results: Vec<Value>,
}

impl ListPage {
    /// Accepts `{count, results}`, `{results}` or a bare array.
    pub fn from_envelope(body: Value) -> Result<Self, String> {
        match body {
            Value::Array(results) => Ok(Self {
                count: None,
                results,
            }),
            Value::Object(mut map) => {
                let count = match map.get("count") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(value.as_u64().ok_or_else(|| {
                        format!("`count` is not a non-negative integer: {value}")
                    })?),
                };
                let results = match map.remove("results") {
                    Some(Value::Array(results)) => results,
                    None | Some(Value::Null) if count.is_some() => Vec::new(),
                    None | Some(Value::Null) => {
                        return Err("envelope has neither `count` nor `results`".to_string());
                    }
                    Some(other) => return Err(format!("`results` is not an array: {other}")),
                };
                Ok(Self { count, results })
            }
            other => Err(format!("expected a JSON object or array, got {other}")),
        }
    }

    /// Authoritative total when present, otherwise the number of returned items.
    pub fn total(&self) -> u64 {
        self.count.unwrap_or(self.results.len() as u64)
    }

    /// Whether records beyond this page exist or may exist.
    pub fn is_truncated(&self, page_size: usize) -> bool {
        match self.count {
            Some(count) => count > self.results.len() as u64,
            None => self.results.len() >= page_size,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerClient {
    http: reqwest::Client,
    base_url: Url,
}

impl PeerClient {
    pub fn new(config: &PeerConfig) -> Result<Self, PeerError> {
        let base_url = Url::parse(&config.assets_url)
            .map_err(|e| PeerError::InvalidUrl(format!("{}: {e}", config.assets_url)))?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| PeerError::Client(e.to_string()))?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve `path` below the base URL, keeping any prefix such as `/api/v1`.
    fn url(&self, path: &str) -> Result<Url, PeerError> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| PeerError::InvalidUrl(format!("{joined}: {e}")))
    }

    /// GET returning the JSON body, or `None` on 404.
    async fn get_json(
        &self,
        url: &Url,
        query: &[(&str, String)],
    ) -> Result<Option<Value>, PeerError> {
        let response = self
            .http
            .get(url.clone())
            .query(query)
            .send()
            .await
            .map_err(|e| PeerError::from_reqwest(url, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(PeerError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| PeerError::from_reqwest(url, e))?;
        Ok(Some(body))
    }

    /// Filtered list query with a bounded page size.
    pub async fn list(
        &self,
        path: &str,
        filter: (&str, i64),
        page_size: usize,
    ) -> Result<ListPage, PeerError> {
        let (attribute, value) = filter;
        let query = [
            (attribute, value.to_string()),
            ("limit", page_size.to_string()),
        ];
        self.fetch_page(path, &query).await
    }

    /// Like [`PeerClient::list`], starting `offset` records into the result set.
    pub async fn list_from(
        &self,
        path: &str,
        filter: (&str, i64),
        page_size: usize,
        offset: usize,
    ) -> Result<ListPage, PeerError> {
        let (attribute, value) = filter;
        let query = [
            (attribute, value.to_string()),
            ("limit", page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        self.fetch_page(path, &query).await
    }

    async fn fetch_page(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<ListPage, PeerError> {
        let url = self.url(path)?;
        log::debug!("Listing {url} with {query:?}");

        match self.get_json(&url, query).await? {
            Some(body) => ListPage::from_envelope(body).map_err(|message| PeerError::Decode {
                url: url.to_string(),
                message,
            }),
            // A list endpoint that does not exist cannot answer the question
            None => Err(PeerError::Status {
                url: url.to_string(),
                status: StatusCode::NOT_FOUND.as_u16(),
            }),
        }
    }

    /// Detail lookup; `None` when the record does not exist.
    pub async fn get_detail(&self, path: &str) -> Result<Option<Value>, PeerError> {
        let url = self.url(path)?;
        self.get_json(&url, &[]).await
    }

    /// Ask the peer's dedicated usage endpoint. `None` when the endpoint is absent.
    pub async fn check_usage(
        &self,
        entity_type: ContextEntityType,
        id: i64,
    ) -> Result<Option<bool>, PeerError> {
        let url = self.url(&format!("/usage/{}/{id}/", entity_type.as_str()))?;
        let body = match self.get_json(&url, &[]).await {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(None),
            Err(PeerError::Status { status: 405, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        body.get("in_use")
            .and_then(Value::as_bool)
            .map(Some)
            .ok_or_else(|| PeerError::Decode {
                url: url.to_string(),
                message: "missing boolean `in_use`".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;
    use std::time::Duration;

    fn client_for(url: &str, timeout: Duration) -> PeerClient {
        PeerClient::new(&PeerConfig {
            assets_url: url.to_string(),
            timeout,
            connect_timeout: Duration::from_millis(200),
        })
        .unwrap()
    }

    #[test]
    fn test_envelope_with_count() {
        let page = ListPage::from_envelope(json!({"count": 12, "results": [{"id": 1}]})).unwrap();
        assert_eq!(page.count, Some(12));
        assert_eq!(page.total(), 12);
        assert!(page.is_truncated(1));
    }

    #[test]
    fn test_envelope_without_count_falls_back_to_items() {
        let page = ListPage::from_envelope(json!({"results": [{"id": 1}, {"id": 2}]})).unwrap();
        assert_eq!(page.count, None);
        assert_eq!(page.total(), 2);
        assert!(!page.is_truncated(5));
        assert!(page.is_truncated(2));

        let page = ListPage::from_envelope(json!([{"id": 1}])).unwrap();
        assert_eq!(page.total(), 1);
    }

    #[test]
    fn test_count_only_envelope() {
        let page = ListPage::from_envelope(json!({"count": 3})).unwrap();
        assert_eq!(page.total(), 3);
        assert!(page.results.is_empty());
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(ListPage::from_envelope(json!({"detail": "nope"})).is_err());
        assert!(ListPage::from_envelope(json!({"count": -1, "results": []})).is_err());
        assert!(ListPage::from_envelope(json!({"results": "x"})).is_err());
        assert!(ListPage::from_envelope(json!("text")).is_err());
    }

    #[test]
    fn test_url_keeps_base_path() {
        let client = client_for("http://peer.local/api/v1/", Duration::from_secs(1));
        assert_eq!(
            client.url("/assets/").unwrap().as_str(),
            "http://peer.local/api/v1/assets/"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = PeerClient::new(&PeerConfig {
            assets_url: "::".to_string(),
            ..PeerConfig::default()
        })
        .unwrap_err();
        assert!(!err.is_verification_failure());
    }

    #[tokio::test]
    async fn test_list_sends_filter_and_page_size() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/assets/")
                    .query_param("category", "7")
                    .query_param("limit", "5");
                then.status(200)
                    .json_body(json!({"count": 1, "results": [{"id": 3}]}));
            })
            .await;

        let client = client_for(&server.base_url(), Duration::from_secs(2));
        let page = client.list("/assets/", ("category", 7), 5).await.unwrap();

        mock.assert_async().await;
        assert_eq!(page.total(), 1);
    }

    #[tokio::test]
    async fn test_list_from_sends_offset() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/products/")
                    .query_param("manufacturer", "7")
                    .query_param("limit", "100")
                    .query_param("offset", "200");
                then.status(200)
                    .json_body(json!({"count": 201, "results": [{"id": 9}]}));
            })
            .await;

        let client = client_for(&server.base_url(), Duration::from_secs(2));
        let page = client
            .list_from("/products/", ("manufacturer", 7), 100, 200)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.total(), 201);
    }

    #[tokio::test]
    async fn test_timeout_is_a_verification_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/assets/");
                then.status(200)
                    .json_body(json!({"count": 0, "results": []}))
                    .delay(Duration::from_secs(2));
            })
            .await;

        let client = client_for(&server.base_url(), Duration::from_millis(150));
        let err = client
            .list("/assets/", ("category", 7), 5)
            .await
            .unwrap_err();

        assert!(matches!(err, PeerError::Timeout { .. }), "{err:?}");
        assert!(err.is_verification_failure());
    }

    #[tokio::test]
    async fn test_server_error_and_bad_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/components/");
                then.status(502);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repairs/");
                then.status(200).body("<html>maintenance</html>");
            })
            .await;

        let client = client_for(&server.base_url(), Duration::from_secs(2));

        let err = client
            .list("/components/", ("supplier", 1), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Status { status: 502, .. }));

        let err = client
            .list("/repairs/", ("supplier", 1), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Decode { .. }), "{err:?}");
        assert!(err.is_verification_failure());
    }

    #[tokio::test]
    async fn test_detail_not_found_is_none() {
        let server = MockServer::start_async().await;
        let client = client_for(&server.base_url(), Duration::from_secs(2));
        assert_eq!(client.get_detail("/products/50/").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_check_usage_endpoint() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/usage/supplier/12/");
                then.status(200).json_body(json!({"in_use": false}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/usage/supplier/13/");
                then.status(405);
            })
            .await;

        let client = client_for(&server.base_url(), Duration::from_secs(2));
        assert_eq!(
            client
                .check_usage(ContextEntityType::Supplier, 12)
                .await
                .unwrap(),
            Some(false)
        );
        assert_eq!(
            client
                .check_usage(ContextEntityType::Supplier, 13)
                .await
                .unwrap(),
            None
        );
        // No mock at all: endpoint absent
        assert_eq!(
            client
                .check_usage(ContextEntityType::Supplier, 14)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Port 9 (discard) is not served locally
        let client = client_for("http://127.0.0.1:9", Duration::from_millis(300));
        let err = client
            .list("/assets/", ("status", 1), 5)
            .await
            .unwrap_err();
        assert!(err.is_verification_failure());
    }
}
