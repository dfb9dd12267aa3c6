//! HTTP client for the collection API consumed by the sync engine.
//!
//! Implements [`SyncApi`] over the REST endpoints for headers, diffs, mutations and
//! detail manifests.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use cadence_core::api::{DiffQuery, SyncApi};
use cadence_core::entity::{EntityKey, EntityRecord};
use cadence_core::sync::{
    CollectionHeader, ConflictRecord, DiffResponse, EntityManifest, PatchOutcome, PatchRequest,
    ProbeOutcome,
};

use crate::error::{Result, SyncClientError};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

const API_URL_ENV: &str = "CADENCE_API_URL";
const API_TOKEN_ENV: &str = "CADENCE_API_TOKEN";

const TOTAL_COUNT_HEADER: &str = "x-total-count";
const LAST_EVENT_ID_HEADER: &str = "x-last-event-id";
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    code: String,
    message: String,
}

/// Conflict body returned with `409 Conflict` on PATCH.
#[derive(Debug, Deserialize)]
struct ConflictResponse {
    local_version: EntityRecord,
    server_version: EntityRecord,
    #[serde(default)]
    conflicting_fields: Vec<String>,
    #[serde(default)]
    event_type: String,
}

/// Client for the collection sync API.
#[derive(Debug, Clone)]
pub struct SyncApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl SyncApiClient {
    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            debug!("[SyncApi] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[SyncApi] Response error ({}): {}", status, preview);
    }

    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the API (e.g., "https://api.example.com")
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Create a client from `CADENCE_API_URL` and the optional `CADENCE_API_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var(API_URL_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                SyncClientError::invalid_request(format!(
                    "{} not configured. Sync API operations are disabled.",
                    API_URL_ENV
                ))
            })?;
        let client = Self::new(&base_url)?;
        Ok(match std::env::var(API_TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => client.with_token(token.trim()),
            _ => client,
        })
    }

    /// Attach a bearer token to every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create headers for an API request.
    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &self.token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| SyncClientError::auth("Invalid access token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        Ok(headers)
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/api/v1/{}",
            self.base_url,
            urlencoding::encode(collection)
        )
    }

    fn entity_url(&self, key: &EntityKey) -> String {
        format!(
            "{}/{}",
            self.collection_url(key.kind.collection()),
            urlencoding::encode(&key.id)
        )
    }

    fn error_from_body(status: StatusCode, body: &str) -> SyncClientError {
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
            return SyncClientError::api(
                status.as_u16(),
                format!("{}: {}", error.code, error.message),
            );
        }
        SyncClientError::api(status.as_u16(), format!("Request failed: {}", body))
    }

    /// Parse a JSON response body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(Self::error_from_body(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "[SyncApi] Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            SyncClientError::Json(e)
        })
    }

    fn parse_header_u64(headers: &HeaderMap, name: &'static str) -> Result<u64> {
        match headers.get(name) {
            None => Ok(0),
            Some(value) => value
                .to_str()
                .map_err(|_| SyncClientError::invalid_request(format!("Invalid header {}", name)))?
                .trim()
                .parse::<u64>()
                .map_err(|_| SyncClientError::invalid_request(format!("Invalid header {}", name))),
        }
    }

    fn parse_etag(headers: &HeaderMap) -> Option<String> {
        headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Collection headers
    // ─────────────────────────────────────────────────────────────────────────

    /// GET /api/v1/{collection}/header
    pub async fn get_header(&self, collection: &str) -> Result<CollectionHeader> {
        let url = format!("{}/header", self.collection_url(collection));

        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Conditional freshness probe.
    ///
    /// HEAD /api/v1/{collection}/header with `If-None-Match`
    pub async fn head_header(
        &self,
        collection: &str,
        etag: Option<&str>,
    ) -> Result<ProbeOutcome> {
        let url = format!("{}/header", self.collection_url(collection));
        let mut headers = self.headers()?;
        if let Some(etag) = etag {
            let value = HeaderValue::from_str(etag)
                .map_err(|_| SyncClientError::invalid_request("Invalid etag format"))?;
            headers.insert(IF_NONE_MATCH, value);
        }

        let response = self.client.head(&url).headers(headers).send().await?;
        let status = response.status();
        Self::log_response(status, "");

        if status == StatusCode::NOT_MODIFIED {
            return Ok(ProbeOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(SyncClientError::api(
                status.as_u16(),
                format!("Header probe failed for {}", collection),
            ));
        }

        let headers = response.headers();
        Ok(ProbeOutcome::Modified(CollectionHeader {
            total: Self::parse_header_u64(headers, TOTAL_COUNT_HEADER)?,
            etag: Self::parse_etag(headers),
            last_event_id: Self::parse_header_u64(headers, LAST_EVENT_ID_HEADER)?,
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Diffs and mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// GET /api/v1/{collection}/diff?cursor&last_event_id&range&sort&archived
    pub async fn get_diff(&self, collection: &str, query: &DiffQuery) -> Result<DiffResponse> {
        let url = format!("{}/diff", self.collection_url(collection));
        let mut params: Vec<(&str, String)> =
            vec![("last_event_id", query.last_event_id.to_string())];
        if let Some(cursor) = &query.cursor {
            params.push(("cursor", cursor.clone()));
        }
        if let Some(filter) = &query.filter {
            params.extend(filter.query_params());
        }

        debug!(
            "[SyncApi] get_diff collection={} last_event_id={} cursor={:?}",
            collection, query.last_event_id, query.cursor
        );

        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .query(&params)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Send one mutation. A `409 Conflict` is returned as [`PatchOutcome::Conflict`].
    ///
    /// PATCH /api/v1/{collection}/{id}
    pub async fn patch(&self, key: &EntityKey, request: &PatchRequest) -> Result<PatchOutcome> {
        let url = self.entity_url(key);
        let mut headers = self.headers()?;
        let token_value = HeaderValue::from_str(&request.idempotency_token)
            .map_err(|_| SyncClientError::invalid_request("Invalid idempotency token"))?;
        headers.insert(IDEMPOTENCY_KEY_HEADER, token_value);

        let response = self
            .client
            .patch(&url)
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if status == StatusCode::CONFLICT {
            let conflict: ConflictResponse = serde_json::from_str(&body)?;
            return Ok(PatchOutcome::Conflict(ConflictRecord {
                entity_key: key.clone(),
                local_version: conflict.local_version,
                server_version: conflict.server_version,
                conflicting_fields: conflict.conflicting_fields,
                event_type: conflict.event_type,
            }));
        }
        if !status.is_success() {
            return Err(Self::error_from_body(status, &body));
        }

        if body.trim().is_empty() {
            return Ok(PatchOutcome::Applied(None));
        }
        match serde_json::from_str::<EntityRecord>(&body) {
            Ok(entity) => Ok(PatchOutcome::Applied(Some(entity))),
            Err(err) => {
                debug!(
                    "[SyncApi] PATCH {} accepted without entity body: {}",
                    key, err
                );
                Ok(PatchOutcome::Applied(None))
            }
        }
    }

    /// GET /api/v1/{collection}/{id}/manifest
    pub async fn get_manifest(&self, key: &EntityKey) -> Result<EntityManifest> {
        let url = format!("{}/manifest", self.entity_url(key));

        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

#[async_trait]
impl SyncApi for SyncApiClient {
    async fn fetch_header(&self, collection: &str) -> cadence_core::Result<CollectionHeader> {
        Ok(self.get_header(collection).await?)
    }

    async fn probe_header(
        &self,
        collection: &str,
        etag: Option<&str>,
    ) -> cadence_core::Result<ProbeOutcome> {
        Ok(self.head_header(collection, etag).await?)
    }

    async fn fetch_diff(
        &self,
        collection: &str,
        query: &DiffQuery,
    ) -> cadence_core::Result<DiffResponse> {
        Ok(self.get_diff(collection, query).await?)
    }

    async fn patch_entity(
        &self,
        key: &EntityKey,
        request: &PatchRequest,
    ) -> cadence_core::Result<PatchOutcome> {
        Ok(self.patch(key, request).await?)
    }

    async fn fetch_manifest(&self, key: &EntityKey) -> cadence_core::Result<EntityManifest> {
        Ok(self.get_manifest(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::sync::{MutationKind, RetryClass};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: String,
    }

    #[derive(Debug, Clone)]
    struct MockResponse {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
    }

    impl MockResponse {
        fn json(status: u16, body: &str) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            }
        }
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next()?.to_string();
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Some(CapturedRequest {
            method,
            path,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            204 => "No Content",
            304 => "Not Modified",
            409 => "Conflict",
            422 => "Unprocessable Entity",
            503 => "Service Unavailable",
            _ => "Error",
        }
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        method: &str,
        response: &MockResponse,
    ) -> std::io::Result<()> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nConnection: close\r\n",
            response.status,
            status_text(response.status)
        );
        for (name, value) in &response.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        let body = if method == "HEAD" || response.status == 304 {
            ""
        } else {
            response.body.as_str()
        };
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body.as_bytes()).await?;
        stream.flush().await
    }

    async fn start_mock_server(
        responses: Vec<MockResponse>,
    ) -> (
        String,
        Arc<TokioMutex<Vec<CapturedRequest>>>,
        tokio::task::JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let captured = Arc::new(TokioMutex::new(Vec::<CapturedRequest>::new()));
        let scripted = Arc::new(TokioMutex::new(VecDeque::from(responses)));
        let captured_clone = Arc::clone(&captured);

        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(value) => value,
                    Err(_) => break,
                };
                let captured_inner = Arc::clone(&captured_clone);
                let scripted_inner = Arc::clone(&scripted);
                tokio::spawn(async move {
                    let Some(request) = read_http_request(&mut stream).await else {
                        return;
                    };
                    let method = request.method.clone();
                    captured_inner.lock().await.push(request);
                    let response = scripted_inner
                        .lock()
                        .await
                        .pop_front()
                        .unwrap_or_else(|| MockResponse::json(500, "{}"));
                    let _ = write_http_response(&mut stream, &method, &response).await;
                });
            }
        });

        (format!("http://{}", addr), captured, handle)
    }

    fn entity_json(id: &str, etag: &str) -> String {
        format!(
            r#"{{"kind":"task","id":"{}","status":"scheduled","priority":1,"etag":"{}","fields":{{"labels":["x"]}}}}"#,
            id, etag
        )
    }

    #[tokio::test]
    async fn head_probe_returns_not_modified_and_sends_etag() {
        let (base_url, captured, server) = start_mock_server(vec![MockResponse::json(304, "")]).await;
        let client = SyncApiClient::new(&base_url).expect("client");

        let outcome = client
            .head_header("sessions", Some("\"A\""))
            .await
            .expect("probe");

        assert_eq!(outcome, ProbeOutcome::NotModified);
        let requests = captured.lock().await.clone();
        assert_eq!(requests[0].method, "HEAD");
        assert_eq!(requests[0].path, "/api/v1/sessions/header");
        assert_eq!(
            requests[0].headers.get("if-none-match").map(String::as_str),
            Some("\"A\"")
        );
        server.abort();
    }

    #[tokio::test]
    async fn head_probe_parses_changed_header() {
        let (base_url, _captured, server) = start_mock_server(vec![MockResponse {
            status: 200,
            headers: vec![
                ("ETag", "\"B\"".to_string()),
                ("X-Total-Count", "17".to_string()),
                ("X-Last-Event-Id", "905".to_string()),
            ],
            body: String::new(),
        }])
        .await;
        let client = SyncApiClient::new(&base_url).expect("client");

        let outcome = client
            .head_header("sessions", Some("\"A\""))
            .await
            .expect("probe");

        assert_eq!(
            outcome,
            ProbeOutcome::Modified(CollectionHeader {
                total: 17,
                etag: Some("\"B\"".to_string()),
                last_event_id: 905,
            })
        );
        server.abort();
    }

    #[tokio::test]
    async fn diff_request_carries_cursor_and_filter() {
        let body = format!(
            r#"{{"upserts":[{}],"deletes":[{{"kind":"task","id":"t-2"}}],"cursor":"c-9","last_event_id":44,"etag":"E"}}"#,
            entity_json("t-1", "v3")
        );
        let (base_url, captured, server) =
            start_mock_server(vec![MockResponse::json(200, &body)]).await;
        let client = SyncApiClient::new(&base_url)
            .expect("client")
            .with_token("secret");

        let query = DiffQuery {
            cursor: Some("c-8".to_string()),
            last_event_id: 40,
            filter: Some(Default::default()),
        };
        let diff = client.get_diff("tasks", &query).await.expect("diff");

        assert_eq!(diff.upserts.len(), 1);
        assert_eq!(diff.deletes, vec![EntityKey::task("t-2")]);
        assert_eq!(diff.last_event_id, 44);
        let requests = captured.lock().await.clone();
        assert!(requests[0].path.starts_with("/api/v1/tasks/diff?"));
        assert!(requests[0].path.contains("last_event_id=40"));
        assert!(requests[0].path.contains("cursor=c-8"));
        assert!(requests[0].path.contains("range=all"));
        assert_eq!(
            requests[0].headers.get("authorization").map(String::as_str),
            Some("Bearer secret")
        );
        server.abort();
    }

    #[tokio::test]
    async fn patch_sends_idempotency_token_and_maps_conflict() {
        let conflict_body = format!(
            r#"{{"local_version":{},"server_version":{},"conflicting_fields":["labels"],"event_type":"task.updated"}}"#,
            entity_json("t-1", "v1"),
            entity_json("t-1", "v2")
        );
        let (base_url, captured, server) =
            start_mock_server(vec![MockResponse::json(409, &conflict_body)]).await;
        let client = SyncApiClient::new(&base_url).expect("client");

        let request = PatchRequest {
            action: MutationKind::Update,
            payload: serde_json::json!({ "labels": ["y"] }),
            idempotency_token: "tok-1".to_string(),
        };
        let outcome = client
            .patch(&EntityKey::task("t-1"), &request)
            .await
            .expect("patch");

        match outcome {
            PatchOutcome::Conflict(conflict) => {
                assert_eq!(conflict.entity_key, EntityKey::task("t-1"));
                assert_eq!(conflict.conflicting_fields, vec!["labels".to_string()]);
                assert_eq!(conflict.server_version.etag.as_deref(), Some("v2"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        let requests = captured.lock().await.clone();
        assert_eq!(requests[0].method, "PATCH");
        assert_eq!(
            requests[0].headers.get("idempotency-key").map(String::as_str),
            Some("tok-1")
        );
        let sent: serde_json::Value = serde_json::from_str(&requests[0].body).expect("body");
        assert_eq!(sent["idempotency_token"], "tok-1");
        assert_eq!(sent["action"], "update");
        server.abort();
    }

    #[tokio::test]
    async fn patch_accepts_empty_success_body() {
        let (base_url, _captured, server) =
            start_mock_server(vec![MockResponse::json(204, "")]).await;
        let client = SyncApiClient::new(&base_url).expect("client");
        let request = PatchRequest {
            action: MutationKind::Delete,
            payload: serde_json::Value::Null,
            idempotency_token: "tok-2".to_string(),
        };

        let outcome = client
            .patch(&EntityKey::session("s-1"), &request)
            .await
            .expect("patch");
        assert_eq!(outcome, PatchOutcome::Applied(None));
        server.abort();
    }

    #[tokio::test]
    async fn api_errors_keep_retry_classification() {
        let (base_url, _captured, server) = start_mock_server(vec![
            MockResponse::json(503, r#"{"code":"UNAVAILABLE","message":"maintenance"}"#),
            MockResponse::json(422, r#"{"code":"INVALID","message":"bad field"}"#),
        ])
        .await;
        let client = SyncApiClient::new(&base_url).expect("client");

        let first = client.get_header("tasks").await.unwrap_err();
        assert_eq!(first.retry_class(), RetryClass::Retryable);
        assert!(first.to_string().contains("UNAVAILABLE: maintenance"));

        let second = client
            .get_manifest(&EntityKey::task("t-1"))
            .await
            .unwrap_err();
        assert_eq!(second.retry_class(), RetryClass::Permanent);
        server.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_connectivity_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = SyncApiClient::new(&format!("http://{}", addr)).expect("client");
        let err: cadence_core::Error = client.get_header("tasks").await.unwrap_err().into();
        assert!(err.is_connectivity());
    }
}
