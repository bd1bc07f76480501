//! REST client for the school backend

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    Acknowledgement, ApiError, BackendApi, ChangesRequest, CredentialStore, MutationRequest, Page,
    SnapshotRequest,
};
use crate::models::ServerRecord;

/// Uniform response envelope
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    pagination: Option<Pagination>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sync_token: Option<String>,
    #[serde(default)]
    server_time: Option<DateTime<Utc>>,
}

impl Envelope {
    fn is_success(&self) -> bool {
        self.success == Some(true)
            || self
                .status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("success"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default = "first_page")]
    page: u32,
    #[serde(default)]
    total_pages: Option<u32>,
}

fn first_page() -> u32 {
    1
}

/// HTTP implementation of [`BackendApi`]
pub struct HttpBackend {
    base_url: String,
    client: Client,
    credentials: Arc<dyn CredentialStore>,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialStore>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Envelope, ApiError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        read_envelope(response).await
    }

    fn transport_error(&self, error: reqwest::Error) -> ApiError {
        if error.is_timeout() {
            ApiError::Timeout(self.timeout)
        } else if error.is_decode() {
            ApiError::Decode(error.to_string())
        } else {
            ApiError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_snapshot_page(
        &self,
        request: &SnapshotRequest,
    ) -> Result<Page<ServerRecord>, ApiError> {
        let (scope_key, scope_id) = request.scope.query_pair();
        debug!(
            "GET {} {}={} page={}",
            request.entity_type, scope_key, scope_id, request.page
        );

        let builder = self.client.get(self.url(request.entity_type.as_str())).query(&[
            (scope_key, scope_id.to_string()),
            ("page", request.page.to_string()),
            ("limit", request.limit.to_string()),
        ]);

        let envelope = self.send(builder).await?;
        page_from_envelope(envelope, request.page)
    }

    async fn fetch_changes_page(
        &self,
        request: &ChangesRequest,
    ) -> Result<Page<ServerRecord>, ApiError> {
        let mut query = vec![
            ("page", request.page.to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(since) = request.since {
            query.push(("since", since.to_rfc3339()));
        }
        if let Some(ref token) = request.token {
            query.push(("token", token.clone()));
        }
        debug!("GET changes for {} page={}", request.entity_type, request.page);

        let path = format!("sync/{}/changes", request.entity_type);
        let builder = self.client.get(self.url(&path)).query(&query);

        let envelope = self.send(builder).await?;
        page_from_envelope(envelope, request.page)
    }

    async fn push_mutation(
        &self,
        request: &MutationRequest,
    ) -> Result<Acknowledgement, ApiError> {
        debug!(
            "POST mutation {} {} {}/{}",
            request.mutation_id, request.operation, request.entity_type, request.entity_id
        );

        let builder = self
            .client
            .post(self.url("sync/mutations"))
            .header("Idempotency-Key", request.mutation_id.to_string())
            .json(request);

        let envelope = self.send(builder).await?;
        match envelope.data {
            Some(Value::Null) | None => Ok(Acknowledgement::default()),
            Some(data) => {
                serde_json::from_value(data).map_err(|e| ApiError::Decode(e.to_string()))
            }
        }
    }

    async fn health(&self) -> Result<(), ApiError> {
        let response = self
            .authorize(self.client.get(self.url("health")))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::from_status(status.as_u16(), status.to_string()))
        }
    }
}

/// Turn an HTTP response into an envelope, classifying failures
async fn read_envelope(response: Response) -> Result<Envelope, ApiError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))?;

    parse_envelope(status.as_u16(), &body)
}

fn parse_envelope(status: u16, body: &str) -> Result<Envelope, ApiError> {
    let parsed: Result<Envelope, _> = serde_json::from_str(body);

    if !(200..300).contains(&status) {
        let message = parsed
            .ok()
            .and_then(|e| e.message)
            .unwrap_or_else(|| truncate(body, 200));
        return Err(ApiError::from_status(status, message));
    }

    let envelope = parsed.map_err(|e| ApiError::Decode(e.to_string()))?;
    if !envelope.is_success() {
        // 2xx with success=false is the backend's validation failure shape
        return Err(ApiError::Rejected {
            status,
            message: envelope
                .message
                .unwrap_or_else(|| "request was not successful".to_string()),
        });
    }
    Ok(envelope)
}

fn page_from_envelope(envelope: Envelope, requested_page: u32) -> Result<Page<ServerRecord>, ApiError> {
    let items = match envelope.data {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(record_from_wire)
            .collect::<Result<Vec<_>, _>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(ApiError::Decode(format!(
                "expected a list in data, got {}",
                kind_of(&other)
            )))
        }
    };

    let (page, total_pages) = match envelope.pagination {
        Some(p) => (p.page, p.total_pages),
        None => (requested_page, None),
    };

    Ok(Page {
        items,
        page,
        total_pages,
        sync_token: envelope.sync_token,
        server_time: envelope.server_time,
    })
}

/// Accept both sync-shaped records and plain CRUD rows
///
/// A plain row becomes the payload as a whole; its `id` (or `_id`) is the
/// entity id.
fn record_from_wire(value: Value) -> Result<ServerRecord, ApiError> {
    if value.get("payload").is_some() {
        return serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()));
    }

    let id = value
        .get("id")
        .or_else(|| value.get("_id"))
        .and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| ApiError::Decode("record without an id".to_string()))?;

    let version = value.get("version").and_then(Value::as_i64).unwrap_or(0);
    let deleted = value
        .get("deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(ServerRecord {
        entity_id: id,
        payload: value,
        version,
        deleted,
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
