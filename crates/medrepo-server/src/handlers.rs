//! REST handlers over the resource repository.

use std::time::SystemTime;

use axum::{
    Json,
    extract::{Path, RawQuery, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use medrepo_core::TenantContext;
use medrepo_search::SearchQuery;
use medrepo_storage::StoredResource;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{ApiError, ApiResult, FHIR_JSON};
use crate::server::AppState;
use crate::websocket;

/// Header carrying the caller's tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";

const HISTORY: &str = "_history";
const EVENTS: &str = "$events";
const REFRESH_TOKEN: &str = "$refresh-token";

/// Tenant of the request; no header means the platform itself.
pub fn tenant_context(headers: &HeaderMap) -> TenantContext {
    match headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
    {
        Some(tenant) if !tenant.is_empty() => TenantContext::tenant(tenant),
        _ => TenantContext::system(),
    }
}

pub fn etag(version_id: u64) -> String {
    format!("W/\"{version_id}\"")
}

/// Parses `W/"3"`, `"3"` or `3`.
pub fn parse_if_match(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"').parse().ok()
}

fn fhir_json(status: StatusCode, body: &Value) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON))],
        bytes,
    )
        .into_response()
}

fn header_value(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}

fn version_headers(stored: &StoredResource) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::new();
    if let Some(v) = header_value(&etag(stored.version_id)) {
        headers.push((header::ETAG, v));
    }
    let modified = httpdate::fmt_http_date(SystemTime::from(stored.last_updated));
    if let Some(v) = header_value(&modified) {
        headers.push((header::LAST_MODIFIED, v));
    }
    headers
}

fn version_location(stored: &StoredResource) -> String {
    format!(
        "/fhir/{}/{}/{HISTORY}/{}",
        stored.resource_type, stored.id, stored.version_id
    )
}

fn resource_response(status: StatusCode, stored: &StoredResource, location: bool) -> Response {
    let mut response = fhir_json(status, &stored.content);
    let headers = response.headers_mut();
    for (name, value) in version_headers(stored) {
        headers.insert(name, value);
    }
    if location && let Some(v) = header_value(&version_location(stored)) {
        headers.insert(header::LOCATION, v);
    }
    response
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "Medrepo",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(body))
}

/// Shard states plus live session count.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let latest = state.services.activator.latest_version();
    let shards: Vec<Value> = state
        .services
        .board
        .snapshot()
        .into_iter()
        .map(|(shard, s)| json!({"shard": shard.as_str(), "state": s.to_string()}))
        .collect();
    let ready = state
        .services
        .board
        .snapshot()
        .iter()
        .all(|(_, s)| *s == medrepo_storage::ShardState::AtVersion(latest));
    let body = json!({
        "status": if ready { "ok" } else { "degraded" },
        "schemaVersion": latest,
        "shards": shards,
        "sessions": state.services.dispatcher.session_count(),
    });
    (StatusCode::OK, Json(body))
}

// ---- CRUD ----

pub async fn create_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> ApiResult<Response> {
    let ctx = tenant_context(&headers);
    let stored = state
        .services
        .repository
        .create(&ctx, &resource_type, payload)
        .await?;
    Ok(resource_response(StatusCode::CREATED, &stored, true))
}

pub async fn read_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = tenant_context(&headers);
    let stored = state
        .services
        .repository
        .read(&ctx, &resource_type, &id)
        .await?;
    Ok(resource_response(StatusCode::OK, &stored, false))
}

pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> ApiResult<Response> {
    let ctx = tenant_context(&headers);
    let raw = headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::PreconditionRequired("If-Match header is required".into()))?;
    let expected = parse_if_match(raw)
        .ok_or_else(|| ApiError::bad_request(format!("invalid If-Match value '{raw}'")))?;

    if let Some(body_id) = payload.get("id").and_then(Value::as_str)
        && body_id != id
    {
        return Err(ApiError::bad_request(format!(
            "resource id '{body_id}' does not match '{id}'"
        )));
    }

    let stored = state
        .services
        .repository
        .update(&ctx, &resource_type, &id, expected, payload)
        .await?;
    Ok(resource_response(StatusCode::OK, &stored, true))
}

pub async fn delete_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = tenant_context(&headers);
    let tombstone = state
        .services
        .repository
        .delete(&ctx, &resource_type, &id)
        .await?;
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Some(v) = header_value(&etag(tombstone.version_id)) {
        response.headers_mut().insert(header::ETAG, v);
    }
    Ok(response)
}

// ---- history ----

/// `GET /fhir/{type}/{id}/{operation}`: `_history` or the `$events` socket.
pub async fn instance_operation(
    State(state): State<AppState>,
    Path((resource_type, id, operation)): Path<(String, String, String)>,
    request: Request,
) -> ApiResult<Response> {
    match operation.as_str() {
        HISTORY => history(&state, &resource_type, &id, request.headers()).await,
        EVENTS if resource_type == "Subscription" => {
            websocket::subscription_events(state, id, request).await
        }
        _ => Err(ApiError::not_found(format!(
            "unknown operation {resource_type}/{id}/{operation}"
        ))),
    }
}

async fn history(
    state: &AppState,
    resource_type: &str,
    id: &str,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let ctx = tenant_context(headers);
    let history = state
        .services
        .repository
        .history(&ctx, resource_type, id)
        .await?;
    let versions = history.collect().await?;

    let entries: Vec<Value> = versions.iter().map(history_entry).collect();
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "history",
        "total": entries.len(),
        "entry": entries,
    });
    Ok(fhir_json(StatusCode::OK, &bundle))
}

fn history_entry(stored: &StoredResource) -> Value {
    let url = format!("{}/{}", stored.resource_type, stored.id);
    if stored.deleted {
        json!({
            "fullUrl": url,
            "request": {"method": "DELETE", "url": url},
            "response": {"status": "204", "etag": etag(stored.version_id)},
        })
    } else {
        let method = if stored.version_id == 1 { "POST" } else { "PUT" };
        json!({
            "fullUrl": url,
            "resource": stored.content,
            "request": {"method": method, "url": url},
            "response": {"status": "200", "etag": etag(stored.version_id)},
        })
    }
}

/// `GET /fhir/{type}/{id}/_history/{vid}`
pub async fn read_version(
    State(state): State<AppState>,
    Path((resource_type, id, operation, version)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if operation != HISTORY {
        return Err(ApiError::not_found(format!(
            "unknown operation {resource_type}/{id}/{operation}"
        )));
    }
    let version_id: u64 = version
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid version id '{version}'")))?;
    let ctx = tenant_context(&headers);
    let stored = state
        .services
        .repository
        .read_version(&ctx, &resource_type, &id, version_id)
        .await?;
    if stored.deleted {
        return Err(ApiError::Gone(format!(
            "{resource_type}/{id} was deleted at version {version_id}"
        )));
    }
    Ok(resource_response(StatusCode::OK, &stored, false))
}

// ---- search ----

pub async fn search_resource(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = tenant_context(&headers);
    let pairs = url::form_urlencoded::parse(raw.as_deref().unwrap_or("").as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()));
    let mut query = SearchQuery::from_pairs(&resource_type, pairs)?;

    let settings = &state.search;
    let count = query
        .count
        .unwrap_or(settings.default_count)
        .min(settings.max_count);
    query.count = Some(count);

    let found = state.services.repository.search(&ctx, &query).await?;
    debug!(resource_type = %resource_type, matches = found.len(), "Search executed");

    let entries: Vec<Value> = found
        .iter()
        .map(|stored| {
            json!({
                "fullUrl": format!("{}/{}", stored.resource_type, stored.id),
                "resource": stored.content,
                "search": {"mode": "match"},
            })
        })
        .collect();
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "searchset",
        "total": entries.len(),
        "entry": entries,
    });
    Ok(fhir_json(StatusCode::OK, &bundle))
}

// ---- type-level operations ----

#[derive(Debug, Deserialize)]
pub struct RefreshTokenRequest {
    pub token: String,
}

/// `POST /fhir/{type}/{operation}`; only `Subscription/$refresh-token`.
pub async fn type_operation(
    State(state): State<AppState>,
    Path((resource_type, operation)): Path<(String, String)>,
    Json(body): Json<RefreshTokenRequest>,
) -> ApiResult<Response> {
    if resource_type != "Subscription" || operation != REFRESH_TOKEN {
        return Err(ApiError::not_found(format!(
            "unknown operation {resource_type}/{operation}"
        )));
    }
    let token = state.services.dispatcher.refresh_token(&body.token).await?;
    Ok((StatusCode::OK, Json(token)).into_response())
}
