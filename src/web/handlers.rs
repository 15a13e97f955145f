//! HTTP request handlers and the API error taxonomy.

use super::AppState;
use crate::analytics::Insights;
use crate::auth::{self, AuthError};
use crate::db::{DbError, EventLog, MonitorTarget, PingSample};
use crate::probe::{self, ProbeError, TraceResult};
use crate::registry::{RegistryError, TargetPatch};

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_LOG_LIMIT: usize = 100;
const EXPORT_PAGE_SIZE: usize = 500;
const DEFAULT_TRACE_HOPS: u32 = 30;
const DEFAULT_TRACE_TIMEOUT_SECS: u64 = 25;
const MAX_TRACE_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Error taxonomy
// ============================================================================

/// User-facing API errors. Every variant renders as `{"detail": ...}` with
/// a message that is safe to show.
#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    NotFound(String),
    BadRequest(String),
    ServiceUnavailable(String),
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::Unauthenticated => "Not authenticated".to_string(),
            ApiError::NotFound(msg) | ApiError::BadRequest(msg) | ApiError::ServiceUnavailable(msg) => {
                msg.clone()
            }
            ApiError::Internal => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound => ApiError::NotFound("Target not found".to_string()),
            RegistryError::DuplicateTarget
            | RegistryError::InvalidIp
            | RegistryError::InvalidFrequency => ApiError::BadRequest(e.to_string()),
            RegistryError::Store(e) => {
                tracing::error!("storage error: {}", e);
                ApiError::ServiceUnavailable("Storage temporarily unavailable".to_string())
            }
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => ApiError::NotFound("Target not found".to_string()),
            other => {
                tracing::error!("storage error: {}", other);
                ApiError::ServiceUnavailable("Storage temporarily unavailable".to_string())
            }
        }
    }
}

impl From<ProbeError> for ApiError {
    fn from(e: ProbeError) -> Self {
        match e {
            ProbeError::ToolUnavailable(_) | ProbeError::ToolTimeout(_) => {
                ApiError::ServiceUnavailable(e.to_string())
            }
            ProbeError::Command(msg) => {
                tracing::error!("traceroute failed: {}", msg);
                ApiError::Internal
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials | AuthError::InvalidToken => ApiError::Unauthenticated,
            AuthError::Encoding => ApiError::Internal,
        }
    }
}

/// `Json` extractor whose rejection renders in the API error shape.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

/// `Query` extractor whose rejection renders in the API error shape.
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(ApiQuery(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

pub async fn handle_login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    auth::check_credentials(&state.config, &req.username, &req.password)?;
    let access_token = auth::issue_token(
        &state.config.auth_secret,
        &req.username,
        state.config.auth_token_minutes,
    )?;
    Ok(Json(LoginResponse {
        access_token,
        token_type: "bearer",
    }))
}

// ============================================================================
// Targets
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub ip: String,
    pub frequency: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTargetResponse {
    pub id: i64,
    pub message: String,
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateTargetRequest>,
) -> Result<Json<CreateTargetResponse>, ApiError> {
    let target = state
        .registry
        .create(&req.ip, req.frequency, req.url.as_deref(), req.notes.as_deref())
        .await?;
    Ok(Json(CreateTargetResponse {
        id: target.id,
        message: format!("Started tracking {}", target.ip),
    }))
}

pub async fn handle_list_targets(
    State(state): State<AppState>,
) -> Result<Json<Vec<MonitorTarget>>, ApiError> {
    Ok(Json(state.registry.list()?))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTargetRequest {
    #[serde(default)]
    pub frequency: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiJson(req): ApiJson<UpdateTargetRequest>,
) -> Result<Json<MonitorTarget>, ApiError> {
    let target = state
        .registry
        .update(
            id,
            TargetPatch {
                frequency_seconds: req.frequency,
                url: req.url,
                notes: req.notes,
            },
        )
        .await?;
    Ok(Json(target))
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub message: String,
    pub id: i64,
}

pub async fn handle_pause_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ActionResponse>, ApiError> {
    let target = state.registry.pause(id).await?;
    Ok(Json(ActionResponse {
        message: format!("Paused tracking {}", target.ip),
        id,
    }))
}

pub async fn handle_resume_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ActionResponse>, ApiError> {
    let target = state.registry.resume(id).await?;
    Ok(Json(ActionResponse {
        message: format!("Resumed tracking {}", target.ip),
        id,
    }))
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ActionResponse>, ApiError> {
    let target = state.registry.delete(id).await?;
    Ok(Json(ActionResponse {
        message: format!("Deleted target {}", target.ip),
        id,
    }))
}

// ============================================================================
// Samples & events
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct LogRow {
    pub time: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub hops: Option<i64>,
    pub packet_loss: bool,
}

impl From<PingSample> for LogRow {
    fn from(s: PingSample) -> Self {
        Self {
            time: s.time,
            latency_ms: s.latency_ms,
            hops: s.hops,
            packet_loss: s.packet_loss,
        }
    }
}

pub async fn handle_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiQuery(query): ApiQuery<LogsQuery>,
) -> Result<Json<Vec<LogRow>>, ApiError> {
    let target = state.registry.get(id)?;
    let samples = state.store.query_raw(
        target.id,
        query.since,
        query.limit.unwrap_or(DEFAULT_LOG_LIMIT),
    )?;
    Ok(Json(samples.into_iter().map(LogRow::from).collect()))
}

/// Format one sample as a CSV line. Null latency/hops render as empty cells.
fn csv_row(sample: &PingSample, target_ip: &str) -> String {
    format!(
        "{},{},{},{},{},{}\n",
        sample.time.to_rfc3339_opts(SecondsFormat::Millis, true),
        sample.target_id,
        target_ip,
        sample
            .latency_ms
            .map(|v| v.to_string())
            .unwrap_or_default(),
        sample.hops.map(|v| v.to_string()).unwrap_or_default(),
        sample.packet_loss,
    )
}

/// Stream every raw sample for a target as CSV, paging through the store so
/// the result set is never held in memory.
pub async fn handle_export_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let target = state.registry.get(id)?;
    let store = state.store.clone();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, Infallible>>(8);
    tokio::task::spawn_blocking(move || {
        let header = "time,target_id,target_ip,latency_ms,hops,packet_loss\n".to_string();
        if tx.blocking_send(Ok(header)).is_err() {
            return;
        }
        let mut after_ms = i64::MIN;
        loop {
            let page = match store.raw_page(target.id, after_ms, EXPORT_PAGE_SIZE) {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!("export: page read failed for target {}: {}", target.id, e);
                    return;
                }
            };
            let Some(last) = page.last() else { return };
            after_ms = last.time.timestamp_millis();

            let mut chunk = String::with_capacity(page.len() * 64);
            for sample in &page {
                chunk.push_str(&csv_row(sample, &target.ip));
            }
            if tx.blocking_send(Ok(chunk)).is_err() {
                // Client went away; stop paging.
                return;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv; charset=utf-8")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"target-{}-samples.csv\"", id),
        )
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|_| ApiError::Internal)
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiQuery(query): ApiQuery<EventsQuery>,
) -> Result<Json<Vec<EventLog>>, ApiError> {
    let events = state
        .registry
        .events(id, query.limit.unwrap_or(DEFAULT_LOG_LIMIT))?;
    Ok(Json(events))
}

// ============================================================================
// Insights & traceroute
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct InsightsQuery {
    #[serde(default)]
    pub window_minutes: Option<i64>,
    #[serde(default)]
    pub bucket_seconds: Option<i64>,
}

pub async fn handle_insights(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiQuery(query): ApiQuery<InsightsQuery>,
) -> Result<Json<Insights>, ApiError> {
    let window_minutes = query.window_minutes.unwrap_or(60);
    if !(1..=1440).contains(&window_minutes) {
        return Err(ApiError::BadRequest(
            "window_minutes must be between 1 and 1440".to_string(),
        ));
    }
    let bucket_seconds = query.bucket_seconds.unwrap_or(60);
    if bucket_seconds < 1 {
        return Err(ApiError::BadRequest(
            "bucket_seconds must be at least 1".to_string(),
        ));
    }

    let target = state.registry.get(id)?;
    let insights = state
        .analytics
        .insights(target.id, window_minutes, bucket_seconds)?;
    Ok(Json(insights))
}

#[derive(Debug, Deserialize)]
pub struct TracerouteQuery {
    #[serde(default)]
    pub max_hops: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

pub async fn handle_traceroute(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    ApiQuery(query): ApiQuery<TracerouteQuery>,
) -> Result<Json<TraceResult>, ApiError> {
    let target = state.registry.get(id)?;
    let max_hops = query.max_hops.unwrap_or(DEFAULT_TRACE_HOPS).clamp(1, 64);
    let timeout = query
        .timeout
        .unwrap_or(DEFAULT_TRACE_TIMEOUT_SECS)
        .clamp(1, MAX_TRACE_TIMEOUT_SECS);

    let result = probe::traceroute(
        &state.config.traceroute_binary,
        &target.ip,
        max_hops,
        Duration::from_secs(timeout),
    )
    .await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError::from(RegistryError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(RegistryError::DuplicateTarget).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RegistryError::InvalidIp).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RegistryError::InvalidFrequency).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ProbeError::ToolUnavailable("traceroute".to_string())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(ProbeError::ToolTimeout(25)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Internal.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_storage_errors_stay_opaque() {
        let err = ApiError::from(RegistryError::Store(DbError::Migration(
            "secret path /var/db".to_string(),
        )));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.detail().contains("/var/db"));
    }

    #[test]
    fn test_csv_row_success_and_loss() {
        let t = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let ok = PingSample::success(t, 7, 12.5, 56);
        assert_eq!(
            csv_row(&ok, "192.0.2.9"),
            "2026-03-14T12:00:00.000Z,7,192.0.2.9,12.5,56,false\n"
        );

        let lost = PingSample::loss(t, 7);
        assert_eq!(
            csv_row(&lost, "192.0.2.9"),
            "2026-03-14T12:00:00.000Z,7,192.0.2.9,,,true\n"
        );
    }
}
