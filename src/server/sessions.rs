//! Session intake endpoints
//!
//! Field naming mirrors what the hook scripts send: camelCase for the
//! session identifiers, snake_case for the tool payload fields.

use super::{ApiError, AppState};
use crate::queue::{NewSummaryRequest, NewToolEvent, QueueStats};
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

/// Request body for POST /api/sessions/init
#[derive(Debug, Deserialize)]
pub struct InitSessionRequest {
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
    pub project: Option<String>,
    /// First user prompt of the session; accepted for hook-API symmetry,
    /// currently unused beyond validation
    #[allow(dead_code)]
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitSessionResponse {
    #[serde(rename = "sessionDbId")]
    pub session_db_id: i64,
    #[serde(rename = "memorySessionId")]
    pub memory_session_id: Option<String>,
}

/// POST /api/sessions/init - register a content session
///
/// Idempotent: hooks fire on every session start and may retry; re-posting
/// an already-known content session returns the existing ids.
pub async fn init_session(
    State(state): State<AppState>,
    Json(request): Json<InitSessionRequest>,
) -> Result<Json<InitSessionResponse>, ApiError> {
    if request.content_session_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "contentSessionId must not be empty".to_string(),
        ));
    }

    let record = state
        .memory
        .register_content_session(&request.content_session_id, request.project.as_deref())
        .map_err(|e| ApiError::StorageUnavailable(e.to_string()))?;

    tracing::info!(
        session_db_id = record.id,
        content_session_id = %record.content_session_id,
        "Session registered"
    );

    Ok(Json(InitSessionResponse {
        session_db_id: record.id,
        memory_session_id: record.memory_session_id,
    }))
}

/// Request body for POST /api/sessions/observations
#[derive(Debug, Deserialize)]
pub struct ObservationRequest {
    #[serde(rename = "sessionDbId")]
    pub session_db_id: i64,
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
    pub tool_name: String,
    pub tool_input: Option<serde_json::Value>,
    pub tool_response: Option<serde_json::Value>,
    pub cwd: Option<String>,
    pub prompt_number: Option<i64>,
    pub project: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ObservationResponse {
    pub id: i64,
}

/// POST /api/sessions/observations - capture one raw tool event
///
/// Returns as soon as the row is durable; summarization happens later on
/// the worker thread.
pub async fn post_observation(
    State(state): State<AppState>,
    Json(request): Json<ObservationRequest>,
) -> Result<Json<ObservationResponse>, ApiError> {
    if request.tool_name.trim().is_empty() {
        return Err(ApiError::BadRequest("tool_name must not be empty".to_string()));
    }

    let id = state.queue.insert_event(NewToolEvent {
        session_db_id: request.session_db_id,
        content_session_id: request.content_session_id,
        tool_name: request.tool_name,
        tool_input: request.tool_input.map(|v| v.to_string()),
        tool_response: request.tool_response.map(|v| v.to_string()),
        cwd: request.cwd,
        prompt_number: request.prompt_number,
        project: request.project,
    })?;

    Ok(Json(ObservationResponse { id }))
}

/// Request body for POST /api/sessions/summary
#[derive(Debug, Deserialize)]
pub struct SummaryRequestBody {
    #[serde(rename = "sessionDbId")]
    pub session_db_id: i64,
    #[serde(rename = "contentSessionId")]
    pub content_session_id: String,
    pub project: Option<String>,
    pub user_prompt: Option<String>,
    pub last_assistant_message: Option<String>,
    pub memory_session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub id: i64,
}

/// POST /api/sessions/summary - request an end-of-turn summary
///
/// 409 when the session already has a request in flight.
pub async fn post_summary(
    State(state): State<AppState>,
    Json(request): Json<SummaryRequestBody>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let id = state.queue.insert_summary_request(NewSummaryRequest {
        session_db_id: request.session_db_id,
        content_session_id: request.content_session_id,
        memory_session_id: request.memory_session_id,
        project: request.project,
        user_prompt: request.user_prompt,
        last_assistant_message: request.last_assistant_message,
    })?;

    Ok(Json(SummaryResponse { id }))
}

/// Response for GET /api/stats
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub events: QueueStats,
    pub summaries: QueueStats,
    pub tracked_processes: usize,
    pub reaper: crate::procs::ReaperTotals,
}

/// GET /api/stats - queue depths, tracker depth, orphan-scan totals
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        events: state.queue.event_stats()?,
        summaries: state.queue.summary_stats()?,
        tracked_processes: state.tracker.len(),
        reaper: state.reaper.totals(),
    }))
}
