//! # Transcription Task REST API Handlers
//!
//! ## Available Endpoints:
//! - `POST /api/v1/transcriptions` - Queue a recording for transcription
//! - `GET /api/v1/transcriptions` - Tasks currently queued or running
//! - `DELETE /api/v1/transcriptions/{file_name}` - Cancel one task
//! - `DELETE /api/v1/transcriptions` - Cancel everything
//! - `GET /api/v1/languages` - Languages a task can ask for

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::{Segment, TranscriptionParameters, TranscriptionTask};

/// Request body for queueing a recording.
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// Name of a file in the recordings directory
    pub file_name: String,
    /// Variant id; the configured default when omitted
    pub model: Option<String>,
    pub parameters: Option<TranscriptionParameters>,
    /// Segments from an earlier, interrupted run of the same recording
    pub resume_segments: Option<Vec<Segment>>,
}

impl EnqueueRequest {
    pub fn into_task(self, default_model: &str) -> TranscriptionTask {
        let model = self.model.unwrap_or_else(|| default_model.to_string());
        let parameters = self.parameters.unwrap_or_default();
        match self.resume_segments {
            Some(segments) if !segments.is_empty() => {
                TranscriptionTask::resuming(self.file_name, model, parameters, segments)
            }
            _ => TranscriptionTask::new(self.file_name, model, parameters),
        }
    }
}

/// Check a request against what the worker can actually run, then queue it.
///
/// Shared by the REST endpoint and the WebSocket `enqueue` message.
pub async fn submit(state: &AppState, request: EnqueueRequest) -> AppResult<(bool, TranscriptionTask)> {
    state.storage.audio_file_path(&request.file_name)?;

    if let Some(language) = request
        .parameters
        .as_ref()
        .and_then(|parameters| parameters.language.as_deref())
    {
        let known = state
            .worker
            .available_languages()
            .iter()
            .any(|candidate| candidate.code == language);
        if !known {
            return Err(AppError::BadRequest(format!("Unsupported language '{}'", language)));
        }
    }

    let task = request.into_task(&state.config.models.default_variant);
    let queued = state.worker.enqueue(task.clone()).await;
    Ok((queued, task))
}

/// ## Endpoint: `POST /api/v1/transcriptions`
///
/// ## Request:
/// ```json
/// { "file_name": "meeting.wav", "model": "small", "parameters": { "language": "en" } }
/// ```
///
/// Responds `202 Accepted` with the queued task, or `200 OK` with
/// `"queued": false` when the recording is already in the queue.
pub async fn enqueue_transcription(
    state: web::Data<AppState>,
    body: web::Json<EnqueueRequest>,
) -> AppResult<HttpResponse> {
    let (queued, task) = submit(&state, body.into_inner()).await?;

    if queued {
        info!(task_id = %task.id, file = %task.file_name, "Transcription requested over HTTP");
        Ok(HttpResponse::Accepted().json(json!({ "queued": true, "task": task })))
    } else {
        Ok(HttpResponse::Ok().json(json!({
            "queued": false,
            "message": format!("{} is already queued", task.file_name)
        })))
    }
}

pub async fn list_transcriptions(state: web::Data<AppState>) -> HttpResponse {
    let tasks = state.worker.current_tasks();
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": tasks.len(),
        "tasks": tasks
    }))
}

pub async fn cancel_transcription(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let file_name = path.into_inner();
    if !state.worker.cancel(&file_name).await {
        return Err(AppError::NotFound(format!("No task for {}", file_name)));
    }
    Ok(HttpResponse::Ok().json(json!({ "canceled": file_name })))
}

pub async fn cancel_all_transcriptions(state: web::Data<AppState>) -> HttpResponse {
    let removed = state.worker.cancel_all().await;
    HttpResponse::Ok().json(json!({ "canceled": removed }))
}

pub async fn list_languages(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "languages": state.worker.available_languages() }))
}
