//! # Model Catalog REST API Handlers
//!
//! ## Available Endpoints:
//! - `GET /api/v1/models` - Known variants, their memory needs and whether they are on disk

use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

use crate::error::format_bytes;
use crate::state::AppState;

/// Response structure for one model variant.
#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub id: String,
    pub description: String,
    pub size_mb: u32,
    pub memory_required_bytes: u64,
    pub memory_required: String,
    pub downloaded: bool,
    /// Whether the machine currently has room to load it
    pub fits_in_memory: bool,
}

/// ## Endpoint: `GET /api/v1/models`
///
/// ## Response:
/// ```json
/// {
///   "default_variant": "tiny",
///   "available_memory_bytes": 8589934592,
///   "models": [
///     {
///       "id": "tiny",
///       "description": "Fastest, basic accuracy",
///       "size_mb": 39,
///       "memory_required_bytes": 286261248,
///       "memory_required": "273.0 MB",
///       "downloaded": true,
///       "fits_in_memory": true
///     }
///   ]
/// }
/// ```
pub async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    let catalog = state.worker.catalog();
    let memory = state.gate.snapshot();

    let models: Vec<ModelInfoResponse> = catalog
        .variants()
        .iter()
        .map(|variant| ModelInfoResponse {
            id: variant.id.clone(),
            description: variant.description.clone(),
            size_mb: variant.size_mb,
            memory_required_bytes: variant.memory_required,
            memory_required: format_bytes(variant.memory_required),
            downloaded: catalog.is_downloaded(variant),
            fits_in_memory: memory.available_bytes > variant.memory_required,
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "default_variant": catalog.default_variant().id,
        "device": state.device,
        "available_memory_bytes": memory.available_bytes,
        "models": models
    }))
}
