use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::format_bytes;
use crate::state::AppState;
use crate::transcription::TranscriptionStatus;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let memory = state.gate.snapshot();
    let disk = state.storage.disk_space();
    let tasks = state.worker.current_tasks();
    let running = tasks
        .iter()
        .find(|task| {
            matches!(
                task.status,
                TranscriptionStatus::Loading | TranscriptionStatus::Progress { .. }
            )
        })
        .map(|task| {
            json!({
                "file_name": task.file_name,
                "model": task.model,
                "status": task.status.as_str(),
                "progress": task.progress
            })
        });

    let catalog = state.worker.catalog();
    let default_variant = catalog.default_variant();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "transcription-worker",
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port
        },
        "memory": {
            "available_bytes": memory.available_bytes,
            "total_bytes": memory.total_bytes,
            "available": format_bytes(memory.available_bytes)
        },
        "disk": {
            "available_bytes": disk.available_bytes,
            "total_bytes": disk.total_bytes,
            "recordings_bytes": disk.recordings_bytes,
            "available": format_bytes(disk.available_bytes)
        },
        "queue": {
            "length": tasks.len(),
            "running": running
        },
        "models": {
            "device": state.device,
            "default_variant": default_variant.id,
            "default_downloaded": catalog.is_downloaded(default_variant),
            "downloaded": catalog.downloaded_variants().len()
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_state;
    use crate::transcription::testing::ScriptedProvider;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_queue_and_models() {
        let (state, _dirs) = test_state(ScriptedProvider::finishing(), &[]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue"]["length"], 0);
        assert!(body["queue"]["running"].is_null());
        assert_eq!(body["models"]["default_variant"], "small");
        assert_eq!(body["models"]["default_downloaded"], true);
        assert_eq!(body["memory"]["available_bytes"], 4_096u64 * 1024 * 1024);
    }
}
