pub mod models;
pub mod tasks;

pub use models::*;
pub use tasks::*;

use actix_web::web;

/// Routes under `/api/v1`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(crate::health::health_check))
            .route("/models", web::get().to(list_models))
            .route("/languages", web::get().to(list_languages))
            .route("/transcriptions", web::get().to(list_transcriptions))
            .route("/transcriptions", web::post().to(enqueue_transcription))
            .route("/transcriptions", web::delete().to(cancel_all_transcriptions))
            .route(
                "/transcriptions/{file_name}",
                web::delete().to(cancel_transcription),
            ),
    );
}
