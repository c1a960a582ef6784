//! Chat page served at `/`.

use crate::{error::AppResult, state::AppState};
use actix_web::{http::header::ContentType, web, HttpResponse};
use tracing::warn;

/// Serve the chat interface from `server.index_path`.
///
/// The file is read on every request, so the page can be edited without a restart.
pub async fn get_interface(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let path = &state.config.server.index_path;

    let page = tokio::fs::read_to_string(path).await.map_err(|err| {
        warn!(path = %path, error = %err, "Interface load failed");
        err
    })?;

    Ok(HttpResponse::Ok()
        .content_type(ContentType::html())
        .body(page))
}
