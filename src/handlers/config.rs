use crate::{backends::AudioFormat, error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration, with the API key replaced by a marker.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = &state.config;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port,
                "index_path": config.server.index_path,
                "max_frame_bytes": config.server.max_frame_bytes
            },
            "backend": {
                "api_key": redact(&config.backend.api_key),
                "base_url": config.backend.base_url,
                "llm_model": config.backend.llm_model,
                "max_tokens": config.backend.max_tokens,
                "temperature": config.backend.temperature,
                "tts_model": config.backend.tts_model,
                "tts_voice": config.backend.tts_voice,
                "request_timeout_secs": config.backend.request_timeout_secs,
                "audio_format": AudioFormat::Mp3.as_str(),
                "audio_mime_type": AudioFormat::Mp3.mime_type()
            },
            "conversation": {
                "max_pending": config.conversation.max_pending
            }
        }
    })))
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}
