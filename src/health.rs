use crate::state::{AppMetrics, AppState, ConversationSnapshot};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;
use tracing::warn;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let conversation = state.conversation.snapshot();
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "connections": {
            "active": conversation.active_connections,
            "registered": state.registry.len()
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics)
        },
        "memory": get_memory_info(),
        "backends": {
            "generation": {
                "model": config.backend.llm_model,
                "base_url": config.backend.base_url
            },
            "synthesis": {
                "model": config.backend.tts_model,
                "voice": config.backend.tts_voice
            }
        },
        "system": get_system_status(&conversation)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "conversation": state.conversation.snapshot(),
        "memory": get_memory_info(),
        "limits": {
            "max_pending": state.config.conversation.max_pending,
            "request_timeout_secs": state.config.backend.request_timeout_secs
        }
    }))
}

fn error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            return json!({
                "resident_memory_bytes": proc_status_bytes(&status, "VmRSS:"),
                "virtual_memory_bytes": proc_status_bytes(&status, "VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": null,
        "virtual_memory_bytes": null,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// Byte value of a `/proc/<pid>/status` field such as `VmRSS:   1234 kB`.
///
/// `None` when the field is missing or unparsable, which shows up as `null` in JSON.
fn proc_status_bytes(status: &str, field: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with(field))?;
    let raw = line.split_whitespace().nth(1)?;
    match raw.parse::<u64>() {
        Ok(kib) => Some(kib * 1024),
        Err(err) => {
            warn!(field = %field, value = %raw, error = %err, "Unparsable /proc status field");
            None
        }
    }
}

/// Rough load indicator from turn outcomes so far.
fn get_system_status(conversation: &ConversationSnapshot) -> serde_json::Value {
    let finished = conversation.turns_completed + conversation.turns_failed;
    let failure_rate = if finished > 0 {
        conversation.turns_failed as f64 / finished as f64
    } else {
        0.0
    };

    let status = if failure_rate > 0.5 {
        "degraded"
    } else if conversation.messages_rejected > 0 {
        "backpressure"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "turn_failure_percent": (failure_rate * 100.0).round(),
        "active_connections": conversation.active_connections,
        "rejected_messages": conversation.messages_rejected
    })
}
