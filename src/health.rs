use crate::config::AppConfig;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;
    let active = state.active_connections();

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
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count)
        },
        "connections": {
            "active": active,
            "max": config.performance.max_concurrent_sessions,
            "accepted": metrics.connections_accepted,
            "rejected": metrics.connections_rejected
        },
        "reply_cycles": state.pipeline.stats.snapshot(),
        "conversations": {
            "devices": state.pipeline.memory.device_count()
        },
        "provider": {
            "configured": !config.provider.api_key.is_empty(),
            "asr_model": config.models.asr_model,
            "llm_model": config.models.llm_model,
            "tts_model": config.models.tts_realtime_model
        },
        "system": load_status(config, active)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count),
            "requests_per_second": ratio(metrics.request_count, uptime_seconds)
        },
        "endpoints": endpoint_stats,
        "connections": {
            "active": state.active_connections(),
            "accepted": metrics.connections_accepted,
            "rejected": metrics.connections_rejected
        },
        "reply_cycles": state.pipeline.stats.snapshot(),
        "performance": {
            "max_concurrent_sessions": state.config.performance.max_concurrent_sessions,
            "channel_capacity": state.config.performance.channel_capacity,
            "session_timeout_secs": state.config.performance.session_timeout_secs
        }
    }))
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}

fn load_status(config: &AppConfig, active: usize) -> serde_json::Value {
    let max = config.performance.max_concurrent_sessions;
    let usage = if max > 0 { active as f64 / max as f64 } else { 0.0 };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (usage * 100.0).round(),
        "load_warnings": if usage > 0.8 {
            vec!["High connection usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
