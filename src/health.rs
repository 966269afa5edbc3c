use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let registry = &state.relay.registry;

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
            "error_rate": metrics.error_rate(),
            "websocket_upgrades": metrics.upgrade_count
        },
        "relay": {
            "active_sessions": registry.active_count(),
            "max_sessions": registry.max_sessions(),
            "counters": state.relay.counters.snapshot()
        },
        "collaborators": collaborator_status(&config, state.relay.backend.kind()),
        "memory": get_memory_info(),
        "system": get_system_status(registry.active_count(), registry.max_sessions())
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
        "overall": overall_metrics(&metrics, uptime_seconds),
        "endpoints": endpoint_stats,
        "relay": {
            "active_sessions": state.relay.registry.active_count(),
            "max_sessions": state.relay.registry.max_sessions(),
            "counters": state.relay.counters.snapshot()
        },
        "memory": get_memory_info()
    }))
}

fn overall_metrics(metrics: &AppMetrics, uptime_seconds: u64) -> serde_json::Value {
    json!({
        "total_requests": metrics.request_count,
        "total_errors": metrics.error_count,
        "error_rate": metrics.error_rate(),
        "websocket_upgrades": metrics.upgrade_count,
        "requests_per_second": if uptime_seconds > 0 {
            metrics.request_count as f64 / uptime_seconds as f64
        } else {
            0.0
        }
    })
}

/// Where each collaborator points. Keys are reported as present or not, never echoed.
fn collaborator_status(config: &AppConfig, backend_kind: &str) -> serde_json::Value {
    json!({
        "live_session": {
            "model": config.upstream.model,
            "voice": config.upstream.voice,
            "api_key_configured": config.upstream.api_key.is_some()
        },
        "summarizer": {
            "model": config.summarizer.model,
            "api_key_configured": config.summarizer.api_key.is_some()
        },
        "backend": {
            "kind": backend_kind,
            "base_url": config.backend.base_url
        },
        "features": config.features
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", std::process::id())) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(active_sessions: usize, max_sessions: usize) -> serde_json::Value {
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::Harness;
    use actix_web::body::to_bytes;

    #[test]
    fn test_system_status_thresholds() {
        assert_eq!(get_system_status(1, 10)["status"], "normal");
        assert_eq!(get_system_status(8, 10)["status"], "moderate_load");
        assert_eq!(get_system_status(10, 10)["status"], "high_load");
        assert_eq!(get_system_status(0, 0)["session_usage_percent"], 0.0);
    }

    #[actix_web::test]
    async fn test_health_reports_relay() {
        let mut config = AppConfig::default();
        config.upstream.api_key = Some("secret".into());
        let state = AppState::new(config, Harness::new().services);

        let response = health_check(web::Data::new(state)).await;
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["relay"]["active_sessions"], 0);
        assert_eq!(json["collaborators"]["backend"]["kind"], "fake");
        assert_eq!(json["collaborators"]["live_session"]["api_key_configured"], true);
        assert!(!body.windows(6).any(|w| w == b"secret"));
    }
}
