use crate::state::{TrafficSnapshot, TrafficState};
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ipnet::IpNet;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub traffic: Arc<TrafficState>,
    pub start_time: Instant,
    /// Set once the capture source has been drained.
    pub drained: AtomicBool,
}

impl AppState {
    pub fn new(traffic: Arc<TrafficState>) -> Self {
        Self {
            traffic,
            start_time: Instant::now(),
            drained: AtomicBool::new(false),
        }
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    total_packets: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    packets_per_second: f64,
    bytes_per_second: f64,
    #[serde(flatten)]
    traffic: TrafficSnapshot,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let mut app = Router::new()
        .route("/metrics", get(get_metrics))
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| match s.parse::<IpNet>() {
                    Ok(net) => Some(net),
                    Err(_) => {
                        tracing::warn!("ignoring invalid allowlist entry {}", s);
                        None
                    }
                })
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve `app` on `listener` in the background. A server failure is logged
/// as soon as it happens.
pub fn spawn_server(listener: TcpListener, app: Router) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        let result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
        if let Err(e) = &result {
            tracing::error!("metrics server stopped: {}", e);
        }
        result
    })
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = if state.drained.load(Ordering::Relaxed) {
        "drained"
    } else {
        "running"
    };
    Json(HealthResponse {
        status,
        total_packets: state.traffic.snapshot().total_packets,
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let traffic = state.traffic.snapshot();

    let (packets_per_second, bytes_per_second) = if uptime > 0 {
        (
            traffic.total_packets as f64 / uptime as f64,
            traffic.total_bytes as f64 / uptime as f64,
        )
    } else {
        (0.0, 0.0)
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        packets_per_second,
        bytes_per_second,
        traffic,
    })
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.traffic.encode_metrics() {
        Ok(buf) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buf,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Protocol;
    use crate::storage::WriteOutcome;

    fn app_state() -> Arc<AppState> {
        let traffic = Arc::new(TrafficState::new());
        traffic.record_packet(Protocol::Udp, 90);
        traffic.record_packet(Protocol::Udp, 10);
        traffic.record_write_outcome(WriteOutcome::Fail);
        Arc::new(AppState::new(traffic))
    }

    #[tokio::test]
    async fn test_spawned_server_answers_while_running() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = spawn_server(listener, router(app_state(), &[]));

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/api/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "running");
        assert_eq!(body["total_packets"], 2);
        assert!(!server.is_finished());

        server.abort();
    }

    #[tokio::test]
    async fn test_health_reports_drain_state() {
        let state = app_state();
        let Json(health) = get_health(State(state.clone())).await;
        assert_eq!(health.status, "running");
        assert_eq!(health.total_packets, 2);

        state.drained.store(true, Ordering::Relaxed);
        let Json(health) = get_health(State(state)).await;
        assert_eq!(health.status, "drained");
    }

    #[tokio::test]
    async fn test_stats_include_per_protocol_tallies() {
        let Json(stats) = get_stats(State(app_state())).await;
        assert_eq!(stats.traffic.total_bytes, 100);
        assert_eq!(stats.traffic.protocols["udp"].packets, 2);
        assert_eq!(stats.traffic.writes_failed, 1);

        let body = serde_json::to_value(&stats).unwrap();
        assert_eq!(body["total_packets"], 2);
        assert_eq!(body["protocols"]["udp"]["bytes"], 100);
    }

    #[tokio::test]
    async fn test_metrics_handler_serves_text() {
        let response = get_metrics(State(app_state())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}
