//! HTTP API for the presentation layer
//!
//! Read endpoints answer from the shared status store; command endpoints
//! queue into the timing loop and return 202 without waiting for the
//! transition. Uses hyper for the HTTP server.

use crate::domain::lap::SessionStats;
use crate::domain::types::RaceCommand;
use crate::infra::metrics::Metrics;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::status_store::{StatusStore, StatusView};
use crate::services::timing_loop::{CommandError, CommandSender};
use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared state for request handlers
#[derive(Clone)]
pub struct ApiState {
    pub store: StatusStore,
    pub commands: CommandSender,
    pub metrics: Arc<Metrics>,
    pub site_id: Arc<str>,
}

/// Body of GET /api/status
#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    view: StatusView,
    stats: SessionStats,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let (status, payload) = match serde_json::to_vec(body) {
        Ok(payload) => (status, payload),
        Err(e) => {
            error!(error = %e, "api_serialize_failed");
            (StatusCode::INTERNAL_SERVER_ERROR, br#"{"error":"serialize"}"#.to_vec())
        }
    };
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(payload)))
        .expect("static response should not fail")
}

fn command_response(command: RaceCommand, result: Result<(), CommandError>) -> Response<Full<Bytes>> {
    match result {
        Ok(()) => {
            info!(command = %command.as_str(), "api_command_queued");
            json_response(
                StatusCode::ACCEPTED,
                &json!({ "success": true, "command": command.as_str() }),
            )
        }
        Err(e) => {
            warn!(command = %command.as_str(), error = %e, "api_command_rejected");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({ "success": false, "command": command.as_str(), "message": e.to_string() }),
            )
        }
    }
}

/// Route one request
pub async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: ApiState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &state))
}

fn route(method: &Method, path: &str, state: &ApiState) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/health") => {
            let snapshot = state.store.read();
            let status = if snapshot.sensor_health.is_degraded() {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            json_response(
                status,
                &json!({
                    "status": if status == StatusCode::OK { "healthy" } else { "degraded" },
                    "sensor": snapshot.sensor_health,
                    "race_state": snapshot.state.tag(),
                    "session_id": &*snapshot.session_id,
                }),
            )
        }
        (&Method::GET, "/api/status") => {
            let snapshot = state.store.read();
            let body = StatusResponse { view: snapshot.view(Instant::now()), stats: snapshot.stats() };
            json_response(StatusCode::OK, &body)
        }
        (&Method::GET, "/api/statistics") => {
            json_response(StatusCode::OK, &state.store.read().stats())
        }
        (&Method::GET, "/api/laps") => {
            let snapshot = state.store.read();
            json_response(StatusCode::OK, &*snapshot.laps)
        }
        (&Method::GET, "/metrics") => {
            let snapshot = state.store.read();
            let body = format_prometheus_metrics(&state.metrics.peek(), &snapshot, &state.site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::POST, path) if path.starts_with("/api/") => {
            match path.trim_start_matches("/api/").parse::<RaceCommand>() {
                Ok(command) => command_response(command, state.commands.send(command)),
                Err(_) => not_found(),
            }
        }
        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::from("")))
            .expect("static response should not fail"),
        _ => not_found(),
    }
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from("Not Found")))
        .expect("static response should not fail")
}

/// Bind and serve the API until shutdown
pub async fn start_web_server(
    bind_address: &str,
    port: u16,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .with_context(|| format!("Invalid web bind address {bind_address}:{port}"))?;
    let listener =
        TcpListener::bind(addr).await.with_context(|| format!("Failed to bind web API on {addr}"))?;

    info!(addr = %addr, site = %state.site_id, "web_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "web_connection");
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "web_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "web_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("web_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
