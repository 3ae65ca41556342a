//! HTTP surface: health, configuration, zone control, and the SSE push
//! channel viewers subscribe to.
//!
//! The server runs on its own thread so the pipeline hot path never shares
//! a runtime with Actix. All state is shared through the same handles the
//! driver uses; mutations go through the copy-on-write config and the zone
//! registry's atomic swap, so no handler can expose torn state.

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{Context, Result};
use async_stream::stream;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;

use crate::{
    broadcast::{ViewerGuard, ViewerRegistry},
    config::SharedConfig,
    data::{
        HealthResponse, LineRequest, PolygonRequest, TrackingRequest, TunablesView,
        VisibilityRequest,
    },
    pipeline::PipelineStatus,
    telemetry,
    watchdog::RestartState,
    zones::ZoneRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub zones: Arc<ZoneRegistry>,
    pub viewers: Arc<ViewerRegistry>,
    pub status: Arc<PipelineStatus>,
    pub restart: Arc<RestartState>,
}

#[derive(Default)]
pub struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the API server thread and return a handle that can stop it.
pub fn spawn_api_server(state: AppState, port: u16) -> Result<ApiServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("sitewatch-api".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(state.clone()))
                        .route("/health", web::get().to(health_handler))
                        .route("/config", web::get().to(config_handler))
                        .route("/performance/{preset}", web::post().to(preset_handler))
                        .route("/zones/line", web::post().to(line_handler))
                        .route("/zones/polygon", web::post().to(polygon_handler))
                        .route("/zones/visibility", web::post().to(visibility_handler))
                        .route("/tracking", web::post().to(tracking_handler))
                        .route("/restart", web::post().to(restart_handler))
                        .route("/events", web::get().to(events_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .bind(("0.0.0.0", port))?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("HTTP server error: {err}");
            }
        })
        .context("Failed to spawn API server thread")?;

    Ok(ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

async fn health_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        viewer_count: state.viewers.count(),
        pipeline_state: state.status.capture_label(),
        last_sequence: state.status.last_sequence(),
    })
}

async fn config_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(TunablesView::from_config(&state.config.snapshot()))
}

async fn preset_handler(path: web::Path<String>, state: web::Data<AppState>) -> HttpResponse {
    let name = path.into_inner();
    let applied = state.config.update(|config| config.apply_preset(&name));
    if applied {
        HttpResponse::Ok().json(TunablesView::from_config(&state.config.snapshot()))
    } else {
        HttpResponse::BadRequest().body(format!("unknown preset: {name}"))
    }
}

async fn line_handler(
    request: web::Json<LineRequest>,
    state: web::Data<AppState>,
) -> HttpResponse {
    match state.zones.reconfigure_line(request.start, request.end) {
        Ok(()) => HttpResponse::Ok().json(state.zones.snapshot()),
        Err(err) => HttpResponse::BadRequest().body(err.to_string()),
    }
}

async fn polygon_handler(
    request: web::Json<PolygonRequest>,
    state: web::Data<AppState>,
) -> HttpResponse {
    match state
        .zones
        .reconfigure_polygon(request.into_inner().vertices)
    {
        Ok(()) => HttpResponse::Ok().json(state.zones.snapshot()),
        Err(err) => HttpResponse::BadRequest().body(err.to_string()),
    }
}

async fn visibility_handler(
    request: web::Json<VisibilityRequest>,
    state: web::Data<AppState>,
) -> HttpResponse {
    state.zones.set_visible(request.visible);
    HttpResponse::Ok().json(state.zones.snapshot())
}

async fn tracking_handler(
    request: web::Json<TrackingRequest>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let enabled = request.enabled;
    state
        .config
        .update(|config| config.tracking_enabled = enabled);
    // The driver notices the change at its next cycle and resets the
    // tracker, counters, and correlation state.
    HttpResponse::Ok().json(serde_json::json!({ "tracking_enabled": enabled }))
}

async fn restart_handler(state: web::Data<AppState>) -> HttpResponse {
    state.restart.arm("restart requested");
    HttpResponse::Ok().json(serde_json::json!({ "status": "restart requested" }))
}

/// The push channel: one SSE record per processed cycle. Registration is
/// dropped automatically when the client goes away.
async fn events_handler(state: web::Data<AppState>) -> HttpResponse {
    let (id, mut rx) = state.viewers.register();
    let guard = ViewerGuard::new(id, state.viewers.clone());

    let stream = stream! {
        let _guard = guard;
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 500\n\n"));
        while let Some(payload) = rx.recv().await {
            let mut chunk = String::with_capacity(payload.json.len() + 32);
            chunk.push_str("id: ");
            chunk.push_str(&payload.sequence.to_string());
            chunk.push('\n');
            chunk.push_str("data: ");
            chunk.push_str(&payload.json);
            chunk.push_str("\n\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream)
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
