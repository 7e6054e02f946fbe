//! `/metrics` + `/healthz` axum router, trimmed down from a much larger
//! router that also carried cluster/Redis/rate-limiter endpoints with no
//! counterpart here.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::responder::ResponderContext;

pub struct HttpServer {
    ctx: Arc<ResponderContext>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(ctx: Arc<ResponderContext>, bind_addr: SocketAddr) -> Self {
        Self { ctx, bind_addr }
    }

    pub async fn start(self) -> Result<(), Box<dyn std::error::Error>> {
        let app = Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(prometheus_metrics))
            .with_state(self.ctx)
            .layer(CorsLayer::permissive());

        info!(addr = %self.bind_addr, "starting http server");
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

async fn prometheus_metrics(State(ctx): State<Arc<ResponderContext>>) -> impl IntoResponse {
    ctx.metrics.sync_from(&ctx.mcache, &ctx.provider, &ctx.negcache);

    match ctx.metrics.export() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .unwrap(),
        Err(e) => {
            error!(error = %e, "failed to export metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body("failed to export metrics".to_string())
                .unwrap()
        }
    }
}
