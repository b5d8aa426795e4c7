//! SurgeGate - A traffic-surge admission controller.
//!
//! # API Endpoints
//!
//! - `GET /health` - Health check
//! - `GET|POST /api/traffic/state` - Read state / run an admission action
//! - `POST /api/traffic/state/reset` - Reset the state (admin)
//! - `GET|POST /api/traffic/config` - Read / update thresholds (update is admin)
//! - `GET|POST|DELETE /api/traffic/blocked-ips` - Blocklist (mutations are admin)
//!
//! Every other request passes the edge interceptor and, when
//! `SURGEGATE_UPSTREAM_URL` is set, is relayed to that origin.

use std::net::SocketAddr;

use axum::{middleware, routing::any};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use surgegate::api::{self, AppState};
use surgegate::auth::AdminAuth;
use surgegate::controller::AdmissionController;
use surgegate::interceptor::{EdgeGuard, admission_guard};
use surgegate::proxy::{Upstream, forward};
use surgegate::settings::Settings;
use surgegate::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("surgegate=info".parse()?))
        .init();

    let settings = Settings::from_env();

    info!(port = settings.port, db_url = %settings.database_url, "Starting SurgeGate server");
    if settings.uses_dev_admin_token() {
        warn!("SURGEGATE_ADMIN_TOKEN is not set; using the development token");
    }
    info!(
        trusted_proxies = settings.edge.trusted_proxies.len(),
        "Forwarding headers are honored only from trusted proxies"
    );

    let storage = Storage::new(&settings.database_url).await?;
    info!("Database initialized");

    let controller = AdmissionController::new(storage);
    let state = AppState {
        controller: controller.clone(),
        admin: AdminAuth::new(settings.admin_token.as_str()),
    };

    let mut app = api::router(state);

    if let Some(upstream_url) = &settings.upstream_url {
        let upstream = Upstream::new(upstream_url, settings.upstream_timeout)?;
        info!(upstream = %upstream.base_url(), "Relaying admitted requests upstream");
        app = app.fallback_service(any(forward).with_state(upstream));
    }

    let guard = EdgeGuard::new(controller, settings.edge.clone());
    let app = app
        .layer(middleware::from_fn_with_state(guard, admission_guard))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "SurgeGate is listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
