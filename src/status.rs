// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Read-only status view over the registry, served over HTTP

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::procs::Registry;
use crate::Error;

/// What the endpoint reports for one started application
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
}

/// Derives the status of every registered app, in registry order
///
/// Liveness comes from the recorded exit state of each handle, no process is signaled.
pub async fn collect(registry: &Registry) -> Vec<AppStatus> {
    let mut apps = registry.lock().await;
    let now = Utc::now();

    apps.iter_mut()
        .map(|app| {
            let running = app.refresh();
            AppStatus {
                name: app.name().to_string(),
                running,
                started_at: app.started_at(),
                stopped_at: app.stopped_at(),
                uptime_seconds: app.uptime_seconds(now),
            }
        })
        .collect()
}

async fn apps(State(registry): State<Arc<Registry>>) -> Json<Vec<AppStatus>> {
    Json(collect(&registry).await)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// `GET /` and `GET /apps` list the apps, `GET /health` is a liveness probe
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(apps))
        .route("/apps", get(apps))
        .route("/health", get(health))
        .with_state(registry)
}

/// Serves the status endpoint until the process exits
pub async fn serve(listen: SocketAddr, registry: Arc<Registry>) -> Result<(), Error> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "Ready-Set: live on {}", listen);

    axum::serve(listener, router(registry)).await?;
    Ok(())
}
