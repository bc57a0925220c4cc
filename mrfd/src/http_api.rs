//! Admin and observability HTTP endpoints

use crate::runtime::Runtime;
use axum::Router;
use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use serde::Serialize;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

pub fn router(rt: Arc<Runtime>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/api/v1/session", get(sessions))
        .route("/api/v1/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(rt)
}

/// Serve the admin API until the process exits
pub async fn serve(rt: Arc<Runtime>) -> anyhow::Result<()> {
    let addr = SocketAddr::V4(SocketAddrV4::new(
        rt.config.server_ipv4,
        rt.config.http_port,
    ));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("admin API listening on http://{addr}");

    axum::serve(listener, router(rt)).await?;

    Ok(())
}

async fn home() -> Html<&'static str> {
    Html("<h1>mrfd API Webserver</h1>\n")
}

#[derive(Serialize)]
struct SessionList {
    sessions: Vec<String>,
}

async fn sessions(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    let sessions = rt
        .sessions
        .snapshot()
        .iter()
        .map(|session| session.describe())
        .collect();

    axum::Json(SessionList { sessions })
}

#[derive(Serialize)]
struct Stats {
    cpu_count: usize,
    workers: usize,
    concurrent_sessions: usize,
    free_media_ports: usize,
    prompt_repositories: usize,
}

async fn stats(State(rt): State<Arc<Runtime>>) -> impl IntoResponse {
    axum::Json(Stats {
        cpu_count: num_cpus::get(),
        workers: rt.config.workers,
        concurrent_sessions: rt.sessions.len(),
        free_media_ports: rt.ports.free_count(),
        prompt_repositories: usize::from(
            rt.media.get_repo(&rt.config.repo_name).is_some(),
        ),
    })
}

async fn metrics(State(rt): State<Arc<Runtime>>) -> String {
    rt.metrics.gather()
}
