mod auth;
mod config;
mod middleware;

mod db;
mod error;
mod models;
mod pagination;
mod permissions;
mod reminders;
mod routes;
mod scheduling;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::{config::Config, models::AppState, reminders::LogDispatcher};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;

    match &cfg.bootstrap_admin {
        Some(admin) => db::bootstrap_admin(&pool, admin).await?,
        None => tracing::debug!("no bootstrap admin configured"),
    }

    tracing::info!(
        offsets = ?cfg.reminder_offsets_hours,
        workday_start = cfg.workday_start_hour,
        workday_end = cfg.workday_end_hour,
        "scheduling configured"
    );

    let state = AppState {
        db: pool,
        session_ttl_hours: cfg.session_ttl_hours,
        reminder_offsets_hours: Arc::new(cfg.reminder_offsets_hours.clone()),
        workday_start_hour: cfg.workday_start_hour,
        workday_end_hour: cfg.workday_end_hour,
        dispatcher: Arc::new(LogDispatcher),
    };

    // Browser front desks call the API cross-origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
