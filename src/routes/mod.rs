use crate::models::{ApiOk, AppState};
use axum::{Json, Router, routing::get};
use serde::Serialize;

pub mod appointment_routes;
pub mod auth_routes;
pub mod department_routes;
pub mod doctor_routes;
pub mod home_routes;
pub mod patient_routes;
pub mod reminder_routes;
pub mod user_routes;
pub mod waiting_list_routes;

#[derive(Debug, Serialize)]
pub struct HealthData {
    pub status: &'static str,
    pub version: &'static str,
}

async fn health() -> Json<ApiOk<HealthData>> {
    Json(ApiOk::new(HealthData {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

fn api_router() -> Router<AppState> {
    Router::new()
        .merge(home_routes::router())
        .merge(department_routes::router())
        .merge(doctor_routes::router())
        .merge(patient_routes::router())
        .merge(appointment_routes::router())
        .merge(reminder_routes::router())
        .merge(waiting_list_routes::router())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/auth", auth_routes::router())
        .nest("/api/v1/users", user_routes::router())
        .nest("/api/v1", api_router())
        .with_state(state)
}
