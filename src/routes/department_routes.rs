// src/routes/department_routes.rs

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, db_error},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    permissions::{Permission, require},
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DepartmentRow {
    pub department_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub doctor_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateDepartmentRequest {
    pub name: String,
    pub description: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/departments", get(list_departments).post(create_department))
}

pub async fn list_departments(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<Vec<DepartmentRow>>>, ApiError> {
    require(&auth, Permission::ViewSchedule)?;

    let rows: Vec<DepartmentRow> = sqlx::query_as::<_, DepartmentRow>(
        r#"
        SELECT
          d.department_id,
          d.name,
          d.description,
          d.is_active,
          COUNT(doc.doctor_id) FILTER (WHERE doc.is_active) AS doctor_count
        FROM department d
        LEFT JOIN doctor doc ON doc.department_id = d.department_id
        WHERE d.is_active = true
        GROUP BY d.department_id
        ORDER BY d.name ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(rows)))
}

pub async fn create_department(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateDepartmentRequest>,
) -> Result<Json<ApiOk<DepartmentRow>>, ApiError> {
    require(&auth, Permission::ManageDoctors)?;

    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    if name.len() > 128 {
        return Err(ApiError::validation("name is too long (max 128)"));
    }

    let row: DepartmentRow = sqlx::query_as::<_, DepartmentRow>(
        r#"
        INSERT INTO department (name, description)
        VALUES ($1, $2)
        RETURNING department_id, name, description, is_active, 0::BIGINT AS doctor_count
        "#,
    )
    .bind(name)
    .bind(req.description.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(row)))
}
