// src/routes/user_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::hash_password,
    error::{ApiError, db_error},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    pagination::{PageQuery, Paginated},
    permissions::{Permission, Role, require},
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct UserPublicRow {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub role: i16,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub display_name: String,
    pub password: String,
    pub role: i16,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub display_name: Option<String>,
    pub role: Option<i16>,
    pub is_active: Option<bool>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        // /api/v1/users
        .route("/", get(list_users).post(create_user))
        // /api/v1/users/{user_id}
        .route("/{user_id}", get(get_user).patch(update_user))
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<PageQuery>,
) -> Result<Json<Paginated<UserPublicRow>>, ApiError> {
    require(&auth, Permission::ManageUsers)?;
    let page = q.resolve();

    let total: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM hms_user"#)
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;

    let users: Vec<UserPublicRow> = sqlx::query_as::<_, UserPublicRow>(
        r#"
        SELECT user_id, username, display_name, role, is_active, created_at
        FROM hms_user
        ORDER BY created_at DESC, username ASC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(page.limit)
    .bind(page.offset())
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(Paginated::new(users, page, total)))
}

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    require(&auth, Permission::ManageUsers)?;

    let user: UserPublicRow = sqlx::query_as::<_, UserPublicRow>(
        r#"
        SELECT user_id, username, display_name, role, is_active, created_at
        FROM hms_user
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    Ok(Json(ApiOk::new(user)))
}

fn validate_role(role: i16) -> Result<(), ApiError> {
    if Role::from_i16(role).is_none() {
        return Err(ApiError::validation("role must be one of 0..4"));
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), ApiError> {
    let u = username.trim();
    if u.is_empty() {
        return Err(ApiError::validation("username is required"));
    }
    if u.len() < 3 {
        return Err(ApiError::validation("username must be at least 3 characters"));
    }
    Ok(())
}

fn validate_display_name(display_name: &str) -> Result<(), ApiError> {
    if display_name.trim().is_empty() {
        return Err(ApiError::validation("display_name is required"));
    }
    Ok(())
}

fn validate_password(pw: &str) -> Result<(), ApiError> {
    if pw.trim().len() < 8 {
        return Err(ApiError::validation("password must be at least 8 characters"));
    }
    Ok(())
}

pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    require(&auth, Permission::ManageUsers)?;

    validate_username(&req.username)?;
    validate_display_name(&req.display_name)?;
    validate_password(&req.password)?;
    validate_role(req.role)?;

    let pw_hash = hash_password(req.password.trim())?;

    // duplicate usernames surface as 409 through db_error
    let user: UserPublicRow = sqlx::query_as::<_, UserPublicRow>(
        r#"
        INSERT INTO hms_user (username, display_name, password_hash, role, is_active)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING user_id, username, display_name, role, is_active, created_at
        "#,
    )
    .bind(req.username.trim())
    .bind(req.display_name.trim())
    .bind(&pw_hash)
    .bind(req.role)
    .bind(req.is_active.unwrap_or(true))
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(user_id = %user.user_id, role = user.role, "user created");
    Ok(Json(ApiOk::new(user)))
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<ApiOk<UserPublicRow>>, ApiError> {
    require(&auth, Permission::ManageUsers)?;

    if let Some(name) = req.display_name.as_deref() {
        validate_display_name(name)?;
    }
    if let Some(role) = req.role {
        validate_role(role)?;
    }
    if user_id == auth.user_id && req.is_active == Some(false) {
        return Err(ApiError::validation("you cannot disable your own account"));
    }

    let updated: UserPublicRow = sqlx::query_as::<_, UserPublicRow>(
        r#"
        UPDATE hms_user
        SET display_name = COALESCE($2, display_name),
            role = COALESCE($3, role),
            is_active = COALESCE($4, is_active)
        WHERE user_id = $1
        RETURNING user_id, username, display_name, role, is_active, created_at
        "#,
    )
    .bind(user_id)
    .bind(req.display_name.as_deref().map(str::trim))
    .bind(req.role)
    .bind(req.is_active)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("user"))?;

    if req.is_active == Some(false) {
        sqlx::query(
            r#"
            UPDATE session_token
            SET revoked_at = now()
            WHERE user_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .execute(&state.db)
        .await
        .map_err(db_error)?;
    }

    Ok(Json(ApiOk::new(updated)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_role_bounds() {
        assert!(validate_role(0).is_ok());
        assert!(validate_role(2).is_ok());
        assert!(validate_role(4).is_ok());

        assert!(validate_role(-1).is_err());
        assert!(validate_role(5).is_err());
        assert!(validate_role(100).is_err());
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("nurse.kavya").is_ok());
        assert!(validate_username("al").is_err()); // Too short
        assert!(validate_username("").is_err());
        assert!(validate_username("  ").is_err()); // Only whitespace
    }

    #[test]
    fn test_validate_password() {
        assert!(validate_password("password123").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password("").is_err());
    }
}
