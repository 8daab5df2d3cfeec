// src/routes/patient_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::{ApiError, db_error},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    pagination::{PageQuery, Paginated},
    permissions::{Permission, require},
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PatientRow {
    pub patient_id: Uuid,
    pub register_number: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub birthday: Option<chrono::NaiveDate>,
    pub gender: i16,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

const PATIENT_COLUMNS: &str =
    "patient_id, register_number, first_name, last_name, email, phone, birthday, gender, created_at, updated_at";

#[derive(Debug, Deserialize)]
pub struct CreatePatientRequest {
    pub register_number: Option<String>, // allow override, otherwise DB default generates it
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub birthday: Option<chrono::NaiveDate>,
    pub gender: Option<i16>, // 0,1,2
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/patients", post(create_patient).get(search_patients))
        .route("/patients/{patient_id}", get(get_patient).patch(update_patient))
}

pub(crate) fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // Only called when the field is present: null => Some(None), value => Some(Some(v)).
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn validate_gender(gender: i16) -> Result<(), ApiError> {
    if !(0..=2).contains(&gender) {
        return Err(ApiError::validation("gender must be 0,1,2"));
    }
    Ok(())
}

fn validate_email(email: Option<&str>) -> Result<(), ApiError> {
    if let Some(e) = email {
        let valid = e
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'))
            .unwrap_or(false);
        if !valid {
            return Err(ApiError::validation("email is not valid"));
        }
    }
    Ok(())
}

pub async fn create_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreatePatientRequest>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    require(&auth, Permission::ManagePatients)?;

    let first_name = req.first_name.trim();
    let last_name = req.last_name.trim();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(ApiError::validation("first_name and last_name are required"));
    }
    let gender = req.gender.unwrap_or(0);
    validate_gender(gender)?;

    let email = normalize_optional(req.email.as_deref()).map(|e| e.to_lowercase());
    validate_email(email.as_deref())?;
    let phone = normalize_optional(req.phone.as_deref());

    // duplicate email / register number is a 409 through db_error
    let row: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        r#"
        INSERT INTO patient (register_number, first_name, last_name, email, phone, birthday, gender)
        VALUES (COALESCE($1, 'P' || nextval('patient_register_seq')::TEXT), $2, $3, $4, $5, $6, $7)
        RETURNING {PATIENT_COLUMNS}
        "#
    ))
    .bind(normalize_optional(req.register_number.as_deref()))
    .bind(first_name)
    .bind(last_name)
    .bind(email)
    .bind(phone)
    .bind(req.birthday)
    .bind(gender)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    tracing::info!(patient_id = %row.patient_id, register_number = %row.register_number, "patient registered");
    Ok(Json(ApiOk::new(row)))
}

pub(crate) async fn fetch_patient(state: &AppState, patient_id: Uuid) -> Result<PatientRow, ApiError> {
    sqlx::query_as::<_, PatientRow>(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patient WHERE patient_id = $1"
    ))
    .bind(patient_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("patient"))
}

pub async fn get_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    require(&auth, Permission::ViewPatients)?;
    Ok(Json(ApiOk::new(fetch_patient(&state, patient_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

fn push_search_filter(qb: &mut QueryBuilder<'_, sqlx::Postgres>, q: &SearchQuery) {
    if let Some(keyword) = q.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let like = format!("%{keyword}%");
        qb.push(" WHERE register_number ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR first_name ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR last_name ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR phone ILIKE ");
        qb.push_bind(like);
    }
}

pub async fn search_patients(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Paginated<PatientRow>>, ApiError> {
    require(&auth, Permission::ViewPatients)?;
    let page = PageQuery { page: q.page, limit: q.limit }.resolve();

    let mut count: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM patient");
    push_search_filter(&mut count, &q);
    let total: i64 = count
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;

    let mut qb: QueryBuilder<sqlx::Postgres> =
        QueryBuilder::new(format!("SELECT {PATIENT_COLUMNS} FROM patient"));
    push_search_filter(&mut qb, &q);
    qb.push(" ORDER BY created_at DESC, patient_id ASC LIMIT ");
    qb.push_bind(page.limit);
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let rows: Vec<PatientRow> = qb
        .build_query_as::<PatientRow>()
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    Ok(Json(Paginated::new(rows, page, total)))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePatientRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub phone: Option<Option<String>>,
    pub birthday: Option<chrono::NaiveDate>,
    pub gender: Option<i16>,
}

pub async fn update_patient(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Json(req): Json<UpdatePatientRequest>,
) -> Result<Json<ApiOk<PatientRow>>, ApiError> {
    require(&auth, Permission::ManagePatients)?;

    let existing = fetch_patient(&state, patient_id).await?;

    let first_name = normalize_optional(req.first_name.as_deref()).unwrap_or(existing.first_name);
    let last_name = normalize_optional(req.last_name.as_deref()).unwrap_or(existing.last_name);

    // absent => keep, null or "" => clear
    let email = match req.email {
        None => existing.email,
        Some(v) => normalize_optional(v.as_deref()).map(|e| e.to_lowercase()),
    };
    let phone = match req.phone {
        None => existing.phone,
        Some(v) => normalize_optional(v.as_deref()),
    };
    validate_email(email.as_deref())?;

    let birthday = req.birthday.or(existing.birthday);
    let gender = req.gender.unwrap_or(existing.gender);
    validate_gender(gender)?;

    let updated: PatientRow = sqlx::query_as::<_, PatientRow>(&format!(
        r#"
        UPDATE patient
        SET first_name = $1,
            last_name = $2,
            email = $3,
            phone = $4,
            birthday = $5,
            gender = $6,
            updated_at = now()
        WHERE patient_id = $7
        RETURNING {PATIENT_COLUMNS}
        "#
    ))
    .bind(first_name)
    .bind(last_name)
    .bind(email)
    .bind(phone)
    .bind(birthday)
    .bind(gender)
    .bind(patient_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(updated)))
}
