// src/routes/doctor_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::{ApiError, db_error},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    pagination::{PageQuery, Paginated},
    permissions::{Permission, require},
    scheduling::{BookedSlot, available_slots},
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DoctorRow {
    pub doctor_id: Uuid,
    pub user_id: Option<Uuid>,
    pub department_id: Uuid,
    pub department_name: String,
    pub first_name: String,
    pub last_name: String,
    pub specialization: Option<String>,
    pub consultation_minutes: i32,
    pub is_active: bool,
}

const DOCTOR_SELECT: &str = r#"
    SELECT
      d.doctor_id,
      d.user_id,
      d.department_id,
      dep.name AS department_name,
      d.first_name,
      d.last_name,
      d.specialization,
      d.consultation_minutes,
      d.is_active
    FROM doctor d
    JOIN department dep ON dep.department_id = d.department_id
"#;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/doctors", get(list_doctors).post(create_doctor))
        .route("/doctors/{doctor_id}", get(get_doctor))
        .route("/doctors/{doctor_id}/slots", get(get_available_slots))
}

#[derive(Debug, Deserialize)]
pub struct DoctorListQuery {
    pub department_id: Option<Uuid>,
    pub q: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

fn push_doctor_filters(qb: &mut QueryBuilder<'_, sqlx::Postgres>, q: &DoctorListQuery) {
    qb.push(" WHERE d.is_active = true ");
    if let Some(dep) = q.department_id {
        qb.push(" AND d.department_id = ");
        qb.push_bind(dep);
    }
    if let Some(keyword) = q.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let like = format!("%{keyword}%");
        qb.push(" AND (d.first_name ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR d.last_name ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR d.specialization ILIKE ");
        qb.push_bind(like);
        qb.push(") ");
    }
}

pub async fn list_doctors(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<DoctorListQuery>,
) -> Result<Json<Paginated<DoctorRow>>, ApiError> {
    require(&auth, Permission::ViewSchedule)?;
    let page = PageQuery { page: q.page, limit: q.limit }.resolve();

    let mut count: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM doctor d");
    push_doctor_filters(&mut count, &q);
    let total: i64 = count
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(DOCTOR_SELECT);
    push_doctor_filters(&mut qb, &q);
    qb.push(" ORDER BY d.last_name ASC, d.first_name ASC LIMIT ");
    qb.push_bind(page.limit);
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let rows: Vec<DoctorRow> = qb
        .build_query_as::<DoctorRow>()
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    Ok(Json(Paginated::new(rows, page, total)))
}

async fn fetch_doctor(state: &AppState, doctor_id: Uuid) -> Result<DoctorRow, ApiError> {
    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(DOCTOR_SELECT);
    qb.push(" WHERE d.doctor_id = ");
    qb.push_bind(doctor_id);

    qb.build_query_as::<DoctorRow>()
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| ApiError::not_found("doctor"))
}

pub async fn get_doctor(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(doctor_id): Path<Uuid>,
) -> Result<Json<ApiOk<DoctorRow>>, ApiError> {
    require(&auth, Permission::ViewSchedule)?;
    Ok(Json(ApiOk::new(fetch_doctor(&state, doctor_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct CreateDoctorRequest {
    pub department_id: Uuid,
    pub user_id: Option<Uuid>,
    pub first_name: String,
    pub last_name: String,
    pub specialization: Option<String>,
    pub consultation_minutes: Option<i32>,
}

pub async fn create_doctor(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateDoctorRequest>,
) -> Result<Json<ApiOk<DoctorRow>>, ApiError> {
    require(&auth, Permission::ManageDoctors)?;

    let first_name = req.first_name.trim();
    let last_name = req.last_name.trim();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(ApiError::validation("first_name and last_name are required"));
    }
    let minutes = req.consultation_minutes.unwrap_or(30);
    if !(5..=240).contains(&minutes) {
        return Err(ApiError::validation("consultation_minutes must be between 5 and 240"));
    }

    let doctor_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO doctor (department_id, user_id, first_name, last_name, specialization, consultation_minutes)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING doctor_id
        "#,
    )
    .bind(req.department_id)
    .bind(req.user_id)
    .bind(first_name)
    .bind(last_name)
    .bind(req.specialization.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .bind(minutes)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(fetch_doctor(&state, doctor_id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    // YYYY-MM-DD, interpreted in UTC
    pub date: String,
    pub slot_minutes: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SlotDto {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SlotsData {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub slot_minutes: i64,
    pub slots: Vec<SlotDto>,
}

pub async fn get_available_slots(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(doctor_id): Path<Uuid>,
    Query(q): Query<SlotsQuery>,
) -> Result<Json<ApiOk<SlotsData>>, ApiError> {
    require(&auth, Permission::ViewSchedule)?;

    let date = NaiveDate::parse_from_str(q.date.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::validation("date must be YYYY-MM-DD"))?;

    let doctor = fetch_doctor(&state, doctor_id).await?;
    let slot_minutes = q.slot_minutes.unwrap_or(i64::from(doctor.consultation_minutes));
    if !(5..=240).contains(&slot_minutes) {
        return Err(ApiError::validation("slot_minutes must be between 5 and 240"));
    }

    let day_start = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    let day_end = day_start + Duration::days(1);

    let booked: Vec<BookedSlot> = sqlx::query_as::<_, BookedSlot>(
        r#"
        SELECT appointment_id, start_time, end_time, status
        FROM appointment
        WHERE doctor_id = $1
          AND status NOT IN ('CANCELLED', 'RESCHEDULED', 'NO_SHOW')
          AND start_time < $3
          AND end_time > $2
        ORDER BY start_time ASC
        "#,
    )
    .bind(doctor_id)
    .bind(day_start)
    .bind(day_end)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let slots = available_slots(
        date,
        state.workday_start_hour,
        state.workday_end_hour,
        slot_minutes,
        &booked,
    )
    .into_iter()
    .map(|r| SlotDto {
        start_time: r.start,
        end_time: r.end,
    })
    .collect();

    Ok(Json(ApiOk::new(SlotsData {
        doctor_id,
        date,
        slot_minutes,
        slots,
    })))
}
