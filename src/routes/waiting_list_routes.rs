// src/routes/waiting_list_routes.rs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;
use uuid::Uuid;

use crate::{
    error::{ApiError, db_error},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    pagination::{PageQuery, Paginated},
    permissions::{Permission, require},
    routes::appointment_routes::scoped_doctor_filter,
    scheduling::{AppointmentStatus, WaitingPriority, WaitingStatus, waiting_status_for},
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct WaitingListRow {
    pub waiting_list_id: Uuid,
    pub appointment_id: Uuid,
    pub appointment_start: DateTime<Utc>,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub doctor_id: Uuid,
    pub queue_date: NaiveDate,
    pub queue_number: i32,
    pub priority: WaitingPriority,
    pub status: WaitingStatus,
    pub called_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const WAITING_SELECT: &str = r#"
    SELECT
      w.waiting_list_id,
      w.appointment_id,
      a.start_time AS appointment_start,
      w.patient_id,
      p.first_name || ' ' || p.last_name AS patient_name,
      w.doctor_id,
      w.queue_date,
      w.queue_number,
      w.priority,
      w.status,
      w.called_at,
      w.completed_at,
      w.notes,
      w.created_at,
      w.updated_at
    FROM waiting_list w
    JOIN appointment a ON a.appointment_id = w.appointment_id
    JOIN patient p ON p.patient_id = w.patient_id
"#;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/waiting_list", get(list_waiting).post(create_waiting_entry))
        .route("/waiting_list/{waiting_list_id}/status", patch(update_waiting_status))
}

async fn fetch_entry<'e, E>(exec: E, waiting_list_id: Uuid) -> Result<WaitingListRow, ApiError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, WaitingListRow>(&format!(
        "{WAITING_SELECT} WHERE w.waiting_list_id = $1"
    ))
    .bind(waiting_list_id)
    .fetch_optional(exec)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("waiting list entry"))
}

/* ============================================================
   POST /waiting_list
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateWaitingRequest {
    pub appointment_id: Uuid,
    pub priority: Option<WaitingPriority>,
    pub notes: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct QueuedAppointment {
    patient_id: Uuid,
    doctor_id: Uuid,
    start_time: DateTime<Utc>,
    status: AppointmentStatus,
}

/// Only appointments that are still going to happen can join the queue.
fn ensure_queueable(status: AppointmentStatus) -> Result<(), ApiError> {
    if status.holds_slot() && status != AppointmentStatus::Completed {
        return Ok(());
    }
    Err(ApiError::validation(format!(
        "a {} appointment cannot join the waiting list",
        status.as_str()
    )))
}

pub async fn create_waiting_entry(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateWaitingRequest>,
) -> Result<(StatusCode, Json<ApiOk<WaitingListRow>>), ApiError> {
    require(&auth, Permission::ManageWaitingList)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    let appt: QueuedAppointment = sqlx::query_as::<_, QueuedAppointment>(
        r#"
        SELECT patient_id, doctor_id, start_time, status
        FROM appointment
        WHERE appointment_id = $1
        FOR UPDATE
        "#,
    )
    .bind(req.appointment_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("appointment"))?;

    ensure_queueable(appt.status)?;

    let already: bool = sqlx::query_scalar(
        r#"SELECT EXISTS (SELECT 1 FROM waiting_list WHERE appointment_id = $1)"#,
    )
    .bind(req.appointment_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_error)?;
    if already {
        return Err(ApiError::Conflict(
            "ALREADY_QUEUED",
            "appointment already has a waiting list entry".into(),
        ));
    }

    // queue numbers are handed out one doctor at a time
    sqlx::query(r#"SELECT doctor_id FROM doctor WHERE doctor_id = $1 FOR UPDATE"#)
        .bind(appt.doctor_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

    let queue_date = appt.start_time.date_naive();
    let queue_number: i32 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(MAX(queue_number), 0) + 1
        FROM waiting_list
        WHERE doctor_id = $1 AND queue_date = $2
        "#,
    )
    .bind(appt.doctor_id)
    .bind(queue_date)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_error)?;

    let status = waiting_status_for(appt.status).unwrap_or(WaitingStatus::Waiting);

    let waiting_list_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO waiting_list (
          appointment_id, patient_id, doctor_id, queue_date, queue_number, priority, status, notes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING waiting_list_id
        "#,
    )
    .bind(req.appointment_id)
    .bind(appt.patient_id)
    .bind(appt.doctor_id)
    .bind(queue_date)
    .bind(queue_number)
    .bind(req.priority.unwrap_or(WaitingPriority::Normal))
    .bind(status)
    .bind(req.notes.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .fetch_one(&mut *tx)
    .await
    .map_err(db_error)?;

    let entry = fetch_entry(&mut *tx, waiting_list_id).await?;
    tx.commit().await.map_err(db_error)?;

    tracing::info!(
        %waiting_list_id,
        appointment_id = %req.appointment_id,
        queue_number,
        "patient added to waiting list"
    );
    Ok((StatusCode::CREATED, Json(ApiOk::new(entry))))
}

/* ============================================================
   GET /waiting_list
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct WaitingListQuery {
    pub doctor_id: Option<Uuid>,
    // defaults to today (UTC)
    pub date: Option<NaiveDate>,
    pub status: Option<WaitingStatus>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

fn push_waiting_filters(
    qb: &mut QueryBuilder<'_, sqlx::Postgres>,
    doctor_id: Option<Uuid>,
    date: NaiveDate,
    status: Option<WaitingStatus>,
) {
    qb.push(" WHERE w.queue_date = ");
    qb.push_bind(date);
    if let Some(id) = doctor_id {
        qb.push(" AND w.doctor_id = ");
        qb.push_bind(id);
    }
    if let Some(s) = status {
        qb.push(" AND w.status = ");
        qb.push_bind(s);
    }
}

pub async fn list_waiting(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<WaitingListQuery>,
) -> Result<Json<Paginated<WaitingListRow>>, ApiError> {
    require(&auth, Permission::ViewSchedule)?;
    let page = PageQuery { page: q.page, limit: q.limit }.resolve();
    let doctor_id = scoped_doctor_filter(&state, &auth, q.doctor_id).await?;
    let date = q.date.unwrap_or_else(|| Utc::now().date_naive());

    let mut count: QueryBuilder<sqlx::Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM waiting_list w");
    push_waiting_filters(&mut count, doctor_id, date, q.status);
    let total: i64 = count
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(WAITING_SELECT);
    push_waiting_filters(&mut qb, doctor_id, date, q.status);
    // waiting_priority is declared NORMAL, URGENT, EMERGENCY
    qb.push(" ORDER BY w.priority DESC, w.queue_number ASC LIMIT ");
    qb.push_bind(page.limit);
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let rows: Vec<WaitingListRow> = qb
        .build_query_as::<WaitingListRow>()
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    Ok(Json(Paginated::new(rows, page, total)))
}

/* ============================================================
   PATCH /waiting_list/{id}/status
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct WaitingStatusRequest {
    pub status: WaitingStatus,
}

/// (stamp called_at, stamp completed_at)
fn queue_stamps(status: WaitingStatus) -> (bool, bool) {
    match status {
        WaitingStatus::Called => (true, false),
        WaitingStatus::Completed => (false, true),
        _ => (false, false),
    }
}

pub async fn update_waiting_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(waiting_list_id): Path<Uuid>,
    Json(req): Json<WaitingStatusRequest>,
) -> Result<Json<ApiOk<WaitingListRow>>, ApiError> {
    require(&auth, Permission::ManageWaitingList)?;
    let (stamp_called, stamp_completed) = queue_stamps(req.status);

    let updated = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE waiting_list
        SET status = $2,
            called_at = CASE WHEN $3 THEN COALESCE(called_at, now()) ELSE called_at END,
            completed_at = CASE WHEN $4 THEN COALESCE(completed_at, now()) ELSE completed_at END,
            updated_at = now()
        WHERE waiting_list_id = $1
        RETURNING waiting_list_id
        "#,
    )
    .bind(waiting_list_id)
    .bind(req.status)
    .bind(stamp_called)
    .bind(stamp_completed)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?;

    if updated.is_none() {
        return Err(ApiError::not_found("waiting list entry"));
    }

    Ok(Json(ApiOk::new(fetch_entry(&state.db, waiting_list_id).await?)))
}
