// src/routes/appointment_routes.rs

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, QueryBuilder};
use uuid::Uuid;

use crate::{
    error::{ApiError, db_error},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, PersonBrief},
    pagination::{Page, PageQuery, Paginated},
    permissions::{Permission, is_doctor, require},
    reminders::{ReminderChannel, ReminderSubject, format_message, plan_reminders, shift_scheduled_time},
    routes::patient_routes::{deserialize_double_option, fetch_patient},
    routes::reminder_routes::{cancel_pending_for_appointment, insert_reminders, resolve_channels},
    scheduling::{
        AppointmentStatus, AppointmentType, BookedSlot, ConfirmationStatus, StatusChangeInput,
        TimeRange, WaitingStatus, check_conflict, follow_up_title, plan_status_change,
    },
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment).patch(edit_appointment),
        )
        .route("/appointments/{appointment_id}/status", patch(update_status))
        .route("/appointments/{appointment_id}/cancel", post(cancel_appointment))
        .route("/appointments/{appointment_id}/reschedule", post(reschedule_appointment))
        .route("/patients/{patient_id}/appointments", get(list_patient_appointments))
}

/* ============================================================
   Rows & DTOs
   ============================================================ */

#[derive(Debug, sqlx::FromRow)]
struct AppointmentDetailRow {
    appointment_id: Uuid,
    patient_id: Uuid,
    p_first: String,
    p_last: String,
    p_reg: String,
    doctor_id: Uuid,
    d_first: String,
    d_last: String,
    department_id: Option<Uuid>,
    department_name: Option<String>,
    appointment_type: AppointmentType,
    title: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration_minutes: i32,
    status: AppointmentStatus,
    confirmation_status: ConfirmationStatus,
    confirmation_time: Option<DateTime<Utc>>,
    check_in_time: Option<DateTime<Utc>>,
    check_out_time: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    cancelled_by_user_id: Option<Uuid>,
    no_show_at: Option<DateTime<Utc>>,
    no_show_reason: Option<String>,
    notes: Option<String>,
    follow_up_needed: bool,
    follow_up_date: Option<DateTime<Utc>>,
    follow_up_of_id: Option<Uuid>,
    rescheduled_from_id: Option<Uuid>,
    reschedule_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct AppointmentDto {
    pub appointment_id: Uuid,
    pub patient: PersonBrief,
    pub patient_register_number: String,
    pub doctor: PersonBrief,
    pub department_id: Option<Uuid>,
    pub department_name: Option<String>,
    pub appointment_type: AppointmentType,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: AppointmentStatus,
    pub confirmation_status: ConfirmationStatus,
    pub confirmation_time: Option<DateTime<Utc>>,
    pub check_in_time: Option<DateTime<Utc>>,
    pub check_out_time: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub cancelled_by_user_id: Option<Uuid>,
    pub no_show_at: Option<DateTime<Utc>>,
    pub no_show_reason: Option<String>,
    pub notes: Option<String>,
    pub follow_up_needed: bool,
    pub follow_up_date: Option<DateTime<Utc>>,
    pub follow_up_of_id: Option<Uuid>,
    pub rescheduled_from_id: Option<Uuid>,
    pub reschedule_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AppointmentDetailRow> for AppointmentDto {
    fn from(r: AppointmentDetailRow) -> Self {
        AppointmentDto {
            appointment_id: r.appointment_id,
            patient: PersonBrief {
                id: r.patient_id,
                display: format!("{} {}", r.p_first, r.p_last),
            },
            patient_register_number: r.p_reg,
            doctor: PersonBrief {
                id: r.doctor_id,
                display: format!("{} {}", r.d_first, r.d_last),
            },
            department_id: r.department_id,
            department_name: r.department_name,
            appointment_type: r.appointment_type,
            title: r.title,
            start_time: r.start_time,
            end_time: r.end_time,
            duration_minutes: r.duration_minutes,
            status: r.status,
            confirmation_status: r.confirmation_status,
            confirmation_time: r.confirmation_time,
            check_in_time: r.check_in_time,
            check_out_time: r.check_out_time,
            cancelled_at: r.cancelled_at,
            cancel_reason: r.cancel_reason,
            cancelled_by_user_id: r.cancelled_by_user_id,
            no_show_at: r.no_show_at,
            no_show_reason: r.no_show_reason,
            notes: r.notes,
            follow_up_needed: r.follow_up_needed,
            follow_up_date: r.follow_up_date,
            follow_up_of_id: r.follow_up_of_id,
            rescheduled_from_id: r.rescheduled_from_id,
            reschedule_reason: r.reschedule_reason,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

const APPOINTMENT_SELECT: &str = r#"
    SELECT
      a.appointment_id,
      a.patient_id,
      p.first_name AS p_first,
      p.last_name  AS p_last,
      p.register_number AS p_reg,
      a.doctor_id,
      d.first_name AS d_first,
      d.last_name  AS d_last,
      a.department_id,
      dep.name AS department_name,
      a.appointment_type,
      a.title,
      a.start_time,
      a.end_time,
      a.duration_minutes,
      a.status,
      a.confirmation_status,
      a.confirmation_time,
      a.check_in_time,
      a.check_out_time,
      a.cancelled_at,
      a.cancel_reason,
      a.cancelled_by_user_id,
      a.no_show_at,
      a.no_show_reason,
      a.notes,
      a.follow_up_needed,
      a.follow_up_date,
      a.follow_up_of_id,
      a.rescheduled_from_id,
      a.reschedule_reason,
      a.created_at,
      a.updated_at
    FROM appointment a
    JOIN patient p ON p.patient_id = a.patient_id
    JOIN doctor d ON d.doctor_id = a.doctor_id
    LEFT JOIN department dep ON dep.department_id = a.department_id
"#;

/// The columns a status change or reschedule needs, read under a row lock.
#[derive(Debug, sqlx::FromRow)]
struct LockedAppointment {
    patient_id: Uuid,
    doctor_id: Uuid,
    department_id: Option<Uuid>,
    appointment_type: AppointmentType,
    title: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration_minutes: i32,
    status: AppointmentStatus,
    notes: Option<String>,
}

/* ============================================================
   Shared helpers
   ============================================================ */

pub(crate) async fn fetch_appointment<'e, E>(
    exec: E,
    appointment_id: Uuid,
) -> Result<AppointmentDto, ApiError>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, AppointmentDetailRow>(&format!(
        "{APPOINTMENT_SELECT} WHERE a.appointment_id = $1"
    ))
    .bind(appointment_id)
    .fetch_optional(exec)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("appointment"))?;

    Ok(row.into())
}

pub(crate) async fn resolve_doctor_id_by_user_id(
    state: &AppState,
    user_id: Uuid,
) -> Result<Uuid, ApiError> {
    sqlx::query_scalar::<_, Uuid>(r#"SELECT doctor_id FROM doctor WHERE user_id = $1"#)
        .bind(user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(db_error)?
        .ok_or_else(|| {
            ApiError::BadRequest(
                "NO_DOCTOR_PROFILE",
                "Doctor account has no doctor profile".into(),
            )
        })
}

/// The caller's own doctor id, or `None` for roles that are not scoped.
async fn caller_doctor_id(state: &AppState, auth: &AuthContext) -> Result<Option<Uuid>, ApiError> {
    if !is_doctor(auth) {
        return Ok(None);
    }
    resolve_doctor_id_by_user_id(state, auth.user_id).await.map(Some)
}

fn check_doctor_scope(mine: Option<Uuid>, doctor_id: Uuid) -> Result<(), ApiError> {
    match mine {
        Some(mine) if mine != doctor_id => Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Doctor can only access their own appointments".into(),
        )),
        _ => Ok(()),
    }
}

/// Doctors only see and act on their own appointments.
pub(crate) async fn ensure_doctor_scope(
    state: &AppState,
    auth: &AuthContext,
    doctor_id: Uuid,
) -> Result<(), ApiError> {
    let mine = caller_doctor_id(state, auth).await?;
    check_doctor_scope(mine, doctor_id)
}

async fn lock_appointment(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> Result<LockedAppointment, ApiError> {
    sqlx::query_as::<_, LockedAppointment>(
        r#"
        SELECT patient_id, doctor_id, department_id, appointment_type, title,
               start_time, end_time, duration_minutes, status, notes
        FROM appointment
        WHERE appointment_id = $1
        FOR UPDATE
        "#,
    )
    .bind(appointment_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("appointment"))
}

#[derive(Debug, sqlx::FromRow)]
struct LockedDoctor {
    department_id: Uuid,
    is_active: bool,
}

/// Row lock on the doctor serialises concurrent bookings for that doctor until
/// the surrounding transaction ends.
async fn lock_doctor(conn: &mut PgConnection, doctor_id: Uuid) -> Result<LockedDoctor, ApiError> {
    sqlx::query_as::<_, LockedDoctor>(
        r#"SELECT department_id, is_active FROM doctor WHERE doctor_id = $1 FOR UPDATE"#,
    )
    .bind(doctor_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("doctor"))
}

async fn booked_slots_around(
    conn: &mut PgConnection,
    doctor_id: Uuid,
    range: &TimeRange,
) -> Result<Vec<BookedSlot>, ApiError> {
    sqlx::query_as::<_, BookedSlot>(
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
    .bind(range.start)
    .bind(range.end)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error)
}

/// Lock the doctor and reject `range` if it clashes with their active
/// appointments. Returns the doctor's department.
async fn lock_and_check_conflict(
    conn: &mut PgConnection,
    doctor_id: Uuid,
    range: TimeRange,
    ignore: Option<Uuid>,
) -> Result<Uuid, ApiError> {
    let doctor = lock_doctor(conn, doctor_id).await?;
    if !doctor.is_active {
        return Err(ApiError::validation("doctor is not active"));
    }
    let booked = booked_slots_around(conn, doctor_id, &range).await?;
    check_conflict(&range, &booked, ignore)?;
    Ok(doctor.department_id)
}

struct NewAppointment<'a> {
    patient_id: Uuid,
    doctor_id: Uuid,
    department_id: Option<Uuid>,
    appointment_type: AppointmentType,
    title: &'a str,
    range: TimeRange,
    notes: Option<&'a str>,
    follow_up_of_id: Option<Uuid>,
    rescheduled_from_id: Option<Uuid>,
    created_by: Uuid,
}

async fn insert_appointment(
    conn: &mut PgConnection,
    new: &NewAppointment<'_>,
) -> Result<Uuid, ApiError> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO appointment (
          patient_id,
          doctor_id,
          department_id,
          appointment_type,
          title,
          start_time,
          end_time,
          duration_minutes,
          notes,
          follow_up_of_id,
          rescheduled_from_id,
          created_by_user_id,
          updated_by_user_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
        RETURNING appointment_id
        "#,
    )
    .bind(new.patient_id)
    .bind(new.doctor_id)
    .bind(new.department_id)
    .bind(new.appointment_type)
    .bind(new.title)
    .bind(new.range.start)
    .bind(new.range.end)
    .bind(new.range.duration_minutes())
    .bind(new.notes)
    .bind(new.follow_up_of_id)
    .bind(new.rescheduled_from_id)
    .bind(new.created_by)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)
}

/// Create the configured default reminders for a freshly booked appointment.
async fn schedule_default_reminders(
    state: &AppState,
    conn: &mut PgConnection,
    appointment_id: Uuid,
    channels: &[ReminderChannel],
) -> Result<usize, ApiError> {
    let appt = fetch_appointment(&mut *conn, appointment_id).await?;
    let subject = ReminderSubject {
        patient_name: &appt.patient.display,
        doctor_name: &appt.doctor.display,
        start_time: appt.start_time,
    };
    let planned = plan_reminders(&subject, &state.reminder_offsets_hours, channels, Utc::now());
    Ok(insert_reminders(conn, appointment_id, &planned).await?.len())
}

fn validate_title(title: &str) -> Result<String, ApiError> {
    let t = title.trim();
    if t.is_empty() {
        return Err(ApiError::validation("title is required"));
    }
    if t.chars().count() > 200 {
        return Err(ApiError::validation("title is too long (max 200)"));
    }
    Ok(t.to_string())
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/* ============================================================
   GET /appointments, GET /patients/{id}/appointments
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct AppointmentListQuery {
    pub doctor_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    // YYYY-MM-DD, whole UTC day
    pub date: Option<NaiveDate>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default)]
struct AppointmentFilter {
    doctor_id: Option<Uuid>,
    patient_id: Option<Uuid>,
    status: Option<AppointmentStatus>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    newest_first: bool,
}

/// Turn `date` or `from`/`to` into a `[from, to)` window on start_time.
fn resolve_window(
    date: Option<NaiveDate>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), ApiError> {
    if let Some(d) = date {
        if from.is_some() || to.is_some() {
            return Err(ApiError::validation("use either date or from/to, not both"));
        }
        let start = Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN));
        return Ok((Some(start), Some(start + Duration::days(1))));
    }
    if let (Some(f), Some(t)) = (from, to) {
        if t <= f {
            return Err(ApiError::validation("to must be after from"));
        }
    }
    Ok((from, to))
}

fn push_appointment_filters(qb: &mut QueryBuilder<'_, sqlx::Postgres>, f: &AppointmentFilter) {
    qb.push(" WHERE 1=1 ");
    if let Some(id) = f.doctor_id {
        qb.push(" AND a.doctor_id = ");
        qb.push_bind(id);
    }
    if let Some(id) = f.patient_id {
        qb.push(" AND a.patient_id = ");
        qb.push_bind(id);
    }
    if let Some(status) = f.status {
        qb.push(" AND a.status = ");
        qb.push_bind(status);
    }
    if let Some(from) = f.from {
        qb.push(" AND a.start_time >= ");
        qb.push_bind(from);
    }
    if let Some(to) = f.to {
        qb.push(" AND a.start_time < ");
        qb.push_bind(to);
    }
}

async fn query_appointments(
    state: &AppState,
    filter: &AppointmentFilter,
    page: Page,
) -> Result<Paginated<AppointmentDto>, ApiError> {
    let mut count: QueryBuilder<sqlx::Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM appointment a");
    push_appointment_filters(&mut count, filter);
    let total: i64 = count
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;

    let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(APPOINTMENT_SELECT);
    push_appointment_filters(&mut qb, filter);
    if filter.newest_first {
        qb.push(" ORDER BY a.start_time DESC, a.appointment_id ASC ");
    } else {
        qb.push(" ORDER BY a.start_time ASC, a.appointment_id ASC ");
    }
    qb.push(" LIMIT ");
    qb.push_bind(page.limit);
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let rows: Vec<AppointmentDetailRow> = qb
        .build_query_as::<AppointmentDetailRow>()
        .fetch_all(&state.db)
        .await
        .map_err(db_error)?;

    Ok(Paginated::new(
        rows.into_iter().map(AppointmentDto::from).collect(),
        page,
        total,
    ))
}

/// Doctors are pinned to their own schedule; asking for someone else's is a 403.
pub(crate) async fn scoped_doctor_filter(
    state: &AppState,
    auth: &AuthContext,
    requested: Option<Uuid>,
) -> Result<Option<Uuid>, ApiError> {
    if !is_doctor(auth) {
        return Ok(requested);
    }
    let mine = resolve_doctor_id_by_user_id(state, auth.user_id).await?;
    match requested {
        Some(id) if id != mine => Err(ApiError::Forbidden(
            "FORBIDDEN",
            "Doctor can only view their own schedule".into(),
        )),
        _ => Ok(Some(mine)),
    }
}

pub async fn list_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<AppointmentListQuery>,
) -> Result<Json<Paginated<AppointmentDto>>, ApiError> {
    require(&auth, Permission::ViewSchedule)?;
    let page = PageQuery { page: q.page, limit: q.limit }.resolve();
    let (from, to) = resolve_window(q.date, q.from, q.to)?;

    let filter = AppointmentFilter {
        doctor_id: scoped_doctor_filter(&state, &auth, q.doctor_id).await?,
        patient_id: q.patient_id,
        status: q.status,
        from,
        to,
        newest_first: false,
    };

    Ok(Json(query_appointments(&state, &filter, page).await?))
}

#[derive(Debug, Deserialize)]
pub struct PatientAppointmentsQuery {
    pub status: Option<AppointmentStatus>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list_patient_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(patient_id): Path<Uuid>,
    Query(q): Query<PatientAppointmentsQuery>,
) -> Result<Json<Paginated<AppointmentDto>>, ApiError> {
    require(&auth, Permission::ViewPatients)?;
    fetch_patient(&state, patient_id).await?;
    let page = PageQuery { page: q.page, limit: q.limit }.resolve();

    let filter = AppointmentFilter {
        doctor_id: scoped_doctor_filter(&state, &auth, None).await?,
        patient_id: Some(patient_id),
        status: q.status,
        newest_first: true,
        ..Default::default()
    };

    Ok(Json(query_appointments(&state, &filter, page).await?))
}

/* ============================================================
   GET /appointments/{id}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    require(&auth, Permission::ViewSchedule)?;
    let appt = fetch_appointment(&state.db, appointment_id).await?;
    ensure_doctor_scope(&state, &auth, appt.doctor.id).await?;
    Ok(Json(ApiOk::new(appt)))
}

/* ============================================================
   POST /appointments (book)
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub department_id: Option<Uuid>,
    pub appointment_type: Option<AppointmentType>,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub notes: Option<String>,
    pub send_reminders: Option<bool>,
    pub reminder_channels: Option<Vec<ReminderChannel>>,
}

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<ApiOk<AppointmentDto>>), ApiError> {
    require(&auth, Permission::BookAppointments)?;

    let title = validate_title(&req.title)?;
    let range = TimeRange::new(req.start_time, req.end_time)?;
    fetch_patient(&state, req.patient_id).await?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    let doctor_department = lock_and_check_conflict(&mut tx, req.doctor_id, range, None).await?;

    let appointment_id = insert_appointment(
        &mut tx,
        &NewAppointment {
            patient_id: req.patient_id,
            doctor_id: req.doctor_id,
            department_id: Some(req.department_id.unwrap_or(doctor_department)),
            appointment_type: req.appointment_type.unwrap_or(AppointmentType::Consultation),
            title: &title,
            range,
            notes: trimmed(req.notes.as_deref()),
            follow_up_of_id: None,
            rescheduled_from_id: None,
            created_by: auth.user_id,
        },
    )
    .await?;

    let reminders = if req.send_reminders.unwrap_or(true) {
        let channels = resolve_channels(req.reminder_channels);
        schedule_default_reminders(&state, &mut tx, appointment_id, &channels).await?
    } else {
        0
    };

    tx.commit().await.map_err(db_error)?;

    tracing::info!(
        %appointment_id,
        doctor_id = %req.doctor_id,
        patient_id = %req.patient_id,
        reminders,
        "appointment booked"
    );

    let appt = fetch_appointment(&state.db, appointment_id).await?;
    Ok((StatusCode::CREATED, Json(ApiOk::new(appt))))
}

/* ============================================================
   PATCH /appointments/{id}
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct EditAppointmentRequest {
    pub title: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub notes: Option<Option<String>>,
    pub appointment_type: Option<AppointmentType>,
    pub department_id: Option<Uuid>,
}

pub async fn edit_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<EditAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    require(&auth, Permission::BookAppointments)?;

    let title = req.title.as_deref().map(validate_title).transpose()?;
    let notes_present = req.notes.is_some();
    let notes = req.notes.flatten();

    let updated = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE appointment
        SET
          title = COALESCE($2, title),
          notes = CASE WHEN $3 THEN $4 ELSE notes END,
          appointment_type = COALESCE($5, appointment_type),
          department_id = COALESCE($6, department_id),
          updated_at = now(),
          updated_by_user_id = $7
        WHERE appointment_id = $1
        RETURNING appointment_id
        "#,
    )
    .bind(appointment_id)
    .bind(title)
    .bind(notes_present)
    .bind(trimmed(notes.as_deref()))
    .bind(req.appointment_type)
    .bind(req.department_id)
    .bind(auth.user_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?;

    if updated.is_none() {
        return Err(ApiError::not_found("appointment"));
    }

    Ok(Json(ApiOk::new(fetch_appointment(&state.db, appointment_id).await?)))
}

/* ============================================================
   PATCH /appointments/{id}/status, POST /appointments/{id}/cancel
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: AppointmentStatus,
    pub cancel_reason: Option<String>,
    pub no_show_reason: Option<String>,
    pub follow_up_needed: Option<bool>,
    pub follow_up_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatusChangeData {
    pub appointment: AppointmentDto,
    pub follow_up: Option<AppointmentDto>,
    pub follow_up_skipped_reason: Option<String>,
}

async fn apply_status_change(
    state: &AppState,
    auth: &AuthContext,
    appointment_id: Uuid,
    req: StatusUpdateRequest,
) -> Result<StatusChangeData, ApiError> {
    let target = req.status;
    // no second pool checkout while the row lock is held
    let mine = caller_doctor_id(state, auth).await?;
    let mut tx = state.db.begin().await.map_err(db_error)?;

    let current = lock_appointment(&mut tx, appointment_id).await?;
    check_doctor_scope(mine, current.doctor_id)?;

    let fx = plan_status_change(
        target,
        current.end_time,
        StatusChangeInput {
            cancel_reason: req.cancel_reason,
            no_show_reason: req.no_show_reason,
            follow_up_needed: req.follow_up_needed.unwrap_or(false),
            follow_up_date: req.follow_up_date,
        },
    )?;

    // a released slot may have been taken in the meantime
    if !current.status.holds_slot() && target.holds_slot() {
        let range = TimeRange {
            start: current.start_time,
            end: current.end_time,
        };
        lock_and_check_conflict(&mut tx, current.doctor_id, range, Some(appointment_id)).await?;
    }

    sqlx::query(
        r#"
        UPDATE appointment
        SET
          status = $2,
          confirmation_status = CASE WHEN $3 THEN 'CONFIRMED'::confirmation_status ELSE confirmation_status END,
          confirmation_time = CASE WHEN $3 THEN COALESCE(confirmation_time, now()) ELSE confirmation_time END,
          check_in_time  = CASE WHEN $4 THEN COALESCE(check_in_time, now()) ELSE check_in_time END,
          check_out_time = CASE WHEN $5 THEN COALESCE(check_out_time, now()) ELSE check_out_time END,
          cancelled_at = CASE WHEN $6::TEXT IS NOT NULL THEN now() ELSE cancelled_at END,
          cancel_reason = COALESCE($6::TEXT, cancel_reason),
          cancelled_by_user_id = CASE WHEN $6::TEXT IS NOT NULL THEN $11 ELSE cancelled_by_user_id END,
          no_show_at = CASE WHEN $7 THEN now() ELSE no_show_at END,
          no_show_reason = CASE WHEN $7 THEN $8 ELSE no_show_reason END,
          follow_up_needed = CASE WHEN $9 THEN true ELSE follow_up_needed END,
          follow_up_date = COALESCE($10, follow_up_date),
          updated_at = now(),
          updated_by_user_id = $11
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(target)
    .bind(fx.confirm)
    .bind(fx.stamp_check_in)
    .bind(fx.stamp_check_out)
    .bind(fx.cancel_reason.as_deref())
    .bind(fx.mark_no_show)
    .bind(fx.no_show_reason.as_deref())
    .bind(fx.follow_up.is_some())
    .bind(fx.follow_up.as_ref().map(|f| f.start))
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    if let Some(ws) = fx.waiting_list_status {
        sqlx::query(
            r#"
            UPDATE waiting_list
            SET status = $2,
                completed_at = CASE WHEN $3 THEN COALESCE(completed_at, now()) ELSE completed_at END,
                updated_at = now()
            WHERE appointment_id = $1
            "#,
        )
        .bind(appointment_id)
        .bind(ws)
        .bind(ws == WaitingStatus::Completed)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
    }

    if fx.cancel_pending_reminders {
        let n = cancel_pending_for_appointment(&mut tx, appointment_id).await?;
        tracing::debug!(%appointment_id, cancelled = n, "pending reminders cancelled");
    }

    let mut follow_up_id: Option<Uuid> = None;
    let mut follow_up_skipped_reason: Option<String> = None;

    if let Some(plan) = fx.follow_up.as_ref() {
        let minutes = i64::from(current.duration_minutes.max(1));
        let range = TimeRange::new(plan.start, plan.start + Duration::minutes(minutes))?;

        let doctor = lock_doctor(&mut tx, current.doctor_id).await?;
        let booked = booked_slots_around(&mut tx, current.doctor_id, &range).await?;

        let clash = if doctor.is_active {
            check_conflict(&range, &booked, None).err().map(|e| e.to_string())
        } else {
            Some("doctor is no longer active".to_string())
        };

        match clash {
            Some(reason) => {
                tracing::warn!(%appointment_id, %reason, "follow-up not booked");
                follow_up_skipped_reason = Some(reason);
            }
            None => {
                let title = follow_up_title(&current.title);
                let id = insert_appointment(
                    &mut tx,
                    &NewAppointment {
                        patient_id: current.patient_id,
                        doctor_id: current.doctor_id,
                        department_id: current.department_id,
                        appointment_type: AppointmentType::FollowUp,
                        title: &title,
                        range,
                        notes: current.notes.as_deref(),
                        follow_up_of_id: Some(appointment_id),
                        rescheduled_from_id: None,
                        created_by: auth.user_id,
                    },
                )
                .await?;
                schedule_default_reminders(state, &mut tx, id, &resolve_channels(None)).await?;
                follow_up_id = Some(id);
            }
        }
    }

    tx.commit().await.map_err(db_error)?;

    tracing::info!(
        %appointment_id,
        from = current.status.as_str(),
        to = target.as_str(),
        "appointment status changed"
    );

    let appointment = fetch_appointment(&state.db, appointment_id).await?;
    let follow_up = match follow_up_id {
        Some(id) => Some(fetch_appointment(&state.db, id).await?),
        None => None,
    };

    Ok(StatusChangeData {
        appointment,
        follow_up,
        follow_up_skipped_reason,
    })
}

pub async fn update_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<Json<ApiOk<StatusChangeData>>, ApiError> {
    require(&auth, Permission::UpdateAppointmentStatus)?;
    let data = apply_status_change(&state, &auth, appointment_id, req).await?;
    Ok(Json(ApiOk::new(data)))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<ApiOk<AppointmentDto>>, ApiError> {
    require(&auth, Permission::BookAppointments)?;
    let data = apply_status_change(
        &state,
        &auth,
        appointment_id,
        StatusUpdateRequest {
            status: AppointmentStatus::Cancelled,
            cancel_reason: req.reason,
            no_show_reason: None,
            follow_up_needed: None,
            follow_up_date: None,
        },
    )
    .await?;
    Ok(Json(ApiOk::new(data.appointment)))
}

/* ============================================================
   POST /appointments/{id}/reschedule
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RescheduleData {
    pub previous: AppointmentDto,
    pub appointment: AppointmentDto,
    pub reminders_moved: usize,
}

fn ensure_reschedulable(status: AppointmentStatus) -> Result<(), ApiError> {
    match status {
        AppointmentStatus::Scheduled | AppointmentStatus::Confirmed => Ok(()),
        other => Err(ApiError::Conflict(
            "INVALID_STATUS",
            format!("a {} appointment cannot be rescheduled", other.as_str()),
        )),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PendingReminder {
    reminder_id: Uuid,
    scheduled_time: DateTime<Utc>,
}

pub async fn reschedule_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<ApiOk<RescheduleData>>, ApiError> {
    require(&auth, Permission::BookAppointments)?;
    let range = TimeRange::new(req.start_time, req.end_time)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    let current = lock_appointment(&mut tx, appointment_id).await?;
    ensure_reschedulable(current.status)?;
    lock_and_check_conflict(&mut tx, current.doctor_id, range, Some(appointment_id)).await?;

    // release the old slot before the new row goes in
    sqlx::query(
        r#"
        UPDATE appointment
        SET status = 'RESCHEDULED',
            reschedule_reason = $2,
            updated_at = now(),
            updated_by_user_id = $3
        WHERE appointment_id = $1
        "#,
    )
    .bind(appointment_id)
    .bind(trimmed(req.reason.as_deref()))
    .bind(auth.user_id)
    .execute(&mut *tx)
    .await
    .map_err(db_error)?;

    let new_id = insert_appointment(
        &mut tx,
        &NewAppointment {
            patient_id: current.patient_id,
            doctor_id: current.doctor_id,
            department_id: current.department_id,
            appointment_type: current.appointment_type,
            title: &current.title,
            range,
            notes: current.notes.as_deref(),
            follow_up_of_id: None,
            rescheduled_from_id: Some(appointment_id),
            created_by: auth.user_id,
        },
    )
    .await?;

    let pending: Vec<PendingReminder> = sqlx::query_as::<_, PendingReminder>(
        r#"
        SELECT reminder_id, scheduled_time
        FROM appointment_reminder
        WHERE appointment_id = $1 AND status = 'PENDING'
        FOR UPDATE
        "#,
    )
    .bind(appointment_id)
    .fetch_all(&mut *tx)
    .await
    .map_err(db_error)?;

    let moved_to = fetch_appointment(&mut *tx, new_id).await?;
    let subject = ReminderSubject {
        patient_name: &moved_to.patient.display,
        doctor_name: &moved_to.doctor.display,
        start_time: range.start,
    };
    let now = Utc::now();
    let mut reminders_moved = 0usize;

    for r in pending {
        let shifted = shift_scheduled_time(r.scheduled_time, current.start_time, range.start);
        if shifted <= now {
            sqlx::query(r#"UPDATE appointment_reminder SET status = 'CANCELLED' WHERE reminder_id = $1"#)
                .bind(r.reminder_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            continue;
        }
        let lead_hours = (range.start - shifted).num_hours();
        sqlx::query(
            r#"
            UPDATE appointment_reminder
            SET appointment_id = $2, scheduled_time = $3, message = $4
            WHERE reminder_id = $1
            "#,
        )
        .bind(r.reminder_id)
        .bind(new_id)
        .bind(shifted)
        .bind(format_message(&subject, lead_hours))
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        reminders_moved += 1;
    }

    tx.commit().await.map_err(db_error)?;

    tracing::info!(
        %appointment_id,
        new_appointment_id = %new_id,
        reminders_moved,
        "appointment rescheduled"
    );

    Ok(Json(ApiOk::new(RescheduleData {
        previous: fetch_appointment(&state.db, appointment_id).await?,
        appointment: fetch_appointment(&state.db, new_id).await?,
        reminders_moved,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_doctor_scope() {
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert!(check_doctor_scope(None, other).is_ok());
        assert!(check_doctor_scope(Some(mine), mine).is_ok());
        assert!(matches!(
            check_doctor_scope(Some(mine), other),
            Err(ApiError::Forbidden("FORBIDDEN", _))
        ));
    }

    #[test]
    fn test_validate_title() {
        assert_eq!(validate_title("  Knee review ").unwrap(), "Knee review");
        assert!(validate_title("   ").is_err());
        assert!(validate_title(&"x".repeat(201)).is_err());
    }

    #[test]
    fn test_resolve_window_from_date() {
        let d = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let (from, to) = resolve_window(Some(d), None, None).unwrap();
        assert_eq!(from, Some(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()));
        assert_eq!(to, Some(Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_resolve_window_rejects_bad_ranges() {
        let d = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert!(resolve_window(Some(d), Some(t), None).is_err());
        assert!(resolve_window(None, Some(t), Some(t)).is_err());
        assert_eq!(resolve_window(None, Some(t), None).unwrap(), (Some(t), None));
        assert_eq!(resolve_window(None, None, None).unwrap(), (None, None));
    }

    #[test]
    fn test_only_upcoming_appointments_can_be_rescheduled() {
        assert!(ensure_reschedulable(AppointmentStatus::Scheduled).is_ok());
        assert!(ensure_reschedulable(AppointmentStatus::Confirmed).is_ok());
        for s in [
            AppointmentStatus::CheckedIn,
            AppointmentStatus::InProgress,
            AppointmentStatus::Completed,
            AppointmentStatus::Cancelled,
            AppointmentStatus::Rescheduled,
            AppointmentStatus::NoShow,
        ] {
            let err = ensure_reschedulable(s).unwrap_err();
            assert!(matches!(err, ApiError::Conflict("INVALID_STATUS", _)));
        }
    }

    #[test]
    fn test_status_request_parsing() {
        let req: StatusUpdateRequest = serde_json::from_str(
            r#"{"status": "COMPLETED", "follow_up_needed": true, "follow_up_date": "2026-03-16T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(req.status, AppointmentStatus::Completed);
        assert_eq!(req.follow_up_needed, Some(true));
        assert_eq!(
            req.follow_up_date,
            Some(Utc.with_ymd_and_hms(2026, 3, 16, 10, 0, 0).unwrap())
        );

        assert!(serde_json::from_str::<StatusUpdateRequest>(r#"{"status": "FINISHED"}"#).is_err());
        assert!(serde_json::from_str::<StatusUpdateRequest>(r#"{}"#).is_err());
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateAppointmentRequest = serde_json::from_str(
            r#"{
                "patient_id": "8a6e0804-2bd0-4672-b79d-d97027f9071a",
                "doctor_id": "2f1c3b2a-6d6e-4d2b-9c1d-2b8a2f2d9e10",
                "title": "Consultation",
                "start_time": "2026-03-02T10:00:00Z",
                "end_time": "2026-03-02T10:30:00Z"
            }"#,
        )
        .unwrap();
        assert!(req.send_reminders.is_none());
        assert!(req.appointment_type.is_none());
        let range = TimeRange::new(req.start_time, req.end_time).unwrap();
        assert_eq!(range.duration_minutes(), 30);
    }

    #[test]
    fn test_edit_request_can_clear_notes() {
        let req: EditAppointmentRequest = serde_json::from_str(r#"{"notes": null}"#).unwrap();
        assert_eq!(req.notes, Some(None));
        let req: EditAppointmentRequest = serde_json::from_str(r#"{"title": "x"}"#).unwrap();
        assert_eq!(req.notes, None);
    }
}

#[cfg(test)]
mod db_tests {
    use axum::response::IntoResponse;
    use sqlx::PgPool;

    use super::*;
    use crate::test_support::{Seeded, at, seed, state};

    fn booking(seeded: &Seeded, title: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> CreateAppointmentRequest {
        CreateAppointmentRequest {
            patient_id: seeded.patient_id,
            doctor_id: seeded.doctor_id,
            department_id: None,
            appointment_type: None,
            title: title.to_string(),
            start_time: start,
            end_time: end,
            notes: None,
            send_reminders: None,
            reminder_channels: None,
        }
    }

    async fn book(state: &AppState, seeded: &Seeded, title: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Uuid {
        let (status, Json(body)) = create_appointment(
            State(state.clone()),
            seeded.admin.clone(),
            Json(booking(seeded, title, start, end)),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        body.data.appointment_id
    }

    fn status_request(status: AppointmentStatus) -> StatusUpdateRequest {
        StatusUpdateRequest {
            status,
            cancel_reason: None,
            no_show_reason: None,
            follow_up_needed: None,
            follow_up_date: None,
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at a Postgres server"]
    async fn test_overlapping_booking_returns_409(db: PgPool) {
        let seeded = seed(&db).await;
        let state = state(db);

        book(&state, &seeded, "Checkup", at(10, 0), at(10, 30)).await;

        let Err(err) = create_appointment(
            State(state.clone()),
            seeded.admin.clone(),
            Json(booking(&seeded, "Second", at(10, 15), at(10, 45))),
        )
        .await
        else {
            panic!("overlapping booking was accepted");
        };
        assert!(matches!(err, ApiError::Conflict("APPOINTMENT_CONFLICT", _)));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        // back-to-back is fine
        book(&state, &seeded, "Third", at(10, 30), at(11, 0)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at a Postgres server"]
    async fn test_cancel_and_check_in_write_their_columns(db: PgPool) {
        let seeded = seed(&db).await;
        let state = state(db);

        let cancelled_id = book(&state, &seeded, "Checkup", at(10, 0), at(10, 30)).await;
        let checked_in_id = book(&state, &seeded, "Review", at(11, 0), at(11, 30)).await;

        let mut req = status_request(AppointmentStatus::Cancelled);
        req.cancel_reason = Some("  patient unwell ".to_string());
        let data = apply_status_change(&state, &seeded.admin, cancelled_id, req)
            .await
            .unwrap();
        let appt = data.appointment;
        assert_eq!(appt.status, AppointmentStatus::Cancelled);
        assert!(appt.cancelled_at.is_some());
        assert_eq!(appt.cancel_reason.as_deref(), Some("patient unwell"));
        assert_eq!(appt.cancelled_by_user_id, Some(seeded.admin.user_id));

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM appointment_reminder WHERE appointment_id = $1 AND status = 'PENDING'",
        )
        .bind(cancelled_id)
        .fetch_one(&state.db)
        .await
        .unwrap();
        assert_eq!(pending, 0);

        let data = apply_status_change(
            &state,
            &seeded.admin,
            checked_in_id,
            status_request(AppointmentStatus::CheckedIn),
        )
        .await
        .unwrap();
        assert_eq!(data.appointment.status, AppointmentStatus::CheckedIn);
        assert!(data.appointment.check_in_time.is_some());
        assert!(data.appointment.cancelled_at.is_none());

        // the cancelled slot is free again
        book(&state, &seeded, "Walk-in", at(10, 0), at(10, 30)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at a Postgres server"]
    async fn test_completed_with_follow_up_books_new_appointment(db: PgPool) {
        let seeded = seed(&db).await;
        let state = state(db);

        let id = book(&state, &seeded, "Chest pain", at(10, 0), at(10, 30)).await;
        let follow_up_date = at(10, 0) + Duration::days(7);

        let mut req = status_request(AppointmentStatus::Completed);
        req.follow_up_needed = Some(true);
        req.follow_up_date = Some(follow_up_date);
        let data = apply_status_change(&state, &seeded.admin, id, req).await.unwrap();

        assert_eq!(data.appointment.status, AppointmentStatus::Completed);
        assert!(data.appointment.check_out_time.is_some());
        assert!(data.appointment.follow_up_needed);
        assert!(data.follow_up_skipped_reason.is_none());

        let follow_up = data.follow_up.expect("follow-up booked");
        assert_eq!(follow_up.title, "Follow-up: Chest pain");
        assert_eq!(follow_up.follow_up_of_id, Some(id));
        assert_eq!(follow_up.appointment_type, AppointmentType::FollowUp);
        assert_eq!(follow_up.patient.id, seeded.patient_id);
        assert_eq!(follow_up.doctor.id, seeded.doctor_id);
        assert_eq!(follow_up.start_time, follow_up_date);
        assert_eq!(follow_up.duration_minutes, 30);
        assert_eq!(follow_up.status, AppointmentStatus::Scheduled);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM appointment WHERE follow_up_of_id = $1")
            .bind(id)
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at a Postgres server"]
    async fn test_fetching_twice_is_stable(db: PgPool) {
        let seeded = seed(&db).await;
        let state = state(db);

        let id = book(&state, &seeded, "Checkup", at(9, 0), at(9, 30)).await;

        let first = fetch_appointment(&state.db, id).await.unwrap();
        let second = fetch_appointment(&state.db, id).await.unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.updated_at, second.updated_at);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }
}
