use axum::{Json, Router, extract::State, routing::get};
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ApiError, db_error};
use crate::middleware::auth_context::AuthContext;
use crate::models::{ApiOk, AppState};
use crate::permissions::{Permission, has_permission, role_to_string};
use crate::routes::appointment_routes::scoped_doctor_filter;
use crate::scheduling::AppointmentStatus;

#[derive(Debug, Serialize)]
pub struct HomeData {
    pub view: String,
    pub date: NaiveDate,
    pub doctor_id: Option<Uuid>,
    pub appointments_today: i64,
    pub by_status: Vec<StatusCount>,
    pub waiting_now: i64,
    pub reminders_due: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct StatusCount {
    pub status: AppointmentStatus,
    pub count: i64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/home", get(home))
}

pub async fn home(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<HomeData>>, ApiError> {
    let view = role_to_string(auth.role);
    let date = Utc::now().date_naive();

    let mut data = HomeData {
        view,
        date,
        doctor_id: None,
        appointments_today: 0,
        by_status: vec![],
        waiting_now: 0,
        reminders_due: None,
    };

    // patients get the bare payload
    if !has_permission(auth.role, Permission::ViewSchedule) {
        return Ok(Json(ApiOk::new(data)));
    }

    let doctor_id = scoped_doctor_filter(&state, &auth, None).await?;
    let day_start = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    let day_end = day_start + Duration::days(1);

    let by_status: Vec<StatusCount> = sqlx::query_as::<_, StatusCount>(
        r#"
        SELECT status, COUNT(*) AS count
        FROM appointment
        WHERE start_time >= $1 AND start_time < $2
          AND ($3::UUID IS NULL OR doctor_id = $3)
        GROUP BY status
        ORDER BY status
        "#,
    )
    .bind(day_start)
    .bind(day_end)
    .bind(doctor_id)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    let waiting_now: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM waiting_list
        WHERE queue_date = $1
          AND status IN ('WAITING', 'CALLED')
          AND ($2::UUID IS NULL OR doctor_id = $2)
        "#,
    )
    .bind(date)
    .bind(doctor_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    if has_permission(auth.role, Permission::ManageReminders) {
        let due: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM appointment_reminder
            WHERE status = 'PENDING' AND scheduled_time <= now()
            "#,
        )
        .fetch_one(&state.db)
        .await
        .map_err(db_error)?;
        data.reminders_due = Some(due);
    }

    data.doctor_id = doctor_id;
    data.appointments_today = by_status.iter().map(|s| s.count).sum();
    data.by_status = by_status;
    data.waiting_now = waiting_now;

    Ok(Json(ApiOk::new(data)))
}
