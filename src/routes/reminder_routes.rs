// src/routes/reminder_routes.rs

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    error::{ApiError, db_error},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
    pagination::{PageQuery, Paginated},
    permissions::{Permission, require},
    reminders::{
        OutgoingReminder, PlannedReminder, ReminderChannel, ReminderStatus, ReminderSubject,
        plan_reminders,
    },
    routes::appointment_routes::{ensure_doctor_scope, fetch_appointment},
};

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ReminderRow {
    pub reminder_id: Uuid,
    pub appointment_id: Uuid,
    pub channel: ReminderChannel,
    pub scheduled_time: DateTime<Utc>,
    pub message: String,
    pub status: ReminderStatus,
    pub sent_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const REMINDER_COLUMNS: &str =
    "reminder_id, appointment_id, channel, scheduled_time, message, status, sent_time, created_at";

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/appointments/{appointment_id}/reminders",
            get(list_appointment_reminders).post(create_appointment_reminders),
        )
        .route("/reminders/due", get(list_due_reminders))
        .route("/reminders/{reminder_id}/send", post(send_reminder))
        .route("/reminders/{reminder_id}/cancel", post(cancel_reminder))
}

/// SMS when the caller does not pick any channel. Duplicates are dropped.
pub(crate) fn resolve_channels(requested: Option<Vec<ReminderChannel>>) -> Vec<ReminderChannel> {
    let mut out: Vec<ReminderChannel> = Vec::new();
    for c in requested.unwrap_or_default() {
        if !out.contains(&c) {
            out.push(c);
        }
    }
    if out.is_empty() {
        out.push(ReminderChannel::Sms);
    }
    out
}

fn validate_offsets(offsets: &[i64]) -> Result<(), ApiError> {
    if offsets.is_empty() {
        return Err(ApiError::validation("offsets_hours must not be empty"));
    }
    if offsets.iter().any(|h| !(1..=24 * 30).contains(h)) {
        return Err(ApiError::validation("offsets_hours must be between 1 and 720"));
    }
    Ok(())
}

fn ensure_pending(status: ReminderStatus) -> Result<(), ApiError> {
    if status == ReminderStatus::Pending {
        return Ok(());
    }
    let current = match status {
        ReminderStatus::Sent => "SENT",
        _ => "CANCELLED",
    };
    Err(ApiError::Conflict(
        "REMINDER_NOT_PENDING",
        format!("reminder is already {current}"),
    ))
}

pub(crate) async fn insert_reminders(
    conn: &mut PgConnection,
    appointment_id: Uuid,
    planned: &[PlannedReminder],
) -> Result<Vec<ReminderRow>, ApiError> {
    let mut out = Vec::with_capacity(planned.len());
    for r in planned {
        let row: ReminderRow = sqlx::query_as::<_, ReminderRow>(&format!(
            r#"
            INSERT INTO appointment_reminder (appointment_id, channel, scheduled_time, message)
            VALUES ($1, $2, $3, $4)
            RETURNING {REMINDER_COLUMNS}
            "#
        ))
        .bind(appointment_id)
        .bind(r.channel)
        .bind(r.scheduled_time)
        .bind(&r.message)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)?;
        out.push(row);
    }
    Ok(out)
}

/// Cancel every pending reminder of an appointment. Returns how many changed.
pub(crate) async fn cancel_pending_for_appointment(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> Result<u64, ApiError> {
    let res = sqlx::query(
        r#"
        UPDATE appointment_reminder
        SET status = 'CANCELLED'
        WHERE appointment_id = $1 AND status = 'PENDING'
        "#,
    )
    .bind(appointment_id)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(res.rows_affected())
}

pub async fn list_appointment_reminders(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<ApiOk<Vec<ReminderRow>>>, ApiError> {
    require(&auth, Permission::ViewSchedule)?;
    let appt = fetch_appointment(&state.db, appointment_id).await?;
    ensure_doctor_scope(&state, &auth, appt.doctor.id).await?;

    let rows: Vec<ReminderRow> = sqlx::query_as::<_, ReminderRow>(&format!(
        r#"
        SELECT {REMINDER_COLUMNS}
        FROM appointment_reminder
        WHERE appointment_id = $1
        ORDER BY scheduled_time ASC, channel ASC
        "#
    ))
    .bind(appointment_id)
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Deserialize)]
pub struct CreateRemindersRequest {
    pub offsets_hours: Option<Vec<i64>>,
    pub channels: Option<Vec<ReminderChannel>>,
}

pub async fn create_appointment_reminders(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<Uuid>,
    Json(req): Json<CreateRemindersRequest>,
) -> Result<Json<ApiOk<Vec<ReminderRow>>>, ApiError> {
    require(&auth, Permission::ManageReminders)?;

    let offsets = match req.offsets_hours {
        Some(o) => {
            validate_offsets(&o)?;
            o
        }
        None => state.reminder_offsets_hours.to_vec(),
    };
    let channels = resolve_channels(req.channels);

    let mut tx = state.db.begin().await.map_err(db_error)?;

    let appt = fetch_appointment(&mut *tx, appointment_id).await?;
    if !appt.status.holds_slot() {
        return Err(ApiError::Conflict(
            "APPOINTMENT_NOT_ACTIVE",
            format!("appointment is {}", appt.status.as_str()),
        ));
    }

    let subject = ReminderSubject {
        patient_name: &appt.patient.display,
        doctor_name: &appt.doctor.display,
        start_time: appt.start_time,
    };
    let planned = plan_reminders(&subject, &offsets, &channels, Utc::now());
    let rows = insert_reminders(&mut tx, appointment_id, &planned).await?;

    tx.commit().await.map_err(db_error)?;

    tracing::info!(%appointment_id, created = rows.len(), "reminders scheduled");
    Ok(Json(ApiOk::new(rows)))
}

pub async fn list_due_reminders(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(q): Query<PageQuery>,
) -> Result<Json<Paginated<ReminderRow>>, ApiError> {
    require(&auth, Permission::ManageReminders)?;
    let page = q.resolve();

    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM appointment_reminder
        WHERE status = 'PENDING' AND scheduled_time <= now()
        "#,
    )
    .fetch_one(&state.db)
    .await
    .map_err(db_error)?;

    let rows: Vec<ReminderRow> = sqlx::query_as::<_, ReminderRow>(&format!(
        r#"
        SELECT {REMINDER_COLUMNS}
        FROM appointment_reminder
        WHERE status = 'PENDING' AND scheduled_time <= now()
        ORDER BY scheduled_time ASC, reminder_id ASC
        LIMIT $1 OFFSET $2
        "#
    ))
    .bind(page.limit)
    .bind(page.offset())
    .fetch_all(&state.db)
    .await
    .map_err(db_error)?;

    Ok(Json(Paginated::new(rows, page, total)))
}

async fn fetch_reminder(state: &AppState, reminder_id: Uuid) -> Result<ReminderRow, ApiError> {
    sqlx::query_as::<_, ReminderRow>(&format!(
        "SELECT {REMINDER_COLUMNS} FROM appointment_reminder WHERE reminder_id = $1"
    ))
    .bind(reminder_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("reminder"))
}

pub async fn send_reminder(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reminder_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReminderRow>>, ApiError> {
    require(&auth, Permission::ManageReminders)?;

    let mut tx = state.db.begin().await.map_err(db_error)?;

    // claimed before dispatch; a concurrent send waits here and then sees SENT
    let reminder: ReminderRow = sqlx::query_as::<_, ReminderRow>(&format!(
        "SELECT {REMINDER_COLUMNS} FROM appointment_reminder WHERE reminder_id = $1 FOR UPDATE"
    ))
    .bind(reminder_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_error)?
    .ok_or_else(|| ApiError::not_found("reminder"))?;
    ensure_pending(reminder.status)?;

    state
        .dispatcher
        .dispatch(&OutgoingReminder {
            reminder_id,
            appointment_id: reminder.appointment_id,
            channel: reminder.channel,
            message: reminder.message.clone(),
        })
        .await
        .map_err(|e| ApiError::Internal(format!("reminder dispatch failed: {e}")))?;

    let sent: ReminderRow = sqlx::query_as::<_, ReminderRow>(&format!(
        r#"
        UPDATE appointment_reminder
        SET status = 'SENT', sent_time = now()
        WHERE reminder_id = $1
        RETURNING {REMINDER_COLUMNS}
        "#
    ))
    .bind(reminder_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_error)?;

    tx.commit().await.map_err(db_error)?;

    Ok(Json(ApiOk::new(sent)))
}

pub async fn cancel_reminder(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(reminder_id): Path<Uuid>,
) -> Result<Json<ApiOk<ReminderRow>>, ApiError> {
    require(&auth, Permission::ManageReminders)?;

    let reminder = fetch_reminder(&state, reminder_id).await?;
    ensure_pending(reminder.status)?;

    let cancelled: ReminderRow = sqlx::query_as::<_, ReminderRow>(&format!(
        r#"
        UPDATE appointment_reminder
        SET status = 'CANCELLED'
        WHERE reminder_id = $1 AND status = 'PENDING'
        RETURNING {REMINDER_COLUMNS}
        "#
    ))
    .bind(reminder_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error)?
    .ok_or_else(|| {
        ApiError::Conflict("REMINDER_NOT_PENDING", "reminder is no longer pending".into())
    })?;

    Ok(Json(ApiOk::new(cancelled)))
}


#[cfg(test)]
mod db_tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use sqlx::PgPool;

    use super::*;
    use crate::reminders::ReminderDispatcher;
    use crate::routes::appointment_routes::{CreateAppointmentRequest, create_appointment};
    use crate::test_support::{at, seed, state_with};

    #[derive(Default)]
    struct CountingDispatcher {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl ReminderDispatcher for CountingDispatcher {
        async fn dispatch(&self, _reminder: &OutgoingReminder) -> Result<(), String> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs DATABASE_URL pointing at a Postgres server"]
    async fn test_concurrent_sends_dispatch_once(db: PgPool) {
        let seeded = seed(&db).await;
        let dispatcher = Arc::new(CountingDispatcher::default());
        let state = state_with(db, dispatcher.clone());

        create_appointment(
            State(state.clone()),
            seeded.admin.clone(),
            Json(CreateAppointmentRequest {
                patient_id: seeded.patient_id,
                doctor_id: seeded.doctor_id,
                department_id: None,
                appointment_type: None,
                title: "Checkup".to_string(),
                start_time: at(10, 0),
                end_time: at(10, 30),
                notes: None,
                send_reminders: Some(true),
                reminder_channels: None,
            }),
        )
        .await
        .unwrap();

        let reminder_id: Uuid = sqlx::query_scalar(
            "SELECT reminder_id FROM appointment_reminder ORDER BY scheduled_time LIMIT 1",
        )
        .fetch_one(&state.db)
        .await
        .unwrap();

        let (a, b) = tokio::join!(
            send_reminder(State(state.clone()), seeded.admin.clone(), Path(reminder_id)),
            send_reminder(State(state.clone()), seeded.admin.clone(), Path(reminder_id)),
        );

        assert_eq!(dispatcher.sent.load(Ordering::SeqCst), 1);
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(ApiError::Conflict("REMINDER_NOT_PENDING", _)))));

        let status: ReminderStatus =
            sqlx::query_scalar("SELECT status FROM appointment_reminder WHERE reminder_id = $1")
                .bind(reminder_id)
                .fetch_one(&state.db)
                .await
                .unwrap();
        assert_eq!(status, ReminderStatus::Sent);
    }
}
