//! Fixtures for the database-backed tests. Each `#[sqlx::test]` gets a fresh
//! migrated database, so ids are created here rather than hard-coded.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::middleware::auth_context::AuthContext;
use crate::models::AppState;
use crate::reminders::{LogDispatcher, ReminderDispatcher};

pub struct Seeded {
    pub admin: AuthContext,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
}

pub fn state_with(db: PgPool, dispatcher: Arc<dyn ReminderDispatcher>) -> AppState {
    AppState {
        db,
        session_ttl_hours: 24,
        reminder_offsets_hours: Arc::new(vec![24, 2]),
        workday_start_hour: 9,
        workday_end_hour: 17,
        dispatcher,
    }
}

pub fn state(db: PgPool) -> AppState {
    state_with(db, Arc::new(LogDispatcher))
}

/// 2030-03-04 at `h:m` UTC, far enough ahead that every reminder stays pending.
pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 3, 4, h, m, 0).unwrap()
}

pub async fn seed(db: &PgPool) -> Seeded {
    let admin_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO hms_user (username, display_name, password_hash, role)
        VALUES ('admin', 'Admin', 'x', 1)
        RETURNING user_id
        "#,
    )
    .fetch_one(db)
    .await
    .unwrap();

    let department_id: Uuid = sqlx::query_scalar(
        r#"INSERT INTO department (name) VALUES ('Cardiology') RETURNING department_id"#,
    )
    .fetch_one(db)
    .await
    .unwrap();

    let doctor_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO doctor (department_id, first_name, last_name)
        VALUES ($1, 'Ada', 'Lovelace')
        RETURNING doctor_id
        "#,
    )
    .bind(department_id)
    .fetch_one(db)
    .await
    .unwrap();

    let patient_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO patient (first_name, last_name)
        VALUES ('Grace', 'Hopper')
        RETURNING patient_id
        "#,
    )
    .fetch_one(db)
    .await
    .unwrap();

    Seeded {
        admin: AuthContext {
            user_id: admin_id,
            role: 1,
            session_token_id: Uuid::new_v4(),
        },
        doctor_id,
        patient_id,
    }
}
