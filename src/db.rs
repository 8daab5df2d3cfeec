use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::auth::hash_password;
use crate::config::BootstrapAdmin;
use crate::permissions::Role;

pub async fn connect_pg(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("database migrations applied");

    Ok(pool)
}

/// Create the first admin account when the user table is empty.
pub async fn bootstrap_admin(pool: &PgPool, admin: &BootstrapAdmin) -> anyhow::Result<()> {
    let existing: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM hms_user"#)
        .fetch_one(pool)
        .await?;
    if existing > 0 {
        return Ok(());
    }

    let phc = hash_password(&admin.password)
        .map_err(|e| anyhow::anyhow!("could not hash bootstrap password: {e:?}"))?;

    sqlx::query(
        r#"
        INSERT INTO hms_user (username, display_name, password_hash, role, is_active)
        VALUES ($1, $2, $3, $4, true)
        "#,
    )
    .bind(admin.username.trim())
    .bind("Administrator")
    .bind(&phc)
    .bind(Role::Admin as i16)
    .execute(pool)
    .await?;

    tracing::info!(username = %admin.username, "bootstrap admin account created");
    Ok(())
}
