use std::env;

use anyhow::{Context, bail};

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub session_ttl_hours: i64,
    pub db_max_connections: u32,
    pub reminder_offsets_hours: Vec<i64>,
    pub workday_start_hour: u32,
    pub workday_end_hour: u32,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Clone, Debug)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let session_ttl_hours =
            parse_positive("SESSION_TTL_HOURS", env::var("SESSION_TTL_HOURS").ok().as_deref(), 24)?;
        let db_max_connections =
            parse_positive("DB_MAX_CONNECTIONS", env::var("DB_MAX_CONNECTIONS").ok().as_deref(), 10)?;

        let reminder_offsets_hours = match env::var("REMINDER_OFFSETS_HOURS") {
            Ok(raw) => parse_offsets(&raw)?,
            Err(_) => vec![24, 2],
        };

        let workday_start_hour = parse_hour("WORKDAY_START_HOUR", 9)?;
        let workday_end_hour = parse_hour("WORKDAY_END_HOUR", 17)?;
        if workday_end_hour <= workday_start_hour {
            bail!("WORKDAY_END_HOUR must be after WORKDAY_START_HOUR");
        }

        let bootstrap_admin = bootstrap_pair(
            env::var("BOOTSTRAP_ADMIN_USERNAME").ok(),
            env::var("BOOTSTRAP_ADMIN_PASSWORD").ok(),
        )?;

        Ok(Self {
            database_url,
            bind_addr,
            session_ttl_hours,
            db_max_connections,
            reminder_offsets_hours,
            workday_start_hour,
            workday_end_hour,
            bootstrap_admin,
        })
    }
}

/// A whole number >= 1, or `default` when unset.
fn parse_positive<T>(key: &str, raw: Option<&str>, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + From<u8>,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a positive whole number"))?;
    if value < T::from(1) {
        bail!("{key} must be at least 1");
    }
    Ok(value)
}

fn bootstrap_pair(
    username: Option<String>,
    password: Option<String>,
) -> anyhow::Result<Option<BootstrapAdmin>> {
    match (username, password) {
        (None, None) => Ok(None),
        (Some(username), Some(password)) => {
            if username.trim().is_empty() || password.is_empty() {
                bail!("BOOTSTRAP_ADMIN_USERNAME and BOOTSTRAP_ADMIN_PASSWORD must not be empty");
            }
            Ok(Some(BootstrapAdmin { username, password }))
        }
        _ => bail!("BOOTSTRAP_ADMIN_USERNAME and BOOTSTRAP_ADMIN_PASSWORD must be set together"),
    }
}

fn parse_hour(key: &str, default: u32) -> anyhow::Result<u32> {
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };
    let hour: u32 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be an hour between 0 and 24"))?;
    if hour > 24 {
        bail!("{key} must be an hour between 0 and 24");
    }
    Ok(hour)
}

/// Parse a comma separated list of whole hours, e.g. `"24,2"`.
pub fn parse_offsets(raw: &str) -> anyhow::Result<Vec<i64>> {
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let hours: i64 = part
            .parse()
            .with_context(|| format!("invalid reminder offset: {part}"))?;
        if hours <= 0 {
            bail!("reminder offsets must be positive hours, got {hours}");
        }
        if !out.contains(&hours) {
            out.push(hours);
        }
    }
    if out.is_empty() {
        bail!("REMINDER_OFFSETS_HOURS must list at least one offset");
    }
    Ok(out)
}
