//! Reminder scheduling and the (simulated) delivery seam.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reminder_channel", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderChannel {
    Email,
    Sms,
    Whatsapp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reminder_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Cancelled,
}

/// What a reminder message talks about.
#[derive(Debug, Clone)]
pub struct ReminderSubject<'a> {
    pub patient_name: &'a str,
    pub doctor_name: &'a str,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedReminder {
    pub channel: ReminderChannel,
    pub scheduled_time: DateTime<Utc>,
    pub message: String,
}

pub fn format_message(subject: &ReminderSubject<'_>, offset_hours: i64) -> String {
    let lead = match offset_hours {
        24 => "tomorrow".to_string(),
        h if h > 24 && h % 24 == 0 => format!("in {} days", h / 24),
        1 => "in 1 hour".to_string(),
        h => format!("in {h} hours"),
    };
    format!(
        "Dear {}, this is a reminder of your appointment with Dr. {} {} on {} at {} UTC.",
        subject.patient_name,
        subject.doctor_name,
        lead,
        subject.start_time.format("%Y-%m-%d"),
        subject.start_time.format("%H:%M"),
    )
}

/// One reminder per (offset, channel). Offsets that would fire before `now`
/// are dropped.
pub fn plan_reminders(
    subject: &ReminderSubject<'_>,
    offsets_hours: &[i64],
    channels: &[ReminderChannel],
    now: DateTime<Utc>,
) -> Vec<PlannedReminder> {
    let mut out = Vec::new();
    for &hours in offsets_hours {
        if hours <= 0 {
            continue;
        }
        let scheduled_time = subject.start_time - Duration::hours(hours);
        if scheduled_time <= now {
            continue;
        }
        let message = format_message(subject, hours);
        for &channel in channels {
            out.push(PlannedReminder {
                channel,
                scheduled_time,
                message: message.clone(),
            });
        }
    }
    out.sort_by_key(|r| r.scheduled_time);
    out
}

/// Shift a pending reminder to follow its appointment to a new start time.
pub fn shift_scheduled_time(
    scheduled_time: DateTime<Utc>,
    old_start: DateTime<Utc>,
    new_start: DateTime<Utc>,
) -> DateTime<Utc> {
    new_start - (old_start - scheduled_time)
}

#[derive(Debug, Clone)]
pub struct OutgoingReminder {
    pub reminder_id: Uuid,
    pub appointment_id: Uuid,
    pub channel: ReminderChannel,
    pub message: String,
}

/// Delivery transport for reminders.
#[async_trait]
pub trait ReminderDispatcher: Send + Sync {
    async fn dispatch(&self, reminder: &OutgoingReminder) -> Result<(), String>;
}

/// Records the send in the log and nothing else; there is no real SMS, email
/// or WhatsApp integration.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl ReminderDispatcher for LogDispatcher {
    async fn dispatch(&self, reminder: &OutgoingReminder) -> Result<(), String> {
        tracing::info!(
            reminder_id = %reminder.reminder_id,
            appointment_id = %reminder.appointment_id,
            channel = ?reminder.channel,
            "reminder dispatched (simulated): {}",
            reminder.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn subject(start: DateTime<Utc>) -> ReminderSubject<'static> {
        ReminderSubject {
            patient_name: "Asha Rao",
            doctor_name: "Meera Iyer",
            start_time: start,
        }
    }

    #[test]
    fn test_plan_default_offsets() {
        let start = Utc.with_ymd_and_hms(2026, 5, 10, 10, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap();
        let planned = plan_reminders(&subject(start), &[24, 2], &[ReminderChannel::Sms], now);

        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].scheduled_time, Utc.with_ymd_and_hms(2026, 5, 9, 10, 0, 0).unwrap());
        assert_eq!(planned[1].scheduled_time, Utc.with_ymd_and_hms(2026, 5, 10, 8, 0, 0).unwrap());
        assert!(planned[0].message.contains("tomorrow"));
        assert!(planned[1].message.contains("in 2 hours"));
        assert!(planned[1].message.contains("Dr. Meera Iyer"));
        assert!(planned[1].message.contains("2026-05-10 at 10:00"));
    }

    #[test]
    fn test_past_offsets_are_skipped() {
        let start = Utc.with_ymd_and_hms(2026, 5, 10, 10, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 1, 0, 0).unwrap();
        let planned = plan_reminders(&subject(start), &[24, 2], &[ReminderChannel::Email], now);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].channel, ReminderChannel::Email);
    }

    #[test]
    fn test_one_row_per_channel() {
        let start = Utc.with_ymd_and_hms(2026, 5, 10, 10, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let planned = plan_reminders(
            &subject(start),
            &[48],
            &[ReminderChannel::Sms, ReminderChannel::Whatsapp],
            now,
        );
        assert_eq!(planned.len(), 2);
        assert!(planned.iter().all(|r| r.message.contains("in 2 days")));
    }

    #[test]
    fn test_shift_keeps_lead_time() {
        let old_start = Utc.with_ymd_and_hms(2026, 5, 10, 10, 0, 0).unwrap();
        let new_start = Utc.with_ymd_and_hms(2026, 5, 12, 15, 30, 0).unwrap();
        let remind = old_start - Duration::hours(2);
        assert_eq!(
            shift_scheduled_time(remind, old_start, new_start),
            new_start - Duration::hours(2)
        );
    }

    #[tokio::test]
    async fn test_log_dispatcher_accepts() {
        let out = OutgoingReminder {
            reminder_id: Uuid::new_v4(),
            appointment_id: Uuid::new_v4(),
            channel: ReminderChannel::Sms,
            message: "hello".into(),
        };
        assert!(LogDispatcher.dispatch(&out).await.is_ok());
    }
}
