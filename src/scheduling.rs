//! Appointment scheduling rules: overlap detection, the status state machine
//! and its side effects, waiting-list mirroring and follow-up construction.
//!
//! Everything here is pure; the route handlers load rows, ask these functions
//! what to do and write the result back inside one transaction.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "appointment_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    CheckedIn,
    InProgress,
    Completed,
    Cancelled,
    Rescheduled,
    NoShow,
}

impl AppointmentStatus {
    /// Statuses that no longer hold the doctor's time slot.
    pub const RELEASED: [AppointmentStatus; 3] = [
        AppointmentStatus::Cancelled,
        AppointmentStatus::Rescheduled,
        AppointmentStatus::NoShow,
    ];

    pub fn holds_slot(&self) -> bool {
        !Self::RELEASED.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "SCHEDULED",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::CheckedIn => "CHECKED_IN",
            AppointmentStatus::InProgress => "IN_PROGRESS",
            AppointmentStatus::Completed => "COMPLETED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::Rescheduled => "RESCHEDULED",
            AppointmentStatus::NoShow => "NO_SHOW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "confirmation_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "appointment_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentType {
    Consultation,
    FollowUp,
    RoutineCheckup,
    Emergency,
    Procedure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "waiting_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitingStatus {
    Waiting,
    Called,
    InConsultation,
    Completed,
    Cancelled,
    NoShow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "waiting_priority", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitingPriority {
    Normal,
    Urgent,
    Emergency,
}

#[derive(Debug, Error, PartialEq)]
pub enum SchedulingError {
    #[error("end_time must be after start_time")]
    InvalidRange,
    #[error("an appointment may last at most 24 hours")]
    RangeTooLong,
    #[error("doctor already has appointment {existing} from {start} to {end}")]
    Conflict {
        existing: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("cancel_reason is required when cancelling an appointment")]
    MissingCancelReason,
    #[error("follow_up_date is required when follow_up_needed is set")]
    MissingFollowUpDate,
    #[error("follow_up_date must be after the completed appointment")]
    FollowUpInPast,
}

impl From<SchedulingError> for ApiError {
    fn from(e: SchedulingError) -> Self {
        match e {
            SchedulingError::Conflict { .. } => ApiError::Conflict("APPOINTMENT_CONFLICT", e.to_string()),
            _ => ApiError::BadRequest("VALIDATION_ERROR", e.to_string()),
        }
    }
}

pub const MAX_APPOINTMENT_MINUTES: i64 = 24 * 60;

/// Half-open `[start, end)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SchedulingError> {
        if end <= start {
            return Err(SchedulingError::InvalidRange);
        }
        if end - start > Duration::minutes(MAX_APPOINTMENT_MINUTES) {
            return Err(SchedulingError::RangeTooLong);
        }
        Ok(Self { start, end })
    }

    /// Bounded by `MAX_APPOINTMENT_MINUTES` for ranges built through `new`.
    pub fn duration_minutes(&self) -> i32 {
        i32::try_from((self.end - self.start).num_minutes()).unwrap_or(i32::MAX)
    }

    /// The three overlap cases: our start falls inside `other`, our end falls
    /// inside `other`, or we enclose `other` entirely.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        let start_inside = self.start >= other.start && self.start < other.end;
        let end_inside = self.end > other.start && self.end <= other.end;
        let encloses = self.start <= other.start && self.end >= other.end;
        start_inside || end_inside || encloses
    }
}

/// An appointment already on the doctor's books.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BookedSlot {
    pub appointment_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AppointmentStatus,
}

impl BookedSlot {
    fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start_time,
            end: self.end_time,
        }
    }
}

/// Reject `proposed` if it overlaps any slot that still holds the doctor's time.
/// `ignore` skips the appointment being moved.
pub fn check_conflict(
    proposed: &TimeRange,
    booked: &[BookedSlot],
    ignore: Option<Uuid>,
) -> Result<(), SchedulingError> {
    let clash = booked
        .iter()
        .filter(|b| Some(b.appointment_id) != ignore)
        .filter(|b| b.status.holds_slot())
        .find(|b| proposed.overlaps(&b.range()));

    match clash {
        Some(b) => Err(SchedulingError::Conflict {
            existing: b.appointment_id,
            start: b.start_time,
            end: b.end_time,
        }),
        None => Ok(()),
    }
}

/// Free slots of `slot_minutes` within the working day that do not collide
/// with any booked appointment.
pub fn available_slots(
    date: NaiveDate,
    day_start_hour: u32,
    day_end_hour: u32,
    slot_minutes: i64,
    booked: &[BookedSlot],
) -> Vec<TimeRange> {
    let mut out = Vec::new();
    if slot_minutes <= 0 || day_end_hour <= day_start_hour {
        return out;
    }
    let Some(open) = NaiveTime::from_hms_opt(day_start_hour, 0, 0) else {
        return out;
    };
    let day_start = Utc.from_utc_datetime(&date.and_time(open));
    let day_end = day_start + Duration::hours(i64::from(day_end_hour - day_start_hour));
    let step = Duration::minutes(slot_minutes);

    let mut cursor = day_start;
    while cursor + step <= day_end {
        let slot = TimeRange {
            start: cursor,
            end: cursor + step,
        };
        if check_conflict(&slot, booked, None).is_ok() {
            out.push(slot);
        }
        cursor += step;
    }
    out
}

/// Field writes that accompany a status change.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StatusEffects {
    pub confirm: bool,
    pub stamp_check_in: bool,
    pub stamp_check_out: bool,
    pub cancel_reason: Option<String>,
    pub no_show_reason: Option<String>,
    pub mark_no_show: bool,
    pub cancel_pending_reminders: bool,
    pub waiting_list_status: Option<WaitingStatus>,
    pub follow_up: Option<FollowUpPlan>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpPlan {
    pub start: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusChangeInput {
    pub cancel_reason: Option<String>,
    pub no_show_reason: Option<String>,
    pub follow_up_needed: bool,
    pub follow_up_date: Option<DateTime<Utc>>,
}

/// Fixed mapping from appointment status to waiting-list status. Statuses not
/// listed leave the queue entry untouched.
pub fn waiting_status_for(status: AppointmentStatus) -> Option<WaitingStatus> {
    match status {
        AppointmentStatus::CheckedIn => Some(WaitingStatus::Waiting),
        AppointmentStatus::InProgress => Some(WaitingStatus::InConsultation),
        AppointmentStatus::Completed => Some(WaitingStatus::Completed),
        AppointmentStatus::Cancelled => Some(WaitingStatus::Cancelled),
        AppointmentStatus::NoShow => Some(WaitingStatus::NoShow),
        AppointmentStatus::Scheduled
        | AppointmentStatus::Confirmed
        | AppointmentStatus::Rescheduled => None,
    }
}

/// Work out the side effects of moving an appointment to `target`.
///
/// Any status may be set from any other; only the inputs each target needs
/// are validated.
pub fn plan_status_change(
    target: AppointmentStatus,
    appointment_end: DateTime<Utc>,
    input: StatusChangeInput,
) -> Result<StatusEffects, SchedulingError> {
    let mut fx = StatusEffects {
        waiting_list_status: waiting_status_for(target),
        ..Default::default()
    };

    match target {
        AppointmentStatus::Scheduled => {}
        AppointmentStatus::Confirmed => fx.confirm = true,
        AppointmentStatus::CheckedIn | AppointmentStatus::InProgress => fx.stamp_check_in = true,
        AppointmentStatus::Completed => {
            fx.stamp_check_out = true;
            if input.follow_up_needed {
                let date = input.follow_up_date.ok_or(SchedulingError::MissingFollowUpDate)?;
                if date < appointment_end {
                    return Err(SchedulingError::FollowUpInPast);
                }
                fx.follow_up = Some(FollowUpPlan { start: date });
            }
        }
        AppointmentStatus::Cancelled => {
            let reason = input
                .cancel_reason
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(SchedulingError::MissingCancelReason)?;
            fx.cancel_reason = Some(reason.to_string());
            fx.cancel_pending_reminders = true;
        }
        AppointmentStatus::NoShow => {
            fx.mark_no_show = true;
            fx.no_show_reason = input
                .no_show_reason
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            fx.cancel_pending_reminders = true;
        }
        AppointmentStatus::Rescheduled => fx.cancel_pending_reminders = true,
    }

    Ok(fx)
}

pub fn follow_up_title(original: &str) -> String {
    format!("Follow-up: {}", original.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn booked(start: (u32, u32), end: (u32, u32), status: AppointmentStatus) -> BookedSlot {
        BookedSlot {
            appointment_id: Uuid::new_v4(),
            start_time: at(start.0, start.1),
            end_time: at(end.0, end.1),
            status,
        }
    }

    #[test]
    fn test_range_requires_positive_duration() {
        assert_eq!(TimeRange::new(at(10, 0), at(10, 0)), Err(SchedulingError::InvalidRange));
        assert_eq!(TimeRange::new(at(10, 30), at(10, 0)), Err(SchedulingError::InvalidRange));
        assert_eq!(TimeRange::new(at(10, 0), at(10, 45)).unwrap().duration_minutes(), 45);
    }

    #[test]
    fn test_range_longer_than_a_day_is_rejected() {
        let far = Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).unwrap();
        let err = TimeRange::new(at(10, 0), far).unwrap_err();
        assert_eq!(err, SchedulingError::RangeTooLong);
        assert!(matches!(ApiError::from(err), ApiError::BadRequest("VALIDATION_ERROR", _)));

        let day = TimeRange::new(at(10, 0), at(10, 0) + Duration::minutes(MAX_APPOINTMENT_MINUTES)).unwrap();
        assert_eq!(day.duration_minutes(), 1440);
    }

    #[test]
    fn test_overlap_cases() {
        let existing = TimeRange::new(at(10, 0), at(10, 30)).unwrap();

        // start inside
        assert!(TimeRange::new(at(10, 15), at(10, 45)).unwrap().overlaps(&existing));
        // end inside
        assert!(TimeRange::new(at(9, 45), at(10, 15)).unwrap().overlaps(&existing));
        // encloses
        assert!(TimeRange::new(at(9, 0), at(11, 0)).unwrap().overlaps(&existing));
        // enclosed
        assert!(TimeRange::new(at(10, 5), at(10, 10)).unwrap().overlaps(&existing));
        // identical
        assert!(existing.overlaps(&existing));

        // back to back is fine
        assert!(!TimeRange::new(at(10, 30), at(11, 0)).unwrap().overlaps(&existing));
        assert!(!TimeRange::new(at(9, 30), at(10, 0)).unwrap().overlaps(&existing));
    }

    #[test]
    fn test_second_overlapping_booking_is_rejected() {
        let first = booked((10, 0), (10, 30), AppointmentStatus::Scheduled);
        let proposed = TimeRange::new(at(10, 15), at(10, 45)).unwrap();

        let err = check_conflict(&proposed, &[first.clone()], None).unwrap_err();
        assert_eq!(
            err,
            SchedulingError::Conflict {
                existing: first.appointment_id,
                start: first.start_time,
                end: first.end_time,
            }
        );
        let api: ApiError = err.into();
        assert!(matches!(api, ApiError::Conflict("APPOINTMENT_CONFLICT", _)));
    }

    #[test]
    fn test_released_statuses_do_not_block() {
        let proposed = TimeRange::new(at(10, 0), at(10, 30)).unwrap();
        for status in AppointmentStatus::RELEASED {
            let slot = booked((10, 0), (10, 30), status);
            assert!(check_conflict(&proposed, &[slot], None).is_ok(), "{status:?}");
        }
        for status in [
            AppointmentStatus::Confirmed,
            AppointmentStatus::CheckedIn,
            AppointmentStatus::InProgress,
            AppointmentStatus::Completed,
        ] {
            let slot = booked((10, 0), (10, 30), status);
            assert!(check_conflict(&proposed, &[slot], None).is_err(), "{status:?}");
        }
    }

    #[test]
    fn test_moving_an_appointment_ignores_itself() {
        let current = booked((10, 0), (10, 30), AppointmentStatus::Scheduled);
        let proposed = TimeRange::new(at(10, 15), at(10, 45)).unwrap();
        assert!(check_conflict(&proposed, &[current.clone()], Some(current.appointment_id)).is_ok());
    }

    #[test]
    fn test_available_slots_skip_booked_time() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let taken = vec![
            booked((9, 30), (10, 0), AppointmentStatus::Scheduled),
            booked((11, 0), (11, 30), AppointmentStatus::Cancelled),
        ];
        let slots = available_slots(date, 9, 12, 30, &taken);
        let starts: Vec<DateTime<Utc>> = slots.iter().map(|s| s.start).collect();
        assert_eq!(
            starts,
            vec![at(9, 0), at(10, 0), at(10, 30), at(11, 0), at(11, 30)]
        );
        assert!(available_slots(date, 12, 9, 30, &[]).is_empty());
        assert!(available_slots(date, 9, 12, 0, &[]).is_empty());
    }

    #[test]
    fn test_cancel_requires_reason() {
        let err = plan_status_change(
            AppointmentStatus::Cancelled,
            at(10, 30),
            StatusChangeInput {
                cancel_reason: Some("   ".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, SchedulingError::MissingCancelReason);

        let fx = plan_status_change(
            AppointmentStatus::Cancelled,
            at(10, 30),
            StatusChangeInput {
                cancel_reason: Some(" patient travelling ".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(fx.cancel_reason.as_deref(), Some("patient travelling"));
        assert!(fx.cancel_pending_reminders);
        assert_eq!(fx.waiting_list_status, Some(WaitingStatus::Cancelled));
    }

    #[test]
    fn test_check_in_stamps_time() {
        let fx = plan_status_change(AppointmentStatus::CheckedIn, at(10, 30), Default::default()).unwrap();
        assert!(fx.stamp_check_in);
        assert!(!fx.stamp_check_out);
        assert_eq!(fx.waiting_list_status, Some(WaitingStatus::Waiting));
    }

    #[test]
    fn test_confirm_and_scheduled_do_not_touch_queue() {
        let fx = plan_status_change(AppointmentStatus::Confirmed, at(10, 30), Default::default()).unwrap();
        assert!(fx.confirm);
        assert_eq!(fx.waiting_list_status, None);

        let fx = plan_status_change(AppointmentStatus::Scheduled, at(10, 30), Default::default()).unwrap();
        assert_eq!(fx, StatusEffects::default());
    }

    #[test]
    fn test_completed_with_follow_up() {
        let when = Utc.with_ymd_and_hms(2026, 3, 16, 10, 0, 0).unwrap();
        let fx = plan_status_change(
            AppointmentStatus::Completed,
            at(10, 30),
            StatusChangeInput {
                follow_up_needed: true,
                follow_up_date: Some(when),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(fx.stamp_check_out);
        assert_eq!(fx.follow_up, Some(FollowUpPlan { start: when }));
        assert_eq!(fx.waiting_list_status, Some(WaitingStatus::Completed));

        let err = plan_status_change(
            AppointmentStatus::Completed,
            at(10, 30),
            StatusChangeInput {
                follow_up_needed: true,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, SchedulingError::MissingFollowUpDate);

        let err = plan_status_change(
            AppointmentStatus::Completed,
            at(10, 30),
            StatusChangeInput {
                follow_up_needed: true,
                follow_up_date: Some(at(9, 0)),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, SchedulingError::FollowUpInPast);
    }

    #[test]
    fn test_no_show_cancels_reminders() {
        let fx = plan_status_change(
            AppointmentStatus::NoShow,
            at(10, 30),
            StatusChangeInput {
                no_show_reason: Some("".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(fx.mark_no_show);
        assert!(fx.cancel_pending_reminders);
        assert_eq!(fx.no_show_reason, None);
        assert_eq!(fx.waiting_list_status, Some(WaitingStatus::NoShow));
    }

    #[test]
    fn test_follow_up_title() {
        assert_eq!(follow_up_title(" Knee review "), "Follow-up: Knee review");
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&AppointmentStatus::CheckedIn).unwrap(),
            "\"CHECKED_IN\""
        );
        let s: AppointmentStatus = serde_json::from_str("\"NO_SHOW\"").unwrap();
        assert_eq!(s, AppointmentStatus::NoShow);
        assert!(serde_json::from_str::<AppointmentStatus>("\"DONE\"").is_err());
        assert_eq!(AppointmentStatus::InProgress.as_str(), "IN_PROGRESS");
    }
}
