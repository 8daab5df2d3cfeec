use crate::error::ApiError;
use crate::middleware::auth_context::AuthContext;

/// Role mapping according to the `hms_user.role` column:
/// 0 Patient, 1 Admin, 2 Doctor, 3 Nurse, 4 Receptionist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Patient,
    Admin,
    Doctor,
    Nurse,
    Receptionist,
}

impl Role {
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Role::Patient),
            1 => Some(Role::Admin),
            2 => Some(Role::Doctor),
            3 => Some(Role::Nurse),
            4 => Some(Role::Receptionist),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Admin => "admin",
            Role::Doctor => "doctor",
            Role::Nurse => "nurse",
            Role::Receptionist => "receptionist",
        }
    }

    pub fn permissions(&self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::Admin => &[
                ViewSchedule,
                BookAppointments,
                UpdateAppointmentStatus,
                ManageReminders,
                ManageWaitingList,
                ViewPatients,
                ManagePatients,
                ManageDoctors,
                ManageUsers,
            ],
            Role::Doctor => &[ViewSchedule, UpdateAppointmentStatus, ViewPatients],
            Role::Nurse => &[
                ViewSchedule,
                UpdateAppointmentStatus,
                ManageWaitingList,
                ViewPatients,
            ],
            Role::Receptionist => &[
                ViewSchedule,
                BookAppointments,
                UpdateAppointmentStatus,
                ManageReminders,
                ManageWaitingList,
                ViewPatients,
                ManagePatients,
            ],
            Role::Patient => &[],
        }
    }
}

pub fn role_to_string(role: i16) -> String {
    Role::from_i16(role)
        .map(|r| r.as_str())
        .unwrap_or("unknown")
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ViewSchedule,
    BookAppointments,
    UpdateAppointmentStatus,
    ManageReminders,
    ManageWaitingList,
    ViewPatients,
    ManagePatients,
    ManageDoctors,
    ManageUsers,
}

impl Permission {
    fn describe(&self) -> &'static str {
        match self {
            Permission::ViewSchedule => "view schedules",
            Permission::BookAppointments => "book appointments",
            Permission::UpdateAppointmentStatus => "update appointment status",
            Permission::ManageReminders => "manage reminders",
            Permission::ManageWaitingList => "manage the waiting list",
            Permission::ViewPatients => "view patients",
            Permission::ManagePatients => "manage patients",
            Permission::ManageDoctors => "manage doctors and departments",
            Permission::ManageUsers => "manage users",
        }
    }
}

pub fn has_permission(role: i16, permission: Permission) -> bool {
    Role::from_i16(role)
        .map(|r| r.permissions().contains(&permission))
        .unwrap_or(false)
}

pub fn require(auth: &AuthContext, permission: Permission) -> Result<(), ApiError> {
    if has_permission(auth.role, permission) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            format!("You do not have permission to {}", permission.describe()),
        ))
    }
}

pub fn is_doctor(auth: &AuthContext) -> bool {
    auth.role == Role::Doctor as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrip_values() {
        assert_eq!(Role::from_i16(1), Some(Role::Admin));
        assert_eq!(Role::from_i16(4), Some(Role::Receptionist));
        assert_eq!(Role::from_i16(9), None);
        assert_eq!(Role::Doctor as i16, 2);
        assert_eq!(role_to_string(3), "nurse");
        assert_eq!(role_to_string(-1), "unknown");
    }

    #[test]
    fn test_permission_membership() {
        assert!(has_permission(1, Permission::ManageUsers));
        assert!(has_permission(4, Permission::BookAppointments));
        assert!(!has_permission(4, Permission::ManageUsers));
        assert!(has_permission(2, Permission::UpdateAppointmentStatus));
        assert!(!has_permission(2, Permission::BookAppointments));
        assert!(has_permission(3, Permission::ManageWaitingList));
        assert!(!has_permission(0, Permission::ViewSchedule));
        assert!(!has_permission(42, Permission::ViewSchedule));
    }

    #[test]
    fn test_require_rejects_with_forbidden() {
        let auth = AuthContext {
            user_id: uuid::Uuid::new_v4(),
            role: 0,
            session_token_id: uuid::Uuid::new_v4(),
        };
        let err = require(&auth, Permission::ViewPatients).unwrap_err();
        assert!(matches!(err, ApiError::Forbidden("FORBIDDEN", _)));
    }
}
