//! Capability checks for every resource the API exposes.
//!
//! Handlers describe *what* they are about to touch as a [`Resource`] and ask
//! [`can_access`]; role rules live only here.

use uuid::Uuid;

use crate::error::AppError;
use crate::models::{auth::AuthenticatedUser, user::UserRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    /// Take or give back a seat directly.
    Book,
    ProcessPayment,
    CancelSubscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Programs and the list of locations.
    Catalog,
    Location(Uuid),
    ClassSession { location_id: Uuid },
    Schedule { location_id: Uuid },
    DiscountCode { location_id: Uuid },
    Enrollment { location_id: Uuid, parent_id: Uuid },
    Progress { location_id: Uuid, parent_id: Uuid },
    CronControl,
}

pub fn can_access(user: &AuthenticatedUser, action: Action, resource: Resource) -> bool {
    if user.role == UserRole::Owner {
        return true;
    }
    let at = |loc: Uuid| user.location_id == Some(loc);
    let role = user.role;

    match resource {
        Resource::Catalog => action == Action::Read,
        Resource::Location(loc) => match action {
            Action::Read => true,
            Action::Update => role == UserRole::LocationManager && at(loc),
            _ => false,
        },
        Resource::ClassSession { location_id } | Resource::Schedule { location_id } => {
            match action {
                Action::Read => at(location_id),
                Action::Create | Action::Update | Action::Delete | Action::Book => {
                    role.is_location_staff() && at(location_id)
                }
                _ => false,
            }
        }
        Resource::DiscountCode { location_id } => match action {
            Action::Read | Action::Create | Action::Update | Action::Delete => {
                matches!(role, UserRole::LocationManager | UserRole::Admin) && at(location_id)
            }
            _ => false,
        },
        Resource::Enrollment {
            location_id,
            parent_id,
        } => {
            let own_admin = role == UserRole::Admin && at(location_id);
            let own_parent = role == UserRole::Parent && user.user_id == parent_id;
            match action {
                Action::Create | Action::Read | Action::ProcessPayment => own_admin || own_parent,
                Action::Update | Action::Delete | Action::CancelSubscription => own_admin,
                Action::Book => false,
            }
        }
        Resource::Progress {
            location_id,
            parent_id,
        } => match action {
            Action::Read => {
                (role.is_location_staff() && at(location_id))
                    || (role == UserRole::Parent && user.user_id == parent_id)
            }
            Action::Update => role.is_location_staff() && at(location_id),
            _ => false,
        },
        Resource::CronControl => role == UserRole::Admin,
    }
}

/// `can_access` as a guard for handlers.
pub fn authorize(user: &AuthenticatedUser, action: Action, resource: Resource) -> Result<(), AppError> {
    if can_access(user, action, resource) {
        Ok(())
    } else {
        Err(AppError::forbidden())
    }
}

/// Location a staff member creates things in: owners must name one, others use their own.
pub fn target_location(user: &AuthenticatedUser, requested: Option<Uuid>) -> Result<Uuid, AppError> {
    match (user.role, requested, user.location_id) {
        (UserRole::Owner, Some(loc), _) => Ok(loc),
        (UserRole::Owner, None, _) => Err(AppError::validation("location_id is required")),
        (_, Some(loc), Some(own)) if loc != own => Err(AppError::forbidden()),
        (_, _, Some(own)) => Ok(own),
        (_, _, None) => Err(AppError::forbidden()),
    }
}
