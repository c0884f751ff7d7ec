use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::users::Role;
use crate::error::ApiError;

/// Authenticated user context, built from a verified token and its session row
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub username: String,
    pub email: String,
    /// Current role as stored in the database
    pub role: Role,
}

impl AuthContext {
    pub fn require_user_admin(&self) -> Result<(), ApiError> {
        if self.role.can_manage_users() {
            Ok(())
        } else {
            Err(ApiError::forbidden("Administrator role required"))
        }
    }

    pub fn require_manager(&self) -> Result<(), ApiError> {
        if self.role.can_manage_packages() {
            Ok(())
        } else {
            Err(ApiError::forbidden("Manager role required"))
        }
    }

    pub fn require_editor(&self) -> Result<(), ApiError> {
        if self.role.can_edit_line_items() {
            Ok(())
        } else {
            Err(ApiError::forbidden("Your role cannot modify line items"))
        }
    }

    pub fn require_reviewer(&self) -> Result<(), ApiError> {
        if self.role.can_review() {
            Ok(())
        } else {
            Err(ApiError::forbidden("Reviewer role required"))
        }
    }
}

/// Session and user state loaded for a token
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub role: String,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// A session authenticates while it is live and its user is active
    pub fn check(&self, token_user_id: Uuid, now: DateTime<Utc>) -> Result<(), &'static str> {
        if self.user_id != token_user_id {
            return Err("Session does not belong to token subject");
        }
        if self.revoked_at.is_some() {
            return Err("Session has been revoked");
        }
        if self.expires_at <= now {
            return Err("Session has expired");
        }
        if !self.is_active || self.deleted_at.is_some() {
            return Err("User account is deactivated");
        }
        Ok(())
    }

    pub fn into_context(self) -> Result<AuthContext, &'static str> {
        let role = self
            .role
            .parse::<Role>()
            .map_err(|_| "Unknown role on user account")?;
        Ok(AuthContext {
            user_id: self.user_id,
            session_id: self.session_id,
            username: self.username,
            email: self.email,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn live_record() -> SessionRecord {
        SessionRecord {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            username: "sam".to_string(),
            email: "sam@example.com".to_string(),
            role: "reviewer".to_string(),
            is_active: true,
            deleted_at: None,
            expires_at: Utc::now() + Duration::hours(1),
            revoked_at: None,
        }
    }

    #[test]
    fn live_session_passes() {
        let record = live_record();
        assert!(record.check(record.user_id, Utc::now()).is_ok());
        let ctx = record.into_context().unwrap();
        assert_eq!(ctx.role, Role::Reviewer);
    }

    #[test]
    fn soft_deleted_user_cannot_authenticate() {
        let mut record = live_record();
        record.is_active = false;
        record.deleted_at = Some(Utc::now());
        assert_eq!(
            record.check(record.user_id, Utc::now()),
            Err("User account is deactivated")
        );
    }

    #[test]
    fn revoked_or_expired_sessions_fail() {
        let mut revoked = live_record();
        revoked.revoked_at = Some(Utc::now());
        assert!(revoked.check(revoked.user_id, Utc::now()).is_err());

        let mut expired = live_record();
        expired.expires_at = Utc::now() - Duration::seconds(1);
        assert!(expired.check(expired.user_id, Utc::now()).is_err());
    }

    #[test]
    fn session_of_another_user_fails() {
        let record = live_record();
        assert!(record.check(Uuid::new_v4(), Utc::now()).is_err());
    }

    #[test]
    fn role_guards() {
        let mut ctx = live_record().into_context().unwrap();
        assert!(ctx.require_reviewer().is_ok());
        assert!(ctx.require_editor().is_err());
        assert!(ctx.require_manager().is_err());

        ctx.role = Role::Admin;
        assert!(ctx.require_user_admin().is_ok());
        assert!(ctx.require_manager().is_ok());
        assert!(ctx.require_editor().is_ok());
    }
}
