use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// User role, ordered loosely from most to least privileged
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Estimator,
    Reviewer,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Estimator => "estimator",
            Role::Reviewer => "reviewer",
            Role::Viewer => "viewer",
        }
    }

    /// User administration
    pub fn can_manage_users(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Create/update/delete projects and bid packages, assign users, complete packages
    pub fn can_manage_packages(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }

    /// Upload diagrams, run extraction, edit line items
    pub fn can_edit_line_items(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager | Role::Estimator)
    }

    /// Approve or reject line items, verify bid forms
    pub fn can_review(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager | Role::Reviewer)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "estimator" => Ok(Role::Estimator),
            "reviewer" => Ok(Role::Reviewer),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Public view of a user
#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub full_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn validate_username(username: &str) -> Result<(), ValidationError> {
    let ok = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(ValidationError::new("username_format").with_message(
            "may only contain letters, digits, '.', '_' and '-'".into(),
        ))
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    #[validate(
        length(min = 3, max = 50, message = "must be between 3 and 50 characters"),
        custom(function = "validate_username")
    )]
    pub username: String,
    #[validate(length(min = 8, max = 128, message = "must be between 8 and 128 characters"))]
    pub password: String,
    #[serde(default)]
    #[validate(length(max = 100, message = "must be at most 100 characters"))]
    pub full_name: Option<String>,
}

/// Login accepts either the email address or the username
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "is required"))]
    pub login: String,
    #[validate(length(min = 1, message = "is required"))]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "is required"))]
    pub current_password: String,
    #[validate(length(min = 8, max = 128, message = "must be between 8 and 128 characters"))]
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
    pub user: UserResponse,
}

/// Admin update of a user
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[serde(default)]
    #[validate(length(max = 100, message = "must be at most 100 characters"))]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserQuery {
    pub role: Option<Role>,
    pub is_active: Option<bool>,
    pub search: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_capabilities() {
        assert!(Role::Admin.can_manage_users());
        assert!(!Role::Manager.can_manage_users());

        assert!(Role::Manager.can_manage_packages());
        assert!(!Role::Estimator.can_manage_packages());

        assert!(Role::Estimator.can_edit_line_items());
        assert!(!Role::Reviewer.can_edit_line_items());

        assert!(Role::Reviewer.can_review());
        assert!(!Role::Estimator.can_review());

        for role in [Role::Viewer] {
            assert!(!role.can_edit_line_items());
            assert!(!role.can_review());
            assert!(!role.can_manage_packages());
        }
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [
            Role::Admin,
            Role::Manager,
            Role::Estimator,
            Role::Reviewer,
            Role::Viewer,
        ] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn register_request_validation() {
        let valid = RegisterRequest {
            email: "pat@example.com".to_string(),
            username: "pat.estimator".to_string(),
            password: "correct horse".to_string(),
            full_name: None,
        };
        assert!(valid.validate().is_ok());

        let bad_email = RegisterRequest {
            email: "not-an-email".to_string(),
            ..valid.clone()
        };
        assert!(bad_email.validate().is_err());

        let bad_username = RegisterRequest {
            username: "has space".to_string(),
            ..valid.clone()
        };
        assert!(bad_username.validate().is_err());

        let short_password = RegisterRequest {
            password: "short".to_string(),
            ..valid
        };
        assert!(short_password.validate().is_err());
    }

    #[test]
    fn login_request_requires_both_fields() {
        let req = LoginRequest {
            login: String::new(),
            password: "x".to_string(),
        };
        assert!(req.validate().is_err());
    }
}
