use serde::{Deserialize, Serialize};

/// Issuer written into every session token
pub const TOKEN_ISSUER: &str = "precon-backend";

/// JWT claims of a session token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    /// Session ID, checked against the sessions table on every request
    pub sid: String,

    /// Role at login time. Informational only: authorization reads the
    /// current role from the database.
    pub role: String,

    /// Issuer
    pub iss: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,
}
