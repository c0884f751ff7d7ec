//! Session token signing and verification

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use super::claims::{Claims, TOKEN_ISSUER};
use crate::config::MAX_SESSION_TTL_HOURS;
use crate::domain::users::Role;

/// HS256 signer for session tokens
#[derive(Clone)]
pub struct SessionTokens {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl SessionTokens {
    /// `ttl_hours` is clamped to `1..=MAX_SESSION_TTL_HOURS`
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::hours(ttl_hours.clamp(1, MAX_SESSION_TTL_HOURS)),
        }
    }

    /// Expiry for a session created at `now`
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }

    /// Sign a token for `session_id`, valid until `expires_at`
    pub fn issue(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        role: Role,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            role: role.as_str().to_string(),
            iss: TOKEN_ISSUER.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("Failed to sign session token")
    }

    /// Verify signature, issuer and expiry
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.validate_exp = true;
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .context("Session token validation failed")?;

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn lifetimes_are_clamped() {
        let now = Utc::now();
        let huge = SessionTokens::new(SECRET, i64::MAX);
        assert_eq!(
            huge.expires_at(now) - now,
            Duration::hours(MAX_SESSION_TTL_HOURS)
        );

        let negative = SessionTokens::new(SECRET, -3);
        assert_eq!(negative.expires_at(now) - now, Duration::hours(1));
    }

    #[test]
    fn issued_tokens_verify() {
        let tokens = SessionTokens::new(SECRET, 24);
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let now = Utc::now();

        let token = tokens
            .issue(user_id, session_id, Role::Estimator, now, tokens.expires_at(now))
            .unwrap();
        let claims = tokens.verify(&token).unwrap();

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.sid, session_id.to_string());
        assert_eq!(claims.role, "estimator");
        assert_eq!(claims.iss, TOKEN_ISSUER);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let tokens = SessionTokens::new(SECRET, 24);
        let issued = Utc::now() - Duration::hours(3);
        let token = tokens
            .issue(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Role::Viewer,
                issued,
                issued + Duration::hours(1),
            )
            .unwrap();

        assert!(tokens.verify(&token).is_err());
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let ours = SessionTokens::new(SECRET, 24);
        let theirs = SessionTokens::new("ffffffffffffffffffffffffffffffff", 24);
        let now = Utc::now();
        let token = theirs
            .issue(Uuid::new_v4(), Uuid::new_v4(), Role::Admin, now, theirs.expires_at(now))
            .unwrap();

        assert!(ours.verify(&token).is_err());
        assert!(ours.verify("not-a-jwt").is_err());
    }
}
