//! Password hashing
//!
//! bcrypt is CPU bound, so both operations run on the blocking pool.

use anyhow::{Context, Result};

pub async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .context("Password hashing task panicked")?
        .context("Failed to hash password")
}

/// `Ok(false)` on mismatch; malformed stored hashes are errors
pub async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .context("Password verification task panicked")?
        .context("Failed to verify password")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_then_verify() {
        let hash = hash_password("correct horse battery").await.unwrap();
        assert_ne!(hash, "correct horse battery");
        assert!(verify_password("correct horse battery", &hash).await.unwrap());
        assert!(!verify_password("wrong password", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_hash_is_an_error() {
        assert!(verify_password("anything", "not-a-bcrypt-hash").await.is_err());
    }
}
