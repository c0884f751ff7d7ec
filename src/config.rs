use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,
    pub redis_cache_ttl_seconds: u64,

    // CORS
    pub cors_allow_origins: Vec<String>,

    // Sessions
    pub session_secret: String,
    pub session_ttl_hours: i64,

    // Vision model
    pub anthropic_api_key: String,
    pub anthropic_base_url: String,
    pub vision_model: String,
    pub vision_max_tokens: u32,
    pub vision_timeout_seconds: u64,
    pub vision_max_retries: u32,

    // Uploads
    pub upload_dir: String,
    pub max_upload_bytes: usize,

    // Background extraction jobs
    pub extraction_job_ttl_seconds: u64,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Longest session lifetime accepted from `SESSION_TTL_HOURS`
pub const MAX_SESSION_TTL_HOURS: i64 = 24 * 365;

/// Reject session lifetimes outside `1..=MAX_SESSION_TTL_HOURS`
pub fn check_session_ttl(hours: i64) -> Result<i64> {
    if !(1..=MAX_SESSION_TTL_HOURS).contains(&hours) {
        anyhow::bail!(
            "SESSION_TTL_HOURS must be between 1 and {}, got {}",
            MAX_SESSION_TTL_HOURS,
            hours
        );
    }
    Ok(hours)
}

/// Split a comma separated origin list, dropping blanks.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = Environment::from_str(&env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string()));

        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        // Database
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_connections = parse_or("DATABASE_MAX_CONNECTIONS", 10);

        // Redis
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis_cache_ttl_seconds = parse_or("REDIS_CACHE_TTL_SECONDS", 86400); // 24 hours

        // CORS
        let cors_allow_origins = parse_origins(
            &env::var("CORS_ALLOW_ORIGINS").unwrap_or_else(|_| "http://localhost:3000".to_string()),
        );

        // Sessions
        let session_secret = env::var("SESSION_SECRET").context("SESSION_SECRET must be set")?;
        if session_secret.len() < 32 {
            anyhow::bail!("SESSION_SECRET must be at least 32 bytes");
        }
        let session_ttl_hours = check_session_ttl(parse_or("SESSION_TTL_HOURS", 24 * 7))?;

        // Vision model
        let anthropic_api_key =
            env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY must be set")?;
        let anthropic_base_url = env::var("ANTHROPIC_BASE_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
        url::Url::parse(&anthropic_base_url).context("ANTHROPIC_BASE_URL is not a valid URL")?;
        let vision_model = env::var("VISION_MODEL")
            .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string());
        let vision_max_tokens = parse_or("VISION_MAX_TOKENS", 4096);
        let vision_timeout_seconds = parse_or("VISION_TIMEOUT_SECONDS", 120); // LLM calls are slow
        let vision_max_retries = parse_or("VISION_MAX_RETRIES", 3);

        // Uploads
        let upload_dir = env::var("UPLOAD_DIR").unwrap_or_else(|_| "./uploads".to_string());
        let max_upload_bytes = parse_or("MAX_UPLOAD_BYTES", 25 * 1024 * 1024);

        let extraction_job_ttl_seconds = parse_or("EXTRACTION_JOB_TTL_SECONDS", 3600);

        Ok(Settings {
            env,
            server_addr,
            database_url,
            database_max_connections,
            redis_url,
            redis_cache_ttl_seconds,
            cors_allow_origins,
            session_secret,
            session_ttl_hours,
            anthropic_api_key,
            anthropic_base_url,
            vision_model,
            vision_max_tokens,
            vision_timeout_seconds,
            vision_max_retries,
            upload_dir,
            max_upload_bytes,
            extraction_job_ttl_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parsing_is_case_insensitive() {
        assert_eq!(Environment::from_str("PRODUCTION"), Environment::Prod);
        assert_eq!(Environment::from_str("prod"), Environment::Prod);
        assert_eq!(Environment::from_str("Staging"), Environment::Staging);
        assert_eq!(Environment::from_str("anything-else"), Environment::Dev);
    }

    #[test]
    fn session_ttl_must_be_sane() {
        assert_eq!(check_session_ttl(168).unwrap(), 168);
        assert_eq!(check_session_ttl(MAX_SESSION_TTL_HOURS).unwrap(), MAX_SESSION_TTL_HOURS);
        assert!(check_session_ttl(0).is_err());
        assert!(check_session_ttl(-5).is_err());
        assert!(check_session_ttl(i64::MAX).is_err());
    }

    #[test]
    fn origins_are_trimmed_and_blanks_dropped() {
        let origins = parse_origins(" http://localhost:3000 , ,https://app.example.com,");
        assert_eq!(
            origins,
            vec![
                "http://localhost:3000".to_string(),
                "https://app.example.com".to_string()
            ]
        );
    }
}
