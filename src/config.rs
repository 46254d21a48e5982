use std::time::Duration;

use crate::retry::RetryPolicy;

fn string_env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Object storage settings (MinIO or S3).
#[derive(Clone, Debug)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// When set, evidence URLs are public `{base}/{bucket}/{key}` links instead of presigned ones.
    pub public_base_url: Option<String>,
    pub url_ttl: Duration,
}

impl S3Config {
    pub fn from_env() -> Self {
        Self {
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            bucket: string_env("S3_BUCKET", "disciplina-evidence"),
            region: string_env("S3_REGION", "us-east-1"),
            access_key: std::env::var("S3_ACCESS_KEY").unwrap_or_default(),
            secret_key: std::env::var("S3_SECRET_KEY").unwrap_or_default(),
            public_base_url: std::env::var("S3_PUBLIC_BASE_URL").ok().filter(|v| !v.is_empty()),
            url_ttl: Duration::from_secs(parse_env("EVIDENCE_URL_TTL_SECS", 3600)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    pub database_url: Option<String>,
    pub retry: RetryPolicy,
    pub cache_ttl: Duration,
    /// Investigation budget used when a due process is started without an explicit one.
    pub default_investigation_days: i64,
    pub s3: S3Config,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            host: string_env("BIND_HOST", "0.0.0.0"),
            port: parse_env("BIND_PORT", 8080),
            frontend_url: string_env("FRONTEND_URL", "http://localhost:5173"),
            database_url: std::env::var("DATABASE_URL").ok(),
            retry: RetryPolicy::from_env(),
            cache_ttl: Duration::from_secs(parse_env("CACHE_TTL_SECS", 30)),
            default_investigation_days: parse_env("DEFAULT_INVESTIGATION_DAYS", 10),
            s3: S3Config::from_env(),
        }
    }
}
