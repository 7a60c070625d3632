//! A1: environment-driven configuration (spec.md §6, SPEC_FULL.md §3).
//!
//! Hand-parsed from `SBLITE_*` environment variables, mirroring the way
//! the teacher resolves its own on-disk app-data directory with `dirs`
//! rather than reaching for a config-loading crate.

use std::path::PathBuf;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailMode {
    Catch,
    Smtp,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    S3,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub anon_key: String,
    pub service_key: String,
    pub db_path: PathBuf,
    pub mail_mode: MailMode,
    pub smtp: Option<SmtpConfig>,
    pub storage_backend: StorageBackend,
    pub storage_root: PathBuf,
    pub listen_addr: String,
    pub wire_addr: String,
}

impl Config {
    /// Loads configuration from the environment. `SBLITE_JWT_SECRET` is
    /// mandatory — startup fails fast rather than running with no
    /// usable auth, the same fail-fast posture the teacher takes over
    /// its access token.
    pub fn from_env() -> Result<Self, AppError> {
        let jwt_secret = std::env::var("SBLITE_JWT_SECRET").map_err(|_| {
            AppError::internal("SBLITE_JWT_SECRET is required; generate one with `sblite keys generate`")
        })?;

        let anon_key = std::env::var("SBLITE_ANON_KEY").unwrap_or_else(|_| "anon".to_string());
        let service_key = std::env::var("SBLITE_SERVICE_KEY").unwrap_or_else(|_| "service_role".to_string());

        let db_path = std::env::var("SBLITE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir().join("sblite.db"));

        let mail_mode = match std::env::var("SBLITE_MAIL_MODE").as_deref() {
            Ok("smtp") => MailMode::Smtp,
            _ => MailMode::Catch,
        };

        let smtp = if mail_mode == MailMode::Smtp {
            Some(SmtpConfig {
                host: std::env::var("SBLITE_SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: std::env::var("SBLITE_SMTP_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(25),
                user: std::env::var("SBLITE_SMTP_USER").ok(),
                pass: std::env::var("SBLITE_SMTP_PASS").ok(),
            })
        } else {
            None
        };

        let storage_backend = match std::env::var("SBLITE_STORAGE_BACKEND").as_deref() {
            Ok("s3") => StorageBackend::S3,
            _ => StorageBackend::Local,
        };

        let storage_root = default_data_dir().join("storage");
        let listen_addr = std::env::var("SBLITE_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8000".to_string());
        let wire_addr = std::env::var("SBLITE_WIRE_ADDR").unwrap_or_else(|_| "127.0.0.1:5432".to_string());

        Ok(Self {
            jwt_secret,
            anon_key,
            service_key,
            db_path,
            mail_mode,
            smtp,
            storage_backend,
            storage_root,
            listen_addr,
            wire_addr,
        })
    }
}

/// Mirrors the teacher's `dirs`-based app-data resolution: a dedicated
/// subdirectory under the platform data dir, created on first use.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("sblite")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_secret_is_a_fail_fast_error() {
        std::env::remove_var("SBLITE_JWT_SECRET");
        assert!(Config::from_env().is_err());
    }
}
