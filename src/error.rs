use serde::Serialize;
use thiserror::Error;

/// Abstract error kinds from the error-handling design: every module-level
/// error converges here before it crosses an HTTP or wire-protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    UnsupportedFeature,
    NotFound,
    PermissionDenied,
    ConstraintViolation,
    SingleRowViolation,
    TranslationFailed,
    Transient,
    Internal,
}

impl ErrorKind {
    /// Maps onto the PostgreSQL SQLSTATE-shaped codes from spec.md §7.
    pub fn sqlstate(self) -> &'static str {
        match self {
            ErrorKind::ParseError => "42601",
            ErrorKind::UnsupportedFeature => "42883",
            ErrorKind::NotFound => "42P01",
            ErrorKind::PermissionDenied => "42501",
            ErrorKind::ConstraintViolation => "23000",
            ErrorKind::SingleRowViolation => "PGRST116",
            ErrorKind::TranslationFailed => "XX000",
            ErrorKind::Transient => "57014",
            ErrorKind::Internal => "PGRST500",
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
    pub hint: Option<String>,
    /// Overrides `kind.sqlstate()` for errors with a specific PG code
    /// (e.g. `23505` unique violation vs the generic `23000`).
    pub code_override: Option<&'static str>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            hint: None,
            code_override: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code_override = Some(code);
        self
    }

    pub fn code(&self) -> &'static str {
        self.code_override.unwrap_or_else(|| self.kind.sqlstate())
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFeature, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn constraint(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConstraintViolation, message).with_code(code)
    }

    pub fn single_row_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SingleRowViolation, message).with_code("PGRST116")
    }

    pub fn pgrst(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message).with_code(code)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// `{code, message, details?, hint?}` — the REST error envelope from spec.md §6.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&AppError> for ErrorEnvelope {
    fn from(e: &AppError) -> Self {
        ErrorEnvelope {
            code: e.code().to_string(),
            message: e.message.clone(),
            details: e.details.clone(),
            hint: e.hint.clone(),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _) => {
                use rusqlite::ErrorCode::*;
                match err.code {
                    ConstraintViolation => {
                        let msg = e.to_string();
                        if msg.contains("UNIQUE") {
                            AppError::constraint("23505", msg)
                        } else if msg.contains("FOREIGN KEY") {
                            AppError::constraint("23503", msg)
                        } else if msg.contains("NOT NULL") {
                            AppError::constraint("23502", msg)
                        } else {
                            AppError::constraint("23000", msg)
                        }
                    }
                    DatabaseBusy | DatabaseLocked => {
                        AppError::new(ErrorKind::Transient, "database is busy")
                    }
                    _ => AppError::internal(e.to_string()),
                }
            }
            rusqlite::Error::QueryReturnedNoRows => {
                AppError::not_found("no rows returned by statement")
            }
            _ => AppError::internal(e.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
