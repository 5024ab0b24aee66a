// 🚦 Error taxonomy - one variant per client-visible failure class
// Every variant maps to exactly one HTTP status and a stable error code

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoanError {
    /// Malformed or missing input
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    /// Bad, expired or missing credentials
    #[error("{0}")]
    Authentication(String),

    /// Wrong role, or not the owner of the resource
    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    /// Illegal state transition or duplicate registration
    #[error("{0}")]
    Conflict(String),

    /// Storage or other unexpected failure. Never shown to clients verbatim.
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type LoanResult<T> = Result<T, LoanError>;

impl LoanError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        LoanError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn loan_not_found(id: i64) -> Self {
        LoanError::NotFound(format!("Loan application {} not found", id))
    }

    /// HTTP status code as a plain number
    pub fn status_code(&self) -> u16 {
        match self {
            LoanError::Validation { .. } => 400,
            LoanError::Authentication(_) => 401,
            LoanError::Authorization(_) => 403,
            LoanError::NotFound(_) => 404,
            LoanError::Conflict(_) => 409,
            LoanError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code carried in the JSON error body
    pub fn code(&self) -> &'static str {
        match self {
            LoanError::Validation { .. } => "validation_error",
            LoanError::Authentication(_) => "authentication_error",
            LoanError::Authorization(_) => "authorization_error",
            LoanError::NotFound(_) => "not_found",
            LoanError::Conflict(_) => "conflict",
            LoanError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to return to a client
    pub fn public_message(&self) -> String {
        match self {
            LoanError::Internal(_) => "An internal error occurred".to_string(),
            LoanError::Validation { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for LoanError {
    fn from(err: rusqlite::Error) -> Self {
        LoanError::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(LoanError::validation("amount", "too small").status_code(), 400);
        assert_eq!(LoanError::Authentication("no token".into()).status_code(), 401);
        assert_eq!(LoanError::Authorization("admins only".into()).status_code(), 403);
        assert_eq!(LoanError::loan_not_found(7).status_code(), 404);
        assert_eq!(LoanError::Conflict("already approved".into()).status_code(), 409);
        assert_eq!(
            LoanError::Internal(anyhow::anyhow!("disk full")).status_code(),
            500
        );
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = LoanError::Internal(anyhow::anyhow!("no such table: loans"));

        assert_eq!(err.code(), "internal_error");
        assert!(!err.public_message().contains("loans"));
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn test_validation_message_excludes_field_prefix() {
        let err = LoanError::validation("purpose", "Unknown purpose 'yacht'");

        assert_eq!(err.public_message(), "Unknown purpose 'yacht'");
        assert_eq!(err.to_string(), "purpose: Unknown purpose 'yacht'");
    }
}
