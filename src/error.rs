//! Unified application error model and mapping helpers.
//! `AppError` is what collaborator calls (auth, profile tables, attendance writes,
//! change feed) return. Components catch it at their boundary and convert it into
//! a typed, user-facing outcome; `ScanError` is the outcome type of the scan pipeline.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    NotFound { code: String, message: String },
    Conflict { code: String, message: String },
    Auth { code: String, message: String },
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn auth<S: Into<String>>(code: S, msg: S) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn io<S: Into<String>>(code: S, msg: S) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// True when the backend could not be reached at all (as opposed to rejecting the call).
    pub fn is_network(&self) -> bool { matches!(self, AppError::Io { .. }) }

    /// True for failures that mean "nobody is signed in" rather than a broken backend.
    pub fn is_unauthenticated(&self) -> bool { matches!(self, AppError::Auth { .. }) }

    /// Short message suitable for a toast or status line.
    pub fn user_message(&self) -> String {
        match self {
            AppError::UserInput { message, .. } => message.clone(),
            AppError::NotFound { .. } => "The requested record was not found.".to_string(),
            AppError::Conflict { .. } => "This record already exists.".to_string(),
            AppError::Auth { code, .. } if code == "portal_mismatch" => {
                "This account cannot sign in here. Use the login page for your role.".to_string()
            }
            AppError::Auth { .. } => "Invalid credentials or session expired.".to_string(),
            AppError::Io { .. } => "Unable to reach the server. Check your connection.".to_string(),
            AppError::Internal { .. } => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: treat as Internal unless downcasted elsewhere
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(err) => AppError::Internal { code: "internal_error".into(), message: err.to_string() },
        }
    }
}

/// Per-detection failures reported by the scan pipeline. None of them stop scanning.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("invalid code")]
    InvalidCode,
    #[error("no student matches code {0}")]
    UnknownCode(String),
    #[error("no active attendance session")]
    NoActiveSession,
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
}

impl ScanError {
    pub fn code_str(&self) -> &'static str {
        match self {
            ScanError::InvalidCode => "invalid-code",
            ScanError::UnknownCode(_) => "unknown-code",
            ScanError::NoActiveSession => "no-active-session",
            ScanError::NetworkUnavailable(_) => "network-unavailable",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ScanError::InvalidCode => "Invalid barcode. Please scan again.".to_string(),
            ScanError::UnknownCode(code) => format!("Student not found for code {}.", code),
            ScanError::NoActiveSession => "No active session. Start an attendance session before scanning.".to_string(),
            ScanError::NetworkUnavailable(_) => "Network unavailable. Attendance was not saved.".to_string(),
        }
    }

    /// Backend failures during resolve/write all surface as `network-unavailable`:
    /// the pipeline has no other bucket for them and the user action is the same.
    pub fn from_backend(err: &AppError) -> Self {
        ScanError::NetworkUnavailable(err.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
