use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Element could not be resolved within its time budget
#[derive(Debug, Clone, Error)]
#[error("element not found (selector: {}, text: {}) after {elapsed_ms}ms", .selector.as_deref().unwrap_or("-"), .fallback_text.as_deref().unwrap_or("-"))]
pub struct LocatorError {
    pub selector: Option<String>,
    pub fallback_text: Option<String>,
    pub elapsed_ms: u64,
}

/// Phases of the federated login macro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginPhase {
    OpenSite,
    LoginEntry,
    Credentials,
    OneTimeCode,
    Consent,
}

impl fmt::Display for LoginPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginPhase::OpenSite => "open site",
            LoginPhase::LoginEntry => "login entry",
            LoginPhase::Credentials => "credentials",
            LoginPhase::OneTimeCode => "one-time code",
            LoginPhase::Consent => "consent",
        };
        f.write_str(name)
    }
}

/// Everything a single action can fail with.
///
/// The executor converts each of these into a failed `StepResult`; none of
/// them is allowed to escape the runner.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("missing secret: environment variable(s) {} not set", .names.join(", "))]
    MissingSecret { names: Vec<String> },

    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("assertion failed: {what}: expected {expected:?}, actual {actual:?}")]
    AssertionMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("login flow failed during {phase}: {reason}")]
    LoginFlow { phase: LoginPhase, reason: String },

    #[error("one-time code rejected after {attempts} attempts")]
    TotpExhausted { attempts: u32 },

    #[error("navigation blocked: {url} is outside the allowed hosts")]
    NavigationBlocked { url: String },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("browser error: {0:#}")]
    Browser(anyhow::Error),
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        ActionError::Browser(err)
    }
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::MissingSecret { .. } => ErrorKind::MissingSecret,
            ActionError::InvalidSecret(_) => ErrorKind::InvalidSecret,
            ActionError::Locator(_) => ErrorKind::Locator,
            ActionError::Timeout { .. } => ErrorKind::Timeout,
            ActionError::AssertionMismatch { .. } => ErrorKind::AssertionMismatch,
            ActionError::LoginFlow { .. } => ErrorKind::LoginFlow,
            ActionError::TotpExhausted { .. } => ErrorKind::TotpExhausted,
            ActionError::NavigationBlocked { .. } => ErrorKind::NavigationBlocked,
            ActionError::UnknownAction(_) => ErrorKind::UnknownAction,
            ActionError::Browser(_) => ErrorKind::Browser,
        }
    }

    pub fn missing(name: &str) -> Self {
        ActionError::MissingSecret {
            names: vec![name.to_string()],
        }
    }

    pub fn login(phase: LoginPhase, reason: impl fmt::Display) -> Self {
        ActionError::LoginFlow {
            phase,
            reason: reason.to_string(),
        }
    }
}

/// Serializable tag for a failure, recorded on step and test results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingSecret,
    InvalidSecret,
    Locator,
    Timeout,
    AssertionMismatch,
    LoginFlow,
    TotpExhausted,
    NavigationBlocked,
    UnknownAction,
    Browser,
    SessionStart,
}

impl ErrorKind {
    /// Failures caused by the harness or environment rather than the page under test
    pub fn is_execution_error(self) -> bool {
        matches!(
            self,
            ErrorKind::Browser | ErrorKind::SessionStart | ErrorKind::UnknownAction
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_secret_lists_every_name() {
        let err = ActionError::MissingSecret {
            names: vec!["LOGIN_USERNAME".into(), "TOTP_SECRET".into()],
        };
        assert_eq!(err.kind(), ErrorKind::MissingSecret);
        assert_eq!(
            err.to_string(),
            "missing secret: environment variable(s) LOGIN_USERNAME, TOTP_SECRET not set"
        );
    }

    #[test]
    fn test_locator_error_message() {
        let err: ActionError = LocatorError {
            selector: Some("#email".into()),
            fallback_text: None,
            elapsed_ms: 1200,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Locator);
        assert!(err.to_string().contains("#email"));
        assert!(err.to_string().contains("1200ms"));
    }

    #[test]
    fn test_login_flow_names_phase() {
        let err = ActionError::login(LoginPhase::LoginEntry, "no login control");
        assert_eq!(
            err.to_string(),
            "login flow failed during login entry: no login control"
        );
    }

    #[test]
    fn test_execution_error_kinds() {
        assert!(ErrorKind::SessionStart.is_execution_error());
        assert!(ErrorKind::UnknownAction.is_execution_error());
        assert!(!ErrorKind::AssertionMismatch.is_execution_error());
        assert!(!ErrorKind::Locator.is_execution_error());
        assert!(!ErrorKind::NavigationBlocked.is_execution_error());
    }

    #[test]
    fn test_navigation_blocked_message() {
        let err = ActionError::NavigationBlocked {
            url: "https://www.google.com/".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NavigationBlocked);
        assert_eq!(
            err.to_string(),
            "navigation blocked: https://www.google.com/ is outside the allowed hosts"
        );
    }
}
