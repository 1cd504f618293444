//! Time-based one-time codes (RFC 6238: SHA1, 30 second step, 6 digits)

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::runner::error::ActionError;

pub const TOTP_STEP_SECS: u64 = 30;
pub const TOTP_DIGITS: usize = 6;

/// Source of "now" for code generation
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock pinned to one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub SystemTime);

impl FixedClock {
    pub fn at_unix(secs: u64) -> Self {
        Self(UNIX_EPOCH + Duration::from_secs(secs))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

/// Strip the decorations people put around base32 secrets
fn normalize_secret(secret: &str) -> String {
    secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '=')
        .collect::<String>()
        .to_uppercase()
}

fn build_totp(secret: &str) -> Result<TOTP, ActionError> {
    let normalized = normalize_secret(secret);
    if normalized.is_empty() {
        return Err(ActionError::InvalidSecret("one-time code secret is empty".into()));
    }
    let bytes = Secret::Encoded(normalized)
        .to_bytes()
        .map_err(|e| ActionError::InvalidSecret(format!("not valid base32: {:?}", e)))?;

    // Real-world secrets are often shorter than the 128 bits `TOTP::new` insists on
    Ok(TOTP::new_unchecked(
        Algorithm::SHA1,
        TOTP_DIGITS,
        1,
        TOTP_STEP_SECS,
        bytes,
    ))
}

/// Code for `secret` at instant `at`. Pure: same inputs, same code.
pub fn current_totp(secret: &str, at: SystemTime) -> Result<String, ActionError> {
    let totp = build_totp(secret)?;
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(totp.generate(secs))
}

/// Seconds until the code for `at` rolls over
pub fn seconds_remaining(at: SystemTime) -> u64 {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    TOTP_STEP_SECS - secs % TOTP_STEP_SECS
}
