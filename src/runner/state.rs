use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{ActionError, ErrorKind};

/// Step execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// Outcome of one step. `step_index` starts at 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_index: usize,
    pub action: String,
    pub status: StepStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn passed(step_index: usize, action: &str, message: String, duration_ms: u64) -> Self {
        Self {
            step_index,
            action: action.to_string(),
            status: StepStatus::Passed,
            message,
            error_kind: None,
            screenshot_path: None,
            duration_ms,
        }
    }

    pub fn failed(step_index: usize, action: &str, error: &ActionError, duration_ms: u64) -> Self {
        Self {
            step_index,
            action: action.to_string(),
            status: StepStatus::Failed,
            message: error.to_string(),
            error_kind: Some(error.kind()),
            screenshot_path: None,
            duration_ms,
        }
    }

    pub fn skipped(step_index: usize, action: &str, reason: &str) -> Self {
        Self {
            step_index,
            action: action.to_string(),
            status: StepStatus::Skipped,
            message: reason.to_string(),
            error_kind: None,
            screenshot_path: None,
            duration_ms: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// Test case status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TestResult {
    /// Derive status and top-level error from the step results
    pub fn from_steps(
        name: &str,
        steps: Vec<StepResult>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        let failed = steps.iter().find(|s| s.is_failed()).cloned();
        let status = if failed.is_some() {
            TestStatus::Failed
        } else if !steps.is_empty() && steps.iter().all(|s| s.status == StepStatus::Skipped) {
            TestStatus::Skipped
        } else {
            TestStatus::Passed
        };

        Self {
            name: name.to_string(),
            status,
            error: failed.as_ref().map(|s| s.message.clone()),
            error_kind: failed.as_ref().and_then(|s| s.error_kind),
            screenshot_path: failed.and_then(|s| s.screenshot_path),
            steps,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }

    /// Case that never got a browser session
    pub fn session_start_failed(
        name: &str,
        error: &anyhow::Error,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            status: TestStatus::Failed,
            steps: Vec::new(),
            error: Some(format!("could not open browser session: {:#}", error)),
            error_kind: Some(ErrorKind::SessionStart),
            screenshot_path: None,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }

    /// Failure caused by the harness rather than the page under test
    pub fn is_execution_error(&self) -> bool {
        self.status == TestStatus::Failed
            && self.error_kind.map_or(false, ErrorKind::is_execution_error)
    }
}

/// Everything one invocation produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub session_id: String,
    pub results: Vec<TestResult>,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new(
        session_id: &str,
        results: Vec<TestResult>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count() as u32;
        Self {
            session_id: session_id.to_string(),
            total: results.len() as u32,
            passed: count(TestStatus::Passed),
            failed: count(TestStatus::Failed),
            skipped: count(TestStatus::Skipped),
            results,
            started_at,
            duration_ms,
        }
    }

    /// 0 when nothing failed, 2 when any case hit an execution error, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.results.iter().any(TestResult::is_execution_error) {
            2
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }
}
