use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{info, warn};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use super::case::CaseRunner;
use super::events::{EventEmitter, TestEvent};
use super::state::{RunSummary, StepResult, TestResult};
use crate::driver::SessionFactory;
use crate::parser::TestCase;
use crate::secrets::{Clock, SecretProvider};
use crate::utils::config::RunConfig;

/// Runs every test case of one invocation and collects a [`RunSummary`]
pub struct SuiteRunner {
    cases: CaseRunner,
}

impl SuiteRunner {
    pub fn new(factory: Arc<dyn SessionFactory>, config: RunConfig) -> Self {
        Self {
            cases: CaseRunner::new(factory, Arc::new(config)),
        }
    }

    pub fn with_secrets(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.cases.secrets = provider;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.cases.clock = clock;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.cases.events = events;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.cases.config
    }

    /// Run `cases` in input order. One case failing never stops the others.
    pub async fn run(&self, cases: &[TestCase]) -> RunSummary {
        let session_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        let config = self.config();

        self.cases.events.emit(TestEvent::SuiteStarted {
            session_id: session_id.clone(),
            case_count: cases.len(),
            dry_run: config.dry_run,
        });
        info!(
            "Run {}: {} case(s){}",
            session_id,
            cases.len(),
            if config.dry_run { " (dry run)" } else { "" }
        );

        let results: Vec<TestResult> = if config.dry_run {
            cases.iter().map(|case| self.dry_run(case)).collect()
        } else {
            let jobs = config.max_concurrent_sessions.max(1);
            // `buffered` keeps results in input order
            let results = stream::iter(cases)
                .map(|case| self.cases.run(case))
                .buffered(jobs)
                .collect::<Vec<_>>()
                .await;
            if let Err(e) = self.cases.factory.shutdown().await {
                warn!("Failed to shut down the browser: {:#}", e);
            }
            results
        };

        let summary = RunSummary::new(
            &session_id,
            results,
            started_at,
            started.elapsed().as_millis() as u64,
        );
        self.cases.events.emit(TestEvent::SuiteFinished {
            total: summary.total,
            passed: summary.passed,
            failed: summary.failed,
            skipped: summary.skipped,
            duration_ms: summary.duration_ms,
        });
        summary
    }

    /// Echo the case without a browser; every step is reported skipped
    fn dry_run(&self, case: &TestCase) -> TestResult {
        let events = &self.cases.events;
        events.emit(TestEvent::CaseStarted {
            case: case.name.clone(),
            step_count: case.steps.len(),
        });

        let steps: Vec<StepResult> = case
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                events.emit(TestEvent::StepSkipped {
                    case: case.name.clone(),
                    index: i + 1,
                    reason: format!("dry run: {}", step.display_name()),
                });
                StepResult::skipped(i + 1, step.action_name(), "dry run")
            })
            .collect();

        let result = TestResult::from_steps(&case.name, steps, Utc::now(), 0);
        events.emit(TestEvent::CaseFinished {
            case: result.name.clone(),
            status: result.status,
            error: None,
            duration_ms: 0,
        });
        result
    }
}
