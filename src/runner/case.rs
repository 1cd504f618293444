use chrono::Utc;
use futures::FutureExt;
use log::{debug, error, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::{timeout, Duration, Instant};

use super::context::{failure_context, ExecutionContext};
use super::error::ActionError;
use super::events::{EventEmitter, TestEvent};
use super::executor;
use super::state::{StepResult, TestResult};
use crate::driver::{BrowserSession, SessionFactory};
use crate::parser::TestCase;
use crate::secrets::{Clock, EnvSecretProvider, SecretProvider, SecretResolver, SystemClock};
use crate::utils::config::RunConfig;

/// Runs one test case in its own browser session
#[derive(Clone)]
pub struct CaseRunner {
    pub factory: Arc<dyn SessionFactory>,
    pub config: Arc<RunConfig>,
    pub secrets: Arc<dyn SecretProvider>,
    pub clock: Arc<dyn Clock>,
    pub events: EventEmitter,
}

impl CaseRunner {
    pub fn new(factory: Arc<dyn SessionFactory>, config: Arc<RunConfig>) -> Self {
        Self {
            factory,
            config,
            secrets: Arc::new(EnvSecretProvider),
            clock: Arc::new(SystemClock),
            events: EventEmitter::default(),
        }
    }

    /// Open a session, run the steps until the first failure, release the session.
    ///
    /// Never panics and never returns early without closing the session.
    pub async fn run(&self, case: &TestCase) -> TestResult {
        let started_at = Utc::now();
        let started = Instant::now();
        self.events.emit(TestEvent::CaseStarted {
            case: case.name.clone(),
            step_count: case.steps.len(),
        });

        let session: Arc<dyn BrowserSession> = match self.factory.open().await {
            Ok(session) => Arc::from(session),
            Err(e) => {
                error!("[{}] Could not open a browser session: {:#}", case.name, e);
                let result = TestResult::session_start_failed(
                    &case.name,
                    &e,
                    started_at,
                    started.elapsed().as_millis() as u64,
                );
                self.emit_finished(&result);
                return result;
            }
        };

        let mut ctx = ExecutionContext::new(
            session.clone(),
            SecretResolver::new(self.secrets.clone()),
            self.config.clone(),
            self.clock.clone(),
            &case.name,
        );

        let mut steps = Vec::with_capacity(case.steps.len());
        let outcome = AssertUnwindSafe(self.run_steps(&mut ctx, case, &mut steps))
            .catch_unwind()
            .await;

        if let Err(payload) = outcome {
            let index = steps.len() + 1;
            let action = case
                .steps
                .get(index - 1)
                .map(|s| s.action_name().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let err = ActionError::Browser(anyhow::anyhow!(
                "action panicked: {}",
                panic_message(payload.as_ref())
            ));
            error!("[{}] Step {} {}", case.name, index, err);

            let mut failed = StepResult::failed(index, &action, &err, 0);
            failed.screenshot_path = self.capture_failure(&ctx, index, &failed.message).await;
            self.emit_step_failed(case, &failed);
            steps.push(failed);
            self.skip_remaining(case, index, &mut steps);
        }

        if let Err(e) = session.close().await {
            warn!("[{}] Failed to close browser session: {:#}", case.name, e);
        }

        let result = TestResult::from_steps(
            &case.name,
            steps,
            started_at,
            started.elapsed().as_millis() as u64,
        );
        self.emit_finished(&result);
        result
    }

    async fn run_steps(
        &self,
        ctx: &mut ExecutionContext,
        case: &TestCase,
        results: &mut Vec<StepResult>,
    ) {
        for (i, step) in case.steps.iter().enumerate() {
            let index = i + 1;
            self.events.emit(TestEvent::StepStarted {
                case: case.name.clone(),
                index,
                step: step.display_name(),
            });

            let mut result = executor::execute(ctx, step, index).await;

            if result.is_failed() {
                debug!(
                    "[{}] step {} failed {}ms into the case",
                    case.name,
                    index,
                    ctx.elapsed_ms()
                );
                if result.screenshot_path.is_none() {
                    result.screenshot_path = self.capture_failure(ctx, index, &result.message).await;
                }
                self.emit_step_failed(case, &result);
                results.push(result);
                self.skip_remaining(case, index, results);
                return;
            }

            self.events.emit(TestEvent::StepPassed {
                case: case.name.clone(),
                index,
                duration_ms: result.duration_ms,
            });
            results.push(result);
        }
    }

    fn skip_remaining(&self, case: &TestCase, failed_index: usize, results: &mut Vec<StepResult>) {
        let reason = format!("skipped after step {} failed", failed_index);
        for (i, step) in case.steps.iter().enumerate().skip(results.len()) {
            self.events.emit(TestEvent::StepSkipped {
                case: case.name.clone(),
                index: i + 1,
                reason: reason.clone(),
            });
            results.push(StepResult::skipped(i + 1, step.action_name(), &reason));
        }
    }

    /// Best-effort screenshot of the page at the point of failure, named
    /// after the error
    async fn capture_failure(&self, ctx: &ExecutionContext, index: usize, error: &str) -> Option<String> {
        let path = ctx.screenshot_path(index, "failure", &failure_context(error));
        let budget = Duration::from_millis(self.config.locator_timeout_ms);
        match timeout(budget, ctx.session().take_screenshot(&path)).await {
            Ok(Ok(())) => {
                debug!("[{}] Saved failure screenshot {}", ctx.case_name, path.display());
                self.events.emit(TestEvent::Log {
                    message: format!("Saved screenshot: {}", path.display()),
                });
                Some(path.to_string_lossy().to_string())
            }
            Ok(Err(e)) => {
                warn!("[{}] Failed to capture failure screenshot: {:#}", ctx.case_name, e);
                None
            }
            Err(_) => {
                warn!("[{}] Failure screenshot timed out", ctx.case_name);
                None
            }
        }
    }

    fn emit_step_failed(&self, case: &TestCase, result: &StepResult) {
        self.events.emit(TestEvent::StepFailed {
            case: case.name.clone(),
            index: result.step_index,
            error: result.message.clone(),
            duration_ms: result.duration_ms,
        });
    }

    fn emit_finished(&self, result: &TestResult) {
        self.events.emit(TestEvent::CaseFinished {
            case: result.name.clone(),
            status: result.status,
            error: result.error.clone(),
            duration_ms: result.duration_ms,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
