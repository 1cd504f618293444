//! Single-step dispatch
//!
//! `execute` never fails: every [`ActionError`] is folded into a failed
//! [`StepResult`] carrying its kind and message.

use log::{debug, info, warn};
use regex::Regex;
use std::sync::OnceLock;
use tokio::time::{sleep, timeout, Duration, Instant};

use super::context::ExecutionContext;
use super::error::{ActionError, LocatorError};
use super::locator::{self, first_visible_matching, poll_for, Located, POLL_INTERVAL_MS};
use super::login_flow::{self, LoginRequest};
use super::state::StepResult;
use crate::driver::{BrowserSession, ElementRef, Selector};
use crate::parser::types::Target;
use crate::parser::Step;
use crate::secrets::{current_totp, SecretSpec};
use crate::utils::config::RunConfig;

/// Slack given to an action past its own budget before it is cut off
const TIMEOUT_GRACE_MS: u64 = 1000;

/// Lookup budget for the second try after opening the user menu, capped at
/// half the step's own wait so the retry stays inside the step timeout
const USER_MENU_RETRY_MS: u64 = 500;

struct ActionOutcome {
    message: String,
    screenshot_path: Option<String>,
}

impl ActionOutcome {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            screenshot_path: None,
        }
    }
}

/// Upper bound for a whole step: its own `timeout`, else the per-kind default
pub fn step_budget_ms(step: &Step, config: &RunConfig) -> u64 {
    step.timeout_ms().unwrap_or(match step {
        Step::Navigate { .. } => config.navigation_timeout_ms,
        Step::LoginViaLoginGov { .. } => config.login_timeout_ms,
        _ => config.default_step_timeout_ms,
    })
}

/// Run one step. `index` is 1-based.
pub async fn execute(ctx: &mut ExecutionContext, step: &Step, index: usize) -> StepResult {
    let started = Instant::now();
    let budget_ms = step_budget_ms(step, &ctx.config);
    debug!("[{}] step {}: {}", ctx.case_name, index, step.display_name());

    let outcome = match timeout(
        Duration::from_millis(budget_ms + TIMEOUT_GRACE_MS),
        run_action(ctx, step, index),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(ActionError::Timeout {
            what: step.display_name(),
            timeout_ms: budget_ms,
        }),
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(outcome) => {
            let mut result =
                StepResult::passed(index, step.action_name(), outcome.message, duration_ms);
            result.screenshot_path = outcome.screenshot_path;
            result
        }
        Err(e) => {
            debug!("[{}] step {} failed: {}", ctx.case_name, index, e);
            StepResult::failed(index, step.action_name(), &e, duration_ms)
        }
    }
}

async fn run_action(
    ctx: &mut ExecutionContext,
    step: &Step,
    index: usize,
) -> Result<ActionOutcome, ActionError> {
    let session = ctx.session.clone();
    let session = session.as_ref();
    let wait_ms = step.timeout_ms().unwrap_or(ctx.config.locator_timeout_ms);

    match step {
        Step::Navigate { url, timeout } => {
            let url = ctx.resolve_url(url)?;
            ctx.check_host(&url)?;
            let nav_ms = timeout.unwrap_or(ctx.config.navigation_timeout_ms);
            navigate(session, &url, nav_ms).await?;
            if ctx.config.dismiss_consent_on_navigate {
                dismiss_consent_banner(session).await?;
            }
            Ok(ActionOutcome::new(format!("navigated to {}", url)))
        }

        Step::Click { selector, text, .. } => {
            let located = locate_or_open_menu(session, selector.as_ref(), text.as_deref(), wait_ms).await?;
            check_link_target(ctx, &located.element).await?;
            session.click(&located.element).await?;
            Ok(ActionOutcome::new(format!("clicked {}", describe(&located))))
        }

        Step::ClickText { text, exact, .. } => {
            let located = locator::locate_text(session, text, *exact, wait_ms).await?;
            check_link_target(ctx, &located.element).await?;
            session.click(&located.element).await?;
            Ok(ActionOutcome::new(format!("clicked {}", describe(&located))))
        }

        Step::Fill {
            selector,
            value,
            text,
            ..
        } => {
            let located = locator::locate(session, Some(selector), text.as_deref(), wait_ms).await?;
            session.fill(&located.element, value).await?;
            Ok(ActionOutcome::new(format!("filled {}", describe(&located))))
        }

        Step::FillEnv { selector, env, .. } => {
            let spec = SecretSpec::Env(env.clone());
            let value = ctx.secrets.resolve(&spec)?;
            let located = locator::locate(session, Some(selector), None, wait_ms).await?;
            session.fill(&located.element, &value).await?;
            Ok(ActionOutcome::new(format!(
                "filled {} from {}",
                describe(&located),
                spec.describe()
            )))
        }

        Step::FillTotp {
            selector,
            env,
            secret,
            ..
        } => {
            let spec = SecretSpec::from_fields(env.as_deref(), secret.as_deref()).ok_or_else(
                || ActionError::InvalidSecret("fill_totp needs `env` or `secret`".into()),
            )?;
            let secret = ctx.secrets.resolve(&spec)?;
            let code = current_totp(&secret, ctx.clock.now())?;
            let located = locator::locate(session, Some(selector), None, wait_ms).await?;
            session.fill(&located.element, &code).await?;
            Ok(ActionOutcome::new(format!(
                "filled one-time code into {} from {}",
                describe(&located),
                spec.describe()
            )))
        }

        Step::LoginViaLoginGov {
            username_env,
            password_env,
            totp_env,
            url,
            ..
        } => {
            let request = LoginRequest {
                username_env,
                password_env,
                totp_env,
                url: url.as_deref(),
            };
            let message = login_flow::login_via_login_gov(ctx, &request).await?;
            Ok(ActionOutcome::new(message))
        }

        Step::WaitFor { selector, text, .. } => {
            let located = locator::locate(session, selector.as_ref(), text.as_deref(), wait_ms)
                .await
                .map_err(|e| ActionError::Timeout {
                    what: format!("{} to appear", target_label(&e)),
                    timeout_ms: wait_ms,
                })?;
            Ok(ActionOutcome::new(format!("{} is visible", describe(&located))))
        }

        Step::WaitForUrlContains { url_fragment, .. } => {
            let url = poll_for(wait_ms, || url_containing(session, url_fragment))
                .await?
                .ok_or_else(|| ActionError::Timeout {
                    what: format!("URL to contain \"{}\"", url_fragment),
                    timeout_ms: wait_ms,
                })?;
            Ok(ActionOutcome::new(format!("URL is {}", url)))
        }

        Step::AssertText {
            selector,
            expected,
            exact,
            ..
        } => match (selector, expected.as_deref()) {
            (Some(target), Some(expected)) => {
                let actual = assert_element_text(session, target, expected, *exact, wait_ms).await?;
                Ok(ActionOutcome::new(format!(
                    "{} has text \"{}\"",
                    target,
                    actual.trim()
                )))
            }
            (None, Some(expected)) => {
                locator::locate_text(session, expected, *exact, wait_ms)
                    .await
                    .map_err(|_| ActionError::AssertionMismatch {
                        what: "visible text on page".into(),
                        expected: expected.to_string(),
                        actual: "<not found>".into(),
                    })?;
                Ok(ActionOutcome::new(format!("found text \"{}\"", expected)))
            }
            (Some(target), None) => {
                let located = locator::locate(session, Some(target), None, wait_ms)
                    .await
                    .map_err(|_| ActionError::AssertionMismatch {
                        what: format!("visibility of {}", target),
                        expected: "visible".into(),
                        actual: "not visible".into(),
                    })?;
                Ok(ActionOutcome::new(format!("{} is visible", describe(&located))))
            }
            (None, None) => Err(ActionError::Browser(anyhow::anyhow!(
                "assert_text needs text or a selector"
            ))),
        },

        Step::AssertElement {
            selector,
            present,
            visible,
            ..
        } => {
            let structural = locator::candidates(selector);
            let check = || presence_holds(session, &structural, *present, *visible);
            let mut held = poll_for(wait_ms, check).await?;
            if held.is_none() && *present && locator::open_user_menu(session).await {
                held = poll_for(USER_MENU_RETRY_MS.min(wait_ms / 2), check).await?;
            }

            let (what, expected, actual) = match (*present, *visible) {
                (true, true) => ("visibility", "visible", "not visible"),
                (true, false) => ("presence", "present", "absent"),
                (false, _) => ("presence", "absent", "present"),
            };
            if held.is_none() {
                return Err(ActionError::AssertionMismatch {
                    what: format!("{} of {}", what, selector),
                    expected: expected.into(),
                    actual: actual.into(),
                });
            }
            Ok(ActionOutcome::new(format!("{} is {}", selector, expected)))
        }

        Step::AssertUrlContains { url_fragment } => {
            let url = session.current_url().await?;
            if !url.contains(url_fragment.as_str()) {
                return Err(ActionError::AssertionMismatch {
                    what: "current URL".into(),
                    expected: url_fragment.clone(),
                    actual: url,
                });
            }
            Ok(ActionOutcome::new(format!("URL {} contains \"{}\"", url, url_fragment)))
        }

        Step::Screenshot { label } => {
            let path = ctx.screenshot_path(index, "screenshot", label.as_deref().unwrap_or(""));
            match session.take_screenshot(&path).await {
                Ok(()) => {
                    info!("Saved screenshot: {}", path.display());
                    Ok(ActionOutcome {
                        message: format!("saved screenshot {}", path.display()),
                        screenshot_path: Some(path.to_string_lossy().to_string()),
                    })
                }
                // A lost screenshot is not a test failure
                Err(e) => {
                    warn!("Failed to save screenshot {}: {:#}", path.display(), e);
                    Ok(ActionOutcome::new(format!("screenshot failed: {:#}", e)))
                }
            }
        }

        Step::Unknown { name } => Err(ActionError::UnknownAction(name.clone())),
    }
}

/// Load `url`, bounded by `timeout_ms`
pub(crate) async fn navigate(
    session: &dyn BrowserSession,
    url: &str,
    timeout_ms: u64,
) -> Result<(), ActionError> {
    match timeout(Duration::from_millis(timeout_ms), session.goto(url, timeout_ms)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ActionError::Browser(
            e.context(format!("navigation to {} failed", url)),
        )),
        Err(_) => Err(ActionError::Timeout {
            what: format!("navigation to {}", url),
            timeout_ms,
        }),
    }
}

fn consent_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(continue|ok|accept|i\s*agree|proceed)\b").expect("valid regex")
    })
}

/// Click a visible cookie/consent button if the page shows one.
///
/// Not finding one is fine; a click that fails is not.
pub(crate) async fn dismiss_consent_banner(
    session: &dyn BrowserSession,
) -> Result<bool, ActionError> {
    let Some(button) =
        first_visible_matching(session, &["button", "[role='button']"], consent_label(), None)
            .await?
    else {
        return Ok(false);
    };
    let label = session.element_text(&button).await.unwrap_or_default();
    session.click(&button).await?;
    info!("Dismissed consent banner via \"{}\"", label.trim());
    Ok(true)
}

/// Resolve a click target; when nothing matches, open the user menu once
/// and look again
async fn locate_or_open_menu(
    session: &dyn BrowserSession,
    target: Option<&Target>,
    text: Option<&str>,
    wait_ms: u64,
) -> Result<Located, ActionError> {
    let first = match locator::locate(session, target, text, wait_ms).await {
        Ok(located) => return Ok(located),
        Err(e) => e,
    };
    if target.is_none() || !locator::open_user_menu(session).await {
        return Err(first.into());
    }
    locator::locate(session, target, text, USER_MENU_RETRY_MS.min(wait_ms / 2))
        .await
        .map_err(|_| first.into())
}

/// Refuse to follow a link off the allowed hosts
async fn check_link_target(ctx: &ExecutionContext, element: &ElementRef) -> Result<(), ActionError> {
    let href = match ctx.session().attribute(element, "href").await {
        Ok(Some(href)) => href,
        Ok(None) => return Ok(()),
        Err(e) => {
            debug!("Reading href of {} failed: {:#}", element.selector, e);
            return Ok(());
        }
    };
    if ctx.hosts.allows(&href) {
        return Ok(());
    }
    warn!("[{}] blocked click to external link {}", ctx.case_name, href);
    Err(ActionError::NavigationBlocked { url: href })
}

fn describe(located: &Located) -> String {
    if located.via_fallback {
        format!("{} (text fallback)", located.element.selector)
    } else {
        located.element.selector.to_string()
    }
}

fn target_label(err: &LocatorError) -> String {
    match (&err.selector, &err.fallback_text) {
        (Some(css), _) => css.clone(),
        (None, Some(text)) => format!("text \"{}\"", text),
        (None, None) => "element".into(),
    }
}

fn text_matches(actual: &str, expected: &str, exact: bool) -> bool {
    if exact {
        actual.trim() == expected.trim()
    } else {
        actual
            .to_lowercase()
            .contains(&expected.trim().to_lowercase())
    }
}

async fn url_containing(
    session: &dyn BrowserSession,
    fragment: &str,
) -> Result<Option<String>, ActionError> {
    match session.current_url().await {
        Ok(url) if url.contains(fragment) => Ok(Some(url)),
        Ok(_) => Ok(None),
        Err(e) => {
            debug!("Reading current URL failed, retrying: {:#}", e);
            Ok(None)
        }
    }
}

/// `Some(())` once the element's presence matches `present`.
/// Present means "in the DOM"; absent means "nothing visible".
async fn presence_holds(
    session: &dyn BrowserSession,
    candidates: &[Selector],
    present: bool,
    visible: bool,
) -> Result<Option<()>, ActionError> {
    let mut looked = false;
    let mut any_match = false;
    let mut any_visible = false;
    for candidate in candidates {
        match session.find_all(candidate).await {
            Ok(matches) => {
                looked = true;
                any_match |= !matches.is_empty();
                any_visible |= matches.iter().any(|el| el.visible);
            }
            Err(e) => debug!("Lookup of {} failed, retrying: {:#}", candidate, e),
        }
    }
    if !looked {
        return Ok(None);
    }
    let holds = match (present, visible) {
        (true, true) => any_visible,
        (true, false) => any_match,
        (false, _) => !any_visible,
    };
    Ok(holds.then_some(()))
}

/// Poll the first visible element of `target` until its text matches
async fn assert_element_text(
    session: &dyn BrowserSession,
    target: &Target,
    expected: &str,
    exact: bool,
    wait_ms: u64,
) -> Result<String, ActionError> {
    let started = Instant::now();
    let deadline = started + Duration::from_millis(wait_ms);
    let structural = locator::candidates(target);
    let mut last_seen: Option<String> = None;

    loop {
        if let Ok(Some(element)) = locator::first_visible_of(session, &structural).await {
            if let Ok(text) = session.element_text(&element).await {
                if text_matches(&text, expected, exact) {
                    return Ok(text);
                }
                last_seen = Some(text);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep((deadline - now).min(Duration::from_millis(POLL_INTERVAL_MS))).await;
    }

    match last_seen {
        Some(actual) => Err(ActionError::AssertionMismatch {
            what: format!("text of {}", target),
            expected: expected.to_string(),
            actual: actual.trim().to_string(),
        }),
        None => Err(LocatorError {
            selector: Some(target.to_string()),
            fallback_text: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
        .into()),
    }
}
