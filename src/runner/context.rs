use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::time::Instant;

use super::error::ActionError;
use crate::driver::BrowserSession;
use crate::secrets::{Clock, SecretResolver};
use crate::utils::config::RunConfig;
use crate::utils::hosts::HostPolicy;

/// Per-test-case execution state, dropped when the case ends
pub struct ExecutionContext {
    /// Browser session owned by this case
    pub session: Arc<dyn BrowserSession>,

    /// Secret lookups, cached for the lifetime of the case
    pub secrets: SecretResolver,

    pub config: Arc<RunConfig>,

    /// Source of "now" for one-time codes
    pub clock: Arc<dyn Clock>,

    pub case_name: String,

    /// Filename-safe form of `case_name`
    pub case_slug: String,

    /// Hosts pages may be opened on
    pub hosts: HostPolicy,

    /// A login step already succeeded in this session
    pub logged_in: bool,

    /// When the case started. Only steps carry timeouts; this is for reporting.
    pub started: Instant,
}

impl ExecutionContext {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        secrets: SecretResolver,
        config: Arc<RunConfig>,
        clock: Arc<dyn Clock>,
        case_name: &str,
    ) -> Self {
        Self {
            session,
            secrets,
            clock,
            case_name: case_name.to_string(),
            case_slug: sanitize_for_filename(case_name),
            hosts: HostPolicy::from_config(&config),
            config,
            logged_in: false,
            started: Instant::now(),
        }
    }

    /// Time since the case started
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Refuse URLs outside the allowed hosts
    pub fn check_host(&self, url: &str) -> Result<(), ActionError> {
        if self.hosts.allows(url) {
            Ok(())
        } else {
            Err(ActionError::NavigationBlocked { url: url.to_string() })
        }
    }

    pub fn session(&self) -> &dyn BrowserSession {
        self.session.as_ref()
    }

    /// `<output>/screenshots/test_<case>_step<NN>_<kind>_<context>.png`
    pub fn screenshot_path(&self, step_index: usize, kind: &str, context: &str) -> PathBuf {
        let context = sanitize_for_filename(context);
        let mut filename = format!("test_{}_step{:02}_{}", self.case_slug, step_index, kind);
        if !context.is_empty() {
            filename.push('_');
            filename.push_str(&context);
        }
        filename.push_str(".png");
        self.config.output_dir.join("screenshots").join(filename)
    }

    /// Absolute URLs pass through; anything else is joined to the base URL
    pub fn resolve_url(&self, url: &str) -> Result<String, ActionError> {
        let url = url.trim();
        if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("about:") {
            return Ok(url.to_string());
        }
        match self.config.base_url.as_deref() {
            Some(base) => Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            )),
            None => Err(ActionError::Browser(anyhow::anyhow!(
                "relative URL '{}' needs a base URL",
                url
            ))),
        }
    }
}

/// Short filename fragment describing a failure: the message up to its
/// first parenthesis, at most 50 characters
pub fn failure_context(message: &str) -> String {
    let head = message.split('(').next().unwrap_or("").trim();
    sanitize_for_filename(&head.chars().take(50).collect::<String>())
}

/// Lowercase, `_`-separated, word characters only, at most 100 chars
pub fn sanitize_for_filename(text: &str) -> String {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();

    let non_word = NON_WORD.get_or_init(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
    let separators = SEPARATORS.get_or_init(|| Regex::new(r"[-\s]+").expect("valid regex"));

    let cleaned = non_word.replace_all(text.trim(), "");
    let joined = separators.replace_all(&cleaned, "_").to_lowercase();
    joined.chars().take(100).collect()
}
