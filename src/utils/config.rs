use std::path::PathBuf;

use super::hosts::DEFAULT_ALLOWED_HOSTS;

/// Run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Base URL relative navigation is joined to
    pub base_url: Option<String>,

    /// Output directory for results and screenshots
    pub output_dir: PathBuf,

    pub headless: bool,

    /// Validate and echo test cases without opening a browser
    pub dry_run: bool,

    /// Default per-step timeout (ms)
    pub default_step_timeout_ms: u64,

    /// Default timeout of the federated login step (ms)
    pub login_timeout_ms: u64,

    /// Default element-resolution budget (ms)
    pub locator_timeout_ms: u64,

    /// How long to wait for the one-time-code page to advance (ms)
    pub otp_advance_ms: u64,

    /// How long to look for a post-login consent prompt (ms)
    pub consent_wait_ms: u64,

    /// Default page-load timeout (ms)
    pub navigation_timeout_ms: u64,

    /// Dismiss cookie/consent banners after every navigation
    pub dismiss_consent_on_navigate: bool,

    /// Upper bound on simultaneously open sessions
    pub max_concurrent_sessions: usize,

    /// Domains besides the base URL's host that pages may visit
    pub allowed_hosts: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            output_dir: PathBuf::from("./output"),
            headless: true,
            dry_run: false,
            default_step_timeout_ms: 30_000,
            login_timeout_ms: 180_000,
            locator_timeout_ms: 10_000,
            otp_advance_ms: 10_000,
            consent_wait_ms: 8_000,
            navigation_timeout_ms: 60_000,
            dismiss_consent_on_navigate: true,
            max_concurrent_sessions: 1,
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RunConfig {
    /// Defaults overridden by `STORY_TESTER_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let flag = |name: &str| lookup(name).map(|v| v == "true" || v == "1");
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(url) = lookup("STORY_TESTER_BASE_URL").filter(|v| !v.is_empty()) {
            config.base_url = Some(url);
        }
        if let Some(dir) = lookup("STORY_TESTER_OUTPUT").filter(|v| !v.is_empty()) {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(headless) = flag("STORY_TESTER_HEADLESS") {
            config.headless = headless;
        }
        if let Some(dismiss) = flag("STORY_TESTER_DISMISS_CONSENT") {
            config.dismiss_consent_on_navigate = dismiss;
        }
        if let Some(ms) = number("STORY_TESTER_STEP_TIMEOUT_MS") {
            config.default_step_timeout_ms = ms;
        }
        if let Some(ms) = number("STORY_TESTER_LOGIN_TIMEOUT_MS") {
            config.login_timeout_ms = ms;
        }
        if let Some(ms) = number("STORY_TESTER_LOCATOR_TIMEOUT_MS") {
            config.locator_timeout_ms = ms;
        }
        if let Some(ms) = number("STORY_TESTER_OTP_WAIT_MS") {
            config.otp_advance_ms = ms;
        }
        if let Some(ms) = number("STORY_TESTER_CONSENT_WAIT_MS") {
            config.consent_wait_ms = ms;
        }
        if let Some(ms) = number("STORY_TESTER_NAVIGATION_TIMEOUT_MS") {
            config.navigation_timeout_ms = ms;
        }
        if let Some(jobs) = number("STORY_TESTER_JOBS") {
            config.max_concurrent_sessions = jobs.max(1) as usize;
        }
        if let Some(hosts) = lookup("STORY_TESTER_ALLOWED_HOSTS") {
            config.allowed_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }

        config
    }
}
