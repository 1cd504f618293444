//! Federated login through Login.gov
//!
//! Five phases run in strict order: open the site, pick the Login.gov entry
//! point, submit credentials, submit a one-time code (at most twice), then
//! accept a post-login consent prompt if one shows up. A site that shows no
//! login control after opening is taken as already signed in.

use log::{debug, info, warn};
use regex::Regex;
use std::convert::Infallible;
use std::sync::OnceLock;

use super::context::ExecutionContext;
use super::error::{ActionError, LoginPhase};
use super::executor::{dismiss_consent_banner, navigate};
use super::locator::{first_visible_matching, first_visible_of, poll_for, wait_for_element};
use crate::driver::{BrowserSession, ElementRef, Selector};
use crate::secrets::{current_totp, Clock};
use crate::utils::config::RunConfig;

/// One-time code submissions before giving up
pub const OTP_ATTEMPTS: u32 = 2;

const LOGIN_BUTTON_TEST_ID: &str = "[data-testid='login-button']";

const USERNAME_FIELDS: &[&str] = &[
    "input[type='email']",
    "#email",
    "#username",
    "input[name='email']",
    "input[name='username']",
];

const PASSWORD_FIELDS: &[&str] = &["input[type='password']", "#password", "input[name='password']"];

const OTP_FIELDS: &[&str] = &[
    "#otp",
    "input[name*='otp']",
    "input[id*='otp']",
    "input[name*='code']",
    "input[id*='code']",
];

const SUBMIT_FALLBACKS: &[&str] = &["button[type='submit']", "#submit"];

/// Controls only a signed-in page shows
const SIGNED_IN_MARKERS: &[&str] = &[
    "[data-testid='user-menu']",
    "[data-testid*='logout']",
    "#userMenu",
    ".user-menu",
];

/// Secret names and start page for one login
#[derive(Debug, Clone)]
pub struct LoginRequest<'a> {
    pub username_env: &'a str,
    pub password_env: &'a str,
    pub totp_env: &'a str,
    pub url: Option<&'a str>,
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($re).expect("valid regex"))
        }
    };
}

pattern!(login_label, r"(?i)^\s*(login|log\s*in|sign\s*in)\s*$");
pattern!(
    social_provider,
    r"(?i)facebook|google|github|twitter|apple|orcid|microsoft|azure|linkedin"
);
pattern!(login_gov_label, r"(?i)login\.gov");
pattern!(credentials_submit_label, r"(?i)^\s*(sign\s*in|continue|submit)\s*$");
pattern!(otp_submit_label, r"(?i)^\s*(submit|continue|verify|sign\s*in)\s*$");
pattern!(grant_label, r"(?i)\b(grant|authorize|allow|approve|consent|agree)\b");
pattern!(logout_label, r"(?i)^\s*(log\s*out|sign\s*out)\s*$");

/// What the start page offers
enum Landing {
    LoginEntry(ElementRef),
    SignedIn,
}

fn css_list(list: &[&str]) -> Vec<Selector> {
    list.iter().map(|css| Selector::css(css)).collect()
}

fn in_phase(phase: LoginPhase) -> impl Fn(ActionError) -> ActionError {
    move |err| match err {
        ActionError::LoginFlow { .. } => err,
        other => ActionError::login(phase, other),
    }
}

/// Run the whole login. Returns the step message; never includes secret values.
pub async fn login_via_login_gov(
    ctx: &mut ExecutionContext,
    request: &LoginRequest<'_>,
) -> Result<String, ActionError> {
    let secrets = ctx.secrets.resolve_all(&[
        request.username_env,
        request.password_env,
        request.totp_env,
    ])?;
    let (username, password, totp_secret) = (&secrets[0], &secrets[1], &secrets[2]);
    // Reject an undecodable secret before touching the browser
    current_totp(totp_secret, ctx.clock.now())?;

    let session = ctx.session.clone();
    let session = session.as_ref();
    let config = ctx.config.clone();

    // 1. Open the site
    let start_url = match request.url {
        Some(url) => ctx.resolve_url(url),
        None => config
            .base_url
            .clone()
            .ok_or_else(|| ActionError::login(LoginPhase::OpenSite, "no url and no base URL configured")),
    }
    .map_err(in_phase(LoginPhase::OpenSite))?;
    ctx.check_host(&start_url)
        .map_err(in_phase(LoginPhase::OpenSite))?;
    info!("[{}] Login: opening {}", ctx.case_name, start_url);
    navigate(session, &start_url, config.navigation_timeout_ms)
        .await
        .map_err(in_phase(LoginPhase::OpenSite))?;
    dismiss_consent_banner(session)
        .await
        .map_err(in_phase(LoginPhase::OpenSite))?;

    // 2. Login entry point, then the federated option
    let Some(entry) = wait_for_landing(session, config.locator_timeout_ms).await else {
        let landed = session.current_url().await.unwrap_or_default();
        info!("[{}] Login: already logged in on {}", ctx.case_name, landed);
        ctx.logged_in = true;
        return Ok(format!("already logged in, no login control on {}", landed));
    };
    choose_login_gov(session, &config, entry)
        .await
        .map_err(in_phase(LoginPhase::LoginEntry))?;

    // 3. Credentials
    submit_credentials(session, &config, username, password)
        .await
        .map_err(in_phase(LoginPhase::Credentials))?;

    // 4. One-time code
    let attempts = submit_one_time_code(session, ctx.clock.as_ref(), totp_secret, &config).await?;

    // 5. Post-login consent
    let consented = accept_consent(session, config.consent_wait_ms).await?;

    let landed = session.current_url().await.unwrap_or_default();
    info!("[{}] Login: finished on {}", ctx.case_name, landed);
    ctx.logged_in = true;
    Ok(format!(
        "logged in via Login.gov as env:{} after {} code attempt(s){}, now on {}",
        request.username_env,
        attempts,
        if consented { ", consent granted" } else { "" },
        landed
    ))
}

async fn find_login_entry(session: &dyn BrowserSession) -> anyhow::Result<Option<ElementRef>> {
    if let Some(button) = session
        .first_visible(&Selector::css(LOGIN_BUTTON_TEST_ID))
        .await?
    {
        return Ok(Some(button));
    }
    first_visible_matching(
        session,
        &["button", "a", "[role='button']"],
        login_label(),
        Some(social_provider()),
    )
    .await
}

/// Wait for a login control. `None` when the page shows a signed-in marker,
/// or nothing login-related within `wait_ms`.
async fn wait_for_landing(session: &dyn BrowserSession, wait_ms: u64) -> Option<ElementRef> {
    let landing = poll_for(wait_ms, || async {
        match detect_landing(session).await {
            Ok(found) => Ok::<_, Infallible>(found),
            Err(e) => {
                debug!("Login: start page lookup failed, retrying: {:#}", e);
                Ok(None)
            }
        }
    })
    .await;
    match landing {
        Ok(Some(Landing::LoginEntry(entry))) => Some(entry),
        Ok(Some(Landing::SignedIn)) | Ok(None) => None,
        Err(never) => match never {},
    }
}

async fn detect_landing(session: &dyn BrowserSession) -> anyhow::Result<Option<Landing>> {
    if let Some(entry) = find_login_entry(session).await? {
        return Ok(Some(Landing::LoginEntry(entry)));
    }
    if first_visible_of(session, &css_list(SIGNED_IN_MARKERS)).await?.is_some()
        || first_visible_matching(session, &["button", "a"], logout_label(), None)
            .await?
            .is_some()
    {
        return Ok(Some(Landing::SignedIn));
    }
    Ok(None)
}

async fn find_login_gov_option(session: &dyn BrowserSession) -> anyhow::Result<Option<ElementRef>> {
    if let Some(option) = first_visible_matching(session, &["button", "a"], login_gov_label(), None).await? {
        return Ok(Some(option));
    }
    session
        .first_visible(&Selector::text("Login.gov", false))
        .await
}

async fn find_submit(
    session: &dyn BrowserSession,
    label: &Regex,
) -> anyhow::Result<Option<ElementRef>> {
    if let Some(button) = first_visible_matching(session, &["button"], label, None).await? {
        return Ok(Some(button));
    }
    first_visible_of(session, &css_list(SUBMIT_FALLBACKS)).await
}

async fn choose_login_gov(
    session: &dyn BrowserSession,
    config: &RunConfig,
    entry: ElementRef,
) -> Result<(), ActionError> {
    let wait_ms = config.locator_timeout_ms;

    session.click(&entry).await?;
    debug!("Login: clicked entry point {}", entry.selector);

    let option = wait_for_element(wait_ms, || find_login_gov_option(session))
        .await
        .ok_or_else(|| ActionError::login(LoginPhase::LoginEntry, "no Login.gov option found"))?;
    session.click(&option).await?;
    debug!("Login: chose Login.gov via {}", option.selector);
    Ok(())
}

async fn submit_credentials(
    session: &dyn BrowserSession,
    config: &RunConfig,
    username: &str,
    password: &str,
) -> Result<(), ActionError> {
    let wait_ms = config.locator_timeout_ms;
    let username_fields = css_list(USERNAME_FIELDS);
    let password_fields = css_list(PASSWORD_FIELDS);

    let field = wait_for_element(wait_ms, || first_visible_of(session, &username_fields))
        .await
        .ok_or_else(|| ActionError::login(LoginPhase::Credentials, "no username/email field found"))?;
    session.fill(&field, username).await?;

    let field = wait_for_element(wait_ms, || first_visible_of(session, &password_fields))
        .await
        .ok_or_else(|| ActionError::login(LoginPhase::Credentials, "no password field found"))?;
    session.fill(&field, password).await?;

    let submit = wait_for_element(wait_ms, || find_submit(session, credentials_submit_label()))
        .await
        .ok_or_else(|| ActionError::login(LoginPhase::Credentials, "no submit control found"))?;
    session.click(&submit).await?;
    debug!("Login: submitted credentials");
    Ok(())
}

/// Fill and submit a fresh code until the page moves on. Returns the
/// number of attempts used.
async fn submit_one_time_code(
    session: &dyn BrowserSession,
    clock: &dyn Clock,
    secret: &str,
    config: &RunConfig,
) -> Result<u32, ActionError> {
    let otp_fields = css_list(OTP_FIELDS);
    let phase = in_phase(LoginPhase::OneTimeCode);

    for attempt in 1..=OTP_ATTEMPTS {
        let field = wait_for_element(config.locator_timeout_ms, || {
            first_visible_of(session, &otp_fields)
        })
        .await
        .ok_or_else(|| ActionError::login(LoginPhase::OneTimeCode, "no one-time code field found"))?;

        let before = session.current_url().await.map_err(|e| phase(e.into()))?;
        let code = current_totp(secret, clock.now())?;
        session
            .fill(&field, &code)
            .await
            .map_err(|e| phase(e.into()))?;

        let submit = wait_for_element(config.locator_timeout_ms, || {
            find_submit(session, otp_submit_label())
        })
        .await
        .ok_or_else(|| ActionError::login(LoginPhase::OneTimeCode, "no submit control found"))?;
        session.click(&submit).await.map_err(|e| phase(e.into()))?;

        let advanced = poll_for(config.otp_advance_ms, || {
            left_code_page(session, &before, &otp_fields)
        })
        .await?;
        if advanced.is_some() {
            debug!("Login: one-time code accepted on attempt {}", attempt);
            return Ok(attempt);
        }
        warn!(
            "One-time code attempt {}/{} did not get past {}",
            attempt, OTP_ATTEMPTS, before
        );
    }

    Err(ActionError::TotpExhausted {
        attempts: OTP_ATTEMPTS,
    })
}

/// The URL changed or the code field is gone
async fn left_code_page(
    session: &dyn BrowserSession,
    before: &str,
    otp_fields: &[Selector],
) -> Result<Option<()>, ActionError> {
    if let Ok(url) = session.current_url().await {
        if url != before {
            return Ok(Some(()));
        }
    }
    match first_visible_of(session, otp_fields).await {
        Ok(None) => Ok(Some(())),
        _ => Ok(None),
    }
}

/// Accept a "Grant access"-style prompt if one appears within `wait_ms`
async fn accept_consent(session: &dyn BrowserSession, wait_ms: u64) -> Result<bool, ActionError> {
    let Some(button) = wait_for_element(wait_ms, || {
        first_visible_matching(session, &["button", "a"], grant_label(), None)
    })
    .await
    else {
        debug!("Login: no consent prompt within {}ms", wait_ms);
        return Ok(false);
    };
    session
        .click(&button)
        .await
        .map_err(|e| ActionError::login(LoginPhase::Consent, format!("{:#}", e)))?;
    debug!("Login: consent granted");
    Ok(true)
}
