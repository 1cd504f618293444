//! Element resolution with bounded waiting
//!
//! Every lookup polls the session until something matches or the budget is
//! spent. Ambiguity is never an error: the first visible match in document
//! order wins.

use log::debug;
use regex::Regex;
use std::convert::Infallible;
use std::future::Future;
use std::sync::OnceLock;
use tokio::time::{sleep, Duration, Instant};

use super::error::LocatorError;
use crate::driver::{BrowserSession, ElementRef, Selector};
use crate::parser::types::{StructuredTarget, Target};

pub const POLL_INTERVAL_MS: u64 = 100;

/// Roles tried with a humanized slug, in order
const SLUG_ROLES: &[&str] = &["menuitem", "link", "button"];

/// Attributes a bare slug may name
const SLUG_ATTRIBUTES: &[&str] = &["data-testid", "data-test-id", "data-qa"];

const USER_MENU_NAMES: &[&str] = &["user", "account", "profile", "menu", r"my\s*account", "settings"];

const USER_MENU_SELECTORS: &[&str] = &[
    "[data-testid*='user']",
    "[data-testid*='account']",
    "#userMenu",
    ".user-menu",
];

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($re).expect("valid regex"))
        }
    };
}

pattern!(text_attribute, r#"\[text=['"](.+?)['"]\]"#);
pattern!(test_id_prefix, r#"^data-testid\s*=\s*['"]?([\w\-:]+)['"]?$"#);
pattern!(role_prefix, r"^role\s*=\s*([\w-]+)$");
pattern!(aria_label, r#"aria-label=['"](.+?)['"]"#);
pattern!(slug_word, r"^[A-Za-z0-9_-]+$");
pattern!(camel_boundary, r"([a-z])([A-Z])");
pattern!(separators, r"[-_]+");

/// `save_draft-button` becomes `save draft button`, `saveDraft` becomes `save Draft`
pub fn humanize_slug(slug: &str) -> String {
    let spaced = separators().replace_all(slug, " ");
    camel_boundary()
        .replace_all(&spaced, "$1 $2")
        .trim()
        .to_string()
}

fn attribute_selector(attribute: &str, value: &str) -> Selector {
    Selector::Css(format!("[{}='{}']", attribute, value.replace('\'', "\\'")))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Structural selectors to try for `target`, most specific first
pub fn candidates(target: &Target) -> Vec<Selector> {
    match target {
        Target::Plain(raw) => plain_candidates(raw),
        Target::Structured(structured) => structured_candidates(structured),
    }
}

fn structured_candidates(target: &StructuredTarget) -> Vec<Selector> {
    let target = target.normalized();
    let mut found = Vec::new();
    if let Some(id) = non_blank(&target.test_id) {
        found.push(attribute_selector("data-testid", id));
    }
    if let Some(role) = non_blank(&target.role) {
        let name = non_blank(&target.name)
            .or(non_blank(&target.value))
            .or(non_blank(&target.text));
        found.push(Selector::role(role, name));
    }
    if let Some(text) = non_blank(&target.text) {
        found.push(Selector::text(text, false));
    }
    if let Some(css) = non_blank(&target.css) {
        found.push(Selector::css(css));
    }
    if target.role.is_none() && target.kind.is_none() {
        if let Some(value) = non_blank(&target.value) {
            found.push(Selector::text(value, false));
        }
    }
    found
}

fn plain_candidates(raw: &str) -> Vec<Selector> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if let Some(caps) = text_attribute().captures(raw) {
        return vec![Selector::text(&caps[1], false)];
    }
    if let Some(caps) = test_id_prefix().captures(raw) {
        return vec![attribute_selector("data-testid", &caps[1])];
    }
    if let Some(text) = raw.strip_prefix("text=") {
        return match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            Some(quoted) => vec![Selector::text(quoted, true)],
            None => vec![Selector::text(text, false)],
        };
    }
    if let Some(caps) = role_prefix().captures(raw) {
        return vec![Selector::role(&caps[1], None)];
    }

    let mut found = vec![Selector::css(raw)];
    if let Some(caps) = aria_label().captures(raw) {
        for role in ["button", "link"] {
            found.push(Selector::role(role, Some(&caps[1])));
        }
    }

    let slug = raw.trim_matches(|c| c == '\'' || c == '"');
    if slug_word().is_match(slug) {
        for attribute in SLUG_ATTRIBUTES {
            found.push(attribute_selector(attribute, slug));
        }
        found.push(Selector::Css(format!("#{}", slug)));
        found.push(attribute_selector("name", slug));

        let human = humanize_slug(slug);
        for role in SLUG_ROLES {
            found.push(Selector::role(role, Some(&human)));
        }
        found.push(Selector::text(&human, false));
    }
    found
}

/// A resolved element and how it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub element: ElementRef,
    /// Found through the text fallback rather than the structural selector
    pub via_fallback: bool,
}

/// Run `check` every [`POLL_INTERVAL_MS`] until it yields a value or `budget_ms`
/// is spent. The check always runs at least once.
pub async fn poll_for<T, E, F, Fut>(budget_ms: u64, mut check: F) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + Duration::from_millis(budget_ms);
    loop {
        if let Some(found) = check().await? {
            return Ok(Some(found));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep((deadline - now).min(Duration::from_millis(POLL_INTERVAL_MS))).await;
    }
}

/// First visible element across `candidates`, tried in order.
///
/// A candidate the page rejects (malformed for this page's engine) is
/// skipped; the error only surfaces when every candidate failed.
pub async fn first_visible_of(
    session: &dyn BrowserSession,
    candidates: &[Selector],
) -> anyhow::Result<Option<ElementRef>> {
    let mut failures = 0;
    let mut last_error = None;
    for selector in candidates {
        match session.first_visible(selector).await {
            Ok(Some(found)) => return Ok(Some(found)),
            Ok(None) => {}
            Err(e) => {
                debug!("Candidate {} rejected: {:#}", selector, e);
                failures += 1;
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) if failures == candidates.len() => Err(e),
        _ => Ok(None),
    }
}

/// First visible element among `containers` whose text matches `pattern` and
/// does not match `exclude`
pub async fn first_visible_matching(
    session: &dyn BrowserSession,
    containers: &[&str],
    pattern: &Regex,
    exclude: Option<&Regex>,
) -> anyhow::Result<Option<ElementRef>> {
    for css in containers {
        for element in session.find_all(&Selector::css(css)).await? {
            if !element.visible {
                continue;
            }
            let text = session.element_text(&element).await?;
            if pattern.is_match(text.trim()) && !exclude.map_or(false, |re| re.is_match(&text)) {
                return Ok(Some(element));
            }
        }
    }
    Ok(None)
}

/// Poll `lookup` until it yields an element. Lookup errors while polling
/// mean "not there yet".
pub async fn wait_for_element<F, Fut>(budget_ms: u64, mut lookup: F) -> Option<ElementRef>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<ElementRef>>>,
{
    let found = poll_for(budget_ms, || {
        let pending = lookup();
        async move {
            match pending.await {
                Ok(found) => Ok::<_, Infallible>(found),
                Err(e) => {
                    debug!("Lookup failed, retrying: {:#}", e);
                    Ok(None)
                }
            }
        }
    })
    .await;
    match found {
        Ok(found) => found,
        Err(never) => match never {},
    }
}

/// Resolve a step's target element.
///
/// Tries the structural `target` first (see [`candidates`]), then
/// `fallback_text` (exact match, then case-insensitive substring). With both
/// given, each phase gets half of `timeout_ms`; a lone phase gets all of it.
///
/// Known trade-off: when several elements match, the first visible one in
/// document order is used, even if the author meant another. This keeps
/// generated tests moving instead of failing on ambiguity.
pub async fn locate(
    session: &dyn BrowserSession,
    target: Option<&Target>,
    fallback_text: Option<&str>,
    timeout_ms: u64,
) -> Result<Located, LocatorError> {
    let started = Instant::now();
    let selector = target.filter(|t| !t.is_empty());
    let fallback_text = fallback_text.map(str::trim).filter(|s| !s.is_empty());

    let (css_budget, text_budget) = match (selector, fallback_text) {
        (Some(_), Some(_)) => (timeout_ms / 2, timeout_ms - timeout_ms / 2),
        _ => (timeout_ms, timeout_ms),
    };

    if let Some(target) = selector {
        let structural = candidates(target);
        if let Some(element) = wait_for_element(css_budget, || first_visible_of(session, &structural)).await {
            return Ok(Located {
                element,
                via_fallback: false,
            });
        }
        debug!("Target {} matched nothing visible in {}ms", target, css_budget);
    }

    if let Some(text) = fallback_text {
        let candidates = [Selector::text(text, true), Selector::text(text, false)];
        if let Some(element) = wait_for_element(text_budget, || first_visible_of(session, &candidates)).await {
            return Ok(Located {
                element,
                via_fallback: selector.is_some(),
            });
        }
    }

    Err(LocatorError {
        selector: selector.map(Target::to_string),
        fallback_text: fallback_text.map(str::to_string),
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Click the first visible user/account menu trigger, if any. Items inside
/// such menus are often only rendered once it is open.
pub async fn open_user_menu(session: &dyn BrowserSession) -> bool {
    static NAMES: OnceLock<Vec<Regex>> = OnceLock::new();
    let names = NAMES.get_or_init(|| {
        USER_MENU_NAMES
            .iter()
            .map(|name| Regex::new(&format!("(?i){}", name)).expect("valid regex"))
            .collect()
    });

    for name in names {
        if let Ok(Some(trigger)) = first_visible_matching(session, &["button", "[role='button']"], name, None).await {
            if click_menu_trigger(session, &trigger).await {
                return true;
            }
        }
    }
    for css in USER_MENU_SELECTORS {
        if let Ok(Some(trigger)) = session.first_visible(&Selector::css(css)).await {
            if click_menu_trigger(session, &trigger).await {
                return true;
            }
        }
    }
    false
}

async fn click_menu_trigger(session: &dyn BrowserSession, trigger: &ElementRef) -> bool {
    match session.click(trigger).await {
        Ok(()) => {
            debug!("Opened user menu via {}", trigger.selector);
            true
        }
        Err(e) => {
            debug!("User menu trigger {} not clickable: {:#}", trigger.selector, e);
            false
        }
    }
}

/// Text-only lookup; `exact` skips the substring phase
pub async fn locate_text(
    session: &dyn BrowserSession,
    text: &str,
    exact: bool,
    timeout_ms: u64,
) -> Result<Located, LocatorError> {
    if !exact {
        return locate(session, None, Some(text), timeout_ms).await;
    }

    let started = Instant::now();
    let candidates = [Selector::text(text, true)];
    match wait_for_element(timeout_ms, || first_visible_of(session, &candidates)).await {
        Some(element) => Ok(Located {
            element,
            via_fallback: false,
        }),
        None => Err(LocatorError {
            selector: None,
            fallback_text: Some(text.to_string()),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{FakeElement, FakeSession, FakeSite, OnClick};
    use std::sync::Arc;

    async fn session_on(elements: Vec<FakeElement>) -> FakeSession {
        let site = Arc::new(FakeSite::new().page("https://ex.test/", elements));
        let session = FakeSession::new(site);
        session.goto("https://ex.test/", 1000).await.unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_selector_wins_when_present() {
        let session = session_on(vec![FakeElement::new(&["#go"]).text("Go")]).await;

        let found = locate(&session, Some(&Target::plain("#go")), Some("Go"), 1000).await.unwrap();
        assert_eq!(found.element.selector, Selector::css("#go"));
        assert!(!found.via_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_text() {
        let session = session_on(vec![
            FakeElement::new(&["a.nav"]).text("Studies"),
            FakeElement::new(&["button"]).text("Sign in"),
        ])
        .await;

        let found = locate(&session, Some(&Target::plain("#login")), Some("Sign in"), 1000).await.unwrap();
        assert!(found.via_fallback);
        assert_eq!(found.element.selector, Selector::text("Sign in", true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_substring_fallback_is_case_insensitive() {
        let session = session_on(vec![FakeElement::button("Continue to Login.gov")]).await;

        let found = locate(&session, None, Some("login.gov"), 1000).await.unwrap();
        assert_eq!(found.element.selector, Selector::text("login.gov", false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_visible_match_wins() {
        let session = session_on(vec![
            FakeElement::new(&[".item"]).text("hidden").hidden(),
            FakeElement::new(&[".item"]).text("first"),
            FakeElement::new(&[".item"]).text("second"),
        ])
        .await;

        let found = locate(&session, Some(&Target::plain(".item")), None, 500).await.unwrap();
        assert_eq!(found.element.index, 1);
        assert_eq!(session.element_text(&found.element).await.unwrap(), "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_late_element() {
        let session = session_on(vec![FakeElement::new(&["#late"]).appears_after(700)]).await;

        let started = Instant::now();
        locate(&session, Some(&Target::plain("#late")), None, 2000).await.unwrap();
        let waited = started.elapsed().as_millis() as u64;
        assert!((700..=800).contains(&waited), "waited {}ms", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_within_budget() {
        let session = session_on(vec![FakeElement::button("Cancel")]).await;

        let started = Instant::now();
        let err = locate(&session, Some(&Target::plain("#missing")), Some("Nope"), 1000)
            .await
            .unwrap_err();
        let waited = started.elapsed().as_millis() as u64;

        assert!((1000..=1100).contains(&waited), "waited {}ms", waited);
        assert_eq!(err.selector.as_deref(), Some("#missing"));
        assert_eq!(err.fallback_text.as_deref(), Some("Nope"));
        assert!(err.elapsed_ms >= 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_text_skips_substring() {
        let session = session_on(vec![FakeElement::button("Log in with Google")]).await;

        assert!(locate_text(&session, "Log in", true, 300).await.is_err());
        assert!(locate_text(&session, "Log in", false, 300).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_visible_matching_respects_exclude() {
        let session = session_on(vec![
            FakeElement::button("Sign in with Google"),
            FakeElement::new(&["a"]).text("Sign in"),
        ])
        .await;

        let pattern = Regex::new(r"(?i)^sign\s*in").unwrap();
        let social = Regex::new(r"(?i)google").unwrap();
        let found = first_visible_matching(&session, &["button", "a"], &pattern, Some(&social))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.selector, Selector::css("a"));
    }

    #[test]
    fn test_slug_candidates_in_order() {
        let found = candidates(&Target::plain("save-draft"));
        assert_eq!(
            found,
            vec![
                Selector::css("save-draft"),
                Selector::css("[data-testid='save-draft']"),
                Selector::css("[data-test-id='save-draft']"),
                Selector::css("[data-qa='save-draft']"),
                Selector::css("#save-draft"),
                Selector::css("[name='save-draft']"),
                Selector::role("menuitem", Some("save draft")),
                Selector::role("link", Some("save draft")),
                Selector::role("button", Some("save draft")),
                Selector::text("save draft", false),
            ]
        );
        assert_eq!(humanize_slug("myAccount_menu"), "my Account menu");
    }

    #[test]
    fn test_prefixed_and_css_candidates() {
        assert_eq!(
            candidates(&Target::plain("[text='Studies']")),
            vec![Selector::text("Studies", false)]
        );
        assert_eq!(
            candidates(&Target::plain("data-testid=nav-home")),
            vec![Selector::css("[data-testid='nav-home']")]
        );
        assert_eq!(
            candidates(&Target::plain("text=\"Sign in\"")),
            vec![Selector::text("Sign in", true)]
        );
        assert_eq!(candidates(&Target::plain("role=table")), vec![Selector::role("table", None)]);
        assert_eq!(
            candidates(&Target::plain("button[aria-label='Close']")),
            vec![
                Selector::css("button[aria-label='Close']"),
                Selector::role("button", Some("Close")),
                Selector::role("link", Some("Close")),
            ]
        );
    }

    #[test]
    fn test_structured_candidates() {
        let target: Target = serde_json::from_str(r#"{"role": "link", "value": "Help"}"#).unwrap();
        assert_eq!(candidates(&target), vec![Selector::role("link", Some("Help"))]);

        let target: Target = serde_json::from_str(r#"{"type": "testid", "value": "o'brien"}"#).unwrap();
        assert_eq!(candidates(&target), vec![Selector::css("[data-testid='o\\'brien']")]);

        let target: Target = serde_json::from_str(r#"{"value": "Studies"}"#).unwrap();
        assert_eq!(candidates(&target), vec![Selector::text("Studies", false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slug_resolves_by_test_id_and_role() {
        let session = session_on(vec![
            FakeElement::new(&["[data-testid='study-list']"]).text("3 studies"),
            FakeElement::button("Save draft"),
        ])
        .await;

        let found = locate(&session, Some(&Target::plain("study-list")), None, 500).await.unwrap();
        assert_eq!(found.element.selector, Selector::css("[data-testid='study-list']"));

        let found = locate(&session, Some(&Target::plain("saveDraft")), None, 500).await.unwrap();
        assert_eq!(found.element.selector, Selector::role("button", Some("save Draft")));
        assert!(!found.via_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_role_target() {
        let session = session_on(vec![
            FakeElement::new(&["a"]).role("link").text("Edit profile"),
            FakeElement::button("Edit profile"),
        ])
        .await;

        let target: Target = serde_json::from_str(r#"{"role": "button", "name": "edit"}"#).unwrap();
        let found = locate(&session, Some(&target), None, 500).await.unwrap();
        assert_eq!(found.element.selector, Selector::role("button", Some("edit")));
        assert_eq!(found.element.index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_user_menu() {
        let session = session_on(vec![
            FakeElement::new(&["#logout"]).text("Log out").requires_cookie("menu"),
            FakeElement::button("My Account").on_click(OnClick::SetCookie("menu".into())),
        ])
        .await;

        assert!(session.first_visible(&Selector::css("#logout")).await.unwrap().is_none());
        assert!(open_user_menu(&session).await);
        assert!(session.first_visible(&Selector::css("#logout")).await.unwrap().is_some());

        let bare = session_on(vec![FakeElement::button("Save")]).await;
        assert!(!open_user_menu(&bare).await);
    }
}
