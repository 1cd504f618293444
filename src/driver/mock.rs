//! In-memory browser used by the engine's tests
//!
//! A [`FakeSite`] is a set of pages keyed by URL. Each page is a list of
//! elements in document order; clicking an element can navigate, set a
//! cookie, remove the element, or submit a form field for checking.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

use super::traits::{BrowserSession, ElementRef, SessionFactory, Selector};

#[derive(Debug, Clone)]
pub enum OnClick {
    Navigate(String),
    SetCookie(String),
    /// Remove the element from the page
    Dismiss,
    /// Go to `next` if the first element matching `field` holds `expected`, else stay
    SubmitIf {
        field: String,
        expected: String,
        next: String,
    },
    Panic,
}

#[derive(Debug, Clone)]
pub struct FakeElement {
    css: Vec<String>,
    role: Option<String>,
    attributes: HashMap<String, String>,
    text: String,
    visible: bool,
    requires_cookie: Option<String>,
    appears_after: Duration,
    on_click: Option<OnClick>,
}

impl FakeElement {
    /// Element matched by each of the given CSS selectors
    pub fn new(css: &[&str]) -> Self {
        Self {
            css: css.iter().map(|s| s.to_string()).collect(),
            role: None,
            attributes: HashMap::new(),
            text: String::new(),
            visible: true,
            requires_cookie: None,
            appears_after: Duration::ZERO,
            on_click: None,
        }
    }

    pub fn button(text: &str) -> Self {
        Self::new(&["button"]).role("button").text(text)
    }

    pub fn link(text: &str, href: &str) -> Self {
        Self::new(&["a"]).role("link").text(text).attr("href", href)
    }

    pub fn role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn requires_cookie(mut self, name: &str) -> Self {
        self.requires_cookie = Some(name.to_string());
        self
    }

    pub fn appears_after(mut self, ms: u64) -> Self {
        self.appears_after = Duration::from_millis(ms);
        self
    }

    pub fn on_click(mut self, action: OnClick) -> Self {
        self.on_click = Some(action);
        self
    }

    fn matches(&self, selector: &Selector) -> bool {
        match selector {
            Selector::Css(css) => self.css.iter().any(|c| c == css),
            Selector::Text { text, exact: true } => self.text.trim() == text.trim(),
            Selector::Text { text, exact: false } => {
                !text.trim().is_empty()
                    && self
                        .text
                        .to_lowercase()
                        .contains(&text.trim().to_lowercase())
            }
            Selector::Role { role, name } => {
                self.role
                    .as_deref()
                    .map_or(false, |r| r.eq_ignore_ascii_case(role))
                    && name.as_ref().map_or(true, |n| {
                        self.text.to_lowercase().contains(&n.trim().to_lowercase())
                    })
            }
        }
    }

    fn label(&self) -> String {
        self.css
            .first()
            .cloned()
            .unwrap_or_else(|| format!("text={}", self.text))
    }
}

#[derive(Debug, Default)]
struct SiteLog {
    opened: usize,
    closed: usize,
    clicks: Vec<String>,
    fills: Vec<(String, String)>,
    visits: Vec<String>,
}

/// Pages shared by every session opened from one [`FakeBrowser`]
#[derive(Default)]
pub struct FakeSite {
    pages: HashMap<String, Vec<FakeElement>>,
    fail_screenshots: bool,
    hang: bool,
    log: Mutex<SiteLog>,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, elements: Vec<FakeElement>) -> Self {
        self.pages.insert(url.to_string(), elements);
        self
    }

    pub fn failing_screenshots(mut self) -> Self {
        self.fail_screenshots = true;
        self
    }

    /// Navigation and lookups never complete
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.log.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }

    pub fn clicks(&self) -> Vec<String> {
        self.log.lock().unwrap().clicks.clone()
    }

    pub fn visits(&self) -> Vec<String> {
        self.log.lock().unwrap().visits.clone()
    }

    /// Values typed into elements first-matched by `css`
    pub fn fills_of(&self, css: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .fills
            .iter()
            .filter(|(label, _)| label == css)
            .map(|(_, value)| value.clone())
            .collect()
    }
}

/// Session factory over a [`FakeSite`]
pub struct FakeBrowser {
    site: Arc<FakeSite>,
    fail_open: bool,
}

impl FakeBrowser {
    pub fn new(site: Arc<FakeSite>) -> Self {
        Self {
            site,
            fail_open: false,
        }
    }

    /// Factory whose sessions can never be opened
    pub fn broken(site: Arc<FakeSite>) -> Self {
        Self {
            site,
            fail_open: true,
        }
    }
}

#[async_trait]
impl SessionFactory for FakeBrowser {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        if self.fail_open {
            bail!("browser executable not found");
        }
        self.site.log.lock().unwrap().opened += 1;
        Ok(Box::new(FakeSession::new(self.site.clone())))
    }
}

struct PageState {
    url: Option<String>,
    loaded_at: Instant,
    cookies: HashSet<String>,
    values: HashMap<usize, String>,
    removed: HashSet<usize>,
    closed: bool,
}

pub struct FakeSession {
    site: Arc<FakeSite>,
    state: Mutex<PageState>,
}

impl FakeSession {
    pub fn new(site: Arc<FakeSite>) -> Self {
        Self {
            site,
            state: Mutex::new(PageState {
                url: None,
                loaded_at: Instant::now(),
                cookies: HashSet::new(),
                values: HashMap::new(),
                removed: HashSet::new(),
                closed: false,
            }),
        }
    }

    fn elements(&self, state: &PageState) -> &[FakeElement] {
        state
            .url
            .as_ref()
            .and_then(|url| self.site.pages.get(url))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn present(&self, state: &PageState, i: usize, el: &FakeElement) -> bool {
        !state.removed.contains(&i)
            && state.loaded_at.elapsed() >= el.appears_after
            && el
                .requires_cookie
                .as_ref()
                .map_or(true, |c| state.cookies.contains(c))
    }

    /// Page-level indices of the present elements matching `selector`
    fn matching(&self, state: &PageState, selector: &Selector) -> Vec<usize> {
        self.elements(state)
            .iter()
            .enumerate()
            .filter(|(i, el)| self.present(state, *i, el) && el.matches(selector))
            .map(|(i, _)| i)
            .collect()
    }

    fn resolve(&self, state: &PageState, element: &ElementRef) -> Result<usize> {
        if state.closed {
            bail!("session is closed");
        }
        self.matching(state, &element.selector)
            .get(element.index)
            .copied()
            .ok_or_else(|| anyhow!("element {}[{}] is gone", element.selector, element.index))
    }

    async fn stall(&self) {
        if self.site.hang {
            std::future::pending::<()>().await;
        }
    }

    fn navigate(&self, state: &mut PageState, url: &str) -> Result<()> {
        if !self.site.pages.contains_key(url) {
            bail!("net::ERR_NAME_NOT_RESOLVED at {}", url);
        }
        state.url = Some(url.to_string());
        state.loaded_at = Instant::now();
        state.values.clear();
        state.removed.clear();
        self.site.log.lock().unwrap().visits.push(url.to_string());
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn goto(&self, url: &str, _timeout_ms: u64) -> Result<()> {
        self.stall().await;
        let mut state = self.state.lock().unwrap();
        if state.closed {
            bail!("session is closed");
        }
        self.navigate(&mut state, url)
    }

    async fn current_url(&self) -> Result<String> {
        self.stall().await;
        let state = self.state.lock().unwrap();
        Ok(state.url.clone().unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn find_all(&self, selector: &Selector) -> Result<Vec<ElementRef>> {
        self.stall().await;
        let state = self.state.lock().unwrap();
        if state.closed {
            bail!("session is closed");
        }
        let elements = self.elements(&state);
        Ok(self
            .matching(&state, selector)
            .into_iter()
            .enumerate()
            .map(|(index, i)| ElementRef {
                selector: selector.clone(),
                index,
                visible: elements[i].visible,
            })
            .collect())
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let i = self.resolve(&state, element)?;
        let el = self.elements(&state)[i].clone();
        if !el.visible {
            bail!("element {} is not visible", element.selector);
        }
        self.site.log.lock().unwrap().clicks.push(el.label());

        match el.on_click {
            Some(OnClick::Navigate(url)) => self.navigate(&mut state, &url)?,
            Some(OnClick::SetCookie(name)) => {
                state.cookies.insert(name);
            }
            Some(OnClick::Dismiss) => {
                state.removed.insert(i);
            }
            Some(OnClick::SubmitIf {
                field,
                expected,
                next,
            }) => {
                let field_index = self.matching(&state, &Selector::Css(field)).first().copied();
                let typed = field_index.and_then(|f| state.values.get(&f)).cloned();
                if typed.as_deref() == Some(expected.as_str()) {
                    self.navigate(&mut state, &next)?;
                }
            }
            Some(OnClick::Panic) => {
                // Release the lock so the session can still be closed
                drop(state);
                panic!("page script crashed");
            }
            None => {}
        }
        Ok(())
    }

    async fn fill(&self, element: &ElementRef, value: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let i = self.resolve(&state, element)?;
        let el = &self.elements(&state)[i];
        if !el.visible {
            bail!("element {} is not visible", element.selector);
        }
        let label = el.label();
        state.values.insert(i, value.to_string());
        self.site
            .log
            .lock()
            .unwrap()
            .fills
            .push((label, value.to_string()));
        Ok(())
    }

    async fn element_text(&self, element: &ElementRef) -> Result<String> {
        let state = self.state.lock().unwrap();
        let i = self.resolve(&state, element)?;
        Ok(state
            .values
            .get(&i)
            .cloned()
            .unwrap_or_else(|| self.elements(&state)[i].text.clone()))
    }

    async fn attribute(&self, element: &ElementRef, name: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        let i = self.resolve(&state, element)?;
        Ok(self.elements(&state)[i].attributes.get(name).cloned())
    }

    async fn take_screenshot(&self, path: &Path) -> Result<()> {
        if self.site.fail_screenshots {
            bail!("disk full");
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b"\x89PNG fake")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            self.site.log.lock().unwrap().closed += 1;
        }
        Ok(())
    }
}
