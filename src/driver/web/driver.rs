//! Browser sessions backed by Playwright
//!
//! One Chromium process is launched lazily and shared by the whole suite;
//! every session gets its own browser context, so cookies and storage never
//! leak between test cases. Lookups search the main frame, then child frames.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use playwright::api::page::Event as PageEvent;
use playwright::api::{Browser, BrowserContext, ElementHandle, Page, Viewport};
use playwright::Playwright;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::driver::traits::{BrowserSession, ElementRef, SessionFactory, Selector};
use crate::utils::hosts::HostPolicy;

/// How long a popup may sit on `about:blank` before its host is checked
const POPUP_SETTLE_MS: u64 = 5000;

/// Web browser type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrowserType {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

/// Web Driver configuration
#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    pub browser_type: BrowserType,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Explicit browser binary; discovered when unset
    pub executable_path: Option<PathBuf>,
    /// Close popups and undo main-frame navigations that leave these hosts
    pub host_policy: Option<HostPolicy>,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        let headless = std::env::var("STORY_TESTER_HEADLESS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let executable_path = std::env::var("PLAYWRIGHT_CHROMIUM_EXECUTABLE_PATH")
            .ok()
            .map(PathBuf::from);

        Self {
            browser_type: BrowserType::Chromium,
            headless,
            viewport_width: 1366,
            viewport_height: 900,
            executable_path,
            host_policy: None,
        }
    }
}

struct SharedBrowser {
    // Keeps the driver process alive for as long as the browser is in use
    _playwright: Playwright,
    browser: Browser,
}

/// Session factory that launches the browser on first use
pub struct PlaywrightLauncher {
    config: WebDriverConfig,
    shared: Mutex<Option<Arc<SharedBrowser>>>,
}

impl PlaywrightLauncher {
    pub fn new(config: WebDriverConfig) -> Self {
        Self {
            config,
            shared: Mutex::new(None),
        }
    }

    async fn browser(&self) -> Result<Arc<SharedBrowser>> {
        let mut guard = self.shared.lock().await;
        if let Some(shared) = guard.as_ref() {
            return Ok(shared.clone());
        }

        let playwright = Playwright::initialize()
            .await
            .context("Failed to initialize Playwright")?;

        let browser = match self.config.browser_type {
            BrowserType::Chromium => launch_chromium_browser(&playwright.chromium(), &self.config).await?,
            BrowserType::Firefox => playwright
                .firefox()
                .launcher()
                .headless(self.config.headless)
                .launch()
                .await
                .context("Failed to launch Firefox")?,
            BrowserType::Webkit => playwright
                .webkit()
                .launcher()
                .headless(self.config.headless)
                .launch()
                .await
                .context("Failed to launch WebKit")?,
        };
        info!("Launched {:?} (headless: {})", self.config.browser_type, self.config.headless);

        let shared = Arc::new(SharedBrowser {
            _playwright: playwright,
            browser,
        });
        *guard = Some(shared.clone());
        Ok(shared)
    }
}

#[async_trait]
impl SessionFactory for PlaywrightLauncher {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        let shared = self.browser().await?;

        let context = shared
            .browser
            .context_builder()
            .build()
            .await
            .context("Failed to create browser context")?;
        let page = context.new_page().await.context("Failed to open page")?;

        page.set_viewport_size(Viewport {
            width: self.config.viewport_width as i32,
            height: self.config.viewport_height as i32,
        })
        .await?;

        let guard = match &self.config.host_policy {
            Some(policy) => Some(spawn_host_guard(&page, policy.clone())?),
            None => None,
        };

        Ok(Box::new(PlaywrightSession {
            _browser: shared,
            context,
            page,
            guard,
            closed: Mutex::new(false),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(shared) = self.shared.lock().await.take() {
            shared.browser.close().await.context("Failed to close browser")?;
            debug!("Browser closed");
        }
        Ok(())
    }
}

/// One browser context with a single page
pub struct PlaywrightSession {
    _browser: Arc<SharedBrowser>,
    context: BrowserContext,
    page: Page,
    guard: Option<JoinHandle<()>>,
    closed: Mutex<bool>,
}

impl PlaywrightSession {
    /// Matches in the main frame, then in each child frame
    async fn query(&self, selector: &Selector) -> Result<Vec<ElementHandle>> {
        let sel = selector_to_playwright(selector);
        let mut handles = self.page.query_selector_all(&sel).await?;
        for frame in self.page.frames()? {
            if !matches!(frame.parent_frame(), Ok(Some(_))) {
                continue;
            }
            match frame.query_selector_all(&sel).await {
                Ok(found) => handles.extend(found),
                Err(e) => debug!("Skipping detached frame: {:#}", e),
            }
        }

        let Selector::Role { name: Some(name), .. } = selector else {
            return Ok(handles);
        };
        let wanted = name.trim().to_lowercase();
        let mut named = Vec::with_capacity(handles.len());
        for handle in handles {
            if accessible_name(&handle).await.to_lowercase().contains(&wanted) {
                named.push(handle);
            }
        }
        Ok(named)
    }

    async fn handle(&self, element: &ElementRef) -> Result<ElementHandle> {
        let mut handles = self.query(&element.selector).await?;
        if element.index >= handles.len() {
            anyhow::bail!(
                "Element {}[{}] is no longer on the page",
                element.selector,
                element.index
            );
        }
        Ok(handles.swap_remove(element.index))
    }
}

#[async_trait]
impl BrowserSession for PlaywrightSession {
    async fn goto(&self, url: &str, timeout_ms: u64) -> Result<()> {
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.page.goto_builder(url).goto(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Navigation to {} timed out after {}ms", url, timeout_ms))?
        .with_context(|| format!("Failed to navigate to {}", url))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let url: String = self
            .page
            .evaluate::<(), String>("() => window.location.href", ())
            .await?;
        Ok(url)
    }

    async fn find_all(&self, selector: &Selector) -> Result<Vec<ElementRef>> {
        let handles = self.query(selector).await?;

        let mut found = Vec::with_capacity(handles.len());
        for (index, handle) in handles.iter().enumerate() {
            found.push(ElementRef {
                selector: selector.clone(),
                index,
                visible: handle.is_visible().await.unwrap_or(false),
            });
        }
        Ok(found)
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        let handle = self.handle(element).await?;
        handle
            .click_builder()
            .click()
            .await
            .with_context(|| format!("Failed to click {}", element.selector))?;
        Ok(())
    }

    async fn fill(&self, element: &ElementRef, value: &str) -> Result<()> {
        let handle = self.handle(element).await?;
        handle
            .fill_builder(value)
            .fill()
            .await
            .with_context(|| format!("Failed to fill {}", element.selector))?;
        Ok(())
    }

    async fn element_text(&self, element: &ElementRef) -> Result<String> {
        let handle = self.handle(element).await?;
        let text = handle.inner_text().await?;
        if !text.trim().is_empty() {
            return Ok(text);
        }
        // Form fields carry their text in `value`
        Ok(handle.get_attribute("value").await?.unwrap_or_default())
    }

    async fn attribute(&self, element: &ElementRef, name: &str) -> Result<Option<String>> {
        let handle = self.handle(element).await?;
        Ok(handle.get_attribute(name).await?)
    }

    async fn take_screenshot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        self.page
            .screenshot_builder()
            .path(path.to_path_buf())
            .screenshot()
            .await
            .with_context(|| format!("Failed to save screenshot to {}", path.display()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().await;
        if !*closed {
            *closed = true;
            if let Some(guard) = &self.guard {
                guard.abort();
            }
            self.context.close().await.context("Failed to close browser context")?;
        }
        Ok(())
    }
}

fn selector_to_playwright(selector: &Selector) -> String {
    match selector {
        Selector::Css(css) => css.clone(),
        Selector::Text { text, exact: true } => format!("text=\"{}\"", text.replace('"', "\\\"")),
        Selector::Text { text, exact: false } => format!("text=/{}/i", escape_regex_body(text.trim())),
        // Names are filtered after the query
        Selector::Role { role, .. } => role_css(role),
    }
}

/// Escape `text` for a `/.../` regex body. Quotes and `>` are escaped too so
/// the selector parser never sees a string delimiter or a `>>` chain.
fn escape_regex_body(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\^$.|?*+()[]{}/>\"'".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Elements carrying an ARIA role, explicitly or implicitly
fn role_css(role: &str) -> String {
    let role = role.trim().to_ascii_lowercase();
    let implicit = match role.as_str() {
        "button" => "button, input[type='button'], input[type='submit'], input[type='reset'], ",
        "link" => "a[href], area[href], ",
        "textbox" => "input:not([type]), input[type='text'], input[type='email'], input[type='password'], textarea, ",
        "checkbox" => "input[type='checkbox'], ",
        "heading" => "h1, h2, h3, h4, h5, h6, ",
        "table" => "table, ",
        "navigation" => "nav, ",
        _ => "",
    };
    format!("{}[role='{}']", implicit, role.replace('\'', ""))
}

/// `aria-label`, else the visible text
async fn accessible_name(handle: &ElementHandle) -> String {
    if let Ok(Some(label)) = handle.get_attribute("aria-label").await {
        if !label.trim().is_empty() {
            return label;
        }
    }
    handle.inner_text().await.unwrap_or_default()
}

/// Watch a page for popups and main-frame navigations that leave the allowed
/// hosts. Popups are closed; navigations are undone with a history step back.
fn spawn_host_guard(page: &Page, policy: HostPolicy) -> Result<JoinHandle<()>> {
    let mut events = Box::pin(page.subscribe_event()?);
    let page = page.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(PageEvent::Popup(popup)) => {
                    tokio::spawn(close_if_disallowed(popup, policy.clone()));
                }
                Ok(PageEvent::FrameNavigated(frame)) => {
                    if !matches!(frame.parent_frame(), Ok(None)) {
                        continue;
                    }
                    let url = frame.url().unwrap_or_default();
                    if policy.allows(&url) {
                        continue;
                    }
                    warn!("Blocked navigation to {}, going back", url);
                    if let Err(e) = page.go_back_builder().go_back().await {
                        debug!("Going back from {} failed: {:#}", url, e);
                    }
                }
                Ok(_) => {}
                // Lagged behind the event stream; keep watching
                Err(e) => debug!("Page events skipped: {}", e),
            }
        }
    }))
}

async fn close_if_disallowed(popup: Page, policy: HostPolicy) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(POPUP_SETTLE_MS);
    let mut url = popup.url().unwrap_or_default();
    while (url.is_empty() || url == "about:blank") && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(250)).await;
        url = popup.url().unwrap_or_default();
    }
    if policy.allows(&url) {
        return;
    }
    warn!("Closing popup to disallowed host: {}", url);
    if let Err(e) = popup.close(None).await {
        debug!("Closing popup {} failed: {:#}", url, e);
    }
}

/// Launch a new Chromium browser
async fn launch_chromium_browser(
    chromium: &playwright::api::BrowserType,
    config: &WebDriverConfig,
) -> Result<playwright::api::Browser> {
    let mut launcher = chromium.launcher();
    launcher = launcher.headless(config.headless);

    let executable = config.executable_path.clone().or_else(find_system_browser);
    if let Some(ref path) = executable {
        info!("Using browser executable: {}", path.display());
        launcher = launcher.executable(path);
    } else {
        debug!("No browser executable found, using Playwright's bundled Chromium");
    }

    let args: Vec<String> = [
        "--no-sandbox",
        "--disable-setuid-sandbox",
        "--disable-dev-shm-usage",
        "--disable-gpu",
        "--ignore-certificate-errors",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    launcher = launcher.args(&args);

    launcher.launch().await.context("Failed to launch Chromium")
}

fn find_system_browser() -> Option<PathBuf> {
    let common_paths = [
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    common_paths
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_mapping() {
        assert_eq!(selector_to_playwright(&Selector::css("#email")), "#email");
        assert_eq!(
            selector_to_playwright(&Selector::text("Log in", true)),
            "text=\"Log in\""
        );
        assert_eq!(
            selector_to_playwright(&Selector::text("Say \"hi\"", true)),
            "text=\"Say \\\"hi\\\"\""
        );
        assert_eq!(selector_to_playwright(&Selector::text("login", false)), "text=/login/i");
    }

    #[test]
    fn test_substring_text_is_escaped() {
        assert_eq!(
            selector_to_playwright(&Selector::text("a >> b/c (1.5)", false)),
            "text=/a \\>\\> b\\/c \\(1\\.5\\)/i"
        );
        assert_eq!(
            selector_to_playwright(&Selector::text("Don't \"quote\"", false)),
            "text=/Don\\'t \\\"quote\\\"/i"
        );
        assert_eq!(selector_to_playwright(&Selector::text(" Studies ", false)), "text=/Studies/i");
    }

    #[test]
    fn test_role_mapping() {
        assert_eq!(
            selector_to_playwright(&Selector::role("link", Some("Help"))),
            "a[href], area[href], [role='link']"
        );
        assert_eq!(selector_to_playwright(&Selector::role("menuitem", None)), "[role='menuitem']");
    }

    #[test]
    fn test_default_viewport() {
        let config = WebDriverConfig::default();
        assert_eq!(config.browser_type, BrowserType::Chromium);
        assert_eq!((config.viewport_width, config.viewport_height), (1366, 900));
        assert!(config.host_policy.is_none());
    }
}
