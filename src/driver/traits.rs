use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;

/// How to find elements on a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Structural CSS selector
    Css(String),
    /// Visible text; `exact` is a whole-string, case-sensitive match,
    /// otherwise a case-insensitive substring match
    Text { text: String, exact: bool },
    /// ARIA role, optionally narrowed by accessible name (case-insensitive substring)
    Role { role: String, name: Option<String> },
}

impl Selector {
    pub fn css(css: &str) -> Self {
        Selector::Css(css.to_string())
    }

    pub fn text(text: &str, exact: bool) -> Self {
        Selector::Text {
            text: text.to_string(),
            exact,
        }
    }

    pub fn role(role: &str, name: Option<&str>) -> Self {
        Selector::Role {
            role: role.to_string(),
            name: name.map(str::to_string),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css(css) => write!(f, "{}", css),
            Selector::Text { text, exact: true } => write!(f, "text=\"{}\"", text),
            Selector::Text { text, exact: false } => write!(f, "text~\"{}\"", text),
            Selector::Role { role, name: Some(name) } => write!(f, "role={}[name~\"{}\"]", role, name),
            Selector::Role { role, name: None } => write!(f, "role={}", role),
        }
    }
}

/// The `index`-th match (document order) of `selector` at the time it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef {
    pub selector: Selector,
    pub index: usize,
    pub visible: bool,
}

/// One isolated browser session (own cookies and storage), owned by a single test case.
///
/// Every call is a suspension point; callers bound them with timeouts.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Load `url` and wait for the page to settle
    async fn goto(&self, url: &str, timeout_ms: u64) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    /// All matches in document order, with their visibility
    async fn find_all(&self, selector: &Selector) -> Result<Vec<ElementRef>>;

    async fn click(&self, element: &ElementRef) -> Result<()>;

    /// Clear the field and type `value`
    async fn fill(&self, element: &ElementRef, value: &str) -> Result<()>;

    /// Visible text, or the current value for form fields
    async fn element_text(&self, element: &ElementRef) -> Result<String>;

    async fn attribute(&self, element: &ElementRef, name: &str) -> Result<Option<String>>;

    async fn take_screenshot(&self, path: &Path) -> Result<()>;

    /// Release the session. Safe to call more than once.
    async fn close(&self) -> Result<()>;

    /// First visible match, if any
    async fn first_visible(&self, selector: &Selector) -> Result<Option<ElementRef>> {
        Ok(self.find_all(selector).await?.into_iter().find(|e| e.visible))
    }
}

/// Opens fresh sessions; one per test case
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>>;

    /// Tear down anything shared between sessions
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
