use serde::{Deserialize, Serialize};
use std::fmt;

fn default_username_env() -> String {
    "LOGIN_USERNAME".to_string()
}

fn default_password_env() -> String {
    "LOGIN_PASSWORD".to_string()
}

fn default_totp_env() -> String {
    "TOTP_SECRET".to_string()
}

fn default_true() -> bool {
    true
}

fn default_root() -> String {
    "/".to_string()
}

/// Where a step points: a selector string or a structured locator object.
///
/// Strings may be CSS, `text=...`, `role=...`, `data-testid=...`, or a bare
/// slug such as `save-button`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Target {
    Plain(String),
    Structured(StructuredTarget),
}

/// `{"data-testid": ..}`, `{"role": .., "name": ..}`, `{"type": .., "value": ..}`, `{"css": ..}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StructuredTarget {
    #[serde(default, rename = "data-testid", alias = "testid", skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,
    /// `text`, `css` or `testid`, qualifying `value`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl StructuredTarget {
    /// Fold `{type, value}` into the matching field
    pub fn normalized(&self) -> StructuredTarget {
        let mut target = self.clone();
        if target.text.is_none() && target.css.is_none() && target.test_id.is_none() {
            if let (Some(kind), Some(value)) = (self.kind.as_deref(), self.value.as_ref()) {
                match kind.to_ascii_lowercase().as_str() {
                    "text" => target.text = Some(value.clone()),
                    "css" => target.css = Some(value.clone()),
                    "testid" | "data-testid" => target.test_id = Some(value.clone()),
                    _ => {}
                }
            }
        }
        target
    }

    fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        blank(&self.test_id) && blank(&self.role) && blank(&self.text) && blank(&self.css) && blank(&self.value)
    }
}

impl Target {
    pub fn plain(selector: &str) -> Self {
        Target::Plain(selector.to_string())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Target::Plain(s) => s.trim().is_empty(),
            Target::Structured(t) => t.is_empty(),
        }
    }
}

impl From<&str> for Target {
    fn from(selector: &str) -> Self {
        Target::plain(selector)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = match self {
            Target::Plain(s) => return write!(f, "{}", s),
            Target::Structured(t) => t.normalized(),
        };
        if let Some(id) = &t.test_id {
            write!(f, "data-testid={}", id)
        } else if let Some(role) = &t.role {
            match t.name.as_ref().or(t.value.as_ref()).or(t.text.as_ref()) {
                Some(name) => write!(f, "role={}[name=\"{}\"]", role, name),
                None => write!(f, "role={}", role),
            }
        } else if let Some(text) = t.text.as_ref() {
            write!(f, "text=\"{}\"", text)
        } else if let Some(css) = &t.css {
            write!(f, "{}", css)
        } else {
            write!(f, "text=\"{}\"", t.value.as_deref().unwrap_or(""))
        }
    }
}

/// One atomic browser instruction, as emitted by the test-case generator.
///
/// Known kinds deserialize strictly (unknown fields are rejected). Kinds the
/// runner does not recognise are kept as [`Step::Unknown`] by the parser so
/// they can be reported per step instead of silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    #[serde(alias = "navigate_to")]
    Navigate {
        #[serde(default = "default_root", alias = "target")]
        url: String,
        #[serde(default)]
        timeout: Option<u64>,
    },

    Click {
        #[serde(default, alias = "target")]
        selector: Option<Target>,
        /// Visible-text fallback when the selector matches nothing
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },

    ClickText {
        text: String,
        #[serde(default)]
        exact: bool,
        #[serde(default)]
        timeout: Option<u64>,
    },

    Fill {
        #[serde(alias = "target")]
        selector: Target,
        value: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },

    FillEnv {
        #[serde(alias = "target")]
        selector: Target,
        env: String,
        #[serde(default)]
        timeout: Option<u64>,
    },

    FillTotp {
        #[serde(alias = "target")]
        selector: Target,
        #[serde(default)]
        env: Option<String>,
        #[serde(default)]
        secret: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },

    LoginViaLoginGov {
        #[serde(default = "default_username_env")]
        username_env: String,
        #[serde(default = "default_password_env")]
        password_env: String,
        #[serde(default = "default_totp_env")]
        totp_env: String,
        /// Start page, defaults to the run's base URL
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },

    WaitFor {
        #[serde(default, alias = "target")]
        selector: Option<Target>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },

    WaitForUrlContains {
        #[serde(alias = "value", alias = "target")]
        url_fragment: String,
        #[serde(default)]
        timeout: Option<u64>,
    },

    /// Visible text on the page, or the text of one element. With only a
    /// target, the element just has to be visible.
    #[serde(alias = "assert_text_present", alias = "assert_visible")]
    AssertText {
        #[serde(default, alias = "target")]
        selector: Option<Target>,
        #[serde(default, alias = "text")]
        expected: Option<String>,
        #[serde(default)]
        exact: bool,
        #[serde(default)]
        timeout: Option<u64>,
    },

    #[serde(
        alias = "assert_element_present",
        alias = "assert_element_presence",
        alias = "assert_element_exists",
        alias = "assert_element_visible",
        alias = "assert"
    )]
    AssertElement {
        #[serde(alias = "target")]
        selector: Target,
        #[serde(default = "default_true", alias = "exists", alias = "existence")]
        present: bool,
        /// Require a visible match rather than one anywhere in the DOM
        #[serde(default)]
        visible: bool,
        #[serde(default)]
        timeout: Option<u64>,
    },

    #[serde(alias = "assert_url_matches")]
    AssertUrlContains {
        #[serde(alias = "value", alias = "target")]
        url_fragment: String,
    },

    Screenshot {
        #[serde(default, alias = "name")]
        label: Option<String>,
    },

    /// Action kind not understood by this runner
    #[serde(skip_deserializing)]
    Unknown { name: String },
}

impl Step {
    /// Every action name the parser accepts
    pub const KNOWN_ACTIONS: &'static [&'static str] = &[
        "navigate",
        "navigate_to",
        "click",
        "click_text",
        "fill",
        "fill_env",
        "fill_totp",
        "login_via_login_gov",
        "wait_for",
        "wait_for_url_contains",
        "assert_text",
        "assert_text_present",
        "assert_visible",
        "assert_element",
        "assert_element_present",
        "assert_element_presence",
        "assert_element_exists",
        "assert_element_visible",
        "assert",
        "assert_url_contains",
        "assert_url_matches",
        "screenshot",
    ];

    /// Aliases that default `visible` to true on element assertions
    pub const VISIBILITY_ACTIONS: &'static [&'static str] = &["assert_element_visible", "assert"];

    /// Action name as written in results
    pub fn action_name(&self) -> &str {
        match self {
            Step::Navigate { .. } => "navigate",
            Step::Click { .. } => "click",
            Step::ClickText { .. } => "click_text",
            Step::Fill { .. } => "fill",
            Step::FillEnv { .. } => "fill_env",
            Step::FillTotp { .. } => "fill_totp",
            Step::LoginViaLoginGov { .. } => "login_via_login_gov",
            Step::WaitFor { .. } => "wait_for",
            Step::WaitForUrlContains { .. } => "wait_for_url_contains",
            Step::AssertText { .. } => "assert_text",
            Step::AssertElement { .. } => "assert_element",
            Step::AssertUrlContains { .. } => "assert_url_contains",
            Step::Screenshot { .. } => "screenshot",
            Step::Unknown { name } => name,
        }
    }

    /// Explicit per-step timeout in milliseconds
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Step::Navigate { timeout, .. }
            | Step::Click { timeout, .. }
            | Step::ClickText { timeout, .. }
            | Step::Fill { timeout, .. }
            | Step::FillEnv { timeout, .. }
            | Step::FillTotp { timeout, .. }
            | Step::LoginViaLoginGov { timeout, .. }
            | Step::WaitFor { timeout, .. }
            | Step::WaitForUrlContains { timeout, .. }
            | Step::AssertText { timeout, .. }
            | Step::AssertElement { timeout, .. } => *timeout,
            Step::AssertUrlContains { .. } | Step::Screenshot { .. } | Step::Unknown { .. } => None,
        }
    }

    /// Short human-readable form for console output
    pub fn display_name(&self) -> String {
        match self {
            Step::Navigate { url, .. } => format!("navigate {}", url),
            Step::Click { selector, text, .. } => format!("click {}", label_of(selector, text)),
            Step::ClickText { text, .. } => format!("click_text \"{}\"", text),
            Step::Fill { selector, .. } => format!("fill {}", selector),
            Step::FillEnv { selector, env, .. } => format!("fill_env {} <- ${}", selector, env),
            Step::FillTotp { selector, .. } => format!("fill_totp {}", selector),
            Step::LoginViaLoginGov { .. } => "login_via_login_gov".to_string(),
            Step::WaitFor { selector, text, .. } => format!("wait_for {}", label_of(selector, text)),
            Step::WaitForUrlContains { url_fragment, .. } => {
                format!("wait_for_url_contains \"{}\"", url_fragment)
            }
            Step::AssertText {
                selector: Some(selector),
                expected: None,
                ..
            } => format!("assert_visible {}", selector),
            Step::AssertText { expected, .. } => {
                format!("assert_text \"{}\"", expected.as_deref().unwrap_or(""))
            }
            Step::AssertElement {
                selector, present, ..
            } => {
                if *present {
                    format!("assert_element {}", selector)
                } else {
                    format!("assert_element !{}", selector)
                }
            }
            Step::AssertUrlContains { url_fragment } => {
                format!("assert_url_contains \"{}\"", url_fragment)
            }
            Step::Screenshot { label } => {
                format!("screenshot {}", label.as_deref().unwrap_or(""))
                    .trim_end()
                    .to_string()
            }
            Step::Unknown { name } => format!("{} (unknown)", name),
        }
    }
}

fn label_of(selector: &Option<Target>, text: &Option<String>) -> String {
    match (selector, text) {
        (Some(selector), _) => selector.to_string(),
        (None, Some(text)) => text.clone(),
        (None, None) => "?".to_string(),
    }
}

/// A named scenario: an ordered list of steps run in one browser session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub steps: Vec<Step>,
}
