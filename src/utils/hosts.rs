//! Which hosts a run may navigate to
//!
//! The application under test and its own subdomains are always allowed,
//! plus the federated identity providers named in [`RunConfig::allowed_hosts`].

use url::Url;

use super::config::RunConfig;

/// Identity-provider domains a login may pass through
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "nih.gov",
    "authtest.nih.gov",
    "stsstg.nih.gov",
    "login.gov",
    "identitysandbox.gov",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPolicy {
    base_host: Option<String>,
    suffixes: Vec<String>,
}

impl HostPolicy {
    pub fn new(base_url: Option<&str>, suffixes: &[String]) -> Self {
        let base_host = base_url
            .and_then(|url| Url::parse(url).ok())
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase));
        Self {
            base_host,
            suffixes: suffixes
                .iter()
                .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.base_url.as_deref(), &config.allowed_hosts)
    }

    /// Whether a page at `url` may be visited.
    ///
    /// Without a base URL there is nothing to anchor the policy, so every
    /// host passes. URLs without a host (relative, `about:blank`, `data:`)
    /// always pass.
    pub fn allows(&self, url: &str) -> bool {
        let Some(base) = self.base_host.as_deref() else {
            return true;
        };
        let host = match Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
                _ => return true,
            },
            Err(_) => return true,
        };

        host_matches(&host, base) || self.suffixes.iter().any(|suffix| host_matches(&host, suffix))
    }
}

/// `host` is `domain` or one of its subdomains
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}
