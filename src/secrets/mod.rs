pub mod totp;

use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

use crate::runner::error::ActionError;

pub use totp::{current_totp, Clock, FixedClock, SystemClock};

/// Where a secret comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SecretSpec {
    /// Named variable looked up through the provider
    Env(String),
    /// Value written inline in the step
    Literal(String),
}

impl SecretSpec {
    /// Build from a step's `env` / `secret` fields. An inline literal wins
    /// over `env`; blank values count as absent.
    pub fn from_fields(env: Option<&str>, secret: Option<&str>) -> Option<Self> {
        fn present(v: Option<&str>) -> Option<&str> {
            v.filter(|s| !s.trim().is_empty())
        }
        match (present(env), present(secret)) {
            (_, Some(literal)) => Some(SecretSpec::Literal(literal.to_string())),
            (Some(name), None) => Some(SecretSpec::Env(name.to_string())),
            (None, None) => None,
        }
    }

    /// Label safe to put in logs and step messages
    pub fn describe(&self) -> String {
        match self {
            SecretSpec::Env(name) => format!("env:{}", name),
            SecretSpec::Literal(_) => "inline secret".to_string(),
        }
    }
}

/// Lookup of named credentials
pub trait SecretProvider: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed name/value map
#[derive(Debug, Default, Clone)]
pub struct StaticSecretProvider {
    values: HashMap<String, String>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

impl SecretProvider for StaticSecretProvider {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Resolves secret specs for one test case, caching env lookups
pub struct SecretResolver {
    provider: Arc<dyn SecretProvider>,
    cache: HashMap<String, String>,
}

impl SecretResolver {
    pub fn new(provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, spec: &SecretSpec) -> Result<String, ActionError> {
        match spec {
            SecretSpec::Literal(value) => {
                warn!("Using an inline secret from the test case; prefer an env variable");
                Ok(value.clone())
            }
            SecretSpec::Env(name) => self.resolve_env(name),
        }
    }

    /// Resolve several env names at once, reporting every missing one
    pub fn resolve_all(&mut self, names: &[&str]) -> Result<Vec<String>, ActionError> {
        let mut values = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match self.resolve_env(name) {
                Ok(v) => values.push(v),
                Err(_) => missing.push(name.to_string()),
            }
        }
        if missing.is_empty() {
            Ok(values)
        } else {
            Err(ActionError::MissingSecret { names: missing })
        }
    }

    fn resolve_env(&mut self, name: &str) -> Result<String, ActionError> {
        if let Some(v) = self.cache.get(name) {
            return Ok(v.clone());
        }
        // Empty counts as unset
        let value = self
            .provider
            .get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ActionError::missing(name))?;
        self.cache.insert(name.to_string(), value.clone());
        Ok(value)
    }
}
