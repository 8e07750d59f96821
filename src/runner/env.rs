//! Scrubbed environment for toolchain processes.

use std::collections::BTreeMap;

use crate::config::SandboxConfig;

/// Variables pinned for every invocation, applied after the passthrough.
const PINNED: &[(&str, &str)] = &[
    ("GOTOOLCHAIN", "local"),
    ("GOWORK", "off"),
    ("CGO_ENABLED", "0"),
    ("GOFLAGS", ""),
];

/// Variables pinned when network access is disallowed.
const OFFLINE: &[(&str, &str)] = &[("GOPROXY", "off"), ("GOSUMDB", "off")];

/// The complete environment handed to a toolchain process.
///
/// The child starts from an empty environment, so nothing outside this set
/// reaches it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxEnv {
    vars: BTreeMap<String, String>,
}

impl SandboxEnv {
    /// Builds the environment from the configuration and the host environment.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::build(config, |key| std::env::var(key).ok())
    }

    /// Builds the environment using `lookup` to read host variables.
    pub fn build(config: &SandboxConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut vars = BTreeMap::new();

        for key in &config.env_passthrough {
            if let Some(value) = lookup(key) {
                vars.insert(key.clone(), value);
            }
        }

        for (key, value) in PINNED {
            vars.insert((*key).to_string(), (*value).to_string());
        }

        if !config.allow_network {
            for (key, value) in OFFLINE {
                vars.insert((*key).to_string(), (*value).to_string());
            }
        }

        for (key, value) in &config.extra_env {
            vars.insert(key.clone(), value.clone());
        }

        Self { vars }
    }

    /// Returns the value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterates over all variables in key order.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
