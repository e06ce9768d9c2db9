use crate::config::Registry;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token or password that never shows up in logs; Debug and Display print
/// `<REDACTED, length N>`.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        SecretString(s.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub token: SecretString,
}

#[derive(Debug)]
struct CredentialEntry {
    name: Option<String>,
    matcher: GlobMatcher,
    credentials: RegistryCredentials,
}

/// Picks the configured credentials for a registry host.
#[derive(Debug, Default)]
pub struct CredentialResolver {
    entries: Vec<CredentialEntry>,
}

impl CredentialResolver {
    pub fn from_config(registries: &[Registry]) -> Result<Self, globset::Error> {
        let entries = registries
            .iter()
            .map(|registry| {
                Ok(CredentialEntry {
                    name: registry.name.clone(),
                    matcher: Glob::new(&registry.hostname.to_lowercase())?.compile_matcher(),
                    credentials: RegistryCredentials {
                        username: registry.username.clone(),
                        token: registry.token.clone(),
                    },
                })
            })
            .collect::<Result<Vec<_>, globset::Error>>()?;
        Ok(Self { entries })
    }

    /// A named secret reference selects its entry directly, otherwise the
    /// first entry whose hostname pattern matches `host` is used.
    pub fn resolve(&self, host: &str, secret_ref: Option<&str>) -> Option<&RegistryCredentials> {
        let entry = match secret_ref {
            Some(name) => self
                .entries
                .iter()
                .find(|e| e.name.as_deref() == Some(name)),
            None => {
                let host = host.to_lowercase();
                self.entries.iter().find(|e| e.matcher.is_match(&host))
            }
        };
        entry.map(|e| &e.credentials)
    }
}
