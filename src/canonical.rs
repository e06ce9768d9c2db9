use std::fmt;
use thiserror::Error;

pub static DEFAULT_REGISTRY: &str = "index.docker.io";
static DEFAULT_NAMESPACE: &str = "library";
static DOCKER_HUB_ALIASES: [&str; 3] = ["docker.io", "index.docker.io", "registry-1.docker.io"];
static MAX_NAME_LENGTH: usize = 255;
static MAX_TAG_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },
}

impl CanonicalError {
    fn invalid(reference: &str, reason: impl Into<String>) -> Self {
        CanonicalError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}

/// A parsed image reference with the defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, CanonicalError> {
        if s.is_empty() {
            return Err(CanonicalError::invalid(s, "reference is empty"));
        }

        let (name_and_tag, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|reason| CanonicalError::invalid(s, reason))?;
                (name, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon after the last slash separates the tag, anything earlier is a port
        let last_slash = name_and_tag.rfind('/');
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                let tag = &name_and_tag[pos + 1..];
                validate_tag(tag).map_err(|reason| CanonicalError::invalid(s, reason))?;
                (&name_and_tag[..pos], Some(tag.to_string()))
            }
            _ => (name_and_tag, None),
        };

        let name = name.to_lowercase();
        if name.is_empty() {
            return Err(CanonicalError::invalid(s, "repository name is empty"));
        }

        let (registry, path) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => {
                validate_host(first).map_err(|reason| CanonicalError::invalid(s, reason))?;
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.clone()),
        };
        let registry = if DOCKER_HUB_ALIASES.contains(&registry.as_str()) {
            DEFAULT_REGISTRY.to_string()
        } else {
            registry
        };

        for component in path.split('/') {
            if !is_valid_path_component(component) {
                return Err(CanonicalError::invalid(
                    s,
                    format!("invalid repository path component {:?}", component),
                ));
            }
        }

        let repository = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("{}/{}", DEFAULT_NAMESPACE, path)
        } else {
            path
        };

        if registry.len() + 1 + repository.len() > MAX_NAME_LENGTH {
            return Err(CanonicalError::invalid(
                s,
                format!("repository name exceeds {} characters", MAX_NAME_LENGTH),
            ));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host and repository path, without tag or digest.
    pub fn canonical_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

/// Maps a user supplied reference such as `alpine` or `quay.io/org/app:v1` to
/// the fully-qualified repository name it denotes.
pub fn canonicalize(reference: &str) -> Result<String, CanonicalError> {
    ImageReference::parse(reference).map(|r| r.canonical_name())
}

/// Splits a canonical name into its registry host and repository path.
pub fn split_canonical(canonical_name: &str) -> Option<(&str, &str)> {
    canonical_name
        .split_once('/')
        .filter(|(host, path)| !host.is_empty() && !path.is_empty())
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn validate_host(host: &str) -> Result<(), String> {
    let (hostname, port) = match host.rsplit_once(':') {
        Some((hostname, port)) => (hostname, Some(port)),
        None => (host, None),
    };

    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) || port.parse::<u16>().is_err() {
            return Err(format!("malformed port in registry host {:?}", host));
        }
    }

    let valid_label = |label: &str| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if hostname.is_empty() || !hostname.split('.').all(valid_label) {
        return Err(format!("malformed registry host {:?}", host));
    }
    Ok(())
}

// [a-z0-9]+ separated by '.', '_', '__' or any run of '-'
fn is_valid_path_component(component: &str) -> bool {
    let starts_alphanumeric = component
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !starts_alphanumeric {
        return false;
    }

    let mut separator = String::new();
    for c in component.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if !separator.is_empty() {
                let allowed = matches!(separator.as_str(), "." | "_" | "__")
                    || separator.chars().all(|s| s == '-');
                if !allowed {
                    return false;
                }
                separator.clear();
            }
        } else if matches!(c, '.' | '_' | '-') {
            separator.push(c);
        } else {
            return false;
        }
    }
    separator.is_empty()
}

fn validate_tag(tag: &str) -> Result<(), String> {
    let mut chars = tag.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid_first || !valid_rest || tag.len() > MAX_TAG_LENGTH {
        return Err(format!("invalid tag {:?}", tag));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<(), String> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(format!("digest {:?} is missing an algorithm", digest));
    };
    let valid_algorithm = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'));
    let valid_hex = hex.len() >= 32 && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !valid_algorithm || !valid_hex {
        return Err(format!("invalid digest {:?}", digest));
    }
    Ok(())
}
