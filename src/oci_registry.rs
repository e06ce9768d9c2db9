use crate::canonical::{DEFAULT_REGISTRY, split_canonical};
use crate::config::Config;
use crate::credentials::RegistryCredentials;
use crate::resource::ErrorClass;
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, LINK, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

static DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
static PAGE_SIZE: &str = "1000";
static CHALLENGE_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)="([^"]*)""#).expect("valid challenge parameter regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("repository {0} not found")]
    NotFound(String),
    #[error("not authorized to list tags of {0}")]
    Unauthorized(String),
    #[error("rate limited while listing tags of {0}")]
    RateLimited(String),
    #[error("registry unreachable: {0}")]
    Unreachable(String),
    #[error("scan timed out after {0:?}")]
    Timeout(Duration),
}

impl RegistryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RegistryError::NotFound(_) => ErrorClass::NotFound,
            RegistryError::Unauthorized(_) => ErrorClass::Unauthorized,
            RegistryError::RateLimited(_) => ErrorClass::RateLimited,
            RegistryError::Unreachable(_) => ErrorClass::Unreachable,
            RegistryError::Timeout(_) => ErrorClass::Timeout,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class().is_transient()
    }
}

/// Lists the tags of a repository identified by its canonical name.
#[async_trait]
pub trait TagLister: Send + Sync {
    async fn list_tags(
        &self,
        canonical_name: &str,
        credentials: Option<&RegistryCredentials>,
        timeout: Duration,
    ) -> Result<Vec<String>, RegistryError>;
}

pub fn create_client(config: &Config) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Tag listing over the OCI distribution API (`/v2/<name>/tags/list`).
#[derive(Debug, Clone)]
pub struct OciRegistryClient {
    http: Client,
    scheme: &'static str,
}

impl OciRegistryClient {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            scheme: "https",
        }
    }

    #[cfg(test)]
    pub(crate) fn insecure(http: Client) -> Self {
        Self {
            http,
            scheme: "http",
        }
    }

    async fn fetch_page(
        &self,
        url: &str,
        canonical_name: &str,
        credentials: Option<&RegistryCredentials>,
        timeout: Duration,
        bearer: &mut Option<String>,
    ) -> Result<Response, RegistryError> {
        loop {
            debug!("Fetching tag list from URL {}", url);
            let request = self
                .http
                .get(url)
                .header(ACCEPT, "application/json")
                .timeout(timeout);
            let request = match bearer.as_deref() {
                Some(token) => request.bearer_auth(token),
                None => authorize(request, credentials),
            };
            let response = request
                .send()
                .await
                .map_err(|e| transport_error(e, timeout))?;

            if response.status() == StatusCode::UNAUTHORIZED && bearer.is_none() {
                if let Some(challenge) = bearer_challenge(&response) {
                    *bearer = Some(
                        self.fetch_token(&challenge, canonical_name, credentials, timeout)
                            .await?,
                    );
                    continue;
                }
            }

            if !response.status().is_success() {
                return Err(classify_status(response.status(), canonical_name));
            }
            return Ok(response);
        }
    }

    async fn fetch_token(
        &self,
        challenge: &HashMap<String, String>,
        canonical_name: &str,
        credentials: Option<&RegistryCredentials>,
        timeout: Duration,
    ) -> Result<String, RegistryError> {
        let realm = challenge
            .get("realm")
            .ok_or_else(|| RegistryError::Unauthorized(canonical_name.to_string()))?;
        let query: Vec<(&str, &str)> = ["service", "scope"]
            .into_iter()
            .filter_map(|key| challenge.get(key).map(|value| (key, value.as_str())))
            .collect();

        debug!("Requesting registry token from {}", realm);
        let request = self.http.get(realm).query(&query).timeout(timeout);
        let response = match credentials {
            Some(RegistryCredentials {
                username: Some(username),
                token,
            }) => request.basic_auth(username, Some(token.expose_secret())),
            _ => request,
        }
        .send()
        .await
        .map_err(|e| transport_error(e, timeout))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status(), canonical_name));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RegistryError::Unauthorized(canonical_name.to_string()))
    }
}

#[async_trait]
impl TagLister for OciRegistryClient {
    async fn list_tags(
        &self,
        canonical_name: &str,
        credentials: Option<&RegistryCredentials>,
        timeout: Duration,
    ) -> Result<Vec<String>, RegistryError> {
        let (host, repository) = split_canonical(canonical_name)
            .ok_or_else(|| RegistryError::NotFound(canonical_name.to_string()))?;
        let api_host = if host == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            host
        };

        let mut url = format!(
            "{}://{}/v2/{}/tags/list?n={}",
            self.scheme, api_host, repository, PAGE_SIZE
        );
        let mut tags = Vec::new();
        // A token from the first challenge is reused for every later page
        let mut bearer = None;
        loop {
            let response = self
                .fetch_page(&url, canonical_name, credentials, timeout, &mut bearer)
                .await?;
            let next = next_page(&response);
            let page: TagList = response
                .json()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = next,
                None => break,
            }
        }

        info!("Listed {} tags for {}", tags.len(), canonical_name);
        Ok(tags)
    }
}

fn authorize(request: RequestBuilder, credentials: Option<&RegistryCredentials>) -> RequestBuilder {
    match credentials {
        Some(RegistryCredentials {
            username: Some(username),
            token,
        }) => request.basic_auth(username, Some(token.expose_secret())),
        Some(RegistryCredentials {
            username: None,
            token,
        }) if !token.is_empty() => request.bearer_auth(token.expose_secret()),
        _ => request,
    }
}

fn classify_status(status: StatusCode, canonical_name: &str) -> RegistryError {
    match status {
        StatusCode::NOT_FOUND => RegistryError::NotFound(canonical_name.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RegistryError::Unauthorized(canonical_name.to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => RegistryError::RateLimited(canonical_name.to_string()),
        other => RegistryError::Unreachable(format!(
            "registry returned status {} for {}",
            other, canonical_name
        )),
    }
}

fn transport_error(error: reqwest::Error, timeout: Duration) -> RegistryError {
    if error.is_timeout() {
        RegistryError::Timeout(timeout)
    } else {
        RegistryError::Unreachable(error.to_string())
    }
}

/// Parses `Bearer realm="...",service="...",scope="..."`.
fn bearer_challenge(response: &Response) -> Option<HashMap<String, String>> {
    let header = response.headers().get(WWW_AUTHENTICATE)?.to_str().ok()?;
    let params = header.strip_prefix("Bearer ")?;
    let challenge: HashMap<String, String> = CHALLENGE_PARAM
        .captures_iter(params)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect();
    (!challenge.is_empty()).then_some(challenge)
}

/// Resolves `Link: </v2/...?last=x>; rel="next"` against the current URL.
fn next_page(response: &Response) -> Option<String> {
    let header = response.headers().get(LINK)?.to_str().ok()?;
    let target = header
        .split(',')
        .find(|link| link.contains("rel=\"next\""))?
        .split(';')
        .next()?
        .trim()
        .strip_prefix('<')?
        .strip_suffix('>')?;
    let base: &Url = response.url();
    base.join(target).ok().map(String::from)
}
