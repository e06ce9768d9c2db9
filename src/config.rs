use crate::credentials::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub static DEFAULT_CONFIG_PATH: &str = "/etc/image-repository-controller/config.yaml";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub registries: Vec<Registry>,
    #[serde(default)]
    pub tls: Tls,
    #[serde(default)]
    pub scan: Scan,
    #[serde(default = "default_cache_sweep_schedule")]
    pub cache_sweep_schedule: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Hostname or glob pattern such as `*.azurecr.io`
    pub hostname: String,
    /// Name an `ImageRepository` can select through `spec.secretRef`
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub token: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scan {
    /// Used when a resource does not set `scanInterval`
    #[serde(default = "default_interval", deserialize_with = "crate::duration::deserialize")]
    pub default_interval: Duration,
    #[serde(default = "default_timeout", deserialize_with = "crate::duration::deserialize")]
    pub default_timeout: Duration,
    /// First retry delay after a transient failure
    #[serde(default = "default_backoff_base", deserialize_with = "crate::duration::deserialize")]
    pub backoff_base: Duration,
    /// Hard limit for one reconciliation including the status write
    #[serde(
        default = "default_reconcile_deadline",
        deserialize_with = "crate::duration::deserialize"
    )]
    pub reconcile_deadline: Duration,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            default_interval: default_interval(),
            default_timeout: default_timeout(),
            backoff_base: default_backoff_base(),
            reconcile_deadline: default_reconcile_deadline(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(5)
}

fn default_reconcile_deadline() -> Duration {
    Duration::from_secs(120)
}

fn default_cache_sweep_schedule() -> String {
    "0 */5 * * * *".to_string()
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let (Some(placeholder), Some(var_name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = env::var(var_name.as_str())
            .with_context(|| format!("Missing environment variable: {}", var_name.as_str()))?;
        result.push_str(&input[last..placeholder.start()]);
        result.push_str(&value);
        last = placeholder.end();
    }
    result.push_str(&input[last..]);

    Ok(result)
}
