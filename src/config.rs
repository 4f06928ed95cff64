use crate::license::DEFAULT_API_ENDPOINT;
use crate::readiness::{ADMIN_CONSOLE_LABEL, WorkloadSelector};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

pub static API_ENDPOINT_ENV: &str = "REPLICATED_API_ENDPOINT";
const DEFAULT_READINESS_TIMEOUT_SECONDS: u64 = 120;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub webserver: Webserver,
    #[serde(default)]
    pub license: License,
    #[serde(default)]
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
}

impl Default for License {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
        }
    }
}

fn default_api_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}

/// Which workload counts as the admin console and how long to wait for it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    /// Falls back to the namespace of the Kubernetes client when unset.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_label_selector")]
    pub label_selector: String,
    #[serde(default)]
    pub container_index: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: default_label_selector(),
            container_index: 0,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Readiness {
    pub fn selector(&self, default_namespace: &str) -> WorkloadSelector {
        WorkloadSelector::new(
            self.namespace.as_deref().unwrap_or(default_namespace),
            self.label_selector.clone(),
            self.container_index,
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_label_selector() -> String {
    ADMIN_CONSOLE_LABEL.to_string()
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_READINESS_TIMEOUT_SECONDS
}

impl Config {
    /// Environment variables that take precedence over the file.
    /// An empty `REPLICATED_API_ENDPOINT` is ignored.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_endpoint) = lookup(API_ENDPOINT_ENV).filter(|v| !v.is_empty()) {
            info!(
                "Using licensing API endpoint {} from {}",
                api_endpoint, API_ENDPOINT_ENV
            );
            self.license.api_endpoint = api_endpoint;
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let mut config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.apply_overrides(|name| env::var(name).ok());

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variable values.
/// Every unset variable is reported in the returned error.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
