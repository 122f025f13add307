//! Compose-manifest parsing.
//!
//! Accepts any YAML document whose top level is a mapping with a `services`
//! mapping. Parsing is a tagged decision (compose shape vs anything else),
//! never permissive: unrecognized shapes fail with `ConfigInvalid` instead of
//! silently producing an empty configuration.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

use crate::error::{Result, SandboxError};

/// Top-level vendor-extension key carrying provider-specific policy.
pub const EXTENSION_KEY: &str = "x-sandpit";

/// Default overall container timeout: 24 hours.
pub const DEFAULT_TIMEOUT_SECS: u64 = 86_400;

/// One named service definition from the manifest.
///
/// Only the fields the sandbox understands are modeled; everything else in
/// the service mapping is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceDef {
    /// Registry image reference. Mutually optional with `build`; at least
    /// one must be present.
    pub image: Option<String>,

    /// Build context, either a string shorthand or a detailed mapping.
    pub build: Option<BuildDef>,

    /// Working directory inside the container.
    pub working_dir: Option<String>,

    /// Environment variables, mapping or `KEY=value` list form.
    #[serde(default)]
    pub environment: Option<EnvDef>,

    /// Memory limit string, e.g. "1g" or "512m".
    pub mem_limit: Option<String>,

    /// CPU count, e.g. 2.0.
    pub cpus: Option<f64>,
}

impl ServiceDef {
    /// Synthesizes a definition for a bare registry image.
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Self::default()
        }
    }

    /// Synthesizes a definition for a bare Dockerfile.
    pub fn from_dockerfile(context: impl Into<String>, dockerfile: impl Into<String>) -> Self {
        Self {
            build: Some(BuildDef::Detailed {
                context: Some(context.into()),
                dockerfile: Some(dockerfile.into()),
            }),
            ..Self::default()
        }
    }

    /// Normalizes the environment field into a unique-key mapping.
    pub fn env_map(&self) -> Result<BTreeMap<String, String>> {
        match &self.environment {
            None => Ok(BTreeMap::new()),
            Some(env) => env.normalized(),
        }
    }
}

/// Build reference: `build: ./dir` shorthand or `build: {context, dockerfile}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BuildDef {
    /// String shorthand: the context directory, with `Dockerfile` inside it.
    Context(String),
    /// Detailed form with optional context and dockerfile paths.
    Detailed {
        context: Option<String>,
        dockerfile: Option<String>,
    },
}

impl BuildDef {
    /// Context directory, defaulting to the compose file's directory.
    pub fn context(&self) -> &str {
        match self {
            Self::Context(dir) => dir,
            Self::Detailed { context, .. } => context.as_deref().unwrap_or("."),
        }
    }

    /// Dockerfile path relative to the context.
    pub fn dockerfile(&self) -> &str {
        match self {
            Self::Context(_) => "Dockerfile",
            Self::Detailed { dockerfile, .. } => dockerfile.as_deref().unwrap_or("Dockerfile"),
        }
    }
}

/// Environment variables in either compose form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvDef {
    /// Mapping form: `KEY: value`. Null values are dropped.
    Map(BTreeMap<String, Option<serde_yaml::Value>>),
    /// List form: `- KEY=value`. Entries without `=` are dropped.
    List(Vec<String>),
}

impl EnvDef {
    /// Flattens into a string-to-string mapping with unique keys.
    pub fn normalized(&self) -> Result<BTreeMap<String, String>> {
        match self {
            Self::Map(map) => {
                let mut out = BTreeMap::new();
                for (key, value) in map {
                    let Some(value) = value else { continue };
                    out.insert(key.clone(), scalar_to_string(key, value)?);
                }
                Ok(out)
            }
            Self::List(entries) => Ok(entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect()),
        }
    }
}

fn scalar_to_string(key: &str, value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        _ => Err(SandboxError::config_invalid(format!(
            "environment value for '{key}' must be a scalar"
        ))),
    }
}

/// Instance-global provider policy from the vendor-extension key.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxOptions {
    /// Overall container lifetime in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Idle eviction in seconds; unset means no idle eviction.
    #[serde(default)]
    pub idle_timeout: Option<u64>,

    /// Deny all egress regardless of the allowlist.
    #[serde(default)]
    pub block_network: bool,

    /// CIDR ranges egress is restricted to; empty means allow all
    /// (only meaningful when the network is not blocked).
    #[serde(default)]
    pub cidr_allowlist: Vec<String>,

    /// Provider cloud affinity.
    #[serde(default)]
    pub cloud: Option<String>,

    /// Provider region affinity.
    #[serde(default)]
    pub region: Option<String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            idle_timeout: None,
            block_network: false,
            cidr_allowlist: Vec::new(),
            cloud: None,
            region: None,
        }
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl SandboxOptions {
    /// Validates cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.timeout == 0 {
            return Err(SandboxError::config_invalid("timeout must be positive"));
        }
        if let Some(idle) = self.idle_timeout {
            if idle > self.timeout {
                return Err(SandboxError::config_invalid(format!(
                    "idle_timeout ({idle}s) must not exceed timeout ({}s)",
                    self.timeout
                )));
            }
        }
        Ok(())
    }
}

/// A parsed manifest: ordered services plus instance-global options.
#[derive(Debug, Clone)]
pub struct ComposeManifest {
    /// Services in manifest order, names unique.
    pub services: Vec<(String, ServiceDef)>,
    /// Options from the vendor-extension key, defaulted when absent.
    pub options: SandboxOptions,
}

/// Parses manifest text into the compose shape.
pub fn parse_manifest(text: &str) -> Result<ComposeManifest> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| SandboxError::config_invalid(format!("not valid YAML: {e}")))?;

    let serde_yaml::Value::Mapping(root) = doc else {
        return Err(SandboxError::config_invalid(
            "top level must be a mapping with a 'services' key",
        ));
    };

    let Some(serde_yaml::Value::Mapping(services_map)) = root.get("services") else {
        return Err(SandboxError::config_invalid(
            "missing or non-mapping 'services' key",
        ));
    };

    let mut services = Vec::with_capacity(services_map.len());
    let mut seen = HashSet::new();
    for (key, value) in services_map {
        let Some(name) = key.as_str() else {
            return Err(SandboxError::config_invalid(
                "service names must be strings",
            ));
        };
        if !seen.insert(name.to_string()) {
            return Err(SandboxError::config_invalid(format!(
                "duplicate service name '{name}'"
            )));
        }
        let def: ServiceDef = serde_yaml::from_value(value.clone()).map_err(|e| {
            SandboxError::config_invalid(format!("service '{name}' is malformed: {e}"))
        })?;
        if def.image.is_none() && def.build.is_none() {
            return Err(SandboxError::config_invalid(format!(
                "service '{name}' must specify 'image' or 'build'"
            )));
        }
        services.push((name.to_string(), def));
    }

    if services.is_empty() {
        return Err(SandboxError::config_invalid(
            "'services' must declare at least one service",
        ));
    }

    let options = match root.get(EXTENSION_KEY) {
        Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| {
            SandboxError::config_invalid(format!("'{EXTENSION_KEY}' is malformed: {e}"))
        })?,
        None => SandboxOptions::default(),
    };
    options.validate()?;

    Ok(ComposeManifest { services, options })
}
