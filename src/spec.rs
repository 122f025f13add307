//! Provider-agnostic container specifications.
//!
//! [`build_specs`] expands a [`ResolvedSpec`] into one [`ContainerSpec`] per
//! declared service, preserving manifest order, normalizing resource strings,
//! and computing the effective network policy.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ResolvedSpec;
use crate::error::{Result, SandboxError};

/// Network access policy for a sandbox container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// Unrestricted egress.
    #[default]
    AllowAll,
    /// Egress restricted to the given CIDR ranges.
    Allowlist(Vec<String>),
    /// No egress at all.
    Deny,
}

impl NetworkPolicy {
    /// Computes the effective policy from the extension options.
    ///
    /// `block_network` wins over any allowlist supplied alongside it.
    pub fn effective(block_network: bool, cidr_allowlist: &[String]) -> Self {
        if block_network {
            Self::Deny
        } else if cidr_allowlist.is_empty() {
            Self::AllowAll
        } else {
            Self::Allowlist(cidr_allowlist.to_vec())
        }
    }

    /// Returns true if any egress is permitted.
    pub fn allows_egress(&self) -> bool {
        !matches!(self, Self::Deny)
    }
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllowAll => write!(f, "allow-all"),
            Self::Allowlist(cidrs) => write!(f, "allowlist({})", cidrs.join(",")),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// Image reference for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Pull from a registry.
    Registry(String),
    /// Build from a Dockerfile within a context directory.
    Build {
        context: PathBuf,
        dockerfile: PathBuf,
    },
}

/// Provisioning parameters for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSpec {
    /// Service name as declared in the manifest.
    pub service: String,
    /// Image or build reference.
    pub image: ImageSource,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Environment variables, keys unique.
    pub env: BTreeMap<String, String>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU count.
    pub cpus: Option<f64>,
    /// Overall container lifetime.
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// Idle eviction; `None` means no idle eviction.
    #[serde(with = "opt_secs")]
    pub idle_timeout: Option<Duration>,
    /// Effective network policy.
    pub network: NetworkPolicy,
    /// Provider cloud affinity.
    pub cloud: Option<String>,
    /// Provider region affinity.
    pub region: Option<String>,
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

mod opt_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
}

/// Expands a resolved configuration into per-service container specs.
///
/// Pure: no I/O, no provider calls. Order follows the manifest. Extension
/// options are instance-global and apply uniformly to every service.
pub fn build_specs(resolved: &ResolvedSpec) -> Result<Vec<ContainerSpec>> {
    let base_dir = resolved.source.base_dir();
    let options = &resolved.options;
    options.validate()?;
    let network = NetworkPolicy::effective(options.block_network, &options.cidr_allowlist);

    let mut specs = Vec::with_capacity(resolved.services.len());
    for (name, def) in &resolved.services {
        let image = match (&def.image, &def.build) {
            (_, Some(build)) => {
                let context = base_dir.join(build.context());
                ImageSource::Build {
                    dockerfile: context.join(build.dockerfile()),
                    context,
                }
            }
            (Some(image), None) => ImageSource::Registry(image.clone()),
            (None, None) => {
                return Err(SandboxError::config_invalid(format!(
                    "service '{name}' must specify 'image' or 'build'"
                )))
            }
        };

        let memory_bytes = def
            .mem_limit
            .as_deref()
            .map(|limit| parse_memory_limit(name, limit))
            .transpose()?;

        let cpus = match def.cpus {
            Some(cpus) if cpus.is_finite() && cpus > 0.0 => Some(cpus),
            Some(cpus) => {
                return Err(SandboxError::config_invalid(format!(
                    "service '{name}' has invalid cpus value: {cpus}"
                )))
            }
            None => None,
        };

        specs.push(ContainerSpec {
            service: name.clone(),
            image,
            working_dir: def.working_dir.clone(),
            env: def.env_map()?,
            memory_bytes,
            cpus,
            timeout: Duration::from_secs(options.timeout),
            idle_timeout: options.idle_timeout.map(Duration::from_secs),
            network: network.clone(),
            cloud: options.cloud.clone(),
            region: options.region.clone(),
        });
    }

    Ok(specs)
}

/// Parses a memory limit string (e.g. "8g", "512m", "1.5G", "2gb") to bytes.
fn parse_memory_limit(service: &str, limit: &str) -> Result<i64> {
    let invalid = || {
        SandboxError::config_invalid(format!(
            "service '{service}' has invalid mem_limit: '{limit}'"
        ))
    };

    let normalized = limit.trim().to_lowercase();
    let trimmed = normalized.strip_suffix('b').unwrap_or(&normalized);

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024.0),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024.0 * 1024.0),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024.0 * 1024.0 * 1024.0),
        Some('t') => (&trimmed[..trimmed.len() - 1], 1024.0f64.powi(4)),
        Some(c) if c.is_ascii_digit() => (trimmed, 1.0),
        _ => return Err(invalid()),
    };

    let value: f64 = digits.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }

    #[allow(clippy::cast_possible_truncation)]
    Ok((value * multiplier) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_manifest, ConfigSource, SandboxOptions, ServiceDef};

    fn resolved_from(yaml: &str) -> ResolvedSpec {
        let manifest = parse_manifest(yaml).unwrap();
        ResolvedSpec {
            source: ConfigSource::Default,
            services: manifest.services,
            options: manifest.options,
        }
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(
            parse_memory_limit("s", "8g").unwrap(),
            8 * 1024 * 1024 * 1024
        );
        assert_eq!(parse_memory_limit("s", "512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("s", "1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("s", "2gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("s", "512mb").unwrap(), 512 * 1024 * 1024);
        assert_eq!(
            parse_memory_limit("s", "1.5g").unwrap(),
            (1.5 * 1024.0 * 1024.0 * 1024.0) as i64
        );
        assert_eq!(parse_memory_limit("s", "0.5g").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("s", "1024").unwrap(), 1024);
        assert_eq!(parse_memory_limit("s", "64k").unwrap(), 64 * 1024);
    }

    #[test]
    fn test_parse_memory_limit_invalid() {
        assert!(parse_memory_limit("s", "lots").is_err());
        assert!(parse_memory_limit("s", "").is_err());
        assert!(parse_memory_limit("s", "g").is_err());
        assert!(parse_memory_limit("s", "-1g").is_err());
    }

    #[test]
    fn test_default_options_scenario() {
        // services: {default: {image: "python:3.12"}} with no extension key
        let resolved = resolved_from("services:\n  default:\n    image: python:3.12\n");
        let specs = build_specs(&resolved).unwrap();

        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.service, "default");
        assert_eq!(spec.image, ImageSource::Registry("python:3.12".to_string()));
        assert_eq!(spec.timeout, Duration::from_secs(86_400));
        assert_eq!(spec.idle_timeout, None);
        assert_eq!(spec.network, NetworkPolicy::AllowAll);
    }

    #[test]
    fn test_block_network_wins_over_allowlist() {
        let policy = NetworkPolicy::effective(true, &["10.0.0.0/8".to_string()]);
        assert_eq!(policy, NetworkPolicy::Deny);
        assert!(!policy.allows_egress());
    }

    #[test]
    fn test_allowlist_when_not_blocked() {
        let cidrs = vec!["10.0.0.0/8".to_string(), "172.16.0.0/12".to_string()];
        let policy = NetworkPolicy::effective(false, &cidrs);
        assert_eq!(policy, NetworkPolicy::Allowlist(cidrs));
        assert!(policy.allows_egress());
    }

    #[test]
    fn test_unrestricted_when_unset() {
        assert_eq!(NetworkPolicy::effective(false, &[]), NetworkPolicy::AllowAll);
    }

    #[test]
    fn test_build_specs_preserves_order_and_merges_options() {
        let resolved = resolved_from(
            r#"
services:
  first:
    image: a
  second:
    image: b
    mem_limit: 1g
    cpus: 2.5
x-sandpit:
  timeout: 3600
  block_network: true
"#,
        );
        let specs = build_specs(&resolved).unwrap();

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].service, "first");
        assert_eq!(specs[1].service, "second");
        // Instance-global options apply uniformly.
        for spec in &specs {
            assert_eq!(spec.timeout, Duration::from_secs(3600));
            assert_eq!(spec.network, NetworkPolicy::Deny);
        }
        assert_eq!(specs[1].memory_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(specs[1].cpus, Some(2.5));
    }

    #[test]
    fn test_build_paths_resolve_against_manifest_dir() {
        let manifest = parse_manifest("services:\n  app:\n    build: ./ctx\n").unwrap();
        let resolved = ResolvedSpec {
            source: ConfigSource::Compose(PathBuf::from("/work/task/compose.yaml")),
            services: manifest.services,
            options: manifest.options,
        };
        let specs = build_specs(&resolved).unwrap();

        let ImageSource::Build {
            context,
            dockerfile,
        } = &specs[0].image
        else {
            panic!("expected build image source");
        };
        assert_eq!(context, &PathBuf::from("/work/task/./ctx"));
        assert_eq!(dockerfile, &PathBuf::from("/work/task/./ctx/Dockerfile"));
    }

    #[test]
    fn test_invalid_cpus_rejected() {
        let resolved = ResolvedSpec {
            source: ConfigSource::Default,
            services: vec![(
                "app".to_string(),
                ServiceDef {
                    cpus: Some(-2.0),
                    ..ServiceDef::from_image("alpine")
                },
            )],
            options: SandboxOptions::default(),
        };
        let err = build_specs(&resolved).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_network_policy_display() {
        assert_eq!(format!("{}", NetworkPolicy::AllowAll), "allow-all");
        assert_eq!(format!("{}", NetworkPolicy::Deny), "deny");
        assert_eq!(
            format!("{}", NetworkPolicy::Allowlist(vec!["10.0.0.0/8".into()])),
            "allowlist(10.0.0.0/8)"
        );
    }
}
