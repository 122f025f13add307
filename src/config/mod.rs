//! Configuration discovery and resolution.
//!
//! Locates the configuration artifact for a task instance and normalizes it
//! into a provider-agnostic [`ResolvedSpec`]. Discovery order: an explicit
//! path from the harness (compose manifest or bare Dockerfile), then an
//! instance-scoped compose file, then a generic compose file in the base
//! directory, then a built-in default image.

mod compose;

pub use compose::{
    parse_manifest, BuildDef, ComposeManifest, EnvDef, SandboxOptions, ServiceDef,
    DEFAULT_TIMEOUT_SECS, EXTENSION_KEY,
};

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SandboxError};

/// Image used when no configuration artifact is found.
pub const DEFAULT_IMAGE: &str = "python:3.12-bookworm";

/// Service name used for synthesized single-service configurations.
pub const DEFAULT_SERVICE: &str = "default";

/// Generic compose filenames probed after the instance-scoped one.
const GENERIC_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Where the resolved configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A compose manifest on disk.
    Compose(PathBuf),
    /// A bare Dockerfile supplied by the harness.
    Dockerfile(PathBuf),
    /// No artifact found; built-in default image.
    Default,
}

impl ConfigSource {
    /// Directory against which relative build paths resolve.
    pub fn base_dir(&self) -> PathBuf {
        match self {
            Self::Compose(path) | Self::Dockerfile(path) => path
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
            Self::Default => PathBuf::from("."),
        }
    }
}

/// Normalized configuration for one task instance.
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    /// Source artifact kind and location.
    pub source: ConfigSource,
    /// Services in manifest order, names unique, never empty.
    pub services: Vec<(String, ServiceDef)>,
    /// Instance-global extension options.
    pub options: SandboxOptions,
}

/// Resolves the configuration for `instance_id`.
///
/// `explicit` is a harness-supplied path to either a compose manifest or a
/// Dockerfile; when absent, `base_dir` is probed for an instance-scoped
/// `{instance_id}-compose.yaml` and then the generic compose filenames.
pub fn resolve(
    instance_id: &str,
    base_dir: &Path,
    explicit: Option<&Path>,
) -> Result<ResolvedSpec> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(SandboxError::config_not_found(path.display().to_string()));
        }
        if is_dockerfile(path) {
            debug!(path = %path.display(), "using explicit Dockerfile");
            return resolve_dockerfile(path);
        }
        debug!(path = %path.display(), "using explicit compose manifest");
        return load_compose(path);
    }

    let instance_file = base_dir.join(format!("{instance_id}-compose.yaml"));
    if instance_file.is_file() {
        debug!(path = %instance_file.display(), "using instance-scoped compose manifest");
        return load_compose(&instance_file);
    }

    for name in GENERIC_COMPOSE_FILES {
        let candidate = base_dir.join(name);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "using generic compose manifest");
            return load_compose(&candidate);
        }
    }

    debug!(image = DEFAULT_IMAGE, "no configuration found; using default image");
    Ok(ResolvedSpec {
        source: ConfigSource::Default,
        services: vec![(
            DEFAULT_SERVICE.to_string(),
            ServiceDef::from_image(DEFAULT_IMAGE),
        )],
        options: SandboxOptions::default(),
    })
}

fn load_compose(path: &Path) -> Result<ResolvedSpec> {
    let text = fs::read_to_string(path)
        .map_err(|e| SandboxError::io_failure(format!("failed to read {}: {e}", path.display())))?;
    let manifest = parse_manifest(&text)?;
    Ok(ResolvedSpec {
        source: ConfigSource::Compose(path.to_path_buf()),
        services: manifest.services,
        options: manifest.options,
    })
}

fn resolve_dockerfile(path: &Path) -> Result<ResolvedSpec> {
    let context = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.display().to_string(),
        _ => ".".to_string(),
    };
    let dockerfile = path
        .file_name()
        .map_or_else(|| "Dockerfile".to_string(), |f| f.to_string_lossy().into_owned());
    Ok(ResolvedSpec {
        source: ConfigSource::Dockerfile(path.to_path_buf()),
        services: vec![(
            DEFAULT_SERVICE.to_string(),
            ServiceDef::from_dockerfile(context, dockerfile),
        )],
        options: SandboxOptions::default(),
    })
}

/// Heuristic for a bare Dockerfile path.
fn is_dockerfile(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.starts_with("Dockerfile") || name.to_lowercase().ends_with(".dockerfile")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const MINIMAL: &str = "services:\n  app:\n    image: alpine\n";

    #[test]
    fn test_instance_scoped_takes_precedence_over_generic() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("task-7-compose.yaml"),
            "services:\n  scoped:\n    image: scoped-image\n",
        )
        .unwrap();
        fs::write(dir.path().join("compose.yaml"), MINIMAL).unwrap();

        let spec = resolve("task-7", dir.path(), None).unwrap();
        assert_eq!(spec.services[0].0, "scoped");
        assert!(matches!(spec.source, ConfigSource::Compose(ref p) if p.ends_with("task-7-compose.yaml")));
    }

    #[test]
    fn test_generic_compose_found() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("docker-compose.yml"), MINIMAL).unwrap();

        let spec = resolve("task-1", dir.path(), None).unwrap();
        assert_eq!(spec.services[0].0, "app");
    }

    #[test]
    fn test_fallback_to_default_image() {
        let dir = tempdir().unwrap();

        let spec = resolve("task-1", dir.path(), None).unwrap();
        assert_eq!(spec.source, ConfigSource::Default);
        assert_eq!(spec.services.len(), 1);
        assert_eq!(spec.services[0].0, DEFAULT_SERVICE);
        assert_eq!(spec.services[0].1.image.as_deref(), Some(DEFAULT_IMAGE));
        assert_eq!(spec.options.timeout, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_explicit_dockerfile() {
        let dir = tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile");
        fs::write(&dockerfile, "FROM alpine\n").unwrap();

        let spec = resolve("task-1", dir.path(), Some(&dockerfile)).unwrap();
        assert!(matches!(spec.source, ConfigSource::Dockerfile(_)));
        let build = spec.services[0].1.build.as_ref().unwrap();
        assert_eq!(build.dockerfile(), "Dockerfile");
        assert_eq!(build.context(), dir.path().display().to_string());
    }

    #[test]
    fn test_explicit_missing_path_is_not_found() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope-compose.yaml");

        let err = resolve("task-1", dir.path(), Some(&missing)).unwrap_err();
        assert!(matches!(err, SandboxError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_explicit_compose_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.yaml");
        fs::write(&path, MINIMAL).unwrap();

        let spec = resolve("task-1", dir.path(), Some(&path)).unwrap();
        assert!(matches!(spec.source, ConfigSource::Compose(_)));
        assert_eq!(spec.services[0].0, "app");
    }

    #[test]
    fn test_invalid_manifest_surfaces_before_any_provisioning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("compose.yaml");
        fs::write(&path, "services: {}\n").unwrap();

        let err = resolve("task-1", dir.path(), None).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_is_dockerfile_variants() {
        assert!(is_dockerfile(Path::new("/x/Dockerfile")));
        assert!(is_dockerfile(Path::new("/x/Dockerfile.gpu")));
        assert!(is_dockerfile(Path::new("/x/build.dockerfile")));
        assert!(!is_dockerfile(Path::new("/x/compose.yaml")));
    }
}
