//! Sandboxed execution environments on container infrastructure.
//!
//! `sandpit` turns a per-task configuration (a compose-style manifest, a
//! bare Dockerfile, or nothing at all) into a set of isolated containers,
//! one per declared service, and hands back a [`SandboxEnvironment`] for
//! each: run commands, move files in and out, grab a raw connection.
//! Teardown is coordinated per instance and guaranteed best-effort, so a
//! failed launch never leaks the containers that did come up.
//!
//! The typical flow:
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use sandpit::{DockerProvider, ExecOptions, LifecycleCoordinator};
//!
//! # async fn run() -> sandpit::Result<()> {
//! let provider = Arc::new(DockerProvider::connect().await?);
//! let coordinator = LifecycleCoordinator::new(provider);
//!
//! let environments = coordinator.launch("task-1", Path::new("."), None).await?;
//! let default = &environments["default"];
//! let output = default
//!     .exec(vec!["echo".into(), "hello".into()], ExecOptions::default())
//!     .await?;
//! println!("{}", output.stdout);
//!
//! coordinator.close("task-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod environment;
pub mod error;
pub mod provider;
pub mod provision;
pub mod registry;
pub mod spec;

pub use config::{ConfigSource, ResolvedSpec, SandboxOptions};
pub use coordinator::LifecycleCoordinator;
pub use environment::{ExecOptions, SandboxEnvironment};
pub use error::{ProvisionFailure, Result, SandboxError, ServiceFailure};
pub use provider::{
    ConnectionInfo, ContainerHandle, ContainerProvider, DockerProvider, ExecOutput, MockProvider,
};
pub use registry::InstanceRegistry;
pub use spec::{ContainerSpec, ImageSource, NetworkPolicy};
