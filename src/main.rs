use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sandpit::{config, spec, DockerProvider, ExecOptions, LifecycleCoordinator};

#[derive(Parser)]
#[command(name = "sandpit")]
#[command(
    author,
    version,
    about = "Sandboxed execution environments on container infrastructure"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve and print the configuration for an instance without provisioning
    Resolve {
        /// Instance id used for config discovery
        #[arg(short, long, default_value = "default")]
        instance: String,

        /// Explicit config path (compose manifest or Dockerfile)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory to probe for configuration
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Print the resolved container specs as JSON
        #[arg(long)]
        json: bool,
    },

    /// Provision an instance, run one command in a service, and tear down
    Run {
        /// Instance id
        #[arg(short, long, default_value = "default")]
        instance: String,

        /// Explicit config path (compose manifest or Dockerfile)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory to probe for configuration
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Service to run the command in (defaults to the first service)
        #[arg(short, long)]
        service: Option<String>,

        /// Command line to execute
        command: String,
    },

    /// Remove leftover containers from previous runs
    Cleanup {
        /// Only remove containers belonging to this instance id
        #[arg(short, long)]
        instance: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("sandpit=debug")
    } else {
        EnvFilter::new("sandpit=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Resolve {
            instance,
            config,
            dir,
            json,
        } => {
            resolve_cmd(&instance, &dir, config.as_deref(), json)?;
        }
        Commands::Run {
            instance,
            config,
            dir,
            service,
            command,
        } => {
            let exit_code = run_cmd(&instance, &dir, config.as_deref(), service, &command).await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        Commands::Cleanup { instance } => {
            cleanup_cmd(instance.as_deref()).await?;
        }
    }

    Ok(())
}

fn resolve_cmd(
    instance: &str,
    dir: &std::path::Path,
    config_path: Option<&std::path::Path>,
    json: bool,
) -> Result<()> {
    let resolved = config::resolve(instance, dir, config_path)?;
    let specs = spec::build_specs(&resolved)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    match &resolved.source {
        config::ConfigSource::Compose(path) => {
            println!("Source: compose manifest {}", path.display());
        }
        config::ConfigSource::Dockerfile(path) => {
            println!("Source: Dockerfile {}", path.display());
        }
        config::ConfigSource::Default => {
            println!("Source: built-in default image");
        }
    }
    println!("Services: {}", specs.len());
    for spec in &specs {
        let image = match &spec.image {
            spec::ImageSource::Registry(image) => image.clone(),
            spec::ImageSource::Build { context, .. } => {
                format!("build {}", context.display())
            }
        };
        println!(
            "  {}: {} (timeout {}s, network {})",
            spec.service,
            image,
            spec.timeout.as_secs(),
            spec.network
        );
    }
    Ok(())
}

async fn run_cmd(
    instance: &str,
    dir: &std::path::Path,
    config_path: Option<&std::path::Path>,
    service: Option<String>,
    command: &str,
) -> Result<i32> {
    let argv = shell_words::split(command)?;
    if argv.is_empty() {
        anyhow::bail!("empty command");
    }

    let provider = Arc::new(DockerProvider::connect().await?);
    let coordinator = LifecycleCoordinator::new(provider);

    let environments = coordinator.launch(instance, dir, config_path).await?;

    let result = async {
        let env = match &service {
            Some(name) => environments
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("no such service: {name}"))?,
            None => environments
                .values()
                .next()
                .ok_or_else(|| anyhow::anyhow!("no services provisioned"))?,
        };

        let output = env.exec(argv, ExecOptions::default()).await?;
        print!("{}", output.stdout);
        eprint!("{}", output.stderr);
        #[allow(clippy::cast_possible_truncation)]
        Ok::<i32, anyhow::Error>(output.exit_code as i32)
    }
    .await;

    // Teardown runs whether or not the command succeeded.
    coordinator.close(instance).await?;
    result
}

async fn cleanup_cmd(instance: Option<&str>) -> Result<()> {
    let provider = DockerProvider::connect().await?;
    let removed = provider.cleanup_orphaned(instance).await?;
    println!("Removed {removed} container(s)");
    Ok(())
}
