//! magikube - Kubernetes session CLI
//!
//! Runs commands as isolated sessions on the current kube context and builds
//! content-addressed images.
//!
//! ## Usage
//!
//! ```sh
//! magikube run --image alpine:3.20 -- echo hi
//! magikube run --spec session.yaml --detach
//! magikube list --label team=infra --status running
//! magikube get <session-id>
//! magikube exec <session-id> -- ls /workspace
//! magikube stop|kill|destroy <session-id>
//! magikube build --spec build.yaml
//! magikube health
//! ```
//!
//! Configuration comes from `MAGIKUBE_*` environment variables; `--namespace`
//! overrides the namespace for both sessions and builds. Logging follows
//! `RUST_LOG` (default `info`) and goes to stderr.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use magikube::{
    BackendConfig, BuildSpec, BuilderConfig, ClusterBackend, ImageBuilder, KubeCluster,
    ListFilter, SessionBackend, SessionId, SessionSpec, SessionStatus,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Parser)]
#[command(name = "magikube", version, about = "Kubernetes session backend")]
struct Cli {
    /// Namespace for sessions and builds.
    #[arg(long, short = 'n', global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a session.
    Run {
        /// Session spec (YAML or JSON).
        #[arg(long)]
        spec: Option<PathBuf>,
        /// Image, overriding the spec.
        #[arg(long)]
        image: Option<String>,
        /// Environment variable (`KEY=VALUE`).
        #[arg(long = "env", short = 'e', value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// Label (`KEY=VALUE`).
        #[arg(long = "label", short = 'l', value_parser = parse_key_val)]
        labels: Vec<(String, String)>,
        /// Port to expose.
        #[arg(long = "port", short = 'p')]
        ports: Vec<u16>,
        /// Setup command run before the main command.
        #[arg(long = "setup")]
        setup: Vec<String>,
        /// Print the session id and return immediately.
        #[arg(long, short = 'd')]
        detach: bool,
        /// Destroy the session after it exits.
        #[arg(long)]
        rm: bool,
        /// Command and arguments.
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// List sessions.
    List {
        /// Only sessions in this status.
        #[arg(long, value_parser = parse_status)]
        status: Option<SessionStatus>,
        /// Only sessions carrying this label (`KEY=VALUE`).
        #[arg(long = "label", short = 'l', value_parser = parse_key_val)]
        labels: Vec<(String, String)>,
    },
    /// Show one session as JSON.
    Get { id: String },
    /// Run a command inside a session.
    Exec {
        id: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Request graceful termination.
    Stop { id: String },
    /// Terminate immediately.
    Kill { id: String },
    /// Delete every resource of a session.
    Destroy { id: String },
    /// Build an image and print its reference.
    Build {
        /// Build spec (YAML or JSON).
        #[arg(long)]
        spec: PathBuf,
        /// Registry, overriding configuration.
        #[arg(long)]
        registry: Option<String>,
    },
    /// Check cluster connectivity.
    Health,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

fn parse_status(s: &str) -> Result<SessionStatus, String> {
    SessionStatus::parse(s).ok_or_else(|| format!("unknown status '{s}'"))
}

// =============================================================================
// Commands
// =============================================================================

async fn load_spec(path: Option<&PathBuf>) -> anyhow::Result<SessionSpec> {
    match path {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            Ok(SessionSpec::from_yaml(&raw)?)
        }
        None => Ok(SessionSpec::default()),
    }
}

async fn pump(
    stream: Arc<magikube::session::BufferedStream>,
    mut out: impl tokio::io::AsyncWrite + Unpin,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await;
        if n == 0 || out.write_all(&buf[..n]).await.is_err() {
            break;
        }
        let _ = out.flush().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    backend: &ClusterBackend,
    spec: Option<PathBuf>,
    image: Option<String>,
    env: Vec<(String, String)>,
    labels: Vec<(String, String)>,
    ports: Vec<u16>,
    setup: Vec<String>,
    detach: bool,
    rm: bool,
    command: Vec<String>,
) -> anyhow::Result<ExitCode> {
    let mut spec = load_spec(spec.as_ref()).await?;
    if let Some(image) = image {
        spec.image = image;
    }
    if !command.is_empty() {
        spec.command = command;
    }
    spec.env.extend(env);
    spec.labels.extend(labels);
    spec.ports.extend(ports);
    spec.setup.extend(setup);
    if spec.image.is_empty() {
        bail!("an image is required (--image or spec file)");
    }

    let handle = backend.run(spec).await?;
    if detach {
        println!("{}", handle.id());
        return Ok(ExitCode::SUCCESS);
    }

    let stdout = tokio::spawn(pump(handle.stdout(), tokio::io::stdout()));
    let stderr = tokio::spawn(pump(handle.stderr(), tokio::io::stderr()));
    let exit = handle.exited().await;
    let _ = tokio::join!(stdout, stderr);

    if rm {
        backend.destroy(handle.id()).await?;
    }
    let Some(exit) = exit else {
        bail!("session {} ended without an exit result", handle.id());
    };
    if let Some(error) = &exit.error {
        tracing::warn!(session = %handle.id(), error = %error, "Session failed");
    }
    Ok(exit_code(exit.exit_code))
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut backend_config = BackendConfig::from_env()?;
    let mut builder_config = BuilderConfig::from_env()?;
    if let Some(namespace) = cli.namespace {
        backend_config = backend_config.with_namespace(namespace.clone());
        builder_config = builder_config.with_namespace(namespace);
    }

    let cluster = Arc::new(
        KubeCluster::try_default()
            .await
            .context("connecting to the cluster")?,
    );

    if let Command::Build { spec, registry } = &cli.command {
        let raw = tokio::fs::read(spec)
            .await
            .with_context(|| format!("reading {}", spec.display()))?;
        let build_spec = BuildSpec::from_yaml(&raw)?;
        if let Some(registry) = registry {
            builder_config = builder_config.with_registry(registry.clone());
        }
        let image = ImageBuilder::new(cluster, builder_config)
            .build(&build_spec)
            .await?;
        println!("{}", image.reference);
        return Ok(ExitCode::SUCCESS);
    }

    let backend = ClusterBackend::new(cluster, backend_config);
    let code = match cli.command {
        Command::Run {
            spec,
            image,
            env,
            labels,
            ports,
            setup,
            detach,
            rm,
            command,
        } => {
            cmd_run(
                &backend, spec, image, env, labels, ports, setup, detach, rm, command,
            )
            .await?
        }
        Command::List { status, labels } => {
            let filter = ListFilter {
                status,
                labels: labels.into_iter().collect::<BTreeMap<_, _>>(),
            };
            for info in backend.list(&filter).await? {
                let exit = info
                    .exit_code
                    .map_or_else(|| "-".to_string(), |c| c.to_string());
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    info.id,
                    info.status,
                    exit,
                    info.image,
                    info.created_at.to_rfc3339()
                );
            }
            ExitCode::SUCCESS
        }
        Command::Get { id } => {
            let info = backend.get(&SessionId::from(id)).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            ExitCode::SUCCESS
        }
        Command::Exec { id, command } => {
            let result = backend.exec(&SessionId::from(id), &command).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&result.stdout).await?;
            stdout.flush().await?;
            let mut stderr = tokio::io::stderr();
            stderr.write_all(&result.stderr).await?;
            stderr.flush().await?;
            exit_code(result.exit_code)
        }
        Command::Stop { id } => {
            backend.stop(&SessionId::from(id)).await?;
            ExitCode::SUCCESS
        }
        Command::Kill { id } => {
            backend.kill(&SessionId::from(id)).await?;
            ExitCode::SUCCESS
        }
        Command::Destroy { id } => {
            backend.destroy(&SessionId::from(id)).await?;
            ExitCode::SUCCESS
        }
        Command::Health => {
            backend.health().await?;
            println!("ok ({})", backend.name());
            ExitCode::SUCCESS
        }
        Command::Build { .. } => ExitCode::SUCCESS,
    };
    backend.close().await;
    Ok(code)
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("magikube: {e:#}");
            ExitCode::FAILURE
        }
    }
}
