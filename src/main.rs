//! Kubescaler CLI - create, scale, and delete experiment clusters

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubescaler::orchestrator::{ClusterOrchestrator, RemoteServices};
use kubescaler::spec::{ClusterSpec, OnStackFailure};
use kubescaler::timing::ResultSnapshot;

/// Kubescaler - managed Kubernetes cluster provisioning for scaling experiments
#[derive(Parser, Debug)]
#[command(name = "kubescaler", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a cluster and wait for its nodes to be ready
    ///
    /// Idempotent: re-running against a partially provisioned cluster
    /// resumes where the previous run stopped.
    Create(ClusterArgs),

    /// Scale the cluster's node group to a new size
    Scale(ScaleArgs),

    /// Delete the cluster: node group, control plane, then network stack
    Delete(ClusterArgs),
}

/// Arguments shared by every cluster operation
#[derive(Args, Debug)]
struct ClusterArgs {
    /// Cluster name
    cluster_name: String,

    /// Starting node count
    #[arg(long, default_value_t = 2)]
    node_count: u32,

    /// Minimum node count
    #[arg(long, default_value_t = 1)]
    min_node_count: u32,

    /// Maximum node count
    #[arg(long, default_value_t = 3)]
    max_node_count: u32,

    /// Machine type for worker nodes
    #[arg(long, default_value = "m5.large")]
    machine_type: String,

    /// Cloud region
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Kubernetes version for the control plane
    #[arg(long, default_value = "1.29")]
    kubernetes_version: String,

    /// Action when network stack creation fails: DELETE | DO_NOTHING | ROLLBACK
    #[arg(long, default_value = "DELETE")]
    on_stack_failure: String,

    /// Network stack creation timeout in minutes (minimum 1)
    #[arg(long, default_value_t = 15)]
    stack_timeout_minutes: u64,

    /// Results file to load previous times from and save this run's times to
    #[arg(long)]
    results: Option<PathBuf>,

    /// Free-form experiment description stored in the results file
    #[arg(long, default_value = "")]
    description: String,

    /// Tag applied to remote resources, as KEY=VALUE (repeatable)
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
}

/// Arguments for the scale operation
#[derive(Args, Debug)]
struct ScaleArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Target node count
    #[arg(long)]
    count: u32,
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("tag must be KEY=VALUE, got '{s}'"))
}

fn build_spec(args: &ClusterArgs) -> anyhow::Result<ClusterSpec> {
    let on_failure: OnStackFailure = args.on_stack_failure.parse()?;
    let mut builder = ClusterSpec::builder(args.cluster_name.clone())
        .node_count(args.node_count)
        .min_nodes(args.min_node_count)
        .max_nodes(args.max_node_count)
        .machine_type(args.machine_type.clone())
        .region(args.region.clone())
        .kubernetes_version(args.kubernetes_version.clone())
        .on_stack_failure(on_failure)
        .stack_timeout_minutes(args.stack_timeout_minutes);
    for (key, value) in &args.tags {
        builder = builder.tag(key.clone(), value.clone());
    }
    Ok(builder.build()?)
}

fn build_orchestrator(args: &ClusterArgs) -> anyhow::Result<ClusterOrchestrator> {
    let spec = build_spec(args)?;
    let services = RemoteServices::aws(args.region.as_str());
    Ok(ClusterOrchestrator::new(spec, services))
}

async fn load_results(
    orchestrator: &mut ClusterOrchestrator,
    path: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(path) = path {
        if path.exists() {
            let snapshot = ResultSnapshot::load(path).await?;
            orchestrator.resume_from(&snapshot);
            println!("Resumed {} earlier timing entries from {}", snapshot.times.len(), path.display());
        }
    }
    Ok(())
}

async fn save_results(
    orchestrator: &ClusterOrchestrator,
    path: Option<&Path>,
    description: &str,
) -> anyhow::Result<()> {
    if let Some(path) = path {
        let snapshot = orchestrator.snapshot(description);
        snapshot.save(path).await?;
        println!("Saved results to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The TLS stack needs exactly one process-wide crypto provider; without
    // it, every cluster API connection would fail at handshake time.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install the default crypto provider: {e:?}");
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create(args) => {
            let mut orchestrator = build_orchestrator(&args)?;
            load_results(&mut orchestrator, args.results.as_deref()).await?;

            let cluster = orchestrator.create().await?;
            println!(
                "Cluster {} is ready with {} nodes",
                args.cluster_name, cluster.ready_nodes
            );
            println!(
                "  Usage: kubectl --kubeconfig={} get nodes",
                orchestrator.spec().kube_config_file().display()
            );

            save_results(&orchestrator, args.results.as_deref(), &args.description).await?;
        }
        Commands::Scale(args) => {
            let mut orchestrator = build_orchestrator(&args.cluster)?;
            load_results(&mut orchestrator, args.cluster.results.as_deref()).await?;

            let ready = orchestrator.scale(args.count).await?;
            println!(
                "Cluster {} now has {} ready nodes",
                args.cluster.cluster_name, ready
            );

            save_results(
                &orchestrator,
                args.cluster.results.as_deref(),
                &args.cluster.description,
            )
            .await?;
        }
        Commands::Delete(args) => {
            let mut orchestrator = build_orchestrator(&args)?;
            load_results(&mut orchestrator, args.results.as_deref()).await?;

            let report = orchestrator.delete().await?;
            save_results(&orchestrator, args.results.as_deref(), &args.description).await?;

            if !report.fully_removed() {
                anyhow::bail!("teardown finished with failed steps: {report:?}");
            }
            println!("Cluster {} deleted", args.cluster_name);
        }
    }

    Ok(())
}
