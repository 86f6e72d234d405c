//! Entry point: CNI plugin surface and audit daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vport_cni::attach::{AttachRequest, Attacher, LiveControlPlane, LiveDatapath};
use vport_cni::cni::{CniArgs, CniCommand, CniErrorReply, CniReply, K8sArgs, NetworkConfig};
use vport_cni::config::{Config, DEFAULT_CONFIG_PATH};
use vport_cni::error::{CniError, CniResult};
use vport_cni::inventory::{KubernetesInventory, MesosInventory, MonitorNotifier};
use vport_cni::metadata::{KubernetesResolver, MesosResolver, MetadataResolver};
use vport_cni::port_name::normalize_mesos_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Orchestrator {
    Kubernetes,
    Mesos,
}

#[derive(Debug, Parser)]
#[command(name = "vport-cni", about = "Overlay CNI plugin and audit daemon")]
struct Cli {
    /// Run the audit daemon instead of the CNI plugin surface.
    #[arg(long)]
    daemon: bool,

    /// Orchestrator this host belongs to.
    #[arg(long, value_enum)]
    orchestrator: Option<Orchestrator>,

    /// Path to the plugin configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

// Namespace entry binds the calling thread, so everything runs on a
// current-thread runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            // No logging yet; stderr is all we have.
            eprintln!("vport-cni: {e}");
            std::process::exit(1);
        }
    };
    init_logging(&config)?;

    if cli.daemon {
        run_daemon(&cli, &config).await
    } else {
        run_cni(&cli, &config).await
    }
}

/// Logging goes to the configured file, or stderr. Stdout belongs to the
/// CNI result JSON.
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_file {
        Some(path) => {
            let truncate = std::fs::metadata(path)
                .map(|m| m.len() > config.log_file_size * 1024 * 1024)
                .unwrap_or(false);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(!truncate)
                .truncate(truncate)
                .write(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn run_daemon(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let daemon_config = vport_audit::DaemonConfig {
        endpoint: PathBuf::from(&config.endpoint),
        bridge: config.bridge.clone(),
        owned_prefix: vport_cni::PORT_NAME_PREFIX.to_string(),
        monitor_interval: config.monitor_interval,
        connection_check_interval: config.connection_check_interval,
        stale_entry_timeout: config.stale_entry_timeout,
    };
    let notifier = MonitorNotifier::new(config);
    let orchestrator = cli.orchestrator.unwrap_or(Orchestrator::Kubernetes);
    info!(?orchestrator, "Starting audit daemon");

    let result = match orchestrator {
        Orchestrator::Kubernetes => {
            vport_audit::run(daemon_config, KubernetesInventory::new(config), notifier).await
        }
        Orchestrator::Mesos => {
            vport_audit::run(daemon_config, MesosInventory::new(config), notifier).await
        }
    };
    match result {
        Err(vport_audit::AuditError::Interrupted) => {
            info!("Audit daemon stopped");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
        Ok(()) => Ok(()),
    }
}

async fn run_cni(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let args = match CniArgs::from_env() {
        Ok(args) => args,
        Err(e) => {
            emit_error(config, &e);
            std::process::exit(1);
        }
    };
    let network_config = match NetworkConfig::from_reader(std::io::stdin()) {
        Ok(network_config) => network_config,
        Err(e) => {
            emit_error(config, &e);
            std::process::exit(1);
        }
    };

    let k8s = K8sArgs::from_cni_args(&args);
    let orchestrator = infer_orchestrator(cli, &k8s);

    match args.command {
        CniCommand::Add => match add(config, &args, &network_config, &k8s, orchestrator).await {
            Ok(reply) => {
                println!("{}", serde_json::to_string(&reply)?);
                Ok(())
            }
            Err(e) => {
                error!("ADD failed for container {}: {e}", args.container_id);
                emit_error(config, &e);
                std::process::exit(1);
            }
        },
        CniCommand::Del => {
            // DEL is best-effort by contract: log everything, fail nothing.
            if let Err(e) = del(config, &args, &k8s, orchestrator).await {
                warn!("DEL left residue for container {}: {e}", args.container_id);
            }
            Ok(())
        }
    }
}

/// An explicit flag wins; otherwise Kubernetes pairs arrive in `CNI_ARGS`
/// only when a kubelet is calling.
fn infer_orchestrator(cli: &Cli, k8s: &K8sArgs) -> Orchestrator {
    cli.orchestrator.unwrap_or(if k8s.pod_name.is_empty() {
        Orchestrator::Mesos
    } else {
        Orchestrator::Kubernetes
    })
}

/// The workload identity (entity id, display name, resolver) for one
/// invocation.
async fn workload(
    config: &Config,
    args: &CniArgs,
    network_config: &NetworkConfig,
    k8s: &K8sArgs,
    orchestrator: Orchestrator,
) -> (String, String, Box<dyn MetadataResolver>) {
    match orchestrator {
        Orchestrator::Kubernetes => {
            let resolver = KubernetesResolver::new(config, k8s.clone());
            // The audit daemon keys entities by pod UID, so attach must too.
            // Fall back to the container id when the API server is not
            // reachable rather than failing the whole operation here.
            let entity_id = match resolver.pod_uid().await {
                Ok(uid) if !uid.is_empty() => uid,
                Ok(_) | Err(_) => {
                    warn!(pod = %k8s.pod_name, "No pod UID, keying entity by container id");
                    args.container_id.clone()
                }
            };
            (entity_id, k8s.pod_name.clone(), Box::new(resolver))
        }
        Orchestrator::Mesos => {
            let labels = network_config.label_map();
            let name = labels
                .get("name")
                .cloned()
                .unwrap_or_else(|| args.container_id.clone());
            (
                normalize_mesos_id(&args.container_id),
                name,
                Box::new(MesosResolver::new(labels)),
            )
        }
    }
}

fn request(config: &Config, args: &CniArgs, entity_id: String, entity_name: String) -> AttachRequest {
    AttachRequest {
        entity_id,
        entity_name,
        netns: args.netns.clone(),
        ifname: args.ifname.clone(),
        mtu: config.mtu,
        resolve_timeout: config.port_resolve_timeout,
        bridge: config.bridge.clone(),
    }
}

async fn add(
    config: &Config,
    args: &CniArgs,
    network_config: &NetworkConfig,
    k8s: &K8sArgs,
    orchestrator: Orchestrator,
) -> CniResult<CniReply> {
    let (entity_id, entity_name, resolver) =
        workload(config, args, network_config, k8s, orchestrator).await;
    let control = LiveControlPlane::connect_with_retry(&config.endpoint, &config.bridge).await;
    let attacher = Attacher::new(&control, &LiveDatapath);

    let result = attacher
        .connect(&request(config, args, entity_id, entity_name), &*resolver)
        .await;
    control.into_connection().disconnect();
    result.map(|address| CniReply::new(&config.cni_version, address))
}

async fn del(
    config: &Config,
    args: &CniArgs,
    k8s: &K8sArgs,
    orchestrator: Orchestrator,
) -> CniResult<()> {
    let (entity_id, entity_name, _resolver) =
        workload(config, args, &NetworkConfig::default(), k8s, orchestrator).await;
    let control = LiveControlPlane::connect_with_retry(&config.endpoint, &config.bridge).await;
    let attacher = Attacher::new(&control, &LiveDatapath);
    let notifier = MonitorNotifier::new(config);

    let report = attacher
        .disconnect(&request(config, args, entity_id, entity_name), &notifier)
        .await;
    control.into_connection().disconnect();
    if !report.failures.is_empty() {
        warn!(
            container = %args.container_id,
            failures = report.failures.len(),
            "Detach completed with residue"
        );
    }
    Ok(())
}

/// Prints the structured CNI error JSON to stdout, where the runtime
/// expects it.
fn emit_error(config: &Config, err: &CniError) {
    let reply = CniErrorReply::new(&config.cni_version, err);
    match serde_json::to_string(&reply) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("vport-cni: cannot encode error reply: {e}"),
    }
}
