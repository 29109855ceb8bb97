use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kubelab_api::{LabApi, Orchestrator};
use kubelab_apply::{render_yaml, JupyterManifests, ManifestBuilder};
use kubelab_core::{DeploymentPhase, DeploymentProgress, LabConfig, WorkloadIdentity};
use kubelab_kubehub::KubeconfigNamespace;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "labctl", version, about = "Run a personal JupyterLab on Kubernetes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster credential (default: ~/.kube/config); a KUBECONFIG list uses its first existing file
    #[arg(long = "kubeconfig", env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Deployment config file (YAML or JSON)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// CPU request/limit, e.g. "2" or "500m"
    #[arg(long = "cpu", global = true)]
    cpu: Option<String>,

    /// Memory request/limit, e.g. "4Gi"
    #[arg(long = "memory", global = true)]
    memory: Option<String>,

    /// Number of NVIDIA GPUs
    #[arg(long = "gpu", global = true)]
    gpu: Option<u32>,

    /// Container image
    #[arg(long = "image", global = true)]
    image: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy (or reuse) the workload and forward it to localhost until Ctrl-C
    Deploy {
        /// Leave the workload running on exit
        #[arg(long = "keep", action = ArgAction::SetTrue)]
        keep: bool,
    },
    /// Show the workload status
    Status,
    /// Delete the workload (statefulset and service)
    Cleanup {
        /// Workload name (default: derived from the credential)
        name: Option<String>,
    },
    /// Print the workload name derived from the credential
    Identity,
    /// Print the manifests that deploy would submit
    Manifests,
}

fn init_tracing() {
    let env = std::env::var("LAB_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LAB_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LAB_METRICS_ADDR; expected host:port");
        }
    }
}

fn default_kubeconfig() -> Option<PathBuf> { dirs::home_dir().map(|h| h.join(".kube").join("config")) }

/// First existing file of a path list (`:`/`;` separated like `KUBECONFIG`),
/// else the first entry.
fn first_kubeconfig(raw: &OsStr) -> Option<PathBuf> {
    let paths: Vec<PathBuf> = std::env::split_paths(raw).filter(|p| !p.as_os_str().is_empty()).collect();
    paths.iter().find(|p| p.is_file()).cloned().or_else(|| paths.into_iter().next())
}

fn read_config_file(path: &Path) -> Result<LabConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path.extension().map(|e| e.eq_ignore_ascii_case("json")).unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    };
    Ok(cfg)
}

/// Config file first, then flags on top.
fn load_config(cli: &Cli) -> Result<LabConfig> {
    let mut cfg = match &cli.config {
        Some(p) => read_config_file(p)?,
        None => LabConfig::default(),
    };
    if let Some(p) = cli.kubeconfig.as_deref().and_then(|p| first_kubeconfig(p.as_os_str())) {
        cfg.credential_path = Some(p);
    }
    if cfg.credential_path.is_none() {
        cfg.credential_path = default_kubeconfig();
    }
    if let Some(ns) = &cli.namespace {
        cfg.namespace = Some(ns.clone());
    }
    if let Some(image) = &cli.image {
        cfg.image = Some(image.clone());
    }
    if let Some(cpu) = &cli.cpu {
        cfg.hardware.cpu = cpu.clone();
    }
    if let Some(memory) = &cli.memory {
        cfg.hardware.memory = memory.clone();
    }
    if let Some(gpu) = cli.gpu {
        cfg.hardware.gpu = gpu;
    }
    Ok(cfg)
}

fn print_progress(ev: &DeploymentProgress, output: Output) -> Result<()> {
    match output {
        Output::Human => match ev.phase {
            DeploymentPhase::Error => eprintln!("[{:>3}%] error: {}", ev.progress_percent, ev.message),
            _ => println!("[{:>3}%] {:<22} {}", ev.progress_percent, ev.phase.as_str(), ev.message),
        },
        Output::Json => println!("{}", serde_json::to_string(ev)?),
    }
    Ok(())
}

async fn wait_for_interrupt(orch: &Orchestrator) {
    let mut pf = orch.supervisor().subscribe();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => return,
            changed = pf.changed() => {
                if changed.is_err() {
                    return;
                }
                let st = pf.borrow_and_update().clone();
                info!(status = ?st.status, restarts = st.restart_count, url = ?st.url, error = ?st.last_error, "port-forward state");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let orch = Arc::new(Orchestrator::with_defaults().with_resolver(Arc::new(KubeconfigNamespace)));

    match cli.command {
        Commands::Deploy { keep } => {
            info!(keep, "deploy invoked");
            let mut stream = orch.deploy_stream(config);
            let mut interrupted = false;
            loop {
                tokio::select! {
                    ev = stream.events.next() => match ev {
                        Some(ev) => print_progress(&ev, cli.output)?,
                        None => break,
                    },
                    _ = signal::ctrl_c(), if !interrupted => {
                        warn!("interrupt received, cancelling deployment");
                        interrupted = true;
                        orch.cancel().await;
                    }
                }
            }
            let outcome = stream.result.await??;
            match cli.output {
                Output::Human => {
                    println!("JupyterLab: {}", outcome.url);
                    println!("Press Ctrl-C to stop{}", if keep { "" } else { " and delete the workload" });
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
            }
            wait_for_interrupt(&orch).await;
            orch.stop_port_forward().await;
            if keep {
                info!(identity = %outcome.identity, "leaving workload running");
            } else {
                let existed = orch.cleanup(&outcome.identity).await?;
                info!(identity = %outcome.identity, existed, "workload deleted");
            }
        }
        Commands::Status => {
            let st = orch.status(&config).await?;
            match cli.output {
                Output::Human => {
                    if st.exists {
                        println!("NAME                     POD                        PHASE     READY  MESSAGE");
                        println!(
                            "{:<24} {:<26} {:<9} {:<6} {}",
                            st.controller_name.as_deref().unwrap_or("-"),
                            st.pod_name.as_deref().unwrap_or("-"),
                            st.phase.as_str(),
                            st.ready,
                            st.message
                        );
                    } else {
                        println!("{}", st.message);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&st)?),
            }
        }
        Commands::Cleanup { name } => {
            let identity = match name {
                Some(n) => WorkloadIdentity::from_name(n),
                None => orch.identity_for(&config)?,
            };
            orch.connect(&config, &CancellationToken::new()).await?;
            let existed = orch.cleanup(&identity).await?;
            match cli.output {
                Output::Human if existed => println!("deleted {}", identity),
                Output::Human => println!("{} not found", identity),
                Output::Json => println!("{}", serde_json::json!({ "identity": identity, "deleted": existed })),
            }
        }
        Commands::Identity => {
            let identity = orch.identity_for(&config)?;
            match cli.output {
                Output::Human => println!("{}", identity),
                Output::Json => println!("{}", serde_json::json!({ "identity": identity, "pod": identity.pod_name() })),
            }
        }
        Commands::Manifests => {
            config.validate()?;
            let identity = orch.identity_for(&config)?;
            let resources = JupyterManifests.build(&config, &identity)?;
            match cli.output {
                Output::Human => print!("{}", render_yaml(&resources)?),
                Output::Json => {
                    let docs = resources
                        .iter()
                        .map(|r| r.to_json().map_err(|e| anyhow!("{}: {}", r, e)))
                        .collect::<Result<Vec<_>>>()?;
                    println!("{}", serde_json::to_string_pretty(&docs)?);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn flags_override_config_file() {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(f, "namespace: team-a\nimage: custom/lab:1\nhardware:\n  cpu: \"2\"\n  gpu: 1\nenvironment:\n  FOO: bar").unwrap();
        let cli = Cli::parse_from([
            "labctl",
            "--config",
            f.path().to_str().unwrap(),
            "--kubeconfig",
            "/tmp/kc",
            "--memory",
            "8Gi",
            "--ns",
            "team-b",
            "status",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("team-b"));
        assert_eq!(cfg.image.as_deref(), Some("custom/lab:1"));
        assert_eq!(cfg.hardware.cpu, "2");
        assert_eq!(cfg.hardware.memory, "8Gi");
        assert_eq!(cfg.hardware.gpu, 1);
        assert_eq!(cfg.environment.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(cfg.credential_path.as_deref(), Some(Path::new("/tmp/kc")));
    }

    #[test]
    fn kubeconfig_list_picks_first_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let present = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let other = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let list = std::env::join_paths([missing.as_path(), present.path(), other.path()]).unwrap();
        assert_eq!(first_kubeconfig(&list).as_deref(), Some(present.path()));

        let cli = Cli::parse_from([OsStr::new("labctl"), OsStr::new("--kubeconfig"), list.as_os_str(), OsStr::new("identity")]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.credential_path.as_deref(), Some(present.path()));

        let none = std::env::join_paths([missing.as_path()]).unwrap();
        assert_eq!(first_kubeconfig(&none), Some(missing));
        assert_eq!(first_kubeconfig(OsStr::new("")), None);
    }

    #[test]
    fn json_config_is_accepted() {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(f, r#"{{"namespace":"lab","git":{{"repository":"https://example.com/r.git"}}}}"#).unwrap();
        let cfg = read_config_file(f.path()).unwrap();
        assert_eq!(cfg.namespace.as_deref(), Some("lab"));
        assert_eq!(cfg.git.map(|g| g.repository), Some("https://example.com/r.git".to_string()));
        assert_eq!(cfg.hardware.memory, "2Gi");
    }
}
