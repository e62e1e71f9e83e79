use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde_json::Value as Json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use seedling_apply::{payload_checksum, three_way_merge_patch};
use seedling_core::{Kind, ManagedResource};
use seedling_dispatch::{Backoff, Dispatcher, DispatcherConfig, EventWatchDispatcher};
use seedling_ensure::WaitConfig;
use seedling_kubehub::{sync_seed_registry, watch_keys, KubeEventRecorder, KubeStore};
use seedling_store::{EventRecorder, ResourceStore};
use seedling_sync::{enqueue_all_projects, ProjectSynchronizer, RegistryHandle, SeedRegistry, CONTROLLER_NAME};

#[derive(Parser, Debug)]
#[command(name = "seedlingctl", version, about = "Seedling control-plane reconciler")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", env = "SEEDLING_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the project synchronizer against the current kube context
    Run(RunArgs),
    /// Print the payload checksum of a Secret or ConfigMap manifest
    Checksum {
        /// YAML or JSON manifest
        manifest: PathBuf,
    },
    /// Print the three-way merge patch for a set of manifests
    Patch {
        /// Last-applied configuration; omitted means `{}`
        #[arg(long)]
        original: Option<PathBuf>,
        #[arg(long)]
        modified: PathBuf,
        #[arg(long)]
        current: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Concurrent reconcile workers
    #[arg(long, env = "SEEDLING_WORKERS", default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    workers: u16,
    /// Per-reconcile deadline in seconds
    #[arg(long, env = "SEEDLING_RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    reconcile_timeout_secs: u64,
    #[arg(long, env = "SEEDLING_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,
    #[arg(long, env = "SEEDLING_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,
    /// How long to wait for a created object to show up in the cache
    #[arg(long, env = "SEEDLING_CACHE_WAIT_TIMEOUT_SECS", default_value_t = 30)]
    cache_wait_timeout_secs: u64,
    #[arg(long, env = "SEEDLING_CACHE_WAIT_INTERVAL_MS", default_value_t = 100)]
    cache_wait_interval_ms: u64,
    /// Namespace holding Seed objects and their kubeconfig Secrets
    #[arg(long, env = "SEEDLING_SEED_NAMESPACE", default_value = "seedling")]
    seed_namespace: String,
    /// How long a cache may take to receive its initial list
    #[arg(long, env = "SEEDLING_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    cache_sync_timeout_secs: u64,
}

/// Seed events folded into one registry sync.
const SEED_BURST: usize = 64;

impl RunArgs {
    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: usize::from(self.workers),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            backoff: Backoff { base: Duration::from_millis(self.backoff_base_ms), max: Duration::from_secs(self.backoff_max_secs) },
        }
    }

    fn cache_sync_timeout(&self) -> Duration { Duration::from_secs(self.cache_sync_timeout_secs) }

    fn wait_config(&self) -> WaitConfig {
        WaitConfig {
            timeout: Duration::from_secs(self.cache_wait_timeout_secs),
            interval: Duration::from_millis(self.cache_wait_interval_ms),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("SEEDLING_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(sock) = addr else { return };
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.with_http_listener(sock).install() {
        Ok(_) => info!(addr = %sock, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

/// Read a YAML or JSON document.
fn read_document(path: &Path) -> Result<Json> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn manifest_resource(doc: Json) -> Result<ManagedResource> {
    let kind_name = doc.get("kind").and_then(Json::as_str).ok_or_else(|| anyhow!("manifest has no kind"))?;
    let kind = Kind::from_kind_name(kind_name).ok_or_else(|| anyhow!("unsupported kind {}", kind_name))?;
    Ok(ManagedResource::from_object_json(kind, doc)?)
}

fn print_json(output: Output, value: &Json) -> Result<()> {
    match output {
        Output::Human => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Json => println!("{}", serde_json::to_string(value)?),
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let client = kube::Client::try_default().await.context("connecting to the control plane")?;
    let control = Arc::new(KubeStore::new("control", client.clone()));
    control.watch_kind(Kind::Project, None);
    control.wait_synced(Kind::Project, args.cache_sync_timeout()).await.context("syncing the project cache")?;

    let handle = RegistryHandle::new(SeedRegistry::new());
    sync_seed_registry(&control, &args.seed_namespace, &handle, args.cache_sync_timeout()).await.context("loading seeds")?;
    let recorder = Arc::new(KubeEventRecorder::new(client.clone(), CONTROLLER_NAME));
    let sync = ProjectSynchronizer::new(
        control.clone() as Arc<dyn ResourceStore>,
        handle.clone(),
        recorder as Arc<dyn EventRecorder>,
    )
    .with_wait(args.wait_config());

    let dispatcher = Dispatcher::new(Arc::new(sync), args.dispatcher_config());
    let watches = EventWatchDispatcher::new(dispatcher.queue());
    let shutdown = CancellationToken::new();

    let projects = {
        let watches = watches.clone();
        let stream = watch_keys(client.clone(), Kind::Project, None);
        tokio::spawn(async move { watches.forward(stream).await })
    };
    let seeds = {
        let stream = watch_keys(client.clone(), Kind::Seed, Some(&args.seed_namespace)).ready_chunks(SEED_BURST);
        let namespace = args.seed_namespace.clone();
        let sync_timeout = args.cache_sync_timeout();
        tokio::spawn(async move {
            watches
                .fan_in(stream, |burst| {
                    let control = control.clone();
                    let handle = handle.clone();
                    let namespace = namespace.clone();
                    async move {
                        match sync_seed_registry(&control, &namespace, &handle, sync_timeout).await {
                            Ok(true) => enqueue_all_projects(control.as_ref()),
                            Ok(false) => Vec::new(),
                            Err(e) => {
                                warn!(events = burst.len(), error = %e, "run: keeping previous seed registry");
                                Vec::new()
                            }
                        }
                    }
                })
                .await
        })
    };

    let stop = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("run: shutdown requested");
        }
        stop.cancel();
    });

    info!(seed_namespace = %args.seed_namespace, workers = args.workers, "run: project synchronizer started");
    dispatcher.run(shutdown).await;
    projects.abort();
    seeds.abort();
    info!("run: stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr);

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Checksum { manifest } => {
            let res = manifest_resource(read_document(&manifest)?)?;
            let sum = payload_checksum(&res)?;
            match cli.output {
                Output::Human => println!("{}", sum),
                Output::Json => println!("{}", serde_json::json!({ "kind": res.kind.kind_name(), "name": res.name, "checksum": sum })),
            }
        }
        Commands::Patch { original, modified, current } => {
            let original = original.as_deref().map(read_document).transpose()?;
            let patch = three_way_merge_patch(original.as_ref(), &read_document(&modified)?, &read_document(&current)?)?;
            print_json(cli.output, &patch)?;
        }
    }
    Ok(())
}
