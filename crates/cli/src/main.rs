use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use opreq_controller::queue::run_workers;
use opreq_controller::{resolve, Context, ControllerConfig, Resolution, WorkQueue};
use opreq_core::{ObjectKey, OperandRegistry, OperandRequest, Record};
use opreq_kubehub::{watch_requests, KubeStore};
use opreq_store::{MemStore, Records};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "opreqctl", version, about = "OperandRequest controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run(RunArgs),
    /// Resolve a request against registry manifests, without a cluster
    Resolve {
        /// OperandRequest manifest (YAML)
        #[arg(long = "request")]
        request: PathBuf,
        /// OperandRegistry manifests (YAML, multi-document allowed)
        #[arg(long = "registry", required = true, num_args = 1..)]
        registries: Vec<PathBuf>,
    },
    /// Print the effective controller configuration
    Config,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Seconds between install/status poll evaluations
    #[arg(long, env = "OPREQ_POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,
    /// Deadline of one poll, in seconds
    #[arg(long, env = "OPREQ_POLL_TIMEOUT_SECS")]
    poll_timeout_secs: Option<u64>,
    /// Delay before re-reconciling a request that is not Running yet
    #[arg(long, env = "OPREQ_REQUEUE_SECS")]
    requeue_secs: Option<u64>,
    /// Reconcile worker count
    #[arg(long, env = "OPREQ_WORKERS")]
    workers: Option<usize>,
    /// Cap of the per-request error backoff, in seconds
    #[arg(long, env = "OPREQ_BACKOFF_MAX_SECS")]
    backoff_max_secs: Option<u64>,
    /// Only watch requests in this namespace
    #[arg(long = "watch-namespace", env = "OPREQ_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
}

impl RunArgs {
    fn apply(&self, mut cfg: ControllerConfig) -> ControllerConfig {
        let secs = |v: Option<u64>| v.filter(|s| *s > 0).map(Duration::from_secs);
        if let Some(d) = secs(self.poll_interval_secs) { cfg.poll_interval = d; }
        if let Some(d) = secs(self.poll_timeout_secs) { cfg.poll_timeout = d; }
        if let Some(d) = secs(self.requeue_secs) { cfg.requeue_after = d; }
        if let Some(d) = secs(self.backoff_max_secs) { cfg.backoff_max = d; }
        if let Some(w) = self.workers.filter(|w| *w > 0) { cfg.workers = w; }
        if let Some(ns) = self.watch_namespace.as_ref().filter(|s| !s.trim().is_empty()) {
            cfg.watch_namespace = Some(ns.clone());
        }
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("OPREQ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OPREQ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OPREQ_METRICS_ADDR; expected host:port");
        }
    }
}

/// Every document in a YAML stream, decoded as `T`. Empty documents are skipped.
fn parse_documents<T: DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        out.push(serde_yaml::from_value(value)?);
    }
    Ok(out)
}

fn load<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_documents(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Load the manifests into an in-memory store and resolve the request there.
async fn resolve_offline(mut request: OperandRequest, registries: Vec<OperandRegistry>) -> Result<Resolution> {
    if request.metadata.namespace.is_empty() {
        request.metadata.namespace = "default".to_string();
    }
    request.set_defaults();
    let records = Records::new(Arc::new(MemStore::new()));
    for mut reg in registries {
        if reg.metadata.namespace.is_empty() {
            reg.metadata.namespace = request.metadata.namespace.clone();
        }
        records.create_if_absent(&reg).await.with_context(|| format!("loading registry {}", reg.key()))?;
    }
    Ok(resolve::resolve(&records, &request).await?)
}

fn print_resolution(res: &Resolution, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(res)?),
        Output::Human => {
            println!("{:<20} {:<24} {:<32} {}", "OPERAND", "REGISTRY", "TARGET", "CHANNEL");
            for c in &res.components {
                println!("{:<20} {:<24} {:<32} {}", c.operand, c.registry.to_string(), c.target.to_string(), c.operator.channel);
            }
            println!("namespaces: {}", res.namespaces.join(", "));
        }
    }
    Ok(())
}

async fn run(config: ControllerConfig) -> Result<()> {
    let store = KubeStore::try_default().await?;
    match store.server_version().await {
        Ok(v) => info!(version = %v, "connected to API server"),
        Err(e) => warn!(error = %e, "could not read API server version"),
    }
    let client = store.client();
    let ctx = Arc::new(Context::new(Records::new(Arc::new(store)), config));
    let queue = Arc::new(WorkQueue::new(ctx.config.requeue_after, ctx.config.backoff_max));
    info!(config = ?ctx.config, "controller starting");

    let (key_tx, mut key_rx) = mpsc::channel::<ObjectKey>(1024);
    let mut watcher = tokio::spawn({
        let ns = ctx.config.watch_namespace.clone();
        async move { watch_requests(client, ns.as_deref(), key_tx).await }
    });
    let pump = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move {
            while let Some(key) = key_rx.recv().await {
                queue.add(key);
            }
        }
    });
    let workers = run_workers(Arc::clone(&ctx), Arc::clone(&queue));

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            Ok(())
        }
        res = &mut watcher => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = ?e, "request watcher failed");
                Err(e)
            }
            Err(e) => Err(anyhow::anyhow!("request watcher panicked: {e}")),
        },
    };

    queue.shutdown();
    watcher.abort();
    pump.abort();
    // Reconciles blocked in a poll are abandoned; the next start re-enters them.
    if tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(workers)).await.is_err() {
        warn!("workers still busy after 10s; exiting anyway");
    }
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args.apply(ControllerConfig::from_env())).await?,
        Commands::Resolve { request, registries } => {
            let mut requests: Vec<OperandRequest> = load(&request)?;
            if requests.len() != 1 {
                bail!("{} must hold exactly one OperandRequest, found {}", request.display(), requests.len());
            }
            let mut regs = Vec::new();
            for path in &registries {
                regs.extend(load::<OperandRegistry>(path)?);
            }
            let res = resolve_offline(requests.remove(0), regs).await?;
            print_resolution(&res, cli.output)?;
        }
        Commands::Config => {
            let cfg = ControllerConfig::from_env();
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
                Output::Human => {
                    println!("poll interval:   {:?}", cfg.poll_interval);
                    println!("poll timeout:    {:?}", cfg.poll_timeout);
                    println!("requeue after:   {:?}", cfg.requeue_after);
                    println!("workers:         {}", cfg.workers);
                    println!("backoff max:     {:?}", cfg.backoff_max);
                    println!("watch namespace: {}", cfg.watch_namespace.as_deref().unwrap_or("<all>"));
                }
            }
        }
    }
    Ok(())
}
