#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use photofinder::config::{default_config_path, load_config, PhotofinderConfig};
use photofinder::ingest::source::parse_url_list;
use photofinder::listing::{list_images, write_url_list, HttpDriveApi};
use photofinder::query;
use photofinder::server::{self, AppContext};

#[derive(Parser)]
#[command(name = "photofinder")]
#[command(about = "Find yourself in shared event photos", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.photofinder/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every photo listed in a file of Drive share links
    Process {
        /// Text file with one share link per line
        #[arg(long)]
        urls_file: PathBuf,
        /// Items per worker group
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Run the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Find stored photos containing the face in a selfie
    Query {
        /// Selfie image file
        #[arg(long)]
        selfie: PathBuf,
        /// Minimum cosine similarity (0.0-1.0)
        #[arg(long)]
        threshold: Option<f32>,
        /// Maximum number of matches
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Write share links for every image under a Drive folder tree
    ListUrls {
        #[arg(long)]
        folder_id: String,
        #[arg(short, long, default_value = "urls.txt")]
        output: PathBuf,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create a default config file
    Init,
    /// Show path to the config file
    Path,
    /// Print the effective configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Serve { host, port } => run_server(&config_path, host, port),
        Commands::Process {
            urls_file,
            batch_size,
        } => {
            init_tracing(true);
            handle_process(&config_path, &urls_file, batch_size)
        }
        Commands::Query {
            selfie,
            threshold,
            limit,
        } => {
            init_tracing(true);
            handle_query(&config_path, &selfie, threshold, limit)
        }
        Commands::ListUrls { folder_id, output } => {
            init_tracing(true);
            handle_list_urls(&folder_id, &output)
        }
        Commands::Config { action } => handle_config(&config_path, action),
    }
}

/// JSON logs unless `force_text` or PHOTOFINDER_LOG_TEXT=1.
fn init_tracing(force_text: bool) {
    let text_logging = force_text
        || std::env::var("PHOTOFINDER_LOG_TEXT")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "photofinder=info".into());

    if text_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Helper: build a multi-threaded tokio runtime for CLI commands.
fn cli_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

fn run_server(config_path: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    init_tracing(false);

    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    // Extraction runs on the blocking pool; cap it so ONNX threads don't oversubscribe.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads((num_cpus / 2).max(2))
        .max_blocking_threads(num_cpus.max(4))
        .thread_name("photofinder-worker")
        .enable_all()
        .build()?;

    tracing::info!(
        "Tokio runtime configured: {} worker threads, {} max blocking threads",
        (num_cpus / 2).max(2),
        num_cpus.max(4)
    );

    rt.block_on(async {
        let mut config = load_config(config_path);
        if let Some(host) = host {
            config.server.host = host;
        }
        if let Some(port) = port {
            config.server.port = port;
        }
        let host = config.server.host.clone();
        let port = config.server.port;

        tracing::info!("photofinder starting (pid {})", std::process::id());
        let ctx = Arc::new(AppContext::initialize(config).await?);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            token.cancel();
        });

        server::serve(ctx, &host, port, cancel).await?;
        anyhow::Ok(())
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn handle_process(
    config_path: &Path,
    urls_file: &Path,
    batch_size: Option<usize>,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(urls_file)
        .with_context(|| format!("cannot read {}", urls_file.display()))?;
    let items = parse_url_list(&text);
    if items.is_empty() {
        eprintln!("No URLs found in {}", urls_file.display());
        return Ok(());
    }

    let config = load_config(config_path);
    let batch_size = batch_size.unwrap_or(config.ingest.batch_size);
    if batch_size == 0 {
        anyhow::bail!("--batch-size must be at least 1");
    }

    let rt = cli_runtime()?;
    rt.block_on(async {
        let ctx = AppContext::initialize(config).await?;
        tracing::info!("Processing {} URLs", items.len());
        let summary = ctx.ingest(items, batch_size).await?;

        println!("{}", serde_json::to_string_pretty(&summary.report())?);
        println!("Audit written to {}", ctx.audit_path.display());
        anyhow::Ok(())
    })
}

fn handle_query(
    config_path: &Path,
    selfie: &Path,
    threshold: Option<f32>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(selfie).with_context(|| format!("cannot read {}", selfie.display()))?;
    let config = load_config(config_path);
    let threshold = threshold.unwrap_or(config.query.threshold);
    let limit = limit.unwrap_or(config.query.limit);
    query::validate_params(threshold, limit)?;

    let rt = cli_runtime()?;
    rt.block_on(async {
        let ctx = AppContext::initialize(config).await?;
        let matches = query::find_by_selfie(
            &ctx.extractor,
            ctx.store.as_ref(),
            &ctx.store_circuit,
            bytes,
            threshold,
            limit,
        )
        .await?;

        let out = json!({
            "success": true,
            "match_count": matches.len(),
            "matches": matches,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        anyhow::Ok(())
    })
}

fn handle_list_urls(folder_id: &str, output: &Path) -> anyhow::Result<()> {
    let api = HttpDriveApi::from_env()?;
    let rt = cli_runtime()?;
    rt.block_on(async {
        let images = list_images(&api, folder_id).await?;
        let written = write_url_list(output, &images)?;
        println!("Wrote {} URLs to {}", written, output.display());
        anyhow::Ok(())
    })
}

fn handle_config(config_path: &Path, action: Option<ConfigAction>) -> anyhow::Result<()> {
    match action {
        Some(ConfigAction::Path) => {
            println!("{}", config_path.display());
        }
        Some(ConfigAction::Init) => {
            if config_path.exists() {
                eprintln!("Config already exists: {}", config_path.display());
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(config_path, DEFAULT_CONFIG)?;
            println!("Created: {}", config_path.display());
        }
        Some(ConfigAction::Show) | None => {
            let mut config: PhotofinderConfig = load_config(config_path);
            if config.store.supabase_key.is_some() {
                config.store.supabase_key = Some("<redacted>".into());
            }
            println!("# Effective config ({})\n", config_path.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# photofinder configuration
# See: photofinder config --help

[server]
host = "0.0.0.0"
port = 8000

[ingest]
batch_size = 10
# worker_cap = 8   # defaults to the number of CPU cores
max_retries = 3
retry_delay_secs = 5
request_timeout_secs = 30
audit_path = "processing_results.json"

[store]
backend = "lance"   # or "supabase" (SUPABASE_URL / SUPABASE_KEY)
table = "photos"
vector_dim = 512

[model]
detector_path = "models/det_10g.onnx"
recognizer_path = "models/w600k_r50.onnx"
det_size = 640
score_threshold = 0.5
pool_size = 2

[query]
threshold = 0.8
limit = 1000
"#;
