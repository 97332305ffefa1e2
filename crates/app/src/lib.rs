use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use recolor_core::backend::InferenceBackend;
use recolor_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use recolor_core::fetch::{ArtifactFetcher, FetchReport};
use recolor_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use recolor_core::model::{ColorizationModel, ModelPaths};
use recolor_core::onnx_graph;
use recolor_core::pipeline;
use recolor_core::server::{app_router, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "recolor",
    about = "Automatic colorization of grayscale photographs",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory holding config.toml and logs")]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Inference backend override (cpu or cuda)")]
    backend: Option<InferenceBackend>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Colorize a single image file and write a PNG.
    Colorize(ColorizeArgs),
    /// Download missing model artifacts into the models directory.
    ///
    /// Only the cluster points have a default source. The ONNX network and
    /// its weight file are fetched once `fetch.sources.network` and
    /// `fetch.sources.weights` are set in config.toml; otherwise copy them
    /// into the models directory by hand.
    FetchModels,
    /// Print a JSON summary of an ONNX graph.
    InspectModel(InspectArgs),
}

#[derive(Args, Debug)]
struct ColorizeArgs {
    #[arg(help = "Grayscale input image")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output PNG path")]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(help = "ONNX file to inspect (defaults to the configured network graph)")]
    path: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    recolor_core::runtime::setup_runtime_libs();
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    recolor_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    let mut config = AppConfig::load_or_default(&resolved_data_dir);
    if let Some(backend) = cli.backend {
        config.model.backend = backend;
    }

    match cli.command {
        Some(Commands::Colorize(args)) => {
            tokio::task::spawn_blocking(move || colorize_file(&config, &args.input, &args.output))
                .await
                .context("colorize task panicked")?
        }
        Some(Commands::FetchModels) => {
            let report = tokio::task::spawn_blocking(move || fetch_missing(&config))
                .await
                .context("fetch task panicked")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.complete() {
                bail!("some model artifacts are still missing");
            }
            Ok(())
        }
        Some(Commands::InspectModel(args)) => {
            let path = args
                .path
                .unwrap_or_else(|| ModelPaths::from_config(&config).network);
            let inspection = onnx_graph::inspect_onnx(&path)?;
            println!("{}", serde_json::to_string_pretty(&inspection)?);
            Ok(())
        }
        None => run_server(cli.port, cli.host, config).await,
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Disabled { reason } = &panic_hook_plan {
        eprintln!("Warning: crash report hook unavailable ({reason}). Panics will not be persisted.");
    }

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filters.effective_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Disabled { reason } = panic_hook_plan {
        warn!(reason = %reason, "Crash report hook unavailable");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn fetch_missing(config: &AppConfig) -> FetchReport {
    let fetcher = ArtifactFetcher::new(
        ModelPaths::from_config(config),
        config.fetch.sources.clone(),
    );
    fetcher.ensure_present()
}

/// Fetch missing artifacts when enabled, then build the model handle.
fn load_model(config: &AppConfig) -> Result<ColorizationModel> {
    let paths = ModelPaths::from_config(config);

    if config.fetch.auto_fetch {
        let fetcher = ArtifactFetcher::new(paths.clone(), config.fetch.sources.clone());
        if !fetcher.missing_artifacts().is_empty() {
            let report = fetcher.ensure_present();
            if !report.complete() {
                warn!(
                    models_dir = %config.paths.models_dir.display(),
                    "Model artifacts are incomplete after fetching; place them in the models \
                     directory or configure fetch.sources in config.toml"
                );
            }
        }
    }

    ColorizationModel::load(&paths, config.model.backend).context("model unavailable")
}

fn colorize_file(config: &AppConfig, input: &Path, output: &Path) -> Result<()> {
    let model = load_model(config)?;
    let bytes = std::fs::read(input)
        .with_context(|| format!("failed to read input image: {}", input.display()))?;

    let started = Instant::now();
    let image = pipeline::colorize(&model, &bytes)?;
    std::fs::write(output, &image.png)
        .with_context(|| format!("failed to write output image: {}", output.display()))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        width = image.width,
        height = image.height,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Colorized image written"
    );
    Ok(())
}

fn resolve_port(port_override: Option<u16>, env_port: Option<&str>, config: &AppConfig) -> u16 {
    port_override
        .or_else(|| env_port.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(config.server.port)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
) -> Result<()> {
    let port = resolve_port(port_override, std::env::var("PORT").ok().as_deref(), &config);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let model_config = config.clone();
    let model = tokio::task::spawn_blocking(move || load_model(&model_config))
        .await
        .context("model loading task panicked")??;

    let app = app_router(AppState::with_model(model, config));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting recolor server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
