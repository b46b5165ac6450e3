use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use renderq_core::api::{self, ApiState};
use renderq_core::config::{config_path, data_dir, desired_port, initialize_data_dir, AppConfig, ENV_PORT};
use renderq_core::decoder::FfmpegFrameDecoder;
use renderq_core::engine::ProcessRenderEngine;
use renderq_core::gateway::FrameDecodeGateway;
use renderq_core::job::{JobSnapshot, JobStatus, RenderRequest};
use renderq_core::logging::{self, FileSink, LogOptions, PanicHookStatus, DEFAULT_LOG_FILTER};
use renderq_core::port::{PortBinder, PortRequest};
use renderq_core::queue::{QueueEvent, RenderJobQueue};
use renderq_core::runner::JobRunner;
use renderq_core::server::{AssetServer, RunningAssetServer, RunningServer, ServerOptions};

#[derive(Parser)]
#[command(
    name = "renderq",
    about = "Render job queue and local asset server",
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

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the studio API and asset servers until interrupted (default).
    Serve(ServeArgs),
    /// Render a single request file and exit.
    Render(RenderArgs),
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, help = "Directory served as static files by the asset server")]
    public_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RenderArgs {
    #[arg(help = "Path to a render request JSON file")]
    request: PathBuf,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Some(Commands::Render(args)) => render_once(args.request, resolved_data_dir).await,
        Some(Commands::Serve(args)) => run_server(args, resolved_data_dir).await,
        None => run_server(cli.serve, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook = logging::install_panic_hook(data_dir);

    let options = LogOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_filters(&options);

    let mut disabled_reason = None;
    let file_layer = match logging::build_file_sink(&options) {
        FileSink::Rolling { appender, .. } => Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(logging::RedactingMakeWriter::new(appender))
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
        ),
        disabled @ FileSink::Disabled { .. } => {
            disabled_reason = Some(disabled);
            None
        }
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(parse_env_filter_with_fallback(&filters.console, "console")),
        )
        .with(file_layer);

    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(FileSink::Disabled {
        attempted_log_dir,
        reason,
    }) = disabled_reason
    {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookStatus::Unavailable { reason } = panic_hook {
        warn!(reason = %reason, "Panic crash artifact hook unavailable");
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

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(err) = initialize_data_dir(data_dir) {
        warn!(error = %err, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Queue, decoder, asset server and runner shared by both commands.
struct Services {
    queue: RenderJobQueue,
    assets: RunningAssetServer,
    shutdown: CancellationToken,
    runner: tokio::task::JoinHandle<()>,
}

impl Services {
    async fn start(
        config: &AppConfig,
        data_dir: &Path,
        binder: &PortBinder,
        listen_host: IpAddr,
        public_dir: Option<PathBuf>,
        queue: RenderJobQueue,
        gateway: Arc<FrameDecodeGateway>,
    ) -> Result<Self> {
        let asset_options = ServerOptions {
            binder: binder.clone(),
            port: PortRequest::new(None, config.server.port_range()),
            listen_host,
            bind_attempts: config.server.bind_attempts,
        };
        let public_dir = public_dir.or_else(|| config.public_dir(data_dir));
        let assets = AssetServer::start(public_dir, &asset_options, gateway)
            .await
            .context("failed to start asset server")?;

        let mut settings = config.runner_settings(data_dir);
        settings.serve_url = Some(format!("http://localhost:{}", assets.port()));
        let engine = Arc::new(ProcessRenderEngine::new(
            config.render.engine_program.clone(),
            config.render.engine_args.clone(),
        ));
        let shutdown = CancellationToken::new();
        let runner = JobRunner::new(queue.clone(), engine, settings).spawn(shutdown.clone());

        Ok(Self {
            queue,
            assets,
            shutdown,
            runner,
        })
    }

    async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.runner.await {
            error!(error = %err, "Render job runner task failed");
        }
        if let Err(err) = self.assets.close().await {
            warn!(error = %err, "Asset server did not close cleanly");
        }
    }
}

fn build_gateway(config: &AppConfig) -> Arc<FrameDecodeGateway> {
    let decoder = Arc::new(FfmpegFrameDecoder::new(config.decode.ffmpeg_path.clone()));
    Arc::new(FrameDecodeGateway::new(decoder, config.decode.gateway_settings()))
}

async fn run_server(args: ServeArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let binder = PortBinder::new();
    let queue = RenderJobQueue::new(config.queue.max_concurrency);
    let gateway = build_gateway(&config);

    let env_port = std::env::var(ENV_PORT).ok();
    let port = desired_port(args.port, env_port.as_deref(), &config.server)?;
    let listen_host = config.server.listen_host(args.host.as_deref())?;
    let studio_options = ServerOptions {
        binder: binder.clone(),
        port: PortRequest::new(port, config.server.port_range()),
        listen_host,
        bind_attempts: config.server.bind_attempts,
    };
    let studio = RunningServer::start(
        api::router(ApiState {
            queue: queue.clone(),
            gateway: Some(gateway.clone()),
        }),
        &studio_options,
    )
    .await
    .context("failed to start studio server")?;

    let services = match Services::start(
        &config,
        &data_dir,
        &binder,
        listen_host,
        args.public_dir,
        queue,
        gateway,
    )
    .await
    {
        Ok(services) => services,
        Err(err) => {
            let _ = studio.close().await;
            return Err(err);
        }
    };

    info!(
        studio_port = studio.port(),
        asset_port = services.assets.port(),
        "renderq is ready"
    );
    if let Some(requested) = port.filter(|requested| *requested != studio.port()) {
        warn!(requested, actual = studio.port(), "Requested port was busy; studio is on another port");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    services.stop().await;
    studio.close().await?;
    Ok(())
}

async fn render_once(request_path: PathBuf, data_dir: PathBuf) -> Result<()> {
    let raw = tokio::fs::read_to_string(&request_path)
        .await
        .with_context(|| format!("failed to read render request: {}", request_path.display()))?;
    let request: RenderRequest = serde_json::from_str(&raw)
        .with_context(|| format!("invalid render request: {}", request_path.display()))?;

    let config = load_config(&data_dir);
    let binder = PortBinder::new();
    let queue = RenderJobQueue::new(1);
    let gateway = build_gateway(&config);
    let listen_host = config.server.listen_host(None)?;
    let services =
        Services::start(&config, &data_dir, &binder, listen_host, None, queue, gateway).await?;

    let mut events = services.queue.subscribe();
    let id = services.queue.add_job(request)?;
    info!(job_id = %id, "Render queued");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let finished = loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                warn!(job_id = %id, "Interrupted; cancelling render");
                services.queue.cancel_job(&id).await?;
            }
            event = events.recv() => match event {
                Ok(QueueEvent::JobUpdated { job }) if job.id == id => {
                    print_progress(&job);
                    if job.status.is_terminal() {
                        break job;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(job) = services.queue.get_job(&id).filter(|job| job.status.is_terminal()) {
                        break job;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    bail!("queue event stream closed before job {id} finished");
                }
            }
        }
    };
    eprintln!();

    services.stop().await;
    report_outcome(&finished, &config.runner_settings(&data_dir).output_dir)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn print_progress(job: &JobSnapshot) {
    let Some(progress) = job.progress.as_ref() else {
        eprint!("\r{:?}    ", job.status);
        return;
    };
    let fraction = progress.value.clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));
    let frames = match progress.total_frames {
        Some(total) => format!("{}/{total}", progress.rendered_frames),
        None => progress.rendered_frames.to_string(),
    };
    eprint!(
        "\r[{bar}] {:5.1}% | {:?} | Frame {frames} | Encoded {}    ",
        fraction * 100.0,
        progress.stage,
        progress.encoded_frames,
    );
}

fn report_outcome(job: &JobSnapshot, output_dir: &Path) -> Result<()> {
    let elapsed = match (job.started_at, job.completed_at) {
        (Some(start), Some(end)) => (end - start).to_std().unwrap_or(Duration::ZERO),
        _ => Duration::ZERO,
    };
    match job.status {
        JobStatus::Done => {
            info!(
                job_id = %job.id,
                output = %output_dir.join(&job.out_name).display(),
                elapsed = %format_duration(elapsed.as_secs_f64()),
                "Render finished"
            );
            Ok(())
        }
        JobStatus::Cancelled => bail!("render {} was cancelled", job.id),
        _ => {
            let message = job
                .error
                .as_ref()
                .map(|err| err.message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("render {} failed: {message}", job.id)
        }
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}
