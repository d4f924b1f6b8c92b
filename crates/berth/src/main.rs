use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use berth::api::{self, AppState};
use berth::bridge::NativePtySpawner;
use berth::container::{ContainerEngine, ContainerRuntime};
use berth::db::Database;
use berth::scheduler::ExpiryScheduler;
use berth::session::{SessionManager, SessionRecord, SessionRegistry};
use berth::settings::{self, APP_NAME, AppConfig, SandboxConfig};

/// How long connections get to park their sessions on shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: AsyncCommand) -> Result<()> {
    match command {
        AsyncCommand::Serve(cmd) => handle_serve(&ctx, cmd).await,
        AsyncCommand::Sessions(cmd) => handle_sessions(&ctx, cmd).await,
    }
}

enum AsyncCommand {
    Serve(ServeCommand),
    Sessions(SessionsCommand),
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, AsyncCommand::Serve(cmd)),
        Command::Sessions { command } => async_main(ctx, AsyncCommand::Sessions(command)),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Berth - per-user sandboxed terminals in containers.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP and WebSocket server
    Serve(ServeCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Inspect persisted sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    /// List session records
    List,
    /// Run one pass of the expiry scheduler now
    Sweep,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config {
            Some(ref path) => settings::expand_str_path(&path.to_string_lossy())?,
            None => settings::default_config_file()?,
        };
        let config = settings::load_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

        // `try_init` also routes `log` records into the subscriber.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            LevelFilter::Error
        } else if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    async fn database(&self) -> Result<Database> {
        let url = settings::database_url(&self.config)?;
        debug!("database: {}", url);
        Database::connect(&url, self.config.database.max_connections).await
    }

    fn engine(&self) -> Arc<dyn ContainerEngine> {
        Arc::new(ContainerRuntime::from_settings(
            self.config.engine.runtime,
            self.config.engine.binary.as_deref(),
        ))
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Init { force } => {
            if ctx.config_file.exists() && !force {
                info!(
                    "config already exists at {} (use --force to overwrite)",
                    ctx.config_file.display()
                );
                return Ok(());
            }
            settings::write_default_config(&ctx.config_file)?;
            info!("wrote default config to {}", ctx.config_file.display());
            Ok(())
        }
    }
}

async fn handle_sessions(ctx: &RuntimeContext, command: SessionsCommand) -> Result<()> {
    let db = ctx.database().await?;
    let registry = SessionRegistry::new(&db);

    match command {
        SessionsCommand::List => {
            let sessions = registry.list().await.context("listing sessions")?;
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&sessions).context("serializing sessions")?
                );
            } else {
                print_sessions(&sessions);
            }
        }
        SessionsCommand::Sweep => {
            let sandbox = SandboxConfig::from_app_config(&ctx.config);
            let scheduler = ExpiryScheduler::new(&db, sandbox.scheduler_batch_size);
            // Registers the cleanup handler on the scheduler.
            let _manager = SessionManager::new(
                registry,
                scheduler.clone(),
                ctx.engine(),
                Arc::new(NativePtySpawner::default()),
                Arc::new(sandbox),
                CancellationToken::new(),
            );
            let consumed = scheduler
                .run_due(chrono::Utc::now())
                .await
                .context("running expiry scheduler")?;
            println!("{consumed} task(s) consumed");
        }
    }
    Ok(())
}

fn print_sessions(sessions: &[SessionRecord]) {
    if sessions.is_empty() {
        println!("no sessions");
        return;
    }
    println!(
        "{:<20} {:<13} {:<32} {:<10} {:<25}",
        "USER", "STATE", "CONTAINER", "LESSON", "EXPIRES"
    );
    for s in sessions {
        let expires = s
            .expires_at
            .at()
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<13} {:<32} {:<10} {:<25}",
            s.user_id, s.state, s.container_name, s.lesson_type, expires
        );
    }
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let sandbox = Arc::new(SandboxConfig::from_app_config(&ctx.config));
    let engine = ctx.engine();

    match engine.health_check().await {
        Ok(version) => info!("Container engine ready ({})", version.trim()),
        Err(e) => warn!("Container engine not reachable: {}", e),
    }

    let db = ctx.database().await?;
    let shutdown = CancellationToken::new();
    let scheduler = ExpiryScheduler::new(&db, sandbox.scheduler_batch_size);
    let sessions = Arc::new(SessionManager::new(
        SessionRegistry::new(&db),
        scheduler.clone(),
        engine,
        Arc::new(NativePtySpawner::default()),
        sandbox.clone(),
        shutdown.clone(),
    ));

    sessions
        .startup_recovery()
        .await
        .context("recovering sessions")?;

    let poller_stop = CancellationToken::new();
    let poller = scheduler.spawn_poller(sandbox.scheduler_poll_interval, poller_stop.clone());

    let app = api::create_router(AppState::new(sessions.clone()));

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    info!("Listening on http://{}", addr);

    let signal_shutdown = shutdown.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        info!("Shutdown signal received, parking sessions...");
        signal_shutdown.cancel();
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    sessions.shutdown(SHUTDOWN_DRAIN_TIMEOUT).await;
    poller_stop.cancel();
    if let Err(e) = poller.await {
        warn!("scheduler poller ended abnormally: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
