use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use herald_core::HeraldConfig;
use herald_store::{MailStore, RequeueScope, SqliteStore};
use herald_worker::{
    DispatchEngine, DryRunTransport, EngineOptions, Mailer, QueueMailer, TestRequest, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "herald", version)]
/// Campaign mail dispatcher
struct Cli {
    #[arg(short, long, global = true)]
    /// config file (falls back to HERALD_CONFIG, then ~/.herald/herald.toml)
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// run the dispatch loop until interrupted
    Run,

    /// dispatch one campaign now, without waiting for the next tick
    Launch {
        campaign_id: i64,
    },

    /// send a single test mail and wait for the outcome
    TestSend {
        #[arg(long)]
        to: String,

        #[arg(long, default_value = "Herald test mail")]
        subject: String,

        #[arg(long, default_value = "herald@localhost")]
        from: String,

        #[arg(long, default_value = "This is a test message sent by herald.")]
        body: String,
    },

    /// hand mail errored by an unresolvable campaign back to the scan loop
    Requeue {
        campaign_id: i64,

        #[arg(long, default_value_t = false)]
        /// also unlock pending mail still claimed; only with no herald daemon running
        force: bool,
    },

    /// print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_daemon=info,herald_worker=info,herald_store=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = HeraldConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        HeraldConfig::default()
    });

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run => run(&config).await,
        Command::Launch { campaign_id } => launch(&config, campaign_id).await,
        Command::TestSend {
            to,
            subject,
            from,
            body,
        } => test_send(&config, TestRequest::new(&to, &from, &subject, &body)).await,
        Command::Requeue { campaign_id, force } => {
            let store = open_store(&config)?;
            let scope = if force {
                RequeueScope::IncludeInFlight
            } else {
                RequeueScope::Unresolved
            };
            let released = store.requeue_campaign(campaign_id, scope).await?;
            info!(campaign_id, released, "campaign mail requeued");
            println!("{released}");
            Ok(())
        }
    }
}

/// Everything a dispatching subcommand needs, wired to one cancellation token.
struct Runtime {
    engine: Arc<DispatchEngine>,
    mailer: Arc<QueueMailer>,
    cancel: CancellationToken,
    mailer_task: tokio::task::JoinHandle<()>,
}

impl Runtime {
    fn start(config: &HeraldConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn MailStore> = Arc::new(open_store(config)?);
        let mailer = Arc::new(QueueMailer::new(
            build_transport(config)?,
            config.delivery.queue_capacity,
            config.dispatch.max_send_attempts,
        ));
        let cancel = CancellationToken::new();

        let mailer_task = {
            let mailer = mailer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { mailer.start(cancel).await })
        };

        let engine = Arc::new(DispatchEngine::new(
            store,
            mailer.clone(),
            EngineOptions::from(&config.dispatch),
            cancel.clone(),
        ));

        Ok(Self {
            engine,
            mailer,
            cancel,
            mailer_task,
        })
    }

    /// Let the mailer finish what it accepted, then stop it.
    async fn finish(self) -> anyhow::Result<()> {
        self.engine.wait_idle().await;
        self.mailer.flush().await;
        self.cancel.cancel();
        self.mailer_task.await.context("mailer task panicked")?;
        Ok(())
    }
}

async fn run(config: &HeraldConfig) -> anyhow::Result<()> {
    let rt = Runtime::start(config)?;

    let engine_task = {
        let engine = rt.engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    shutdown_signal().await;
    info!("shutdown requested");
    rt.cancel.cancel();

    if let Err(e) = engine_task.await {
        error!(error = %e, "dispatch engine task failed");
    }
    rt.mailer_task.await.context("mailer task panicked")?;
    info!("herald stopped");
    Ok(())
}

async fn launch(config: &HeraldConfig, campaign_id: i64) -> anyhow::Result<()> {
    let rt = Runtime::start(config)?;
    let outcome = rt.engine.launch_campaign(campaign_id).await;
    rt.finish().await?;

    let report = outcome.with_context(|| format!("launching campaign {campaign_id}"))?;
    info!(
        campaign_id,
        forwarded = report.forwarded,
        deferred = report.deferred,
        "campaign launch finished"
    );
    Ok(())
}

async fn test_send(config: &HeraldConfig, request: TestRequest) -> anyhow::Result<()> {
    let rt = Runtime::start(config)?;
    let to = request.to.clone();
    let outcome = rt.engine.send_test(request).await;
    rt.finish().await?;

    match outcome {
        Ok(()) => {
            info!(%to, "test mail sent");
            Ok(())
        }
        Err(e) => bail!("test mail to {to} failed: {e}"),
    }
}

fn open_store(config: &HeraldConfig) -> anyhow::Result<SqliteStore> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let conn = rusqlite::Connection::open(db_path)
        .with_context(|| format!("opening database {db_path}"))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
    Ok(SqliteStore::new(conn)?)
}

fn build_transport(config: &HeraldConfig) -> anyhow::Result<Arc<dyn Transport>> {
    if !config.delivery.dry_run {
        bail!("delivery.dry_run = false needs an SMTP transport, and none is built in");
    }
    Ok(Arc::new(DryRunTransport))
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
