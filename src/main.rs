use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use chat_moderator::classify::{
    ClassifierBackend, ClassifierSet, ContentSafetyClassifier, ContentSafetyConfig,
    ContextualClassifier, RuleClassifier, create_context_model,
};
use chat_moderator::config::{AppConfig, ModerationMode};
use chat_moderator::executor::ActionExecutor;
use chat_moderator::notify::{
    EmailConfig, EmailNotifier, FanoutNotifier, LogNotifier, Notifier, WebhookNotifier,
};
use chat_moderator::policy::{FilePolicySource, PolicyStore};
use chat_moderator::poller::{BackoffConfig, PollLoop, PollerConfig};
use chat_moderator::status::{StatusState, status_routes};
use chat_moderator::store::{LibSqlBackend, ModerationStore};
use chat_moderator::transport::{ChannelTransport, GraphConfig, GraphTransport};

/// Chat moderator: polls channels and enforces the moderation policy.
#[derive(Parser, Debug)]
#[command(name = "chat-moderator", version, about, long_about = None)]
struct Cli {
    /// Decide and record only; no deletes, marks, or notifications.
    #[arg(long)]
    dry_run: bool,

    /// Only poll this channel (id or display name).
    #[arg(long, value_name = "NAME")]
    channel: Option<String>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    /// Directory with channels.json and policies.json.
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// Database file.
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Serve the read-only status API on this port.
    #[arg(long, value_name = "PORT")]
    status_port: Option<u16>,

    /// Also write logs to this file (rotated daily).
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false));

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "moderator.log".to_string());
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix));
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if cli.dry_run {
        config.mode = ModerationMode::Monitor;
    }
    if let Some(dir) = cli.config_dir {
        config.config_dir = dir;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if cli.status_port.is_some() {
        config.status_port = cli.status_port;
    }
    if cli.log_file.is_some() {
        config.log_file = cli.log_file;
    }

    let _log_guard = init_tracing(config.log_file.as_deref());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = if config.dry_run() { "monitor" } else { "enforce" },
        config_dir = %config.config_dir.display(),
        once = cli.once,
        "Chat moderator starting"
    );

    // ── Policy ───────────────────────────────────────────────────────────
    let source = Arc::new(FilePolicySource::new(config.config_dir.clone()));
    let policy = Arc::new(
        PolicyStore::load(source)
            .await
            .context("Failed to load moderation policy")?,
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn ModerationStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Classifiers ──────────────────────────────────────────────────────
    let mut backends: Vec<Arc<dyn ClassifierBackend>> = Vec::new();
    if let Some(cs) = ContentSafetyConfig::from_env()? {
        tracing::info!(endpoint = %cs.endpoint, "Content safety classifier enabled");
        backends.push(Arc::new(ContentSafetyClassifier::new(
            cs,
            config.classify_timeout,
        )));
    }
    if let Some(llm) = &config.llm {
        let model = create_context_model(llm)?;
        backends.push(Arc::new(ContextualClassifier::new(model)));
    }
    if config.rules_enabled {
        backends.push(Arc::new(RuleClassifier::default_rules()));
    }
    if backends.is_empty() {
        bail!("No classifier backends configured");
    }
    let classifiers = Arc::new(ClassifierSet::new(backends, config.classify_timeout));

    // ── Transport ────────────────────────────────────────────────────────
    let graph = GraphConfig::from_env().context("Missing Teams credentials")?;
    let transport: Arc<dyn ChannelTransport> = Arc::new(GraphTransport::new(graph)?);

    // ── Notifications ────────────────────────────────────────────────────
    let mut sinks: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(webhook) = WebhookNotifier::from_env(config.transport_timeout) {
        sinks.push(Arc::new(webhook));
    }
    if let Some(email) = EmailConfig::from_env()? {
        sinks.push(Arc::new(EmailNotifier::new(email)));
    }
    let fanout = FanoutNotifier::new(sinks);
    tracing::info!(notifiers = ?fanout.names(), "Notifiers configured");
    let notifier: Arc<dyn Notifier> = Arc::new(fanout);

    let executor = Arc::new(
        ActionExecutor::new(Arc::clone(&transport), notifier, config.dry_run())
            .with_transport_timeout(config.transport_timeout),
    );

    // ── Poll loop ────────────────────────────────────────────────────────
    let poller_config = PollerConfig {
        interval: config.poll_interval,
        cycle_budget: config.cycle_budget,
        max_concurrent_channels: config.max_concurrent_channels,
        backoff: BackoffConfig {
            base: config.poll_interval,
            max_multiplier: config.max_backoff_multiplier,
            jitter: config.backoff_jitter,
        },
        channel_filter: cli.channel,
        transport_timeout: config.transport_timeout,
    };
    let mut poll_loop = PollLoop::new(
        transport,
        classifiers,
        Arc::clone(&store),
        Arc::clone(&policy),
        executor,
        poller_config,
    );

    // ── Status API ───────────────────────────────────────────────────────
    if let Some(port) = config.status_port {
        let app = status_routes(StatusState {
            store: Arc::clone(&store),
            policy: Arc::clone(&policy),
            health: poll_loop.health_board(),
            dry_run: config.dry_run(),
        });
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Failed to bind status port {port}"))?;
        tracing::info!(port, "Status API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Status server stopped");
            }
        });
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested; finishing current message");
            let _ = shutdown_tx.send(true);
        }
    });

    if cli.once {
        let report = poll_loop.run_cycle(&shutdown_rx).await;
        tracing::info!(
            processed = report.processed,
            failures = report.failures,
            "Single cycle complete"
        );
    } else {
        poll_loop.run(shutdown_rx).await;
    }

    tracing::info!("Chat moderator stopped");
    Ok(())
}
