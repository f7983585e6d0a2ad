use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mail_scheduler::accounts::{AccountRegistry, SmtpImapRegistry};
use mail_scheduler::clock::{Clock, SystemClock};
use mail_scheduler::config::SchedulerConfig;
use mail_scheduler::engine::{
    Dispatcher, EngineHandle, FailureSink, Reconciler, StoreFailureSink, recover_interrupted,
};
use mail_scheduler::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = SchedulerConfig::from_env()?;

    // Initialize tracing: stderr always, plus a daily file when configured.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-scheduler.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "mail-scheduler starting");
    info!(
        db = %config.db_path.display(),
        dispatch_secs = config.dispatch_interval.as_secs(),
        reply_poll_secs = config.reply_poll_interval.as_secs(),
        call_timeout_secs = config.call_timeout.as_secs(),
        "Configuration loaded"
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await?
            .with_default_servers(config.default_servers.clone()),
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let failures: Arc<dyn FailureSink> =
        Arc::new(StoreFailureSink::new(Arc::clone(&db), Arc::clone(&clock)));

    // ── Startup recovery: release claims from an interrupted run ─────────
    let recovery = recover_interrupted(db.as_ref(), failures.as_ref()).await?;
    debug!(?recovery, "Startup recovery complete");

    match db.list_accounts().await {
        Ok(accounts) => info!(accounts = accounts.len(), "Accounts loaded"),
        Err(e) => warn!("Failed to list accounts: {e}"),
    }

    // ── Engine ───────────────────────────────────────────────────────────
    let registry: Arc<dyn AccountRegistry> =
        Arc::new(SmtpImapRegistry::new(Arc::clone(&db), config.call_timeout));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        Arc::clone(&failures),
        Arc::clone(&clock),
        config.call_timeout,
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&db),
        registry,
        failures,
        clock,
        config.call_timeout,
    ));

    let engine = EngineHandle::start(
        dispatcher,
        config.dispatch_interval,
        reconciler,
        config.reply_poll_interval,
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested; finishing in-flight work");
    engine.shutdown().await;

    Ok(())
}
