//! Transaction cleaner entry point.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use cleaner::{CleanerError, Config, LogFormat, RunReport, TransactionCleaner};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use stores::{PostgresTimeSeriesStore, PostgresTransactionLog};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "transaction-cleaner")]
#[command(about = "Reconcile zombie saga transactions and purge soft-deleted rows", long_about = None)]
struct Cli {
    /// Physically delete rows marked invalid after reconciling
    #[arg(long)]
    purge: bool,

    /// Compute resolutions and counts without applying any of them
    #[arg(long)]
    dry_run: bool,

    /// Minutes a transaction may stay PENDING before it counts as a zombie
    #[arg(long, value_name = "MINUTES")]
    timeout_minutes: Option<i64>,

    /// Maximum zombies reconciled per run
    #[arg(long, value_name = "N")]
    batch_limit: Option<usize>,

    /// Append-only table to purge (repeatable; replaces CLEANER_TABLES)
    #[arg(long = "table", value_name = "TABLE")]
    tables: Vec<String>,

    /// Keep running, one pass every SECS seconds, until SIGINT or SIGTERM
    #[arg(long, value_name = "SECS")]
    every: Option<u64>,

    /// Serve Prometheus metrics on this address (replaces METRICS_LISTEN_ADDR)
    #[arg(long, value_name = "ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Cli {
    fn apply(self, config: &mut Config) -> Option<u64> {
        let cleaner = &mut config.cleaner;
        cleaner.dry_run = self.dry_run;
        if let Some(minutes) = self.timeout_minutes {
            cleaner.zombie_timeout_minutes = minutes;
        }
        if let Some(limit) = self.batch_limit {
            cleaner.batch_limit = limit;
        }
        if !self.tables.is_empty() {
            cleaner.tables = self.tables;
        }
        if self.metrics_addr.is_some() {
            config.metrics_addr = self.metrics_addr;
        }
        self.every
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, stopping after the current pass");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, stopping after the current pass");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Installs the Prometheus recorder.
///
/// With a listen address the exporter serves `/metrics` itself and no handle
/// is returned. Without one, the caller renders the handle after each pass.
fn install_metrics(config: &Config) -> Result<Option<PrometheusHandle>, CleanerError> {
    match config.metrics_addr {
        Some(addr) => {
            PrometheusBuilder::new().with_http_listener(addr).install()?;
            tracing::info!(%addr, "serving metrics");
            Ok(None)
        }
        None => Ok(Some(PrometheusBuilder::new().install_recorder()?)),
    }
}

async fn connect(url: &str) -> Result<PgPool, CleanerError> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .map_err(|e| CleanerError::Store(e.into()))
}

async fn build_cleaner(
    config: &Config,
) -> Result<TransactionCleaner<PostgresTimeSeriesStore, PostgresTransactionLog>, CleanerError> {
    config.cleaner.validate()?;

    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| CleanerError::Config("DATABASE_URL is not set".to_string()))?;
    let log_pool = connect(database_url).await?;

    let time_series_pool = match config.timeseries_database_url.as_deref() {
        Some(url) if url != database_url => connect(url).await?,
        _ => log_pool.clone(),
    };

    Ok(TransactionCleaner::new(
        PostgresTimeSeriesStore::new(time_series_pool),
        PostgresTransactionLog::new(log_pool),
        config.cleaner.clone(),
    ))
}

fn log_report(report: &RunReport, metrics: Option<&PrometheusHandle>) {
    if let Some(purge) = &report.purge {
        for table in &purge.tables {
            tracing::debug!(
                table = %table.table,
                invalid_rows = table.invalid_rows,
                deleted_rows = table.deleted_rows,
                "table purged"
            );
        }
    }
    if report.zombies.failed > 0 {
        tracing::warn!(
            failed = report.zombies.failed,
            "some zombies could not be reconciled; they will be retried on the next run"
        );
    }
    if let Some(handle) = metrics {
        tracing::info!(metrics = %handle.render(), "cleaner metrics");
    }
}

async fn run(config: Config, purge: bool, every: Option<u64>) -> Result<(), CleanerError> {
    let metrics = install_metrics(&config)?;
    let cleaner = build_cleaner(&config).await?;
    let settings = cleaner.config();
    tracing::info!(
        timeout_minutes = settings.zombie_timeout_minutes,
        batch_limit = settings.batch_limit,
        dry_run = settings.dry_run,
        tables = ?settings.tables,
        "transaction cleaner configured"
    );

    let Some(secs) = every else {
        let report = cleaner.run(purge).await?;
        log_report(&report, metrics.as_ref());
        return Ok(());
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    tracing::info!(every_secs = secs, purge, "starting periodic cleaner");
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {
                // A failed pass is retried on the next tick.
                match cleaner.run(purge).await {
                    Ok(report) => log_report(&report, metrics.as_ref()),
                    Err(e) => tracing::error!(error = %e, "cleaner run failed"),
                }
            }
        }
    }

    tracing::info!("cleaner stopped");
    Ok(())
}

fn print_error(error: &CleanerError) {
    eprintln!("error: {error}");

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        eprintln!("caused by: {cause}");
        source = std::error::Error::source(cause);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let purge = cli.purge;

    let mut config = Config::from_env();
    let every = cli.apply(&mut config);

    init_tracing(&config);

    if let Err(e) = run(config, purge, every).await {
        tracing::error!(error = %e, "transaction cleaner failed");
        print_error(&e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
