use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use autopilot::api::{AppState, autopilot_routes};
use autopilot::autopilot::auto_enable_tagged;
use autopilot::autopilot::eligibility::resolve_timezone;
use autopilot::config::{AutopilotConfig, GeneratorConfig, ProviderConfig};
use autopilot::generator::{ReplyGenerator, RigGenerator};
use autopilot::provider::{HttpProviderClient, ProviderClient, with_auto_refresh};
use autopilot::store::{Database, LibSqlBackend};
use autopilot::{PollCycleDriver, ReplyPipeline, RunMode};

enum Command {
    /// Serve the trigger endpoint.
    Serve,
    /// Run one cycle and print the report.
    Cycle { dry_run: bool },
    /// Run tag reconciliation once.
    Reconcile,
}

fn parse_command(args: &[String]) -> anyhow::Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("serve") => Ok(Command::Serve),
        Some("cycle") => Ok(Command::Cycle {
            dry_run: args.iter().skip(1).any(|a| a == "--dry-run"),
        }),
        Some("reconcile") => Ok(Command::Reconcile),
        Some(other) => bail!("unknown command '{other}' (expected serve, cycle [--dry-run], reconcile)"),
    }
}

/// Console logging plus an optional daily-rolling file. The guard must live
/// as long as the process.
fn init_tracing(
    config: &AutopilotConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "autopilot.log");
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
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AutopilotConfig::from_env().context("invalid autopilot configuration")?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Provider + generator ─────────────────────────────────────────────
    let provider_config = ProviderConfig::from_env().context("invalid provider configuration")?;
    let http = HttpProviderClient::from_store(provider_config, Arc::clone(&store))
        .await
        .context("failed to initialise provider client")?;
    let provider: Arc<dyn ProviderClient> = Arc::new(with_auto_refresh(http));

    let generator_config =
        GeneratorConfig::from_env().context("invalid generator configuration")?;
    let generator: Arc<dyn ReplyGenerator> = Arc::new(RigGenerator::new(&generator_config)?);

    // ── Engine ───────────────────────────────────────────────────────────
    let pipeline = Arc::new(
        ReplyPipeline::new(Arc::clone(&store), Arc::clone(&provider), generator)
            .with_default_timezone(resolve_timezone(&config.default_timezone))
            .with_context_limit(config.context_limit),
    );
    let driver = Arc::new(PollCycleDriver::new(pipeline, config.max_concurrency));

    match command {
        Command::Cycle { dry_run } => {
            let mode = if dry_run { RunMode::DryRun } else { RunMode::Live };
            let report = driver.run_cycle(mode).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reconcile => {
            let tag = config
                .auto_enable_tag
                .as_deref()
                .context("AUTOPILOT_AUTO_ENABLE_TAG is not set")?;
            let report = auto_enable_tagged(store.as_ref(), provider.as_ref(), tag).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Serve => {
            let app = autopilot_routes(AppState {
                driver,
                store,
                provider,
                trigger_secret: config.trigger_secret.clone(),
                auto_enable_tag: config.auto_enable_tag.clone(),
            });
            let addr = format!("0.0.0.0:{}", config.port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(
                addr = %addr,
                max_concurrency = config.max_concurrency,
                trigger_auth = config.trigger_secret.is_some(),
                "Autopilot listening"
            );
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server error")?;
        }
    }
    Ok(())
}
