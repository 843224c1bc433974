use crate::{
    cli::Cli,
    config::Config,
    db::{build_db_pool, run_migrations},
    health::ExportHealth,
    logging::{format_error_report, init_logging},
    pipeline::exporter::pg::{PgCheckpointStore, PgLogSink},
    pipeline::exporter::Exporter,
    pipeline::scheduler::SchedulerConfig,
    pipeline::types::ChannelTopics,
    pipeline::{Pipeline, PipelineConfig},
    server::{monitoring::EXPORT_METRICS, setup_server_with_addr},
    state::AppState,
    worker::retry::RetryPolicy,
    worker::rpc::{rate_limiter, EvmRpcClient, RpcClientConfig},
    worker::sources::build_source,
    worker::Worker,
};
use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_PIPELINE_NAME: &str = "ethereum";
const MAX_PENDING_PER_WORKER: usize = 4;

pub fn resolve_node_url(cli: &Cli, config: &Config) -> Result<String, String> {
    cli.node_url
        .clone()
        .or_else(|| config.node_url.clone())
        .ok_or_else(|| "NODE_URL is required (env var or --node-url)".to_string())
}

pub fn resolve_database_url(cli: &Cli, config: &Config) -> Result<String, String> {
    cli.database_url
        .clone()
        .or_else(|| config.database_url.clone())
        .ok_or_else(|| "DATABASE_URL is required (env var or --database-url)".to_string())
}

pub fn resolve_pipeline_name(cli: &Cli, config: &Config) -> String {
    cli.name
        .clone()
        .or_else(|| config.exporter_name.clone())
        .unwrap_or_else(|| DEFAULT_PIPELINE_NAME.to_string())
}

/// Checkpoint slot: one per pipeline name and source, so sources never share progress.
pub fn checkpoint_slot(pipeline_name: &str, cli: &Cli) -> String {
    format!("{pipeline_name}:{}", cli.source)
}

pub fn resolve_topic_prefix(cli: &Cli, pipeline_name: &str) -> String {
    cli.topic_prefix
        .clone()
        .unwrap_or_else(|| pipeline_name.to_string())
}

pub fn resolve_max_pending(cli: &Cli) -> usize {
    cli.max_pending
        .unwrap_or_else(|| cli.concurrency.saturating_mul(MAX_PENDING_PER_WORKER))
}

pub fn resolve_retry_policy(cli: &Cli) -> RetryPolicy {
    RetryPolicy {
        max_attempts: cli.retry_attempts,
        initial_backoff: Duration::from_millis(cli.retry_initial_ms),
        max_backoff: Duration::from_millis(cli.retry_max_ms),
        jitter: Duration::from_millis(cli.retry_jitter_ms),
    }
}

pub fn validate_args(cli: &Cli) -> Result<(), String> {
    if cli.confirmations < 0 {
        return Err(format!(
            "--confirmations must be >= 0, got {}",
            cli.confirmations
        ));
    }
    if cli.block_interval <= 0 {
        return Err(format!(
            "--block-interval must be > 0, got {}",
            cli.block_interval
        ));
    }
    if cli.concurrency == 0 {
        return Err("--concurrency must be > 0".to_string());
    }
    if let Some(max_pending) = cli.max_pending {
        if max_pending < cli.concurrency {
            return Err(format!(
                "--max-pending ({max_pending}) must be >= --concurrency ({})",
                cli.concurrency
            ));
        }
    }
    if cli.loop_interval_ms == 0 {
        return Err("--loop-interval-ms must be > 0".to_string());
    }
    if cli.start_block < 0 {
        return Err(format!("--start-block must be >= 0, got {}", cli.start_block));
    }
    if cli.rpc_timeout_ms == 0 {
        return Err("--rpc-timeout-ms must be > 0".to_string());
    }
    if cli.rpc_rps == 0 {
        return Err("--rpc-rps must be > 0".to_string());
    }
    if cli.retry_attempts == 0 {
        return Err("--retry-attempts must be > 0".to_string());
    }
    if cli.retry_max_ms < cli.retry_initial_ms {
        return Err(format!(
            "--retry-max-ms ({}) must be >= --retry-initial-ms ({})",
            cli.retry_max_ms, cli.retry_initial_ms
        ));
    }
    if cli.health_timeout_secs == 0 {
        return Err("--health-timeout-secs must be > 0".to_string());
    }
    if cli.db_pool_size == 0 {
        return Err("--db-pool-size must be > 0".to_string());
    }
    if let Some(prefix) = &cli.topic_prefix {
        if prefix.trim().is_empty() {
            return Err("--topic-prefix must not be empty".to_string());
        }
    }
    cli.metrics_bind.parse::<SocketAddr>().map_err(|err| {
        format!(
            "invalid --metrics-bind address `{}`: {err}",
            cli.metrics_bind
        )
    })?;

    Ok(())
}

/// First SIGTERM/SIGINT cancels `shutdown`; a second one cancels `force`.
async fn forward_shutdown_signals(shutdown: CancellationToken, force: CancellationToken) {
    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(err), _) | (_, Err(err)) => {
                error!(
                    event = "signal_handler_install_failed",
                    error = %err,
                    "failed to register signal handlers"
                );
                return;
            }
        };

    for (token, stage) in [(&shutdown, "graceful"), (&force, "forced")] {
        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        warn!(
            event = "shutdown_signal_received",
            signal = received,
            stage,
            "shutdown signal received"
        );
        token.cancel();
    }
}

fn report_failure(event: &'static str, context: &str, err: &(dyn std::error::Error + 'static)) {
    let error_report = format_error_report(err);
    error!(
        event = event,
        error = %err,
        error_debug = ?err,
        error_report = %error_report,
        "{context}"
    );
    eprintln!("{context}: {err}");
    eprintln!("{error_report}");
}

/// Runs the export pipeline until shutdown or a fatal error.
///
/// Returns the process exit code: `0` on a clean stop, `1` on a runtime failure and `2`
/// when the arguments or environment are invalid.
pub async fn run_export(cli: Cli) -> i32 {
    dotenv().ok();

    if let Err(err) = validate_args(&cli) {
        eprintln!("{err}");
        return 2;
    }

    let config = Config::from_env();
    let (node_url, db_url) = match (
        resolve_node_url(&cli, &config),
        resolve_database_url(&cli, &config),
    ) {
        (Ok(node_url), Ok(db_url)) => (node_url, db_url),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("{err}");
            return 2;
        }
    };
    let metrics_addr = match cli.metrics_bind.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("invalid --metrics-bind address `{}`: {err}", cli.metrics_bind);
            return 2;
        }
    };
    let pipeline_name = resolve_pipeline_name(&cli, &config);
    let topic_prefix = resolve_topic_prefix(&cli, &pipeline_name);
    let slot = checkpoint_slot(&pipeline_name, &cli);

    let logging_context = init_logging(&pipeline_name, cli.source.as_str(), &cli.log_level);
    let run_span = tracing::info_span!(
        "export_run",
        service = %logging_context.service,
        pipeline = %logging_context.pipeline,
        source = %logging_context.source,
        environment = %logging_context.environment,
        run_id = %logging_context.run_id,
        build_version = %logging_context.build_version,
        build_commit = %logging_context.build_commit
    );
    let _run_guard = run_span.enter();
    info!(
        event = "export_starting",
        checkpoint_slot = %slot,
        topic_prefix = %topic_prefix,
        "starting export run"
    );

    let migration_url = db_url.clone();
    match tokio::task::spawn_blocking(move || run_migrations(&migration_url)).await {
        Ok(Ok(applied)) => info!(event = "migrations_applied", applied, "database schema ready"),
        Ok(Err(err)) => {
            report_failure("migrations_failed", "failed to run migrations", err.as_ref());
            return 1;
        }
        Err(err) => {
            report_failure("migrations_failed", "migration task failed", &err);
            return 1;
        }
    }

    let pool = match build_db_pool(&db_url, cli.db_pool_size).await {
        Ok(pool) => pool,
        Err(err) => {
            report_failure("db_pool_build_failed", "failed to build db pool", &err);
            return 1;
        }
    };

    let topics = ChannelTopics::with_prefix(&topic_prefix);
    let sink = PgLogSink::new(pool.clone(), topics.clone());
    let health = Arc::new(ExportHealth::new(Duration::from_secs(
        cli.health_timeout_secs,
    )));

    let server_token = CancellationToken::new();
    let app_state = Arc::new(AppState::new(
        server_token.clone(),
        health.clone(),
        Arc::new(sink.probe()),
    ));
    let server_handle = match setup_server_with_addr(app_state, metrics_addr).await {
        Ok(handle) => handle,
        Err(err) => {
            report_failure(
                "metrics_server_start_failed",
                &format!("failed to start health/metrics endpoint on {metrics_addr}"),
                &err,
            );
            return 1;
        }
    };

    let client = match EvmRpcClient::new(
        RpcClientConfig {
            url: node_url,
            timeout: Duration::from_millis(cli.rpc_timeout_ms),
            retry_policy: resolve_retry_policy(&cli),
        },
        rate_limiter(cli.rpc_rps),
    ) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            report_failure("rpc_client_build_failed", "failed to build RPC client", &err);
            server_token.cancel();
            return 1;
        }
    };

    let worker = Worker::new(build_source(cli.source, client), cli.start_block);
    let exporter = Exporter::new(slot.clone(), sink, PgCheckpointStore::new(pool), health);
    let pipeline_config = PipelineConfig {
        name: slot,
        confirmations: cli.confirmations,
        block_interval: cli.block_interval,
        scheduler: SchedulerConfig {
            concurrency: cli.concurrency,
            max_pending: resolve_max_pending(&cli),
        },
        loop_interval: Duration::from_millis(cli.loop_interval_ms),
        topics,
    };
    let mut pipeline = Pipeline::new(pipeline_config, worker, exporter);
    if let Some(metrics) = EXPORT_METRICS.get() {
        pipeline = pipeline.with_metrics(metrics.clone());
    }

    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();
    let signal_handle = tokio::spawn(forward_shutdown_signals(shutdown.clone(), force.clone()));

    let result = pipeline.run(shutdown, force).await;

    signal_handle.abort();
    server_token.cancel();
    if let Err(err) = server_handle.await {
        warn!(event = "metrics_server_join_failed", error = %err, "server task did not stop cleanly");
    }

    match result {
        Ok(summary) => {
            info!(
                event = "export_complete",
                block_number = summary.last_position.block_number,
                primary_key = summary.last_position.primary_key,
                exported_records = summary.exported_records,
                exported_batches = summary.exported_batches,
                "export run completed"
            );
            0
        }
        Err(err) => {
            report_failure("export_failed", "export run failed", &err);
            1
        }
    }
}
