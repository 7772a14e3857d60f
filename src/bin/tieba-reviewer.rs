use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

use tieba_reviewer::config::{Config, FunctionProviderKind};
use tieba_reviewer::dispatcher::{DeadLetter, ReviewResultDispatcher, ReviewResultPayload};
use tieba_reviewer::engine::RuleMatcher;
use tieba_reviewer::functions::{
    FunctionProvider, FunctionRegistry, HttpRemoteFunctionClient, LocalProvider, RemoteProvider,
    builtin,
};
use tieba_reviewer::metrics::create_metrics_publisher;
use tieba_reviewer::repository::{PostgresRuleRepository, RedisReloadListener};
use tieba_reviewer::tasks::{
    WorkerDeps, WorkerManager, WorkerManagerConfig, spawn_cancellable_task, spawn_managed_task,
};
use tieba_reviewer::transport::{RedisEventStream, RedisStreamSink, create_redis_pool};

#[tokio::main]
async fn main() -> Result<()> {
    let version = tieba_reviewer::config::version()?;

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{version}");
            std::process::exit(0);
        }
    });

    let config = Config::new()?;

    let env_filter = tracing_subscriber::EnvFilter::new(
        env::var("RUST_LOG").unwrap_or_else(|_| "tieba_reviewer=info,sqlx=warn".into()),
    );

    let fmt_layer = if env::var("JSON_LOGS").is_ok() {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!(
        version = %version,
        consumer = %config.stream.consumer_name,
        "Starting tieba-reviewer"
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    let redis_pool = create_redis_pool(&config.redis_url)?;
    let metrics = create_metrics_publisher(&config.metrics)?;

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();
    let hard_stop = CancellationToken::new();

    let registry = Arc::new(builtin::register_builtins(FunctionRegistry::new()));
    tracing::info!(functions = ?registry.names(), "Registered local functions");

    let local = LocalProvider::new(registry, config.functions.timeout);
    let remote = match (&config.functions.provider, &config.functions.rpc_url) {
        (provider, Some(rpc_url)) if provider.needs_remote() => {
            let http_client = reqwest::Client::builder()
                .user_agent(format!("tieba-reviewer/{version}"))
                .build()
                .context("Failed to build HTTP client")?;
            Some(
                RemoteProvider::new(
                    Arc::new(HttpRemoteFunctionClient::new(http_client, rpc_url.clone())),
                    config.functions.timeout,
                )
                .with_shutdown(hard_stop.clone()),
            )
        }
        _ => None,
    };
    let provider = match (config.functions.provider, remote) {
        (FunctionProviderKind::Remote, Some(remote)) => FunctionProvider::Remote(remote),
        (FunctionProviderKind::Hybrid, Some(remote)) => FunctionProvider::Hybrid { local, remote },
        _ => FunctionProvider::Local(local),
    };
    tracing::info!(mode = provider.mode(), "Function provider ready");

    let matcher = Arc::new(RuleMatcher::new(Arc::new(provider)));
    let dispatcher = ReviewResultDispatcher::new(
        Arc::new(RedisStreamSink::<ReviewResultPayload>::new(
            redis_pool.clone(),
            config.stream.action_stream_key.clone(),
        )),
        Arc::new(RedisStreamSink::<DeadLetter>::new(
            redis_pool.clone(),
            config.stream.dead_letter_stream_key.clone(),
        )),
        config.dispatch.retry,
        metrics.clone(),
    );
    let stream = Arc::new(RedisEventStream::new(
        redis_pool,
        config.stream.stream_key.clone(),
        config.stream.consumer_group.clone(),
        config.stream.read_block,
    ));

    let manager = Arc::new(WorkerManager::new(
        Arc::new(PostgresRuleRepository::new(pool)),
        WorkerDeps {
            stream,
            matcher,
            dispatcher,
            metrics,
        },
        WorkerManagerConfig::from_config(&config),
        hard_stop,
    ));

    let (reload_tx, reload_rx) = mpsc::channel(64);
    let listener = RedisReloadListener::new(
        config.redis_url.clone(),
        config.stream.rules_channel.clone(),
    );
    spawn_cancellable_task(&tracker, token.clone(), "reload_listener", move |cancel| {
        listener.run(reload_tx, cancel)
    });
    spawn_managed_task(
        &tracker,
        token.clone(),
        "worker_manager",
        manager.run(reload_rx, token.clone()),
    );

    {
        let signal_token = token.clone();

        tracing::info!("Starting signal handler task");
        tracker.spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    tracing::error!(error = ?e, "Failed to listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut terminate) => {
                        terminate.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                () = signal_token.cancelled() => {
                    tracing::info!("Signal handler task shutting down gracefully");
                },
                _ = terminate => {
                    tracing::info!("Received SIGTERM signal, initiating shutdown");
                },
                _ = ctrl_c => {
                    tracing::info!("Received Ctrl+C signal, initiating shutdown");
                },
            }

            signal_token.cancel();
        });
    }

    tracker.close();
    tracing::info!("Waiting for all tasks to complete...");
    tracker.wait().await;

    tracing::info!("All tasks completed, application shutting down");
    Ok(())
}
