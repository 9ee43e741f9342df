use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use futures::future::{select, Either};
use ingest_common::metrics::setup_metrics_recorder;
use ingest_common::pubsub::PubSubClient;
use ingest_common::time::SystemTime;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use replay::config::Config;
use replay::coordinator::ReplayCoordinator;
use replay::handlers;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

async fn listen(app: axum::Router, bind: String) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    Ok(())
}

async fn replay_loop(coordinator: Arc<ReplayCoordinator>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(e) = coordinator.drain().await {
            tracing::error!("replay drain failed: {e}");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("failed to load configuration from env");

    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(config.log_level).into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let client = PubSubClient::new(
        &config.pubsub.pubsub_url,
        config.pubsub.pubsub_project.as_str(),
        config.pubsub.pubsub_auth_token.as_deref(),
        config.pubsub.pubsub_timeout_ms.0,
    )
    .expect("failed to create pubsub client");

    let coordinator = Arc::new(ReplayCoordinator::new(
        Arc::new(client.subscription(config.dead_letter_subscription.as_str())),
        Arc::new(client),
        config.ingestion_topic.as_str(),
        config.parking_topic.as_str(),
        config.replay_settings(),
        Arc::new(SystemTime {}),
    ));

    let replay_loop = Box::pin(replay_loop(
        coordinator.clone(),
        config.replay_interval_secs,
    ));

    let recorder_handle = setup_metrics_recorder();
    let app = handlers::app(coordinator, Some(recorder_handle));
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, replay_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => tracing::info!("replay http server stopped"),
            Err(e) => tracing::error!("failed to start replay http server, {}", e),
        },
        Either::Right((_, _)) => {
            tracing::error!("replay loop exited")
        }
    };
}
