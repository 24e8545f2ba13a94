//! Gateway entry point: config, store, queue, MQTT bridge, HTTP surface.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fiscal_gateway::api::{self, AppState};
use fiscal_gateway::applog;
use fiscal_gateway::db::Db;
use fiscal_gateway::mqtt::MqttBridge;
use fiscal_gateway::queue::JobQueue;
use fiscal_gateway::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .init();

    let settings = Arc::new(Settings::from_env());
    let db = Arc::new(
        Db::init(&settings.db_path)
            .map_err(anyhow::Error::msg)
            .context("database init")?,
    );
    applog::init_sink(Arc::clone(&db));

    let queue = JobQueue::new(Arc::clone(&db), Arc::clone(&settings));
    let dispatcher = queue.start();

    let mqtt = MqttBridge::new(Arc::clone(&db), Arc::clone(&settings));
    let bridge_task = mqtt.start();

    let state = Arc::new(AppState {
        db,
        queue: Arc::clone(&queue),
        mqtt: Arc::clone(&mqtt),
        settings: Arc::clone(&settings),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("bind {}:{}", settings.host, settings.port))?;
    info!(
        "fiscal-gateway listening on http://{}:{}",
        settings.host, settings.port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server")?;

    info!("shutting down");
    mqtt.stop();
    queue.stop();
    if let Some(task) = bridge_task {
        let _ = task.await;
    }
    let _ = dispatcher.await;
    Ok(())
}
