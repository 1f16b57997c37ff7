use anyhow::Context;
use cellar_api::{app, config::AppConfig, db, events, tracing::init_subscriber, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    init_subscriber(&config.log_level, config.log_json);

    let pool = db::connect(&config).await.context("database connection failed")?;
    if config.auto_migrate {
        db::migrate(&pool).await.context("schema bootstrap failed")?;
    }

    let (event_sender, event_receiver) = events::channel(1024);
    tokio::spawn(events::log_events(event_receiver));

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config, pool, event_sender)?;

    // Callback is primary; the monitor polls as backup and flags stuck
    // orders for review.
    let monitor = state.services.monitor.clone();
    tokio::spawn(async move { (*monitor).clone().run().await });

    let router = app(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;
    info!("Listening on {addr}");

    axum::serve(listener, router).await.context("server error")?;
    Ok(())
}
