//! Vigil daemon: runs the Telegram activity check.
//!
//! Wires config, the sled database (liveness store + reputation ledger share one DB),
//! the Telegram client, the cron sweep, the update poller, and `/health`. Timeouts of
//! challenges left outstanding by a previous run are re-armed before the first sweep.
//! CTRL-C stops the scheduler first, then the poller and health endpoint, then closes
//! the store.

mod health;
mod poller;
mod telegram;

use health::HealthState;
use poller::UpdatePoller;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use telegram::TelegramApi;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_core::{
    EngineSettings, LivenessEngine, LivenessStore, Scheduler, SledLedger, SystemClock,
    TimerQueue, VigilConfig, VigilError,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[vigil-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "vigil daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), BoxError> {
    let config = VigilConfig::load()?;
    config.validate()?;
    let token = bot_token(&config)?;
    let settings = EngineSettings::from_config(&config.activity_check)?;

    let db_path = Path::new(&config.app.storage_path).join("vigil");
    let db = sled::open(&db_path)?;
    let store = Arc::new(LivenessStore::from_db(db.clone())?);
    let ledger = Arc::new(SledLedger::from_db(&db)?);
    let api = Arc::new(TelegramApi::new(&token)?);
    let scheduler = Arc::new(Scheduler::new());

    let engine = Arc::new(LivenessEngine::new(
        Arc::clone(&store),
        api.clone(),
        ledger.clone(),
        scheduler.clone() as Arc<dyn TimerQueue>,
        Arc::new(SystemClock),
        settings,
    ));
    engine.resume_outstanding()?;

    let sweep_engine = Arc::clone(&engine);
    scheduler.start(&config.activity_check.schedule, move || {
        sweep_engine.sweep_job()
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = UpdatePoller::new(
        Arc::clone(&api),
        Arc::clone(&engine),
        Arc::clone(&ledger),
        Arc::clone(&store),
    );
    let poll_task = tokio::spawn(poller.run(shutdown_rx.clone()));
    let health_task = tokio::spawn(health::serve(
        config.app.health_port,
        HealthState {
            scheduler: Arc::clone(&scheduler),
            store: Arc::clone(&store),
        },
        shutdown_rx,
    ));

    tracing::info!(
        storage_path = %db_path.display(),
        schedule = %config.activity_check.schedule,
        max_retries = config.activity_check.max_retries,
        "vigil daemon started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("CTRL-C received; shutting down daemon");

    scheduler.stop();
    shutdown_tx.send_replace(true);
    if let Err(e) = poll_task.await {
        tracing::warn!(error = %e, "poller task ended abnormally");
    }
    if let Err(e) = health_task.await {
        tracing::warn!(error = %e, "health task ended abnormally");
    }
    store.close()?;
    tracing::info!("vigil daemon stopped");
    Ok(())
}

/// The token must be present and fully resolved (`${BOT_TOKEN}` left unexpanded means
/// the variable was never set).
fn bot_token(config: &VigilConfig) -> Result<String, VigilError> {
    let token = config.app.token.trim();
    if token.is_empty() || token.contains("${") {
        return Err(VigilError::InvalidConfig(
            "app.token is not set (export BOT_TOKEN or VIGIL__APP__TOKEN)".into(),
        ));
    }
    Ok(token.to_string())
}
