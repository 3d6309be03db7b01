use log::{error, info};
use manga_autoscraper::app_state::AppState;
use manga_autoscraper::config::Config;
use manga_autoscraper::{db, init_logging, maintenance, processor, scheduler};
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_logging();

    let config = Config::load();
    let conn = db::init_db(Path::new(&config.database_path)).map_err(std::io::Error::other)?;
    std::fs::create_dir_all(config.library_path())?;
    std::fs::create_dir_all(config.staging_path())?;

    let state = AppState::new(config, conn).map_err(std::io::Error::other)?;
    state.prepare_database().map_err(std::io::Error::other)?;
    let state = Arc::new(state);
    let discoveries = state.subscribe();

    let notifier = tokio::spawn(async move {
        scheduler::log_discoveries(discoveries).await;
    });

    let tasks = vec![
        tokio::spawn(maintenance::run(state.clone())),
        tokio::spawn(scheduler::run(state.clone())),
        tokio::spawn(processor::run(state.clone())),
        notifier,
    ];
    info!("Auto-scraper running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}
