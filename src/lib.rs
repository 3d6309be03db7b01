// Library interface for the manga auto-scraper
// The binary and the integration tests both build on these modules

pub mod activity;
pub mod app_state;
pub mod catalog;
pub mod config;
pub mod db;
pub mod downloader;
pub mod error;
pub mod helpers;
pub mod http_client;
pub mod maintenance;
pub mod metrics;
pub mod models;
pub mod normalize;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod source_utils;
pub mod sources;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

/// Initialise log4rs from `log4rs.yml`, or log to the console at info level
/// when the file is missing or invalid.
pub fn init_logging() {
    let path = Path::new("log4rs.yml");
    if path.exists() {
        match log4rs::init_file(path, Default::default()) {
            Ok(()) => return,
            Err(e) => eprintln!("Invalid log4rs.yml ({}), falling back to console logging", e),
        }
    }

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} - {m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info));
    match config {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                eprintln!("Could not initialise logging: {}", e);
            }
        }
        Err(e) => eprintln!("Could not build logging config: {}", e),
    }
}
