//! Structured logging.
use once_cell::sync::Lazy;
use slog::{o, Drain, Logger};

static ROOT_LOGGER: Lazy<Logger> = Lazy::new(|| {
    let drain = slog_json::Json::default(std::io::stderr()).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
});

/// Get a logger for the named module.
pub fn get_logger(module: &'static str) -> Logger {
    ROOT_LOGGER.new(o!("module" => module))
}
