use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.to_rfc3339())
    }
}

pub fn log_dir() -> Result<PathBuf, String> {
    let base = std::env::var("TILLER_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"));

    if !base.exists() {
        fs::create_dir_all(&base).map_err(|e| format!("failed to create log directory: {}", e))?;
    }
    Ok(base)
}

/// Console plus daily-rolling file output, filtered by RUST_LOG.
pub fn init_logger() {
    let _ = tracing_log::LogTracer::init();

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_level(true)
        .with_timer(LocalTimer);

    match log_dir() {
        Ok(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "tiller.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_timer(LocalTimer);
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(console_layer)
                .with(file_layer)
                .try_init();
            // The appender guard must outlive the process for the writer
            // thread to keep flushing.
            std::mem::forget(guard);
            info!("Log system initialized (console + file persistence)");
        }
        Err(e) => {
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(console_layer)
                .try_init();
            info!("Log system initialized (console only): {}", e);
        }
    }
}
