pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod logger;
pub mod proxy;

use tracing::error;

/// Headless entry point: load settings, apply environment overrides,
/// validate, then run the proxy until interrupted.
pub fn run() {
    logger::init_logger();

    let mut settings = match config::ProxySettings::load() {
        Ok(settings) => settings,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    config::apply_env_overrides(&mut settings);
    settings.normalize();

    if let Err(errors) = config::validate_settings(&settings) {
        error!(
            "configuration validation failed:\n{}",
            errors.join("\n")
        );
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Err(e) = proxy::serve(settings).await {
            error!("proxy terminated: {}", e);
            std::process::exit(1);
        }
    });
}
