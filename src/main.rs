mod app;
mod config;
#[cfg(test)]
mod fake;
mod gateway;
mod model;
mod mpd;
mod playlist;
mod server;
mod supervisor;

use config::Config;

#[tokio::main]
async fn main() {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            if let Err(err) = app::handle_config_init() {
                eprintln!("config-init failed: {err}");
                std::process::exit(1);
            }
            return;
        }
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("can't load configuration: {err}");
            std::process::exit(1);
        }
    };

    init_logging(config.debug);
    if let Err(err) = app::run(config).await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    use tracing_subscriber::{fmt, EnvFilter};
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_target(false).init();
}
