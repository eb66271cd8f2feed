use crate::config::Config;
use crate::mpd::{call_bounded, Command, RemoteSession, SessionFactory, TcpSessionFactory};
use crate::playlist::PlaylistInitializer;
use crate::server::ServerState;
use crate::supervisor::ConnectionSupervisor;
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    config.log_summary();

    let factory: Arc<dyn SessionFactory> = Arc::new(TcpSessionFactory::new(&config.mpd));
    // Nothing to operate against without a first session.
    let session = factory.open().await?;

    if config.debug {
        log_daemon_snapshot(&config, session.as_ref()).await;
    }

    let supervisor = Arc::new(ConnectionSupervisor::new(
        session.clone(),
        factory,
        config.supervisor.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let probe_task = supervisor.spawn(shutdown_rx.clone());

    let initializer = PlaylistInitializer::new(config.supervisor.command_timeout());
    let outcome = initializer.ensure_populated(session.as_ref()).await;
    tracing::info!(?outcome, "startup playlist check finished");
    drop(session);

    let state = Arc::new(ServerState::new(
        &config,
        supervisor.clone(),
        shutdown_tx.clone(),
    ));

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown: ctrl-c");
            let _ = signal_tx.send(true);
        }
    });

    let served =
        crate::server::start(config.web.bind_host(), config.web.port, state, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Err(err) = probe_task.await {
        tracing::warn!(error = %err, "MPD supervisor task ended abnormally");
    }
    served
}

async fn log_daemon_snapshot(config: &Config, session: &dyn RemoteSession) {
    let timeout = config.supervisor.command_timeout();
    for command in [Command::Status, Command::Stats] {
        match call_bounded(session, &command, timeout).await {
            Ok(reply) => {
                tracing::debug!(command = command.name(), reply = ?reply.to_map(), "MPD snapshot")
            }
            Err(err) => {
                tracing::warn!(command = command.name(), error = %err, "MPD snapshot failed")
            }
        }
    }
}

pub fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
