//! NetWarden Core - Daemon Entry Point
//!
//! Boots the policy-and-safety core: configuration, state store, the wired
//! facade, the background daemon tasks, and the local facade API. Signals:
//! TERM drains gracefully, HUP reloads configuration, USR1 dumps status to
//! the log.

mod api;
mod constants;
mod logic;

use std::sync::Arc;

use logic::config::Config;
use logic::daemon::Daemon;
use logic::facade::Facade;
use logic::store::Store;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("{} v{} starting", constants::APP_NAME, constants::APP_VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    let exit = runtime.block_on(run());
    if let Err(err) = exit {
        log::error!("fatal: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> logic::error::CoreResult<()> {
    let config_path = Config::config_path();
    let config = Config::load(&config_path)?;

    let store = Arc::new(Store::open(&config.store_path()).await?);
    log::info!("state store at {}", config.store_path().display());

    let facade = Facade::build(config, store).await?;
    let daemon = Daemon::new(facade.clone());
    daemon.start().await?;

    let shutdown = daemon.shutdown_handle();
    spawn_signal_handlers(facade.clone(), shutdown.clone(), config_path);

    // serves until the shutdown channel fires
    api::serve(facade.clone(), shutdown.clone()).await?;

    facade.drain(&shutdown).await?;
    log::info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handlers(
    facade: Arc<Facade>,
    shutdown: Arc<logic::Shutdown>,
    config_path: std::path::PathBuf,
) {
    use tokio::signal::unix::{signal, SignalKind};

    // TERM: stop intake and drain
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
            let mut int = signal(SignalKind::interrupt()).expect("SIGINT handler");
            tokio::select! {
                _ = term.recv() => log::info!("SIGTERM received, draining"),
                _ = int.recv() => log::info!("SIGINT received, draining"),
            }
            shutdown.trigger();
        });
    }

    // HUP: reload configuration without touching in-flight deployments
    {
        let facade = facade.clone();
        tokio::spawn(async move {
            let mut hup = signal(SignalKind::hangup()).expect("SIGHUP handler");
            while hup.recv().await.is_some() {
                log::info!("SIGHUP received, reloading {}", config_path.display());
                match Config::load(&config_path) {
                    Ok(fresh) => {
                        if let Err(err) = facade.reload(fresh).await {
                            log::error!("reload failed, keeping old config: {}", err);
                        }
                    }
                    Err(err) => log::error!("reload parse failed, keeping old config: {}", err),
                }
            }
        });
    }

    // USR1: status dump to the log
    tokio::spawn(async move {
        let mut usr1 = signal(SignalKind::user_defined1()).expect("SIGUSR1 handler");
        while usr1.recv().await.is_some() {
            match facade.daemon_status().await {
                Ok(status) => match serde_json::to_string_pretty(&status) {
                    Ok(dump) => log::info!("status dump:\n{}", dump),
                    Err(err) => log::warn!("status serialization failed: {}", err),
                },
                Err(err) => log::warn!("status dump failed: {}", err),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_handlers(
    _facade: Arc<Facade>,
    shutdown: Arc<logic::Shutdown>,
    _config_path: std::path::PathBuf,
) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.trigger();
    });
}
