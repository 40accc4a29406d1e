use crate::{
    engine::{Command, EngineError},
    portfolio::manager::PortfolioManager,
};
use marlin_execution::{client::ExchangeApi, tracker::OrderTracker};
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Forward process termination signals (SIGTERM, ctrl-c) to the manager as a single
/// [`Command::Terminate`], consumed at the next tick boundary.
pub fn spawn_signal_listener(command_tx: mpsc::Sender<Command>) {
    tokio::spawn(async move {
        let reason = wait_for_signal().await;
        info!(%reason, "termination signal received");
        let _ = command_tx
            .send(Command::Terminate(reason.to_string()))
            .await;
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            warn!(%error, "SIGTERM handler unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return "ctrl-c";
        }
    };
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = tokio::signal::ctrl_c() => "ctrl-c",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}

/// Drive the manager until it stops, rebuilding the order tracker whenever its event stream
/// dies, and map the outcome to the process exit code: `0` on clean external shutdown, `1` on
/// internal termination.
pub async fn run<Client, Tracker, RebuildTracker>(
    mut manager: PortfolioManager<Client, Tracker>,
    mut rebuild_tracker: RebuildTracker,
) -> ExitCode
where
    Client: ExchangeApi,
    Tracker: OrderTracker,
    RebuildTracker: FnMut() -> Option<Tracker>,
{
    loop {
        match manager.run().await {
            Ok(()) => {
                manager.shutdown().await;
                return ExitCode::SUCCESS;
            }
            Err(EngineError::TrackerStopped(error)) => {
                warn!(%error, "order tracker died, rebuilding");
                match rebuild_tracker() {
                    Some(tracker) => manager.set_tracker(tracker),
                    None => {
                        error!("tracker rebuild failed, shutting down");
                        manager.shutdown().await;
                        return ExitCode::FAILURE;
                    }
                }
            }
            Err(error) => {
                error!(%error, "unrecoverable engine error");
                manager.shutdown().await;
                return ExitCode::FAILURE;
            }
        }
    }
}
