//! # Dispatch Client
//!
//! Command-line front end for the dispatch core. Connects as a rider or a
//! driver, resumes anything queued offline by a previous run, optionally
//! requests a ride, then prints lifecycle updates and reads commands from
//! stdin until the ride ends, `quit` is typed or a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use lib_dispatch::core::RideUpdate;
use lib_dispatch::{DispatchContext, JsonFilePendingStore, UserRole};

mod client_logic;
use client_logic::console::{self, Command};
use client_logic::device::{LogMap, ManualPosition};
use client_logic::{config, logger};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                tokio::select! {
                    _ = signal::ctrl_c() => tracing::info!("Ctrl-C received, initiating shutdown."),
                    _ = term_signal.recv() => tracing::info!("SIGTERM received, initiating shutdown."),
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = signal::ctrl_c().await;
                tracing::info!("Ctrl-C received, initiating shutdown.");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        tracing::info!("Ctrl-C received, initiating shutdown.");
    }
}

/// A ride that reached a terminal state ends an unattended session.
fn ends_session(update: &RideUpdate) -> bool {
    matches!(update, RideUpdate::StateChanged { to, .. } if to.is_terminal())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = logger::setup_logging(&log_dir, &log_level)?;

    let identity = config.identity()?;
    let outbox_path = config
        .outbox_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("./outbox.json"));
    let position = Arc::new(ManualPosition::new(config.position));

    let ctx = DispatchContext::builder(config.dispatch_config(), identity.clone())
        .store(Arc::new(JsonFilePendingStore::new(&outbox_path)))
        .position(position.clone())
        .map(Arc::new(LogMap))
        .auth_token(config.auth_token.clone())
        .build()?;

    let mut updates = ctx.rides().subscribe();
    let mut status = ctx.connection().watch_status();

    // Offline is not fatal: ride requests queue up and the status poll covers
    // for the missing push channel.
    if let Err(e) = ctx.start().await {
        tracing::warn!(error = %e, "starting without a push connection");
    }

    if identity.role == UserRole::Rider {
        if let Some(ride) = config.ride_request(&identity) {
            match ctx.rides().request_ride(ride).await {
                Ok(ride) => tracing::info!(ride_id = %ride.id, state = %ride.state, "ride requested"),
                Err(e) => tracing::error!(error = %e, "ride request failed"),
            }
        }
    }
    // A ride started from the command line ends the session when it finishes.
    let unattended = ctx.rides().current_ride().is_some();
    println!("{}", console::HELP);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            update = updates.recv() => match update {
                Ok(update) => {
                    println!("{}", console::describe(&update, identity.role));
                    if unattended && ends_session(&update) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "ride updates dropped"),
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                tracing::info!(status = ?current, "push channel status");
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(command) => {
                        if !console::execute(&ctx, &position, command).await {
                            break;
                        }
                    }
                    Err(e) => println!("{}", e),
                },
                // Keep following the ride without a console.
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    ctx.shutdown();
    tracing::info!("Shutdown complete.");
    Ok(())
}
