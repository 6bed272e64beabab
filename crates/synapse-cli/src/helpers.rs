//! Process-level helpers: tracing, signals and the panic hook.

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use synapse_kernel::ShutdownTrigger;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialise the global subscriber.  `RUST_LOG` takes precedence over
/// `default_level`.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

// ---------------------------------------------------------------------------
// Shutdown triggers
// ---------------------------------------------------------------------------

/// Route panics into the shutdown sequence instead of dying mid-flight.
///
/// The previously installed hook still runs afterwards, so the usual panic
/// report reaches stderr.
pub fn install_panic_hook(triggers: mpsc::UnboundedSender<ShutdownTrigger>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        error!(location = %location, payload = %payload, "unhandled fault, shutting down");
        let _ = triggers.send(ShutdownTrigger::Fault);
        previous(info);
    }));
}

/// Forward interrupt, terminate and the user signals as shutdown triggers.
pub fn spawn_signal_listener(triggers: mpsc::UnboundedSender<ShutdownTrigger>) {
    tokio::spawn(async move {
        loop {
            let Some(trigger) = next_signal().await else {
                break;
            };
            info!(signal = %trigger, "signal received");
            if triggers.send(trigger).is_err() {
                break;
            }
        }
    });
}

#[cfg(unix)]
async fn next_signal() -> Option<ShutdownTrigger> {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut usr1, mut usr2) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) {
        (Ok(term), Ok(usr1), Ok(usr2)) => (term, usr1, usr2),
        (term, usr1, usr2) => {
            let err = term.err().or(usr1.err()).or(usr2.err());
            warn!(?err, "failed to install signal handlers, only Ctrl+C is handled");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        trigger = ctrl_c() => trigger,
        _ = term.recv() => Some(ShutdownTrigger::Terminate),
        _ = usr1.recv() => Some(ShutdownTrigger::User1),
        _ = usr2.recv() => Some(ShutdownTrigger::User2),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Option<ShutdownTrigger> {
    ctrl_c().await
}

async fn ctrl_c() -> Option<ShutdownTrigger> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some(ShutdownTrigger::Interrupt),
        Err(err) => {
            warn!(?err, "failed to install Ctrl+C handler");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
