use signal_hook::{
    consts::{SIGINT, SIGQUIT, SIGTERM},
    iterator::Signals,
};
use tokio_util::sync::CancellationToken;

/// Cancels `shutdown` on the first SIGINT, SIGTERM or SIGQUIT.
///
/// A second signal exits right away without waiting for the drain.
pub fn handle_shutdown(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;

    std::thread::spawn(move || {
        for signal in signals.forever() {
            if shutdown.is_cancelled() {
                log::warn!("Received signal {signal} during shutdown, exiting now");
                std::process::exit(1);
            }
            log::info!("Received signal {signal}, shutting down");
            shutdown.cancel();
        }
    });

    Ok(())
}

pub fn notify_ready() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        log::debug!("Unable to notify systemd: {e}");
    }
}

pub fn notify_stopping() {
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]) {
        log::debug!("Unable to notify systemd: {e}");
    }
}
