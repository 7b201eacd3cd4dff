//! Thin periodic scheduler wrapper around [`hb_session::Session::probe`].
//!
//! Mirrors `hawkbit_autohandler`/`autohandler` from the original
//! embedded client: run a poll, react to the terminal status, sleep for
//! the current polling interval, repeat. Unlike the original there is no
//! Zephyr delayable work item; `tokio::time::sleep` stands in for it.

use hb_session::{Session, Terminal};
use std::time::Duration;

/// Run the scheduler loop forever. `on_unconfirmed_image` is invoked in
/// place of the original's warm reboot when a poll reports
/// `UnconfirmedImage`; a hosted build typically exits the process there
/// so a supervisor can restart into the previous confirmed image.
pub async fn run(mut session: Session, on_unconfirmed_image: impl Fn()) -> ! {
    loop {
        let terminal = session.probe().await;
        log_terminal(terminal);
        if terminal == Terminal::UnconfirmedImage {
            on_unconfirmed_image();
        }
        let interval_ms = session.poll_interval_ms();
        tokio::time::sleep(Duration::from_millis(u64::from(interval_ms))).await;
    }
}

fn log_terminal(terminal: Terminal) {
    match terminal {
        Terminal::Ok => tracing::info!("poll complete: nothing to do"),
        Terminal::NoUpdate => tracing::info!("poll complete: no deployment assigned"),
        Terminal::UpdateInstalled => tracing::info!("poll complete: update installed, swap requested"),
        Terminal::CancelUpdate => tracing::info!("poll complete: server cancellation acknowledged"),
        Terminal::UnconfirmedImage => tracing::warn!("running image is unconfirmed, rebooting"),
        Terminal::DownloadError => tracing::error!("poll failed: download or swap request error"),
        Terminal::NetworkingError => tracing::error!("poll failed: networking error"),
        Terminal::MetadataError => tracing::error!("poll failed: malformed server response"),
    }
}
