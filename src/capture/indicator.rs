// indicator.rs — Drives the host's "screen is being captured" indication
// (a notification or foreground-service badge) from session state changes.

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::session::SessionState;

/// Host-side presentation of an ongoing capture session.
pub trait ActivityIndicator: Send + Sync {
    fn show_capture_active(&self);
    fn clear_capture_active(&self);
}

/// Mirror `states` onto `indicator` until the manager is dropped or the
/// returned task is aborted. Abort the handle to unregister.
pub fn spawn_activity_indicator<I>(
    mut states: watch::Receiver<SessionState>,
    indicator: I,
) -> JoinHandle<()>
where
    I: ActivityIndicator + 'static,
{
    tokio::spawn(async move {
        let mut shown = false;
        loop {
            let active = *states.borrow_and_update() == SessionState::Active;
            if active != shown {
                if active {
                    indicator.show_capture_active();
                } else {
                    indicator.clear_capture_active();
                }
                shown = active;
            }
            if states.changed().await.is_err() {
                break;
            }
        }
        if shown {
            indicator.clear_capture_active();
        }
        log::debug!("Activity indicator task ended");
    })
}
