//! Ties an event channel to the session lifecycle
//!
//! Login starts the channel, logout stops it, and a new session replacing an
//! active one (another user, or a refreshed token) restarts it so the next
//! connection is addressed with the current credentials.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::gate::{Session, SessionGate};
use crate::channel::EventChannel;

/// Background task following the session. Dropping it stops following but
/// leaves the channel in whatever state it reached.
pub struct SessionBinding {
    task: JoinHandle<()>,
}

impl SessionBinding {
    /// If a session is already active the channel is started right away.
    pub fn spawn(gate: Arc<dyn SessionGate>, channel: EventChannel) -> Self {
        let sessions = gate.watch();
        let task = tokio::spawn(follow(sessions, channel));
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SessionBinding {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn follow(mut sessions: watch::Receiver<Option<Session>>, channel: EventChannel) {
    let mut current = sessions.borrow_and_update().clone();
    if let Some(session) = &current {
        debug!(user_id = %session.user.id, "Session already active, starting event channel");
        channel.start().await;
    }

    while sessions.changed().await.is_ok() {
        let next = sessions.borrow_and_update().clone();

        match (&current, &next) {
            (None, Some(session)) => {
                info!(user_id = %session.user.id, "Session started, starting event channel");
                channel.start().await;
            }
            (Some(session), None) => {
                info!(user_id = %session.user.id, "Session ended, stopping event channel");
                channel.stop().await;
            }
            (Some(old), Some(new)) if old != new => {
                info!(
                    from_user = %old.user.id,
                    to_user = %new.user.id,
                    "Session replaced, restarting event channel"
                );
                channel.stop().await;
                channel.start().await;
            }
            (Some(_), Some(session)) => {
                // a logout and login of the same session can coalesce into
                // this; the channel may have settled closed in between
                trace!(user_id = %session.user.id, "Session unchanged, ensuring event channel is started");
                channel.start().await;
            }
            (None, None) => {}
        }

        current = next;
    }

    debug!("Session source dropped, binding exits");
}
