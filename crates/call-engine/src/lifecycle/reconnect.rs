use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::timer::ScheduledTask;
use crate::types::{AgentId, CallId, SocketId, VisitorId};

/// Default time a dropped visitor has to come back
pub const DEFAULT_RECONNECT_WINDOW: Duration = Duration::from_secs(60);

/// The owner of the calls whose windows are being tracked
#[async_trait]
pub trait ReconnectHost: Send + Sync {
    /// Whether `token` is the current reconnect token for this call and visitor
    fn rejoin_allowed(&self, call_id: &CallId, visitor_id: &VisitorId, token: &str) -> bool;

    /// The window ran out; end the call as `reconnect_failed`
    async fn window_expired(&self, call_id: &CallId, visitor_id: &VisitorId, agent_id: &AgentId);

    /// Resume the call on `socket_id`, rotate the token and tell both
    /// parties. Returns false if the call could not be resumed.
    async fn complete_rejoin(&self, call_id: &CallId, visitor_id: &VisitorId, socket_id: &SocketId) -> bool;
}

#[derive(Debug)]
struct Window {
    visitor_id: VisitorId,
    agent_id: AgentId,
    timer: ScheduledTask,
}

/// Keeps calls alive while their visitor reconnects
///
/// One timer per call. Whoever removes a call's window from the map first
/// (the expiry timer, a rejoin, or an explicit cancel) decides its outcome;
/// the others find nothing and do nothing.
pub struct ReconnectionWindowManager {
    windows: Arc<Mutex<HashMap<CallId, Window>>>,
    duration: Duration,
    host: Weak<dyn ReconnectHost>,
}

impl ReconnectionWindowManager {
    pub fn new(host: Weak<dyn ReconnectHost>, duration: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            duration,
            host,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Open a window for `call_id`. Returns false if one is already running.
    pub fn start_window(&self, call_id: &CallId, visitor_id: &VisitorId, agent_id: &AgentId) -> bool {
        let mut windows = self.windows.lock();
        if windows.contains_key(call_id) {
            debug!("Reconnect window for call {} already running", call_id);
            return false;
        }

        let expiring = self.windows.clone();
        let host = self.host.clone();
        let (call, visitor, agent) = (call_id.clone(), visitor_id.clone(), agent_id.clone());
        let timer = ScheduledTask::start(self.duration, async move {
            let claimed = expiring.lock().remove(&call).is_some();
            if !claimed {
                return;
            }
            info!("⌛ Reconnect window expired for call {} (visitor {})", call, visitor);
            if let Some(host) = host.upgrade() {
                host.window_expired(&call, &visitor, &agent).await;
            }
        });

        windows.insert(
            call_id.clone(),
            Window {
                visitor_id: visitor_id.clone(),
                agent_id: agent_id.clone(),
                timer,
            },
        );
        info!(
            "⏳ Reconnect window opened for call {} ({}s)",
            call_id,
            self.duration.as_secs()
        );
        true
    }

    /// Reconcile a returning visitor.
    ///
    /// Returns false without touching the window if no window is open, the
    /// visitor is not the one recorded for the call, or the token is stale.
    pub async fn handle_rejoin(
        &self,
        call_id: &CallId,
        visitor_id: &VisitorId,
        socket_id: &SocketId,
        token: &str,
    ) -> bool {
        let recorded = self.windows.lock().get(call_id).map(|w| w.visitor_id.clone());
        match recorded {
            None => {
                debug!("Rejoin for call {} with no open window", call_id);
                return false;
            }
            Some(recorded) if &recorded != visitor_id => {
                warn!(
                    "⚠️ Rejoin for call {} by visitor {} but window belongs to {}",
                    call_id, visitor_id, recorded
                );
                return false;
            }
            Some(_) => {}
        }

        let Some(host) = self.host.upgrade() else {
            return false;
        };
        if !host.rejoin_allowed(call_id, visitor_id, token) {
            warn!("⚠️ Rejoin for call {} presented a stale token", call_id);
            return false;
        }

        // Take the window; if the timer got there first the call is gone
        let Some(window) = self.windows.lock().remove(call_id) else {
            return false;
        };
        window.timer.cancel();
        drop(window);

        host.complete_rejoin(call_id, visitor_id, socket_id).await
    }

    /// Stop a window without ending the call. Safe if none is open.
    pub fn cancel_window(&self, call_id: &CallId) -> bool {
        match self.windows.lock().remove(call_id) {
            Some(window) => {
                window.timer.cancel();
                debug!("Reconnect window for call {} cancelled", call_id);
                true
            }
            None => false,
        }
    }

    pub fn is_waiting(&self, call_id: &CallId) -> bool {
        self.windows.lock().contains_key(call_id)
    }

    /// Time left in a call's window
    pub fn remaining(&self, call_id: &CallId) -> Option<Duration> {
        self.windows.lock().get(call_id).map(|w| w.timer.remaining())
    }

    /// Agent a waiting call belongs to
    pub fn agent_for(&self, call_id: &CallId) -> Option<AgentId> {
        self.windows.lock().get(call_id).map(|w| w.agent_id.clone())
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every window (shutdown)
    pub fn clear_all(&self) -> usize {
        let drained: Vec<Window> = self.windows.lock().drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for window in drained {
            window.timer.cancel();
        }
        count
    }
}

impl std::fmt::Debug for ReconnectionWindowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionWindowManager")
            .field("open_windows", &self.len())
            .field("duration", &self.duration)
            .finish()
    }
}
