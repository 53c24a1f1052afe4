//! Control-socket link to the browser agent.
//!
//! One socket is shared by every task. Outbound action envelopes carry a
//! fresh correlation id and park a waiter in the pending map; the socket
//! reader resolves waiters as responses arrive, in whatever order the agent
//! produces them. Connection loss keeps waiters parked: a response that
//! arrives after the agent reconnects still completes its call, and anything
//! else runs into the per-call deadline.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ActionError;
use crate::model::ActionKind;

/// Base delay of the reconnect window schedule.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Number of reconnect windows before the link is declared down.
const RECONNECT_MAX_WINDOWS: u32 = 5;

/// Connection lifecycle of the control socket.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
}

/// Transport seam between the dispatcher and the wire. The production
/// implementation is [`ActionLink`]; tests substitute scripted agents.
#[async_trait]
pub trait ActionTransport: Send + Sync {
    async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ActionError>;
}

type Waiter = oneshot::Sender<Result<Value, ActionError>>;

pub struct ActionLink {
    pending: DashMap<String, Waiter>,
    writer: RwLock<Option<mpsc::Sender<Message>>>,
    state: watch::Sender<LinkState>,
    /// Bumped on every socket attach so stale reconnect supervisors retire.
    generation: AtomicU64,
    reconnect_windows: AtomicU32,
    max_in_flight: usize,
}

impl ActionLink {
    pub fn new(max_in_flight: usize) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            pending: DashMap::new(),
            writer: RwLock::new(None),
            state,
            generation: AtomicU64::new(0),
            reconnect_windows: AtomicU32::new(0),
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LinkState::Ready
    }

    /// Delay before reconnect window `attempt` (1-based): 1s, 2s, 4s, ...
    pub fn backoff_delay(attempt: u32) -> Duration {
        RECONNECT_BASE_DELAY * 2u32.pow(attempt.saturating_sub(1).min(RECONNECT_MAX_WINDOWS))
    }

    /// Adopt a freshly accepted socket. The link stays in `Connecting` until
    /// the agent's `{type:"connected"}` handshake arrives.
    pub fn attach(&self, writer: mpsc::Sender<Message>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.writer.write() = Some(writer);
        self.state.send_replace(LinkState::Connecting);
        info!(pending = self.pending.len(), "control socket attached");
    }

    /// Drop the current socket and start counting reconnect windows.
    /// Pending waiters stay parked so responses arriving after a reconnect
    /// still resolve their calls.
    pub fn detach(self: &Arc<Self>) {
        *self.writer.write() = None;
        if self.state() == LinkState::Disconnected {
            return;
        }
        self.state.send_replace(LinkState::Connecting);
        warn!("control socket lost; waiting for the browser agent to reconnect");

        let link = Arc::clone(self);
        let generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            for attempt in 1..=RECONNECT_MAX_WINDOWS {
                link.reconnect_windows.store(attempt, Ordering::SeqCst);
                tokio::time::sleep(Self::backoff_delay(attempt)).await;
                if link.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if link.is_ready() {
                    return;
                }
                debug!(attempt, "still waiting for browser agent reconnect");
            }
            if link.generation.load(Ordering::SeqCst) == generation && !link.is_ready() {
                link.state.send_replace(LinkState::Disconnected);
                warn!(
                    windows = RECONNECT_MAX_WINDOWS,
                    "browser agent did not reconnect; link marked disconnected; \
                     reopen the extension to resume"
                );
            }
        });
    }

    /// Handle one inbound text frame. `Err` means the frame was malformed
    /// and the caller should drop the socket.
    pub fn handle_frame(&self, raw: &str) -> Result<(), ActionError> {
        let frame: Value = serde_json::from_str(raw)
            .map_err(|err| ActionError::Transport(format!("malformed frame: {err}")))?;

        if let Some(kind) = frame.get("type").and_then(Value::as_str) {
            match kind {
                "connected" => {
                    let from = frame
                        .get("from")
                        .and_then(Value::as_str)
                        .unwrap_or("agent");
                    self.reconnect_windows.store(0, Ordering::SeqCst);
                    self.state.send_replace(LinkState::Ready);
                    info!(%from, "browser agent handshake complete");
                }
                "ping" => {
                    self.send_frame(json!({"type": "pong"}));
                }
                "pong" => debug!("heartbeat pong received"),
                other => debug!(kind = other, "ignoring control frame"),
            }
            return Ok(());
        }

        let Some(id) = frame.get("id").and_then(Value::as_str) else {
            warn!("dropping frame without id or type");
            return Ok(());
        };
        let Some((_, waiter)) = self.pending.remove(id) else {
            debug!(%id, "dropping response with no pending waiter (late or unknown)");
            return Ok(());
        };
        let status = frame.get("status").and_then(Value::as_str).unwrap_or("");
        let outcome = if status == "success" {
            Ok(frame.get("data").cloned().unwrap_or(Value::Null))
        } else {
            let message = frame
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("agent reported an unspecified error");
            Err(ActionError::Action(message.to_string()))
        };
        let _ = waiter.send(outcome);
        Ok(())
    }

    /// Queue a control frame on the current socket, if any.
    pub(crate) fn send_frame(&self, frame: Value) -> bool {
        let Some(writer) = self.writer.read().clone() else {
            return false;
        };
        writer.try_send(Message::Text(frame.to_string())).is_ok()
    }

    /// Send an action envelope and await its correlated response.
    pub async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ActionError> {
        if ActionKind::parse(action).is_none() {
            return Err(ActionError::UnknownAction(action.to_string()));
        }
        let Some(writer) = self.writer.read().clone() else {
            return Err(ActionError::Transport(
                "browser agent is not connected".to_string(),
            ));
        };
        if self.pending.len() >= self.max_in_flight {
            return Err(ActionError::Busy);
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let frame = json!({"id": id, "action": action, "payload": payload}).to_string();
        debug!(%id, action, "sending action envelope");
        if let Err(err) = writer.try_send(Message::Text(frame)) {
            self.pending.remove(&id);
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => ActionError::Busy,
                mpsc::error::TrySendError::Closed(_) => {
                    ActionError::Transport("control socket closed".to_string())
                }
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ActionError::Transport(
                "action link shut down while awaiting response".to_string(),
            )),
            Err(_) => {
                // A response landing after this point finds no waiter and is
                // dropped by handle_frame.
                self.pending.remove(&id);
                Err(ActionError::Timeout(timeout))
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ActionTransport for ActionLink {
    async fn call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ActionError> {
        ActionLink::call(self, action, payload, timeout).await
    }
}
