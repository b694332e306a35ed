//! Client sessions bound to a subscription.
//!
//! Each session runs two tasks: one drains its delivery queue in FIFO order,
//! the other drives its timers (liveness pings, token refresh prompts and
//! token expiry). Closing a session cancels both and discards the queue.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundle;
use crate::dispatcher::SubscriptionDispatcher;
use crate::token::BindingToken;
use crate::transport::SessionTransport;
use crate::types::{ActiveSubscription, Delivery, OutboundMessage};

/// Live sessions keyed by session id.
pub(crate) type SessionTable = DashMap<String, SessionHandle>;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The client went away or detached
    Detached,
    /// The delivery queue overflowed
    Lagging,
    /// Pings went unanswered
    PingTimeout,
    TokenExpired,
    /// Delivery failed too often; the subscription is in error
    DeliveryFailed,
    /// The subscription was deleted or is no longer active
    SubscriptionInactive,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Lagging => "lagging",
            Self::PingTimeout => "ping-timeout",
            Self::TokenExpired => "token-expired",
            Self::DeliveryFailed => "delivery-failed",
            Self::SubscriptionInactive => "subscription-inactive",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub token: BindingToken,
    /// When the next refresh prompt is due
    pub next_prompt: Instant,
    pub unanswered_pings: u32,
    pub close_reason: Option<CloseReason>,
}

/// Shared handle of a live session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub id: String,
    pub subscription_id: String,
    pub tenant: String,
    pub attached_at: OffsetDateTime,
    pub queue: mpsc::Sender<Delivery>,
    pub cancel: CancellationToken,
    pub state: Arc<Mutex<SessionState>>,
    pub transport: Arc<dyn SessionTransport>,
}

impl SessionHandle {
    /// Records the close reason (first one wins) and stops the session task.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if state.close_reason.is_none() {
                state.close_reason = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            session_id: self.id.clone(),
            subscription_id: self.subscription_id.clone(),
            tenant: self.tenant.clone(),
            attached_at: self.attached_at,
            token_expires_at: state.token.expires_at,
            unanswered_pings: state.unanswered_pings,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub subscription_id: String,
    pub tenant: String,
    #[serde(with = "time::serde::rfc3339")]
    pub attached_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub token_expires_at: OffsetDateTime,
    pub unanswered_pings: u32,
}

/// Body of a session task.
///
/// Deliveries run in their own task so a slow or stalled client never holds
/// up the timers; liveness and token expiry keep being enforced while a send
/// is blocked or backing off.
pub(crate) async fn run(
    dispatcher: SubscriptionDispatcher,
    session: SessionHandle,
    subscription: Arc<ActiveSubscription>,
    queue: mpsc::Receiver<Delivery>,
) {
    let config = dispatcher.config().clone();
    let delivery = tokio::spawn(drain_queue(
        dispatcher.clone(),
        session.clone(),
        subscription,
        queue,
    ));

    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !session.cancel.is_cancelled() {
        let (deadline, next_prompt) = {
            let state = session.state.lock();
            (state.token.deadline, state.next_prompt)
        };

        tokio::select! {
            biased;

            _ = session.cancel.cancelled() => break,

            _ = sleep_until(deadline) => {
                // a refresh may have replaced the token while we slept
                if session.state.lock().token.is_expired() {
                    debug!(session_id = %session.id, "Binding token expired");
                    session.close(CloseReason::TokenExpired);
                }
            }

            _ = sleep_until(next_prompt) => {
                let expires_at = {
                    let mut state = session.state.lock();
                    if Instant::now() < state.next_prompt {
                        continue;
                    }
                    state.next_prompt += config.refresh_cadence;
                    state.token.expires_at
                };
                debug!(session_id = %session.id, "Prompting for token refresh");
                let prompt = OutboundMessage::RefreshPrompt { expires_at };
                match timeout(config.ping_interval, session.transport.send(prompt)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => session.close(CloseReason::Detached),
                    Err(_) => debug!(session_id = %session.id, "Refresh prompt not accepted in time"),
                }
            }

            _ = ping.tick() => {
                let unanswered = {
                    let mut state = session.state.lock();
                    let unanswered = state.unanswered_pings;
                    if unanswered < config.missed_pings {
                        state.unanswered_pings += 1;
                    }
                    unanswered
                };
                if unanswered >= config.missed_pings {
                    info!(
                        session_id = %session.id,
                        subscription_id = %session.subscription_id,
                        unanswered,
                        "Session missed its pings"
                    );
                    session.close(CloseReason::PingTimeout);
                    continue;
                }
                // a ping the client cannot take counts as unanswered
                match timeout(config.ping_interval, session.transport.send(OutboundMessage::Ping)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => session.close(CloseReason::Detached),
                    Err(_) => debug!(session_id = %session.id, "Ping not accepted in time"),
                }
            }
        }
    }

    if let Err(e) = delivery.await {
        warn!(session_id = %session.id, error = %e, "Delivery task failed");
    }
    dispatcher.finish_session(&session).await;
}

/// Sends the greeting, then drains the queue in FIFO order until the
/// session is cancelled.
async fn drain_queue(
    dispatcher: SubscriptionDispatcher,
    session: SessionHandle,
    subscription: Arc<ActiveSubscription>,
    mut queue: mpsc::Receiver<Delivery>,
) {
    let token = session.state.lock().token.clone();
    let greeting = async {
        session
            .transport
            .send(OutboundMessage::Handshake(bundle::handshake(&subscription)))
            .await?;
        session.transport.send(OutboundMessage::Token(token)).await
    };
    tokio::select! {
        _ = session.cancel.cancelled() => return,
        result = greeting => {
            if let Err(e) = result {
                debug!(session_id = %session.id, error = %e, "Handshake failed");
                session.close(CloseReason::Detached);
                return;
            }
        }
    }

    loop {
        let delivery = tokio::select! {
            _ = session.cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };
        dispatcher.deliver_with_retry(&session, delivery).await;
    }
}
