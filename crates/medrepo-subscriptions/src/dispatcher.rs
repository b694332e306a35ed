//! Subscription dispatcher.
//!
//! ```text
//!   repository ──publish──▶ DispatcherSink ──unbounded──▶ run() event loop
//!                                                            │ match
//!                                                            ▼
//!                                     DeliveryQueue::enqueue(delivery, session)
//!                                                            │ FIFO
//!                                                            ▼
//!                                       session task ──▶ SessionTransport
//! ```
//!
//! Events are fanned out in the order they were committed. Each session has
//! a single worker, so a session observes a lineage's versions in order.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use medrepo_core::{ChangeEvent, ChangeEventSink, ChangeKind, EventError, TenantContext};
use medrepo_search::{SearchIndexer, SearchQuery};
use medrepo_storage::ResourceRepository;
use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bundle;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::queue::{DeliveryQueue, InProcessQueue};
use crate::registry::SubscriptionRegistry;
use crate::session::{self, CloseReason, SessionHandle, SessionInfo, SessionState, SessionTable};
use crate::status::SubscriptionStatusWriter;
use crate::token::BindingToken;
use crate::transport::SessionTransport;
use crate::types::{ActiveSubscription, Delivery, OutboundMessage};

/// Resource types never fanned out to subscribers.
const SKIPPED_TYPES: &[&str] = &["Subscription", "AuditEvent"];

/// Result of a successful attach.
#[derive(Debug, Clone)]
pub struct Attached {
    pub session_id: String,
    pub token: BindingToken,
}

struct Inner {
    config: DispatcherConfig,
    registry: SubscriptionRegistry,
    sessions: Arc<SessionTable>,
    /// Current token value to session id
    tokens: DashMap<String, String>,
    /// Tokens that expired, with the time they did
    expired: DashMap<String, Instant>,
    queue: Arc<dyn DeliveryQueue>,
    status_writer: RwLock<Option<Arc<dyn SubscriptionStatusWriter>>>,
    indexer: SearchIndexer,
    events_tx: mpsc::UnboundedSender<ChangeEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
    cancel: CancellationToken,
}

/// Matches committed changes against active subscriptions and delivers
/// notifications to attached sessions.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SubscriptionDispatcher {
    inner: Arc<Inner>,
}

impl SubscriptionDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let sessions = Arc::new(SessionTable::new());
        let queue = Arc::new(InProcessQueue::new(sessions.clone()));
        Self::build(config, sessions, queue)
    }

    /// Dispatcher with a custom delivery queue.
    pub fn with_queue(config: DispatcherConfig, queue: Arc<dyn DeliveryQueue>) -> Self {
        Self::build(config, Arc::new(SessionTable::new()), queue)
    }

    fn build(
        config: DispatcherConfig,
        sessions: Arc<SessionTable>,
        queue: Arc<dyn DeliveryQueue>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                registry: SubscriptionRegistry::new(),
                sessions,
                tokens: DashMap::new(),
                expired: DashMap::new(),
                queue,
                status_writer: RwLock::new(None),
                indexer: SearchIndexer::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Sets where subscription status changes are written.
    ///
    /// Without a writer, a failing subscription is only dropped from the
    /// in-memory registry.
    pub fn set_status_writer(&self, writer: Arc<dyn SubscriptionStatusWriter>) {
        *self.inner.status_writer.write() = Some(writer);
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Sink to register with the repository's event publisher.
    pub fn sink(&self) -> Arc<dyn ChangeEventSink> {
        Arc::new(DispatcherSink {
            events: self.inner.events_tx.clone(),
        })
    }

    /// Loads every active subscription of every assigned tenant.
    ///
    /// Tenants whose shard is unavailable are skipped and logged; they are
    /// picked up from change events once their subscriptions are written.
    #[instrument(skip_all)]
    pub async fn load_active(&self, repository: &ResourceRepository) -> DispatchResult<usize> {
        let query = SearchQuery::parse("Subscription?status=active")
            .map_err(|e| DispatchError::invalid_subscription("*", e.to_string()))?;
        let mut loaded = 0;
        // tenants sharing a shard see the same lineages; the first one listed owns them
        let mut seen = HashSet::new();
        for assignment in repository.router().list_assignments().await? {
            let ctx = TenantContext::tenant(&assignment.tenant_id);
            let found = match repository.search(&ctx, &query).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(tenant = %assignment.tenant_id, error = %e, "Skipping tenant subscriptions");
                    continue;
                }
            };
            for stored in found {
                if !seen.insert(stored.id.clone()) {
                    continue;
                }
                match ActiveSubscription::from_resource(&assignment.tenant_id, &stored.content) {
                    Ok(Some(subscription)) => {
                        self.inner.registry.upsert(subscription);
                        loaded += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Skipping subscription"),
                }
            }
        }
        info!(subscriptions = loaded, "Active subscriptions loaded");
        Ok(loaded)
    }

    /// Binds a new session to an active subscription of the caller's tenant.
    pub fn attach(
        &self,
        ctx: &TenantContext,
        subscription_id: &str,
        transport: Arc<dyn SessionTransport>,
    ) -> DispatchResult<Attached> {
        let subscription = self
            .inner
            .registry
            .get(subscription_id)
            .filter(|sub| ctx.tenant_id().is_none_or(|tenant| tenant == sub.tenant))
            .ok_or_else(|| DispatchError::SubscriptionNotActive(subscription_id.to_string()))?;

        let config = &self.inner.config;
        let token = BindingToken::issue(config.token_ttl);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let session = SessionHandle {
            id: Uuid::new_v4().to_string(),
            subscription_id: subscription.id.clone(),
            tenant: subscription.tenant.clone(),
            attached_at: OffsetDateTime::now_utc(),
            queue: queue_tx,
            cancel: self.inner.cancel.child_token(),
            state: Arc::new(Mutex::new(SessionState {
                token: token.clone(),
                next_prompt: Instant::now() + config.prompt_after(),
                unanswered_pings: 0,
                close_reason: None,
            })),
            transport,
        };

        self.inner
            .tokens
            .insert(token.value.clone(), session.id.clone());
        self.inner
            .sessions
            .insert(session.id.clone(), session.clone());
        info!(
            session_id = %session.id,
            subscription_id = %session.subscription_id,
            tenant = %session.tenant,
            "Session attached"
        );

        let session_id = session.id.clone();
        tokio::spawn(session::run(self.clone(), session, subscription, queue_rx));
        Ok(Attached { session_id, token })
    }

    /// Records the client's answer to the last ping.
    pub fn acknowledge_ping(&self, session_id: &str) -> DispatchResult<()> {
        let session = self.session(session_id)?;
        session.state.lock().unanswered_pings = 0;
        Ok(())
    }

    /// Exchanges a still-valid token for a new one.
    ///
    /// The new token is also sent to the session's client.
    pub async fn refresh_token(&self, token: &str) -> DispatchResult<BindingToken> {
        self.prune_expired();
        if self.inner.expired.contains_key(token) {
            return Err(DispatchError::TokenExpired);
        }
        let session_id = self
            .inner
            .tokens
            .get(token)
            .map(|entry| entry.clone())
            .ok_or(DispatchError::InvalidToken)?;
        let session = self
            .session(&session_id)
            .map_err(|_| DispatchError::InvalidToken)?;

        let refreshed = {
            let mut state = session.state.lock();
            if state.token.value != token {
                return Err(DispatchError::InvalidToken);
            }
            if state.token.is_expired() {
                None
            } else {
                let refreshed = BindingToken::issue(self.inner.config.token_ttl);
                state.token = refreshed.clone();
                state.next_prompt = Instant::now() + self.inner.config.prompt_after();
                Some(refreshed)
            }
        };
        let Some(refreshed) = refreshed else {
            session.close(CloseReason::TokenExpired);
            return Err(DispatchError::TokenExpired);
        };

        self.inner.tokens.remove(token);
        self.inner
            .tokens
            .insert(refreshed.value.clone(), session_id.clone());
        debug!(session_id = %session_id, "Binding token refreshed");

        if let Err(e) = session
            .transport
            .send(OutboundMessage::Token(refreshed.clone()))
            .await
        {
            debug!(session_id = %session_id, error = %e, "Could not push refreshed token");
        }
        Ok(refreshed)
    }

    /// Closes a session at the client's request.
    pub fn detach(&self, session_id: &str) -> bool {
        self.close_session(session_id, CloseReason::Detached)
    }

    /// Sessions currently bound to a subscription.
    pub fn sessions_for(&self, subscription_id: &str) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.subscription_id == subscription_id)
            .map(|entry| entry.info())
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Runs the event loop until [`shutdown`](Self::shutdown).
    ///
    /// Only one loop may run per dispatcher; a second call returns at once.
    pub async fn run(&self) {
        let Some(mut events) = self.inner.events_rx.lock().take() else {
            warn!("Dispatcher event loop already running");
            return;
        };
        info!("Subscription dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        info!("Subscription dispatcher stopped");
    }

    /// Stops the event loop and closes every session.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// One delivery attempt of a queued notification to a session.
    pub async fn deliver(&self, session_id: &str, delivery: &Delivery) -> DispatchResult<()> {
        let session = self.session(session_id)?;
        self.deliver_to(&session, delivery).await
    }

    async fn deliver_to(&self, session: &SessionHandle, delivery: &Delivery) -> DispatchResult<()> {
        let subscription = self
            .inner
            .registry
            .get(&session.subscription_id)
            .ok_or_else(|| DispatchError::SubscriptionNotActive(session.subscription_id.clone()))?;
        let bundle = bundle::notification(&subscription, delivery);
        session
            .transport
            .send(OutboundMessage::Notification(bundle))
            .await
    }

    /// Delivers with backoff; after the allowed number of consecutive
    /// failures the subscription is put in error and its sessions closed.
    pub(crate) async fn deliver_with_retry(&self, session: &SessionHandle, delivery: Delivery) {
        let max_attempts = self
            .inner
            .registry
            .get(&session.subscription_id)
            .and_then(|sub| sub.max_attempts)
            .unwrap_or(self.inner.config.max_delivery_attempts);

        let mut attempt = 1;
        loop {
            let attempt_result = tokio::select! {
                _ = session.cancel.cancelled() => return,
                result = self.deliver_to(session, &delivery) => result,
            };
            let error = match attempt_result {
                Ok(()) => {
                    debug!(
                        session_id = %session.id,
                        lineage = %delivery.event.lineage(),
                        version_id = delivery.event.version_id,
                        event_number = delivery.event_number,
                        "Notification delivered"
                    );
                    return;
                }
                Err(DispatchError::SubscriptionNotActive(_)) => {
                    session.close(CloseReason::SubscriptionInactive);
                    return;
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!(
                    session_id = %session.id,
                    subscription_id = %session.subscription_id,
                    attempts = attempt,
                    error = %error,
                    "Delivery failed; disabling subscription"
                );
                self.fail_subscription(session, &error).await;
                return;
            }

            let backoff = self.inner.config.backoff_for(attempt);
            debug!(
                session_id = %session.id,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Delivery failed; retrying"
            );
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    async fn fail_subscription(&self, session: &SessionHandle, error: &DispatchError) {
        self.inner.registry.remove(&session.subscription_id);
        self.close_subscription_sessions(&session.subscription_id, CloseReason::DeliveryFailed);

        let writer = self.inner.status_writer.read().clone();
        if let Some(writer) = writer
            && let Err(e) = writer
                .mark_error(&session.tenant, &session.subscription_id, &error.to_string())
                .await
        {
            warn!(
                subscription_id = %session.subscription_id,
                error = %e,
                "Failed to record subscription error"
            );
        }
    }

    async fn handle_event(&self, event: ChangeEvent) {
        if event.resource_type == "Subscription" {
            self.apply_subscription_change(&event);
        }
        if SKIPPED_TYPES.contains(&event.resource_type.as_str()) || self.inner.registry.is_empty() {
            return;
        }

        let rows = match &event.resource {
            Some(content) => self.inner.indexer.index(
                &event.resource_type,
                &event.resource_id,
                event.version_id,
                content,
            ),
            None => Vec::new(),
        };

        for subscription in self.inner.registry.matching(&event, &rows) {
            let delivery = Delivery {
                event: event.clone(),
                event_number: subscription.next_event_number(),
            };
            for session_id in self.session_ids_for(&subscription.id) {
                match self.inner.queue.enqueue(delivery.clone(), &session_id).await {
                    Ok(()) => {}
                    Err(DispatchError::QueueFull(_)) => {
                        warn!(session_id = %session_id, "Delivery queue full; closing session");
                        self.close_session(&session_id, CloseReason::Lagging);
                    }
                    Err(e) => debug!(session_id = %session_id, error = %e, "Session gone before enqueue"),
                }
            }
        }
    }

    fn apply_subscription_change(&self, event: &ChangeEvent) {
        let Some(tenant) = event.tenant.as_deref() else {
            return;
        };
        let parsed = match (&event.change_kind, &event.resource) {
            (ChangeKind::Deleted, _) | (_, None) => Ok(None),
            (_, Some(content)) => ActiveSubscription::from_resource(tenant, content),
        };
        match parsed {
            Ok(Some(subscription)) => {
                self.inner.registry.upsert(subscription);
            }
            Ok(None) => {
                if self.inner.registry.remove(&event.resource_id).is_some() {
                    self.close_subscription_sessions(
                        &event.resource_id,
                        CloseReason::SubscriptionInactive,
                    );
                }
            }
            Err(e) => {
                warn!(subscription_id = %event.resource_id, error = %e, "Ignoring subscription");
                if self.inner.registry.remove(&event.resource_id).is_some() {
                    self.close_subscription_sessions(
                        &event.resource_id,
                        CloseReason::SubscriptionInactive,
                    );
                }
            }
        }
    }

    fn session(&self, session_id: &str) -> DispatchResult<SessionHandle> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DispatchError::SessionNotFound(session_id.to_string()))
    }

    fn session_ids_for(&self, subscription_id: &str) -> Vec<String> {
        let mut ids: Vec<_> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.subscription_id == subscription_id)
            .map(|entry| entry.id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn close_session(&self, session_id: &str, reason: CloseReason) -> bool {
        match self.session(session_id) {
            Ok(session) => {
                session.close(reason);
                true
            }
            Err(_) => false,
        }
    }

    fn close_subscription_sessions(&self, subscription_id: &str, reason: CloseReason) {
        for session_id in self.session_ids_for(subscription_id) {
            self.close_session(&session_id, reason);
        }
    }

    /// Removes a finished session and tells the client why it ended.
    pub(crate) async fn finish_session(&self, session: &SessionHandle) {
        let (reason, token) = {
            let state = session.state.lock();
            let reason = state.close_reason.unwrap_or(if self.inner.cancel.is_cancelled() {
                CloseReason::Shutdown
            } else {
                CloseReason::Detached
            });
            (reason, state.token.value.clone())
        };

        self.inner.sessions.remove(&session.id);
        self.inner.tokens.remove(&token);
        if reason == CloseReason::TokenExpired {
            self.inner.expired.insert(token, Instant::now());
        }

        if reason != CloseReason::Detached {
            let close = OutboundMessage::Close {
                reason: reason.to_string(),
            };
            let wait = self.inner.config.ping_interval;
            match tokio::time::timeout(wait, session.transport.send(close)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session_id = %session.id, error = %e, "Could not send close"),
                Err(_) => debug!(session_id = %session.id, "Close not accepted in time"),
            }
        }
        info!(
            session_id = %session.id,
            subscription_id = %session.subscription_id,
            reason = %reason,
            "Session closed"
        );
    }

    /// Forgets expired tokens after another token lifetime has passed.
    fn prune_expired(&self) {
        let ttl = self.inner.config.token_ttl;
        self.inner
            .expired
            .retain(|_, expired_at| expired_at.elapsed() < ttl);
    }
}

impl std::fmt::Debug for SubscriptionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionDispatcher")
            .field("subscriptions", &self.inner.registry.len())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

/// Lossless sink feeding the dispatcher's event loop.
struct DispatcherSink {
    events: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChangeEventSink for DispatcherSink {
    fn name(&self) -> &str {
        "subscriptions"
    }

    fn publish(&self, event: ChangeEvent) -> Result<(), EventError> {
        self.events
            .send(event)
            .map_err(|_| EventError::Closed("subscription dispatcher stopped".into()))
    }
}
