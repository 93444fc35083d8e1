use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use herald_core::events::{ClientEvent, ServerEvent};
use herald_core::identity::Identity;
use herald_core::ids::SessionId;
use herald_store::{ConversationRepo, UserRepo};

use crate::auth::AuthError;
use crate::handlers;
use crate::metrics::{
    WS_AUTH_FAILURES_TOTAL, WS_BROADCAST_DROPS_TOTAL, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_SESSIONS_ACTIVE,
};
use crate::presence::PresenceTracker;
use crate::rooms::RoomIndex;
use crate::server::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_TIMEOUT: Duration = Duration::from_secs(90);

/// How long a connection without a bearer header may sit silent before
/// its opening auth frame is due.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// A live authenticated connection.
pub struct Session {
    pub id: SessionId,
    pub identity: Identity,
    tx: mpsc::Sender<Arc<String>>,
    last_pong: AtomicU64,
    counted_online: AtomicBool,
}

impl Session {
    fn new(id: SessionId, identity: Identity, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            identity,
            tx,
            last_pong: AtomicU64::new(now_secs()),
            counted_online: AtomicBool::new(false),
        }
    }

    /// Queue a pre-serialized frame for this session's writer task.
    ///
    /// Returns `false` if the queue is full or the writer is gone; a full
    /// queue drops the frame rather than block the sender.
    pub fn send(&self, message: Arc<String>) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                warn!(
                    session_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(Arc::new(json)),
            Err(err) => {
                warn!(event = event.event_name(), error = %err, "failed to serialize event");
                false
            }
        }
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < SESSION_TIMEOUT.as_secs()
    }

    /// Record that this session has been counted toward its identity's
    /// presence refcount. Teardown decrements only for counted sessions.
    pub fn mark_counted_online(&self) {
        self.counted_online.store(true, Ordering::Relaxed);
    }

    pub fn counted_online(&self) -> bool {
        self.counted_online.load(Ordering::Relaxed)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of every live session, keyed by session id.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    max_send_queue: usize,
}

impl SessionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new session for an authenticated identity and return it
    /// together with the receiving end of its send queue.
    pub fn register(&self, identity: Identity) -> (Arc<Session>, mpsc::Receiver<Arc<String>>) {
        let id = SessionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let session = Arc::new(Session::new(id.clone(), identity, tx));
        let previous = self.sessions.insert(id.clone(), Arc::clone(&session));
        debug_assert!(previous.is_none(), "session id collision");
        if previous.is_some() {
            error!(session_id = %id, "replaced a session with a colliding id");
        }
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_SESSIONS_ACTIVE).increment(1.0);
        (session, rx)
    }

    /// Remove a session. Returns it if it was present, or `None` if it was
    /// already gone; teardown keys its idempotence off that `None`.
    pub fn unregister(&self, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        gauge!(WS_SESSIONS_ACTIVE).decrement(1.0);
        Some(session)
    }

    pub fn identity_of(&self, id: &SessionId) -> Option<Identity> {
        self.sessions.get(id).map(|s| s.identity.clone())
    }

    /// Whether the registry still holds the id.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Distinct identities with at least one live session.
    pub fn list_online_identities(&self) -> Vec<Identity> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for entry in self.sessions.iter() {
            let identity = &entry.value().identity;
            if seen.insert(identity.external_id.clone()) {
                result.push(identity.clone());
            }
        }
        result
    }

    /// Every live session and the identity behind it.
    pub fn list_details(&self) -> Vec<(SessionId, Identity)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().identity.clone()))
            .collect()
    }

    pub fn send_to(&self, id: &SessionId, event: &ServerEvent) -> bool {
        match self.sessions.get(id) {
            Some(session) => session.send_event(event),
            None => false,
        }
    }

    /// Serialize once, queue to every target that is still registered.
    /// Returns the number of sessions the frame was queued for.
    pub fn send_to_many(&self, targets: &[SessionId], event: &ServerEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => Arc::new(json),
            Err(err) => {
                warn!(event = event.event_name(), error = %err, "failed to serialize event");
                return 0;
            }
        };
        let mut delivered = 0;
        for id in targets {
            if let Some(session) = self.sessions.get(id) {
                if session.send(Arc::clone(&json)) {
                    delivered += 1;
                }
            }
        }
        debug!(
            event = event.event_name(),
            targets = targets.len(),
            delivered,
            "fan-out"
        );
        delivered
    }

    /// Queue an event to every live session.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => Arc::new(json),
            Err(err) => {
                warn!(event = event.event_name(), error = %err, "failed to serialize event");
                return 0;
            }
        };
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            if entry.value().send(Arc::clone(&json)) {
                delivered += 1;
            }
        }
        debug!(event = event.event_name(), delivered, "broadcast");
        delivered
    }

    /// Sessions that have not answered a ping within the timeout.
    pub fn expired_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Tear a session down: drop its room memberships, unregister it, and
/// announce the identity offline if this was its last counted session.
///
/// Safe to call twice for the same id; the reader-exit path and the reaper
/// can race here. The room sweep runs on every call, not just the first,
/// so an entry re-added by a frame racing the reaper still gets cleared.
/// Presence is decremented only for sessions whose online step ran.
pub fn teardown_session(
    registry: &SessionRegistry,
    rooms: &RoomIndex,
    presence: &PresenceTracker,
    session_id: &SessionId,
) {
    rooms.remove_session(session_id);

    let session = match registry.unregister(session_id) {
        Some(session) => session,
        None => return,
    };
    if session.counted_online() {
        if let Some(event) = presence.session_offline(&session.identity.external_id) {
            registry.broadcast_all(&ServerEvent::UserStatusChanged {
                user_id: event.user_id,
                status: event.kind,
            });
        }
    }
    info!(session_id = %session_id, user_id = %session.identity.external_id, "session closed");
}

/// Count the session toward its identity's presence refcount and broadcast
/// the `online` transition if it was the identity's first live session.
pub fn announce_online(
    registry: &SessionRegistry,
    presence: &PresenceTracker,
    session: &Session,
) {
    let event = presence.session_online(&session.identity.external_id);
    session.mark_counted_online();
    if let Some(event) = event {
        registry.broadcast_all(&ServerEvent::UserStatusChanged {
            user_id: event.user_id,
            status: event.kind,
        });
    }
}

/// Periodically reap sessions whose heartbeat lapsed, running the same
/// teardown as a clean disconnect.
pub fn start_cleanup_task(
    registry: Arc<SessionRegistry>,
    rooms: Arc<RoomIndex>,
    presence: Arc<PresenceTracker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let expired = registry.expired_sessions();
            if expired.is_empty() {
                continue;
            }
            for id in &expired {
                info!(session_id = %id, "reaping unresponsive session");
                teardown_session(&registry, &rooms, &presence, id);
            }
            info!(removed = expired.len(), "dead session cleanup");
        }
    })
}

/// Drive one WebSocket connection from upgrade to teardown.
///
/// The gate runs before anything else: no registry entry, no room
/// membership, and no presence transition exists until the token verifies
/// and the identity row is written. After setup the writer task owns the
/// socket's send half and the reader loop handles frames inline, one at a
/// time, so a session's own events are processed in arrival order.
pub async fn handle_connection(socket: WebSocket, state: AppState, bearer: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let token = match bearer {
        Some(token) => Some(token),
        None => await_auth_frame(&mut ws_rx).await,
    };
    // Rejections close the socket without a frame; an unauthenticated
    // client learns nothing about why.
    let Some(token) = token else {
        let err = AuthError::MissingToken;
        counter!(WS_AUTH_FAILURES_TOTAL, "reason" => err.reason()).increment(1);
        warn!(error = %err, "rejecting connection");
        return;
    };

    let claims = match state.auth.verify(&token) {
        Ok(claims) => claims,
        Err(err) => {
            counter!(WS_AUTH_FAILURES_TOTAL, "reason" => err.reason()).increment(1);
            warn!(error = %err, "rejecting connection");
            return;
        }
    };

    // Refresh the durable identity row before the session becomes visible.
    let users = UserRepo::new(state.db.clone());
    let user = match users.upsert(&claims.sub, &claims.name, claims.avatar_url.as_deref()) {
        Ok(user) => user,
        Err(err) => {
            error!(error = %err, user_id = %claims.sub, "identity upsert failed");
            send_direct(
                &mut ws_tx,
                &ServerEvent::store_unavailable("could not persist identity"),
            )
            .await;
            return;
        }
    };
    let identity = user.identity();

    let (session, mut rx) = state.registry.register(identity.clone());
    info!(session_id = %session.id, user_id = %identity.external_id, "session established");

    // Mirror store membership into the room index so fan-out starts working
    // without an explicit join round-trip.
    let conversations = ConversationRepo::new(state.db.clone());
    match conversations.ids_for_user(user.id) {
        Ok(rooms) => state.rooms.bulk_join(&session.id, &rooms),
        Err(err) => {
            error!(error = %err, session_id = %session.id, "could not load memberships");
            teardown_session(&state.registry, &state.rooms, &state.presence, &session.id);
            send_direct(
                &mut ws_tx,
                &ServerEvent::store_unavailable("could not load memberships"),
            )
            .await;
            return;
        }
    }

    // Ack before the writer takes the socket, so `authenticated` is the
    // first frame the client sees.
    send_direct(
        &mut ws_tx,
        &ServerEvent::Authenticated {
            user_id: identity.external_id.clone(),
            name: identity.name.clone(),
        },
    )
    .await;

    // Announce after registration: the new session hears its own identity
    // come online like everyone else.
    announce_online(&state.registry, &state.presence, &session);

    // Writer task: drain the send queue into the socket + periodic ping.
    let writer_session = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    trace!(session_id = %writer_session.id, "sent ping");
                }
            }
        }
    });

    // Reader loop runs inline: one frame fully handled before the next.
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            WsMessage::Text(text) => process_frame(&state, &session, text.as_str()),
            WsMessage::Pong(_) => session.record_pong(),
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) => {} // axum answers pings automatically
            _ => {}
        }
    }

    teardown_session(&state.registry, &state.rooms, &state.presence, &session.id);
    writer.abort();
}

/// Parse and dispatch one inbound frame, queueing the reply if any.
fn process_frame(state: &AppState, session: &Arc<Session>, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            let name = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(String::from));
            debug!(
                session_id = %session.id,
                event = name.as_deref().unwrap_or("unknown"),
                error = %err,
                "discarding unparseable frame"
            );
            // A malformed send is the one case the client must hear about;
            // everything else is dropped silently.
            if name.as_deref() == Some("send_message") {
                session.send_event(&ServerEvent::bad_request("malformed send_message payload"));
            }
            return;
        }
    };

    trace!(session_id = %session.id, event = event.event_name(), "client event");
    if let Some(reply) = handlers::handle_client_event(state, session, event) {
        session.send_event(&reply);
    }
}

/// Wait for the opening `auth` frame from a client that supplied no bearer
/// header. Anything other than an auth frame within the deadline fails the
/// gate.
async fn await_auth_frame(ws_rx: &mut SplitStream<WebSocket>) -> Option<String> {
    let frame = tokio::time::timeout(AUTH_DEADLINE, async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let WsMessage::Text(text) = msg {
                return Some(text.to_string());
            }
        }
        None
    })
    .await
    .ok()
    .flatten()?;

    match serde_json::from_str::<ClientEvent>(&frame) {
        Ok(ClientEvent::Auth { token }) => Some(token),
        _ => None,
    }
}

/// Send on the socket directly, before the writer task owns it.
async fn send_direct(ws_tx: &mut SplitSink<WebSocket, WsMessage>, event: &ServerEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = ws_tx.send(WsMessage::Text(json.into())).await;
    }
}
