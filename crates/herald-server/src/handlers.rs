use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use herald_core::events::{ClientEvent, ServerEvent};
use herald_core::ids::{ConversationId, SessionId};
use herald_core::message::{MediaType, MessageRecord};
use herald_store::{ConversationRepo, MessageRepo, StoreError, UserRepo};

use crate::metrics::{MESSAGES_RELAYED_TOTAL, RELAY_ERRORS_TOTAL, TYPING_SIGNALS_TOTAL};
use crate::server::AppState;
use crate::sessions::Session;

/// Why a send was rejected. Every variant maps to an error frame for the
/// sending session; none of them reach anyone else.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not a participant of conversation {0}")]
    NotAuthorized(ConversationId),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RelayError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotAuthorized(_) => "not_authorized",
            Self::NotFound(_) => "not_found",
            Self::Store(_) => "store_unavailable",
        }
    }

    /// The error frame for the sending session. Store failures get a
    /// generic message; the detail stays in the logs.
    pub fn to_event(&self) -> ServerEvent {
        match self {
            Self::NotAuthorized(_) => ServerEvent::not_authorized(self.to_string()),
            Self::NotFound(_) => ServerEvent::not_found(self.to_string()),
            Self::Store(_) => ServerEvent::store_unavailable("message could not be saved"),
        }
    }
}

/// Dispatch one parsed client event. The returned event, if any, goes back
/// to the originating session only; fan-out to other sessions happens
/// inside the individual handlers.
pub fn handle_client_event(
    state: &AppState,
    session: &Session,
    event: ClientEvent,
) -> Option<ServerEvent> {
    // A reaped session's socket can keep delivering frames until its
    // reader notices; only ids the registry still holds get dispatched.
    if !state.registry.contains(&session.id) {
        debug!(
            session_id = %session.id,
            event = event.event_name(),
            "dropping frame from unregistered session"
        );
        return None;
    }

    match event {
        ClientEvent::Auth { .. } => {
            // The gate already ran at connect; a repeat frame is noise.
            debug!(session_id = %session.id, "ignoring auth frame on established session");
            None
        }
        ClientEvent::Join(conversation_id) => {
            state.rooms.join(&session.id, conversation_id);
            None
        }
        ClientEvent::SendMessage {
            conversation_id,
            content,
            media_url,
            media_type,
        } => {
            let result = send_message(
                state,
                session,
                conversation_id,
                content.as_deref(),
                media_url.as_deref(),
                media_type,
            );
            match result {
                Ok(record) => Some(ServerEvent::MessageSent(record)),
                Err(err) => {
                    counter!(RELAY_ERRORS_TOTAL, "code" => err.code()).increment(1);
                    warn!(
                        session_id = %session.id,
                        conversation_id = %conversation_id,
                        error = %err,
                        "send rejected"
                    );
                    Some(err.to_event())
                }
            }
        }
        ClientEvent::TypingStart(conversation_id) => {
            relay_typing(state, session, conversation_id, true);
            None
        }
        ClientEvent::TypingStop(conversation_id) => {
            relay_typing(state, session, conversation_id, false);
            None
        }
    }
}

/// Persist a message and fan it out to every session joined to the room,
/// the sender's own sessions included.
///
/// Order matters: existence and membership are checked against the store,
/// the row is written, and only an acknowledged insert is broadcast. A
/// failure at any step reaches nobody but the sender.
#[instrument(skip(state, session, content, media_url), fields(session_id = %session.id))]
fn send_message(
    state: &AppState,
    session: &Session,
    conversation_id: ConversationId,
    content: Option<&str>,
    media_url: Option<&str>,
    media_type: Option<MediaType>,
) -> Result<MessageRecord, RelayError> {
    let users = UserRepo::new(state.db.clone());
    let sender = users
        .find_by_external_id(&session.identity.external_id)?
        .ok_or_else(|| RelayError::NotFound(format!("user {}", session.identity.external_id)))?;

    let conversations = ConversationRepo::new(state.db.clone());
    if !conversations.exists(conversation_id)? {
        return Err(RelayError::NotFound(format!(
            "conversation {conversation_id}"
        )));
    }
    if !conversations.is_participant(conversation_id, sender.id)? {
        return Err(RelayError::NotAuthorized(conversation_id));
    }

    let messages = MessageRepo::new(state.db.clone());
    let record = messages.insert(conversation_id, &sender, content, media_url, media_type)?;

    let targets = state.rooms.broadcast_targets(conversation_id);
    state
        .registry
        .send_to_many(&targets, &ServerEvent::NewMessage(record.clone()));
    counter!(MESSAGES_RELAYED_TOTAL).increment(1);
    info!(message_id = %record.id, targets = targets.len(), "message relayed");

    Ok(record)
}

/// Relay a typing signal to everyone in the room except the session that
/// produced it. The sender's other sessions do receive it. Nothing is
/// persisted and no membership check runs; an empty room means nobody
/// hears it.
fn relay_typing(
    state: &AppState,
    session: &Session,
    conversation_id: ConversationId,
    is_typing: bool,
) {
    counter!(TYPING_SIGNALS_TOTAL).increment(1);

    let targets: Vec<SessionId> = state
        .rooms
        .broadcast_targets(conversation_id)
        .into_iter()
        .filter(|id| *id != session.id)
        .collect();
    if targets.is_empty() {
        return;
    }

    let event = ServerEvent::UserTyping {
        user_id: session.identity.external_id.clone(),
        user_name: session.identity.name.clone(),
        is_typing,
    };
    state.registry.send_to_many(&targets, &event);
    debug!(
        session_id = %session.id,
        conversation_id = %conversation_id,
        is_typing,
        targets = targets.len(),
        "typing relayed"
    );
}
