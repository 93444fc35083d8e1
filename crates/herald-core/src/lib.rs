pub mod events;
pub mod identity;
pub mod ids;
pub mod message;
pub mod presence;

pub use events::{ClientEvent, ServerEvent};
pub use identity::Identity;
pub use ids::{ConversationId, MessageId, SessionId, UserId};
pub use message::{MediaType, MessageRecord, MessageStatus};
pub use presence::{PresenceEvent, PresenceKind};
