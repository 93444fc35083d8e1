use chrono::Utc;
use tracing::instrument;

use herald_core::identity::Identity;
use herald_core::ids::{ConversationId, MessageId};
use herald_core::message::{MediaType, MessageRecord, MessageStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::users::UserRow;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message and return it with the assigned id and timestamp.
    /// The returned record is the canonical shape for broadcast; callers
    /// must never fan out anything the store has not acknowledged.
    #[instrument(skip(self, sender, content), fields(conversation_id = %conversation_id, sender_id = %sender.id))]
    pub fn insert(
        &self,
        conversation_id: ConversationId,
        sender: &UserRow,
        content: Option<&str>,
        media_url: Option<&str>,
        media_type: Option<MediaType>,
    ) -> Result<MessageRecord, StoreError> {
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, sender_id, content, media_url, media_type, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'sent', ?6)",
                rusqlite::params![
                    conversation_id.as_i64(),
                    sender.id.as_i64(),
                    content,
                    media_url,
                    media_type.map(|t| t.to_string()),
                    now,
                ],
            )?;

            Ok(MessageRecord {
                id: MessageId::new(conn.last_insert_rowid()),
                conversation_id,
                sender: sender.identity(),
                content: content.map(str::to_string),
                media_url: media_url.map(str::to_string),
                media_type,
                status: MessageStatus::Sent,
                created_at: now.clone(),
            })
        })
    }

    /// Page through a conversation's messages, oldest first within the page.
    /// The query walks newest-first so offset 0 is always the latest page.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, limit, offset))]
    pub fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.content, m.media_url, m.media_type, m.status, m.created_at,
                        u.external_id, u.name, u.avatar_url
                 FROM messages m
                 JOIN users u ON u.id = m.sender_id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                conversation_id.as_i64(),
                limit,
                offset
            ])?;

            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_record(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<MessageRecord, StoreError> {
    let status_str: String = row_helpers::get(row, 5, "messages", "status")?;
    let media_type_str: Option<String> = row_helpers::get_opt(row, 4, "messages", "media_type")?;

    Ok(MessageRecord {
        id: MessageId::new(row_helpers::get::<i64>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::new(row_helpers::get::<i64>(
            row,
            1,
            "messages",
            "conversation_id",
        )?),
        sender: Identity {
            external_id: row_helpers::get(row, 7, "users", "external_id")?,
            name: row_helpers::get(row, 8, "users", "name")?,
            avatar_url: row_helpers::get_opt(row, 9, "users", "avatar_url")?,
        },
        content: row_helpers::get_opt(row, 2, "messages", "content")?,
        media_url: row_helpers::get_opt(row, 3, "messages", "media_url")?,
        media_type: media_type_str
            .map(|s| row_helpers::parse_enum(&s, "messages", "media_type"))
            .transpose()?,
        status: row_helpers::parse_enum(&status_str, "messages", "status")?,
        created_at: row_helpers::get(row, 6, "messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationRepo;
    use crate::users::UserRepo;

    fn setup() -> (MessageRepo, UserRow, UserRow, ConversationId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let alice = users.upsert("appA:alice", "Alice", None).unwrap();
        let bob = users.upsert("appA:bob", "Bob", None).unwrap();
        let convos = ConversationRepo::new(db.clone());
        let convo = convos.create_private(alice.id, bob.id).unwrap();
        (MessageRepo::new(db), alice, bob, convo.id)
    }

    #[test]
    fn insert_returns_persisted_record() {
        let (repo, alice, _, convo_id) = setup();
        let record = repo
            .insert(convo_id, &alice, Some("hi"), None, None)
            .unwrap();

        assert!(record.id.as_i64() > 0);
        assert_eq!(record.conversation_id, convo_id);
        assert_eq!(record.sender.external_id, "appA:alice");
        assert_eq!(record.content.as_deref(), Some("hi"));
        assert_eq!(record.status, MessageStatus::Sent);
        assert!(!record.created_at.is_empty());
    }

    #[test]
    fn insert_media_message() {
        let (repo, alice, _, convo_id) = setup();
        let record = repo
            .insert(
                convo_id,
                &alice,
                None,
                Some("https://cdn/x.png"),
                Some(MediaType::Image),
            )
            .unwrap();

        assert!(record.content.is_none());
        assert_eq!(record.media_url.as_deref(), Some("https://cdn/x.png"));
        assert_eq!(record.media_type, Some(MediaType::Image));

        let listed = repo.list_for_conversation(convo_id, 10, 0).unwrap();
        assert_eq!(listed[0].media_type, Some(MediaType::Image));
    }

    #[test]
    fn list_returns_chronological_order() {
        let (repo, alice, bob, convo_id) = setup();
        repo.insert(convo_id, &alice, Some("one"), None, None).unwrap();
        repo.insert(convo_id, &bob, Some("two"), None, None).unwrap();
        repo.insert(convo_id, &alice, Some("three"), None, None).unwrap();

        let listed = repo.list_for_conversation(convo_id, 10, 0).unwrap();
        let contents: Vec<_> = listed.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn list_pagination_walks_backwards() {
        let (repo, alice, _, convo_id) = setup();
        for i in 0..5 {
            repo.insert(convo_id, &alice, Some(&format!("m{i}")), None, None)
                .unwrap();
        }

        let latest = repo.list_for_conversation(convo_id, 2, 0).unwrap();
        let contents: Vec<_> = latest.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);

        let older = repo.list_for_conversation(convo_id, 2, 2).unwrap();
        let contents: Vec<_> = older.iter().filter_map(|m| m.content.as_deref()).collect();
        assert_eq!(contents, vec!["m1", "m2"]);
    }

    #[test]
    fn list_scoped_to_conversation() {
        let (repo, alice, bob, convo_id) = setup();
        repo.insert(convo_id, &alice, Some("here"), None, None).unwrap();

        let db = repo.db.clone();
        let other = ConversationRepo::new(db).create_group(&[alice.id, bob.id]).unwrap();
        repo.insert(other.id, &bob, Some("elsewhere"), None, None).unwrap();

        let listed = repo.list_for_conversation(convo_id, 10, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content.as_deref(), Some("here"));
    }
}
