use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use herald_core::ids::{ConversationId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Private,
    Group,
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Group => write!(f, "group"),
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Member,
    Admin,
}

impl std::fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Member => write!(f, "member"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for ParticipantRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Self::Member),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown participant role: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub participant_ids_hash: Option<String>,
    pub created_at: String,
}

/// Deterministic key for a private conversation: sorted participant ids
/// joined with ",". Two create calls for the same pair always collide.
fn participant_ids_hash(members: &[UserId]) -> String {
    let mut ids: Vec<i64> = members.iter().map(|id| id.as_i64()).collect();
    ids.sort_unstable();
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get or create the private conversation between two users.
    #[instrument(skip(self), fields(a = %a, b = %b))]
    pub fn create_private(&self, a: UserId, b: UserId) -> Result<ConversationRow, StoreError> {
        let hash = participant_ids_hash(&[a, b]);

        self.db.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, kind, participant_ids_hash, created_at
                     FROM conversations WHERE participant_ids_hash = ?1",
                    [hash.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .ok();

            if let Some((id, kind, participant_ids_hash, created_at)) = existing {
                return Ok(ConversationRow {
                    id: ConversationId::new(id),
                    kind: row_helpers::parse_enum(&kind, "conversations", "kind")?,
                    participant_ids_hash,
                    created_at,
                });
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO conversations (kind, participant_ids_hash, created_at) VALUES ('private', ?1, ?2)",
                rusqlite::params![hash, now],
            )?;
            let id = conn.last_insert_rowid();

            for member in [a, b] {
                conn.execute(
                    "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, role)
                     VALUES (?1, ?2, 'member')",
                    rusqlite::params![id, member.as_i64()],
                )?;
            }

            Ok(ConversationRow {
                id: ConversationId::new(id),
                kind: ConversationKind::Private,
                participant_ids_hash: Some(hash.clone()),
                created_at: now,
            })
        })
    }

    /// Create a group conversation with the given members.
    #[instrument(skip(self, members), fields(member_count = members.len()))]
    pub fn create_group(&self, members: &[UserId]) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO conversations (kind, created_at) VALUES ('group', ?1)",
                rusqlite::params![now],
            )?;
            let id = conn.last_insert_rowid();

            for member in members {
                conn.execute(
                    "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, role)
                     VALUES (?1, ?2, 'member')",
                    rusqlite::params![id, member.as_i64()],
                )?;
            }

            Ok(ConversationRow {
                id: ConversationId::new(id),
                kind: ConversationKind::Group,
                participant_ids_hash: None,
                created_at: now,
            })
        })
    }

    /// Add a participant to an existing conversation. Idempotent.
    #[instrument(skip(self), fields(conversation_id = %conversation_id, user_id = %user_id))]
    pub fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: ParticipantRole,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, role)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![conversation_id.as_i64(), user_id.as_i64(), role.to_string()],
            )?;
            Ok(())
        })
    }

    /// All conversation ids a user participates in, newest first.
    /// Fetched once at connect time to mirror memberships into the room index.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn ids_for_user(&self, user_id: UserId) -> Result<Vec<ConversationId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.created_at DESC",
            )?;
            let mut rows = stmt.query([user_id.as_i64()])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(ConversationId::new(row_helpers::get::<i64>(
                    row,
                    0,
                    "conversations",
                    "id",
                )?));
            }
            Ok(ids)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn exists(&self, id: ConversationId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversations WHERE id = ?1",
                [id.as_i64()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Authoritative membership check, consulted on every send.
    #[instrument(skip(self), fields(conversation_id = %id, user_id = %user_id))]
    pub fn is_participant(&self, id: ConversationId, user_id: UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversation_participants
                 WHERE conversation_id = ?1 AND user_id = ?2",
                rusqlite::params![id.as_i64(), user_id.as_i64()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Get a conversation by id.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: ConversationId) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, kind, participant_ids_hash, created_at FROM conversations WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_i64()])?;
            match rows.next()? {
                Some(row) => row_to_conversation(row),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    let kind_str: String = row_helpers::get(row, 1, "conversations", "kind")?;
    Ok(ConversationRow {
        id: ConversationId::new(row_helpers::get::<i64>(row, 0, "conversations", "id")?),
        kind: row_helpers::parse_enum(&kind_str, "conversations", "kind")?,
        participant_ids_hash: row_helpers::get_opt(row, 2, "conversations", "participant_ids_hash")?,
        created_at: row_helpers::get(row, 3, "conversations", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;

    fn setup() -> (ConversationRepo, UserId, UserId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let alice = users.upsert("appA:alice", "Alice", None).unwrap();
        let bob = users.upsert("appA:bob", "Bob", None).unwrap();
        (ConversationRepo::new(db), alice.id, bob.id)
    }

    #[test]
    fn participant_hash_is_order_independent() {
        let hash_ab = participant_ids_hash(&[UserId::new(2), UserId::new(1)]);
        let hash_ba = participant_ids_hash(&[UserId::new(1), UserId::new(2)]);
        assert_eq!(hash_ab, "1,2");
        assert_eq!(hash_ab, hash_ba);
    }

    #[test]
    fn create_private_conversation() {
        let (repo, alice, bob) = setup();
        let convo = repo.create_private(alice, bob).unwrap();
        assert_eq!(convo.kind, ConversationKind::Private);
        assert!(convo.participant_ids_hash.is_some());
        assert!(repo.is_participant(convo.id, alice).unwrap());
        assert!(repo.is_participant(convo.id, bob).unwrap());
    }

    #[test]
    fn create_private_is_get_or_create() {
        let (repo, alice, bob) = setup();
        let first = repo.create_private(alice, bob).unwrap();
        let second = repo.create_private(bob, alice).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn create_group_conversation() {
        let (repo, alice, bob) = setup();
        let convo = repo.create_group(&[alice, bob]).unwrap();
        assert_eq!(convo.kind, ConversationKind::Group);
        assert!(convo.participant_ids_hash.is_none());
        assert!(repo.is_participant(convo.id, alice).unwrap());
    }

    #[test]
    fn ids_for_user_lists_memberships() {
        let (repo, alice, bob) = setup();
        let c1 = repo.create_private(alice, bob).unwrap();
        let c2 = repo.create_group(&[alice]).unwrap();
        let ids = repo.ids_for_user(alice).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&c1.id));
        assert!(ids.contains(&c2.id));

        let bob_ids = repo.ids_for_user(bob).unwrap();
        assert_eq!(bob_ids, vec![c1.id]);
    }

    #[test]
    fn add_participant_is_idempotent() {
        let (repo, alice, bob) = setup();
        let convo = repo.create_group(&[alice]).unwrap();
        repo.add_participant(convo.id, bob, ParticipantRole::Member).unwrap();
        repo.add_participant(convo.id, bob, ParticipantRole::Member).unwrap();
        assert!(repo.is_participant(convo.id, bob).unwrap());
        assert_eq!(repo.ids_for_user(bob).unwrap().len(), 1);
    }

    #[test]
    fn exists_and_get() {
        let (repo, alice, bob) = setup();
        let convo = repo.create_private(alice, bob).unwrap();
        assert!(repo.exists(convo.id).unwrap());
        assert!(!repo.exists(ConversationId::new(999)).unwrap());

        let fetched = repo.get(convo.id).unwrap();
        assert_eq!(fetched.id, convo.id);
        assert!(matches!(
            repo.get(ConversationId::new(999)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn non_participant_is_rejected() {
        let (repo, alice, bob) = setup();
        let convo = repo.create_group(&[alice]).unwrap();
        assert!(!repo.is_participant(convo.id, bob).unwrap());
    }
}
