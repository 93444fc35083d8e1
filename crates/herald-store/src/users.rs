use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use herald_core::identity::Identity;
use herald_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub external_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub created_at: String,
}

impl UserRow {
    pub fn identity(&self) -> Identity {
        Identity {
            external_id: self.external_id.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a user keyed by external id, or refresh name/avatar if one
    /// already exists. Called on every authenticated connect so display
    /// names track the latest token claims.
    #[instrument(skip(self), fields(external_id))]
    pub fn upsert(
        &self,
        external_id: &str,
        name: &str,
        avatar_url: Option<&str>,
    ) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, created_at FROM users WHERE external_id = ?1",
                    [external_id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .ok();

            if let Some((id, created_at)) = existing {
                conn.execute(
                    "UPDATE users SET name = ?1, avatar_url = ?2 WHERE id = ?3",
                    rusqlite::params![name, avatar_url, id],
                )?;
                return Ok(UserRow {
                    id: UserId::new(id),
                    external_id: external_id.to_string(),
                    name: name.to_string(),
                    avatar_url: avatar_url.map(str::to_string),
                    created_at,
                });
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users (external_id, name, avatar_url, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![external_id, name, avatar_url, now],
            )?;

            Ok(UserRow {
                id: UserId::new(conn.last_insert_rowid()),
                external_id: external_id.to_string(),
                name: name.to_string(),
                avatar_url: avatar_url.map(str::to_string),
                created_at: now,
            })
        })
    }

    /// Look up a user by external id.
    #[instrument(skip(self), fields(external_id))]
    pub fn find_by_external_id(&self, external_id: &str) -> Result<Option<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, external_id, name, avatar_url, created_at FROM users WHERE external_id = ?1",
            )?;
            let mut rows = stmt.query([external_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_user(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Get a user by store id.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, external_id, name, avatar_url, created_at FROM users WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_i64()])?;
            match rows.next()? {
                Some(row) => row_to_user(row),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        id: UserId::new(row_helpers::get::<i64>(row, 0, "users", "id")?),
        external_id: row_helpers::get(row, 1, "users", "external_id")?,
        name: row_helpers::get(row, 2, "users", "name")?,
        avatar_url: row_helpers::get_opt(row, 3, "users", "avatar_url")?,
        created_at: row_helpers::get(row, 4, "users", "created_at")?,
    })
}
