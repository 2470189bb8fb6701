//! Credential record storage using SQLite.
//!
//! Stores sealed OAuth tokens per (user, scope). Values arrive here already
//! encrypted; this layer never sees plaintext.

use super::{
    expiry::parse_expires_at, CredentialRecord, EncryptedSecret, RecordUpdate, Scope, ScopeKey,
    SecretStore, StoreError,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     scope TEXT NOT NULL,              -- "global" or "agent:<id>"
///     access_token TEXT NOT NULL,       -- iv:tag:ciphertext
///     refresh_token TEXT NOT NULL,      -- iv:tag:ciphertext
///     expires_at TEXT NOT NULL,         -- RFC 3339 with offset
///     token_type TEXT NOT NULL,
///     provider_endpoint TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, scope)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - Every rusqlite failure surfaces as [`StoreError::Unavailable`]
pub struct SqliteSecretStore {
    conn: Mutex<Connection>,
}

impl SqliteSecretStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (or `:memory:`)
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).map_err(db_error("failed to open database"))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                token_type TEXT NOT NULL,
                provider_endpoint TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, scope)
            )
            "#,
            [],
        )
        .map_err(db_error("failed to create credentials table"))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_user_scope ON credentials(user_id, scope)",
            [],
        )
        .map_err(db_error("failed to create index"))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))
    }

    fn apply_update(
        &self,
        key: &ScopeKey,
        expected_refresh_token: Option<&EncryptedSecret>,
        update: &RecordUpdate,
    ) -> Result<usize, StoreError> {
        key.validate()?;

        let access_token = update.access_token.as_ref().map(EncryptedSecret::as_str);
        let refresh_token = update.refresh_token.as_ref().map(EncryptedSecret::as_str);
        let expires_at = update.expires_at.map(|dt| dt.to_rfc3339());
        let expected = expected_refresh_token.map(EncryptedSecret::as_str);
        let now = Utc::now().to_rfc3339();

        // ?8 IS NULL disables the refresh-token guard for plain updates
        self.conn()?
            .execute(
                r#"
                UPDATE credentials SET
                    access_token = COALESCE(?3, access_token),
                    refresh_token = COALESCE(?4, refresh_token),
                    expires_at = COALESCE(?5, expires_at),
                    token_type = COALESCE(?6, token_type),
                    updated_at = ?7
                WHERE user_id = ?1 AND scope = ?2
                  AND (?8 IS NULL OR refresh_token = ?8)
                "#,
                params![
                    key.user_id,
                    key.scope.as_key(),
                    access_token,
                    refresh_token,
                    expires_at,
                    update.token_type,
                    now,
                    expected,
                ],
            )
            .map_err(db_error("failed to update credentials"))
    }
}

#[async_trait]
impl SecretStore for SqliteSecretStore {
    async fn get_record(&self, key: &ScopeKey) -> Result<Option<CredentialRecord>, StoreError> {
        key.validate()?;

        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT access_token, refresh_token, expires_at,
                       token_type, provider_endpoint
                FROM credentials
                WHERE user_id = ?1 AND scope = ?2
                "#,
                params![key.user_id, key.scope.as_key()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_error("failed to read credentials"))?;

        let Some((access_token, refresh_token, expires_at, token_type, provider_endpoint)) = row
        else {
            debug!(key = %key, "No credential record");
            return Ok(None);
        };

        let expires_at = parse_expires_at(&expires_at).map_err(|e| {
            StoreError::Corrupt(format!("{}: invalid expires_at {:?}: {}", key, expires_at, e))
        })?;

        Ok(Some(CredentialRecord {
            access_token: EncryptedSecret::from_stored(access_token),
            refresh_token: EncryptedSecret::from_stored(refresh_token),
            expires_at,
            token_type,
            provider_endpoint,
        }))
    }

    async fn update_record(&self, key: &ScopeKey, update: &RecordUpdate) -> Result<(), StoreError> {
        match self.apply_update(key, None, update)? {
            0 => Err(StoreError::RecordMissing(key.to_string())),
            _ => Ok(()),
        }
    }

    async fn compare_and_update(
        &self,
        key: &ScopeKey,
        expected_refresh_token: &EncryptedSecret,
        update: &RecordUpdate,
    ) -> Result<bool, StoreError> {
        let rows = self.apply_update(key, Some(expected_refresh_token), update)?;
        Ok(rows > 0)
    }

    async fn put_record(&self, key: &ScopeKey, record: &CredentialRecord) -> Result<(), StoreError> {
        key.validate()?;
        let now = Utc::now().to_rfc3339();

        self.conn()?
            .execute(
                r#"
                INSERT INTO credentials (
                    user_id, scope,
                    access_token, refresh_token,
                    expires_at, token_type, provider_endpoint,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                ON CONFLICT(user_id, scope) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    token_type = excluded.token_type,
                    provider_endpoint = excluded.provider_endpoint,
                    updated_at = excluded.updated_at
                "#,
                params![
                    key.user_id,
                    key.scope.as_key(),
                    record.access_token.as_str(),
                    record.refresh_token.as_str(),
                    record.expires_at.to_rfc3339(),
                    record.token_type,
                    record.provider_endpoint,
                    now,
                ],
            )
            .map_err(db_error("failed to store credentials"))?;

        Ok(())
    }

    async fn delete_record(&self, key: &ScopeKey) -> Result<bool, StoreError> {
        key.validate()?;

        let rows_affected = self
            .conn()?
            .execute(
                "DELETE FROM credentials WHERE user_id = ?1 AND scope = ?2",
                params![key.user_id, key.scope.as_key()],
            )
            .map_err(db_error("failed to delete credentials"))?;

        Ok(rows_affected > 0)
    }

    async fn list_scopes(&self, user_id: &str) -> Result<Vec<Scope>, StoreError> {
        if user_id.is_empty() {
            return Err(StoreError::InvalidKey("user_id is empty".to_string()));
        }

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT scope FROM credentials WHERE user_id = ?1 ORDER BY scope")
            .map_err(db_error("failed to prepare query"))?;

        let keys = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))
            .map_err(db_error("failed to execute query"))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_error("failed to read results"))?;

        keys.iter()
            .map(|k| {
                Scope::from_key(k)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown scope {:?}", k)))
            })
            .collect()
    }
}

fn db_error(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::Unavailable(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn create_test_store() -> SqliteSecretStore {
        SqliteSecretStore::new(":memory:").expect("Failed to create test store")
    }

    fn sealed(value: &str) -> EncryptedSecret {
        EncryptedSecret::from_stored(value.to_string())
    }

    fn create_test_record() -> CredentialRecord {
        CredentialRecord {
            access_token: sealed("aa:bb:access"),
            refresh_token: sealed("aa:bb:refresh"),
            expires_at: truncated(Utc::now() + Duration::hours(1)),
            token_type: "Bearer".to_string(),
            provider_endpoint: "https://api.example.com".to_string(),
        }
    }

    // RFC 3339 round-trips at nanosecond precision, but keep comparisons simple
    fn truncated(dt: DateTime<Utc>) -> DateTime<Utc> {
        DateTime::from_timestamp(dt.timestamp(), 0).unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = create_test_store();
        let key = ScopeKey::global("user1");
        let record = create_test_record();

        store.put_record(&key, &record).await.expect("Failed to store");

        let retrieved = store
            .get_record(&key)
            .await
            .expect("Failed to get")
            .expect("Record not found");
        assert_eq!(retrieved, record);
    }

    #[tokio::test]
    async fn test_get_nonexistent_is_none() {
        let store = create_test_store();

        let result = store.get_record(&ScopeKey::global("user1")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let store = create_test_store();
        let mut agent_record = create_test_record();
        agent_record.access_token = sealed("aa:bb:agent-access");

        store
            .put_record(&ScopeKey::global("user1"), &create_test_record())
            .await
            .unwrap();
        store
            .put_record(&ScopeKey::agent("user1", "calendar"), &agent_record)
            .await
            .unwrap();

        let global = store.get_record(&ScopeKey::global("user1")).await.unwrap().unwrap();
        let agent = store
            .get_record(&ScopeKey::agent("user1", "calendar"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(global.access_token, sealed("aa:bb:access"));
        assert_eq!(agent.access_token, sealed("aa:bb:agent-access"));

        // Other users and agents see nothing
        assert!(store.get_record(&ScopeKey::global("user2")).await.unwrap().is_none());
        assert!(store
            .get_record(&ScopeKey::agent("user1", "gmail"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_preserves_unnamed_fields() {
        let store = create_test_store();
        let key = ScopeKey::global("user1");
        let record = create_test_record();
        store.put_record(&key, &record).await.unwrap();

        let new_expiry = truncated(Utc::now() + Duration::hours(2));
        store
            .update_record(
                &key,
                &RecordUpdate {
                    access_token: Some(sealed("aa:bb:new-access")),
                    expires_at: Some(new_expiry),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retrieved = store.get_record(&key).await.unwrap().unwrap();
        assert_eq!(retrieved.access_token, sealed("aa:bb:new-access"));
        assert_eq!(retrieved.expires_at, new_expiry);
        assert_eq!(retrieved.refresh_token, record.refresh_token);
        assert_eq!(retrieved.token_type, record.token_type);
        assert_eq!(retrieved.provider_endpoint, record.provider_endpoint);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = create_test_store();

        let result = store
            .update_record(
                &ScopeKey::global("user1"),
                &RecordUpdate {
                    token_type: Some("Bearer".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::RecordMissing(_))));
    }

    #[tokio::test]
    async fn test_compare_and_update() {
        let store = create_test_store();
        let key = ScopeKey::global("user1");
        let record = create_test_record();
        store.put_record(&key, &record).await.unwrap();

        let update = RecordUpdate {
            access_token: Some(sealed("aa:bb:rotated-access")),
            refresh_token: Some(sealed("aa:bb:rotated-refresh")),
            ..Default::default()
        };

        // Matching refresh token commits
        assert!(store
            .compare_and_update(&key, &record.refresh_token, &update)
            .await
            .unwrap());

        // The old refresh token is now stale
        let stale = RecordUpdate {
            access_token: Some(sealed("aa:bb:stale-access")),
            ..Default::default()
        };
        assert!(!store
            .compare_and_update(&key, &record.refresh_token, &stale)
            .await
            .unwrap());

        let retrieved = store.get_record(&key).await.unwrap().unwrap();
        assert_eq!(retrieved.access_token, sealed("aa:bb:rotated-access"));
        assert_eq!(retrieved.refresh_token, sealed("aa:bb:rotated-refresh"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = create_test_store();
        let key = ScopeKey::global("user1");
        store.put_record(&key, &create_test_record()).await.unwrap();

        assert!(store.delete_record(&key).await.unwrap());
        assert!(store.get_record(&key).await.unwrap().is_none());

        // Deleting again should return false
        assert!(!store.delete_record(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_scopes() {
        let store = create_test_store();
        let record = create_test_record();

        store.put_record(&ScopeKey::global("user1"), &record).await.unwrap();
        store
            .put_record(&ScopeKey::agent("user1", "gmail"), &record)
            .await
            .unwrap();
        store
            .put_record(&ScopeKey::agent("user2", "drive"), &record)
            .await
            .unwrap();

        let scopes = store.list_scopes("user1").await.unwrap();
        assert_eq!(
            scopes,
            vec![Scope::Agent("gmail".to_string()), Scope::Global]
        );
        assert!(store.list_scopes("user3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_identifiers_rejected() {
        let store = create_test_store();

        assert!(matches!(
            store.get_record(&ScopeKey::global("")).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get_record(&ScopeKey::agent("user1", "")).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.list_scopes("").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_naive_expiry_is_corrupt() {
        let store = create_test_store();
        let key = ScopeKey::global("user1");
        store.put_record(&key, &create_test_record()).await.unwrap();

        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE credentials SET expires_at = '2026-01-01T10:00:00' WHERE user_id = 'user1'",
                [],
            )
            .unwrap();

        assert!(matches!(
            store.get_record(&key).await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_database_failure_is_unavailable() {
        let store = create_test_store();
        store
            .conn()
            .unwrap()
            .execute("DROP TABLE credentials", [])
            .unwrap();

        assert!(matches!(
            store.get_record(&ScopeKey::global("user1")).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");
        let key = ScopeKey::agent("user1", "drive");
        let record = create_test_record();

        {
            let store = SqliteSecretStore::new(&path).unwrap();
            store.put_record(&key, &record).await.unwrap();
        }

        let reopened = SqliteSecretStore::new(&path).unwrap();
        assert_eq!(reopened.get_record(&key).await.unwrap(), Some(record));
    }
}
