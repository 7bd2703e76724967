use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::api::FlagError;
use crate::flag_definitions::{Flag, TargetRule, UpdateFlagRequest};

/// The durable store holding flag definitions, keyed by flag key. Single-row
/// operations are atomic by the store's own contract; nothing here serializes
/// read-modify-write sequences across rows or requests.
#[async_trait]
pub trait FlagStore {
    async fn find(&self, key: &str) -> Result<Option<Flag>, FlagError>;
    /// All flags, sorted by key.
    async fn list(&self) -> Result<Vec<Flag>, FlagError>;
    /// Fails with `Conflict` if the key already exists. The stored version
    /// is always 1, whatever the caller put in the snapshot.
    async fn insert(&self, flag: Flag) -> Result<Flag, FlagError>;
    /// Merge-update: unset patch fields keep their stored value, version
    /// bumps unconditionally. Returns the merge base alongside the committed
    /// snapshot so the audit trail records the state the merge actually read.
    /// The merge reads then writes without a lock, so two concurrent updates
    /// to the same key race and the later commit wins (see the design notes
    /// on last-writer-wins).
    async fn update(
        &self,
        key: &str,
        patch: UpdateFlagRequest,
    ) -> Result<(Flag, Flag), FlagError>;
    /// Removes the row and returns the final snapshot for the audit trail.
    async fn delete(&self, key: &str) -> Result<Flag, FlagError>;
}

#[derive(sqlx::FromRow)]
struct FlagRow {
    key: String,
    description: Option<String>,
    enabled: bool,
    rollout_percentage: i32,
    target_groups: sqlx::types::Json<Vec<TargetRule>>,
    version: i32,
}

impl From<FlagRow> for Flag {
    fn from(row: FlagRow) -> Flag {
        Flag {
            key: row.key,
            description: row.description,
            enabled: row.enabled,
            rollout_percentage: row.rollout_percentage,
            target_groups: row.target_groups.0,
            version: row.version,
        }
    }
}

const FLAG_COLUMNS: &str = "key, description, enabled, rollout_percentage, target_groups, version";

pub struct PostgresFlagStore {
    pool: PgPool,
}

impl PostgresFlagStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<PostgresFlagStore, FlagError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(2))
            .connect(url)
            .await
            .map_err(|e| {
                tracing::error!("failed to connect to postgres: {}", e);
                FlagError::DatabaseUnavailable
            })?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("failed to run migrations: {}", e);
            FlagError::DatabaseUnavailable
        })?;

        Ok(PostgresFlagStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn query_error(command: &str, error: sqlx::Error) -> FlagError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.is_unique_violation() {
            return FlagError::Conflict;
        }
    }
    tracing::error!("{} query failed: {}", command, error);
    FlagError::DatabaseUnavailable
}

#[async_trait]
impl FlagStore for PostgresFlagStore {
    async fn find(&self, key: &str) -> Result<Option<Flag>, FlagError> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            "SELECT {FLAG_COLUMNS} FROM features WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("find", e))?;

        Ok(row.map(Flag::from))
    }

    async fn list(&self) -> Result<Vec<Flag>, FlagError> {
        let rows = sqlx::query_as::<_, FlagRow>(&format!(
            "SELECT {FLAG_COLUMNS} FROM features ORDER BY key"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("list", e))?;

        Ok(rows.into_iter().map(Flag::from).collect())
    }

    async fn insert(&self, flag: Flag) -> Result<Flag, FlagError> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            "INSERT INTO features (key, description, enabled, rollout_percentage, target_groups, version)
             VALUES ($1, $2, $3, $4, $5, 1)
             RETURNING {FLAG_COLUMNS}"
        ))
        .bind(&flag.key)
        .bind(&flag.description)
        .bind(flag.enabled)
        .bind(flag.rollout_percentage)
        .bind(sqlx::types::Json(&flag.target_groups))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("insert", e))?;

        Ok(Flag::from(row))
    }

    async fn update(
        &self,
        key: &str,
        patch: UpdateFlagRequest,
    ) -> Result<(Flag, Flag), FlagError> {
        let before = self.find(key).await?.ok_or(FlagError::NotFound)?;
        let after = patch.merge_into(&before);

        // version is written from the read snapshot, not bumped in SQL:
        // interleaved updates both observing the same version is exactly the
        // last-writer-wins behavior callers are promised.
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            "UPDATE features
             SET description = $1,
                 enabled = $2,
                 rollout_percentage = $3,
                 target_groups = $4,
                 version = $5,
                 updated_at = NOW()
             WHERE key = $6
             RETURNING {FLAG_COLUMNS}"
        ))
        .bind(&after.description)
        .bind(after.enabled)
        .bind(after.rollout_percentage)
        .bind(sqlx::types::Json(&after.target_groups))
        .bind(after.version)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("update", e))?;

        // The row can vanish between the read and the write.
        let committed = row.map(Flag::from).ok_or(FlagError::NotFound)?;
        Ok((before, committed))
    }

    async fn delete(&self, key: &str) -> Result<Flag, FlagError> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            "DELETE FROM features WHERE key = $1 RETURNING {FLAG_COLUMNS}"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("delete", e))?;

        row.map(Flag::from).ok_or(FlagError::NotFound)
    }
}

/// Store with the same semantics over a process-local map, for tests. A
/// budget of injected failures lets tests exercise the transient-error
/// paths: each failing operation decrements the budget and reports the
/// store unavailable.
#[derive(Clone, Default)]
pub struct MemoryFlagStore {
    flags: Arc<RwLock<HashMap<String, Flag>>>,
    failures_remaining: Arc<Mutex<u32>>,
}

impl MemoryFlagStore {
    pub fn new() -> MemoryFlagStore {
        Default::default()
    }

    pub fn fail_next_ops(&self, n: u32) {
        *self.failures_remaining.lock().unwrap() = n;
    }

    fn check_available(&self) -> Result<(), FlagError> {
        let mut remaining = self.failures_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(FlagError::DatabaseUnavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn find(&self, key: &str) -> Result<Option<Flag>, FlagError> {
        self.check_available()?;
        Ok(self.flags.read().unwrap().get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<Flag>, FlagError> {
        self.check_available()?;
        let mut flags: Vec<Flag> = self.flags.read().unwrap().values().cloned().collect();
        flags.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(flags)
    }

    async fn insert(&self, mut flag: Flag) -> Result<Flag, FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().unwrap();
        if flags.contains_key(&flag.key) {
            return Err(FlagError::Conflict);
        }
        flag.version = 1;
        flags.insert(flag.key.clone(), flag.clone());
        Ok(flag)
    }

    async fn update(
        &self,
        key: &str,
        patch: UpdateFlagRequest,
    ) -> Result<(Flag, Flag), FlagError> {
        self.check_available()?;
        let mut flags = self.flags.write().unwrap();
        let before = flags.get(key).ok_or(FlagError::NotFound)?.clone();
        let after = patch.merge_into(&before);
        flags.insert(key.to_string(), after.clone());
        Ok((before, after))
    }

    async fn delete(&self, key: &str) -> Result<Flag, FlagError> {
        self.check_available()?;
        self.flags
            .write()
            .unwrap()
            .remove(key)
            .ok_or(FlagError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag_definitions::CreateFlagRequest;

    fn new_flag(key: &str) -> Flag {
        CreateFlagRequest {
            key: key.to_string(),
            description: Some("a flag".to_string()),
            enabled: true,
            rollout_percentage: 50,
            target_groups: vec![],
        }
        .into_flag()
    }

    #[tokio::test]
    async fn test_insert_starts_at_version_one() {
        let store = MemoryFlagStore::new();
        let flag = store.insert(new_flag("new-ui")).await.unwrap();
        assert_eq!(flag.version, 1);
    }

    #[tokio::test]
    async fn test_insert_duplicate_key_conflicts() {
        let store = MemoryFlagStore::new();
        store.insert(new_flag("new-ui")).await.unwrap();
        match store.insert(new_flag("new-ui")).await {
            Err(FlagError::Conflict) => (),
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_merges_and_bumps_version() {
        let store = MemoryFlagStore::new();
        store.insert(new_flag("new-ui")).await.unwrap();

        let patch = UpdateFlagRequest {
            rollout_percentage: Some(100),
            ..Default::default()
        };
        let (before, updated) = store.update("new-ui", patch).await.unwrap();

        assert_eq!(before.version, 1);
        assert_eq!(updated.version, 2);
        assert_eq!(updated.rollout_percentage, 100);
        assert_eq!(updated.description, Some("a flag".to_string()));
    }

    #[tokio::test]
    async fn test_update_returns_its_own_merge_base() {
        let store = MemoryFlagStore::new();
        store.insert(new_flag("new-ui")).await.unwrap();

        let first = UpdateFlagRequest {
            description: Some("first".to_string()),
            ..Default::default()
        };
        let (_, committed) = store.update("new-ui", first).await.unwrap();

        // The reported merge base is the snapshot this update actually read,
        // not whatever a caller fetched earlier.
        let second = UpdateFlagRequest {
            enabled: Some(false),
            ..Default::default()
        };
        let (base, _) = store.update("new-ui", second).await.unwrap();
        assert_eq!(base, committed);
    }

    #[tokio::test]
    async fn test_sequential_updates_each_bump_version() {
        let store = MemoryFlagStore::new();
        store.insert(new_flag("new-ui")).await.unwrap();

        let first = UpdateFlagRequest {
            description: Some("first".to_string()),
            ..Default::default()
        };
        let second = UpdateFlagRequest {
            enabled: Some(false),
            ..Default::default()
        };
        store.update("new-ui", first).await.unwrap();
        let (_, after) = store.update("new-ui", second).await.unwrap();

        // The second update merged against the first's committed state, so
        // both deltas survive when the writes don't interleave.
        assert_eq!(after.version, 3);
        assert_eq!(after.description, Some("first".to_string()));
        assert!(!after.enabled);
    }

    #[tokio::test]
    async fn test_update_missing_key_not_found() {
        let store = MemoryFlagStore::new();
        match store.update("absent", UpdateFlagRequest::default()).await {
            Err(FlagError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_returns_final_snapshot() {
        let store = MemoryFlagStore::new();
        store.insert(new_flag("new-ui")).await.unwrap();

        let deleted = store.delete("new-ui").await.unwrap();
        assert_eq!(deleted.key, "new-ui");
        assert_eq!(store.find("new-ui").await.unwrap(), None);

        match store.delete("new-ui").await {
            Err(FlagError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_then_recreate_resets_version() {
        let store = MemoryFlagStore::new();
        store.insert(new_flag("new-ui")).await.unwrap();
        store
            .update(
                "new-ui",
                UpdateFlagRequest {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.delete("new-ui").await.unwrap();
        let recreated = store.insert(new_flag("new-ui")).await.unwrap();
        assert_eq!(recreated.version, 1);
    }

    #[tokio::test]
    async fn test_list_is_sorted_by_key() {
        let store = MemoryFlagStore::new();
        for key in ["zebra", "apple", "mango"] {
            store.insert(new_flag(key)).await.unwrap();
        }

        let keys: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.key)
            .collect();
        assert_eq!(keys, vec!["apple", "mango", "zebra"]);
    }
}
