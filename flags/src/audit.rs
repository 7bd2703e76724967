use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::api::FlagError;
use crate::flag_definitions::Flag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }
}

/// One mutation, with the snapshots either side of it. Append-only; the
/// recorder assigns the timestamp at insert.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub feature_key: String,
    pub actor: String,
    pub action: AuditAction,
    pub before_state: Option<Flag>,
    pub after_state: Option<Flag>,
}

impl AuditRecord {
    pub fn new(
        feature_key: &str,
        actor: String,
        action: AuditAction,
        before_state: Option<Flag>,
        after_state: Option<Flag>,
    ) -> AuditRecord {
        AuditRecord {
            feature_key: feature_key.to_string(),
            actor,
            action,
            before_state,
            after_state,
        }
    }
}

#[async_trait]
pub trait AuditRecorder {
    async fn record(&self, record: AuditRecord) -> Result<(), FlagError>;
}

pub struct PostgresAuditRecorder {
    pool: PgPool,
}

impl PostgresAuditRecorder {
    pub fn new(pool: PgPool) -> PostgresAuditRecorder {
        PostgresAuditRecorder { pool }
    }
}

fn serialize_state(state: &Option<Flag>) -> Result<Option<String>, FlagError> {
    state
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(FlagError::RequestParsingError)
}

#[async_trait]
impl AuditRecorder for PostgresAuditRecorder {
    async fn record(&self, record: AuditRecord) -> Result<(), FlagError> {
        sqlx::query(
            "INSERT INTO audits (feature_key, actor, action, before_state, after_state)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&record.feature_key)
        .bind(&record.actor)
        .bind(record.action.as_str())
        .bind(serialize_state(&record.before_state)?)
        .bind(serialize_state(&record.after_state)?)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("audit insert failed: {}", e);
            FlagError::DatabaseUnavailable
        })?;

        Ok(())
    }
}

/// Recorder that keeps records in memory, for tests.
#[derive(Clone, Default)]
pub struct MemoryAuditRecorder {
    records: Arc<Mutex<Vec<(DateTime<Utc>, AuditRecord)>>>,
}

impl MemoryAuditRecorder {
    pub fn new() -> MemoryAuditRecorder {
        Default::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }
}

#[async_trait]
impl AuditRecorder for MemoryAuditRecorder {
    async fn record(&self, record: AuditRecord) -> Result<(), FlagError> {
        self.records.lock().unwrap().push((Utc::now(), record));
        Ok(())
    }
}
