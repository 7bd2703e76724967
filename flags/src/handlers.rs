use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use metrics::counter;
use serde_json::json;
use tracing::instrument;

use crate::api::FlagError;
use crate::audit::{AuditAction, AuditRecord};
use crate::flag_definitions::{CreateFlagRequest, Flag, UpdateFlagRequest};
use crate::rollout::{evaluate_flag, FlagEvaluation};
use crate::router;

const READ_RETRY_BACKOFF: Duration = Duration::from_millis(50);

pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

fn actor_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("X-Actor")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// Cache-aside read: cache hit is served as-is, a miss loads from the store
/// and repopulates the cache. A transient store failure is retried once
/// after a short backoff before the request fails.
async fn load_flag(state: &router::State, key: &str) -> Result<Flag, FlagError> {
    if let Some(flag) = state.cache.get(key).await {
        return Ok(flag);
    }

    let found = match state.store.find(key).await {
        Err(FlagError::DatabaseUnavailable) => {
            tokio::time::sleep(READ_RETRY_BACKOFF).await;
            state.store.find(key).await?
        }
        other => other?,
    };

    let flag = found.ok_or(FlagError::NotFound)?;
    state.cache.put(&flag).await;
    Ok(flag)
}

/// Audit write failures never fail the mutation that already committed,
/// but losing history is a compliance problem, so they are counted.
async fn record_audit(state: &router::State, record: AuditRecord) {
    if let Err(e) = state.audit.record(record).await {
        counter!("audit_write_failures_total").increment(1);
        tracing::error!("failed to record audit entry: {}", e);
    }
}

pub async fn list_flags(
    State(state): State<router::State>,
) -> Result<Json<Vec<Flag>>, FlagError> {
    let flags = match state.store.list().await {
        Err(FlagError::DatabaseUnavailable) => {
            tokio::time::sleep(READ_RETRY_BACKOFF).await;
            state.store.list().await?
        }
        other => other?,
    };
    Ok(Json(flags))
}

pub async fn get_flag(
    State(state): State<router::State>,
    Path(key): Path<String>,
) -> Result<Json<Flag>, FlagError> {
    Ok(Json(load_flag(&state, &key).await?))
}

#[instrument(skip_all, fields(key = %payload.key))]
pub async fn create_flag(
    State(state): State<router::State>,
    headers: HeaderMap,
    Json(payload): Json<CreateFlagRequest>,
) -> Result<(StatusCode, Json<Flag>), FlagError> {
    payload.validate()?;
    let actor = actor_from_headers(&headers);

    // Store first: it is the single source of truth. Cache, bus, and audit
    // follow and are each best-effort once the row is committed.
    let flag = state.store.insert(payload.into_flag()).await?;
    state.cache.put(&flag).await;
    state.cache.publish_update(&flag.key).await;
    record_audit(
        &state,
        AuditRecord::new(&flag.key, actor, AuditAction::Create, None, Some(flag.clone())),
    )
    .await;

    Ok((StatusCode::CREATED, Json(flag)))
}

#[instrument(skip_all, fields(key = %key))]
pub async fn update_flag(
    State(state): State<router::State>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateFlagRequest>,
) -> Result<Json<Flag>, FlagError> {
    payload.validate()?;
    let actor = actor_from_headers(&headers);

    // The store reports the snapshot its merge actually read, so the audited
    // before_state can't drift from the merge base under concurrent updates.
    let (before, after) = state.store.update(&key, payload).await?;

    state.cache.put(&after).await;
    state.cache.publish_update(&key).await;
    record_audit(
        &state,
        AuditRecord::new(
            &key,
            actor,
            AuditAction::Update,
            Some(before),
            Some(after.clone()),
        ),
    )
    .await;

    Ok(Json(after))
}

#[instrument(skip_all, fields(key = %key))]
pub async fn delete_flag(
    State(state): State<router::State>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, FlagError> {
    let actor = actor_from_headers(&headers);

    let before = state.store.delete(&key).await?;

    // The entry must be gone before we answer, or a reader could still be
    // served the deleted flag from cache.
    state.cache.invalidate(&key).await;
    state.cache.publish_update(&key).await;
    record_audit(
        &state,
        AuditRecord::new(&key, actor, AuditAction::Delete, Some(before), None),
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, fields(key = %key))]
pub async fn evaluate(
    State(state): State<router::State>,
    Path(key): Path<String>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Result<Json<FlagEvaluation>, FlagError> {
    let user_id = params.remove("user_id").ok_or(FlagError::MissingUserId)?;
    // Every remaining query parameter is an attribute.
    let attributes = params;

    let flag = load_flag(&state, &key).await?;
    let evaluation = evaluate_flag(&flag, &user_id, &attributes);

    counter!(
        "flag_evaluations_total",
        "key" => flag.key.clone(),
        "result" => evaluation.enabled.to_string()
    )
    .increment(1);

    Ok(Json(evaluation))
}
