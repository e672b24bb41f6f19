//! Checkpointed progress for long-running batch work (embedding backfill
//! being the motivating case): a crash resumes from the last committed
//! batch, never from the beginning.

use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::facts::Scope;
use crate::ids::OperationId;
use crate::persistence::{tables, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationProgress {
    pub id: OperationId,
    pub operation_type: String,
    pub scope: Scope,
    pub total_items: u64,
    pub processed_items: u64,
    pub checkpoint_data: serde_json::Value,
    pub state: OperationState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn start_operation(
    store: &Store,
    operation_type: &str,
    scope: Scope,
    total_items: u64,
) -> Result<OperationProgress> {
    let now = Utc::now();
    let progress = OperationProgress {
        id: OperationId::new(),
        operation_type: operation_type.to_string(),
        scope,
        total_items,
        processed_items: 0,
        checkpoint_data: serde_json::Value::Null,
        state: OperationState::Running,
        started_at: now,
        updated_at: now,
    };
    write(store, &progress)?;
    Ok(progress)
}

/// Advances `processed_items` and stashes `checkpoint_data` for resumption.
/// Returns `None` if the operation id is unknown.
pub fn checkpoint(
    store: &Store,
    id: &OperationId,
    processed_items: u64,
    checkpoint_data: serde_json::Value,
) -> Result<Option<OperationProgress>> {
    update(store, id, |progress| {
        progress.processed_items = processed_items;
        progress.checkpoint_data = checkpoint_data.clone();
    })
}

pub fn complete_operation(store: &Store, id: &OperationId) -> Result<Option<OperationProgress>> {
    update(store, id, |progress| progress.state = OperationState::Completed)
}

pub fn fail_operation(store: &Store, id: &OperationId) -> Result<Option<OperationProgress>> {
    update(store, id, |progress| progress.state = OperationState::Failed)
}

pub fn get_operation(store: &Store, id: &OperationId) -> Result<Option<OperationProgress>> {
    let txn = store.begin_read()?;
    let table = txn.open_table(tables::OPERATION_PROGRESS)?;
    match table.get(id.0.as_str())? {
        Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
        None => Ok(None),
    }
}

fn write(store: &Store, progress: &OperationProgress) -> Result<()> {
    let txn = store.begin_write()?;
    {
        let mut table = txn.open_table(tables::OPERATION_PROGRESS)?;
        table.insert(progress.id.0.as_str(), serde_json::to_string(progress)?.as_str())?;
    }
    txn.commit()?;
    Ok(())
}

fn update(
    store: &Store,
    id: &OperationId,
    apply: impl FnOnce(&mut OperationProgress),
) -> Result<Option<OperationProgress>> {
    let txn = store.begin_write()?;
    let mut table = txn.open_table(tables::OPERATION_PROGRESS)?;
    let Some(existing) = table.get(id.0.as_str())?.map(|v| v.value().to_string()) else {
        return Ok(None);
    };
    let mut progress: OperationProgress = serde_json::from_str(&existing)?;
    apply(&mut progress);
    progress.updated_at = Utc::now();
    table.insert(id.0.as_str(), serde_json::to_string(&progress)?.as_str())?;
    drop(table);
    txn.commit()?;
    Ok(Some(progress))
}
