//! Postgres mirror backend.

use async_trait::async_trait;
use kbind_events::{Action, NodeEvent, WorkloadUnitEvent};
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, instrument};

use super::{
    MirrorError, MirrorReader, MirrorResult, MirrorRow, MirrorWriter, NodeRow, WorkloadUnitRow,
};
use crate::db::DbError;

/// Mirror stored in `node_mirror` and `workload_unit_mirror`.
#[derive(Clone)]
pub struct PgMirror {
    pool: PgPool,
}

impl PgMirror {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Decode the stored `last_action` label.
fn decode_action(identity: &str, label: &str) -> MirrorResult<Action> {
    label.parse::<Action>().map_err(|e| MirrorError::CorruptRow {
        identity: identity.to_string(),
        message: e.to_string(),
    })
}

/// Decode a stored JSON snapshot.
fn decode_snapshot<S: DeserializeOwned>(
    identity: &str,
    snapshot: serde_json::Value,
) -> MirrorResult<S> {
    serde_json::from_value::<S>(snapshot).map_err(|e| MirrorError::CorruptRow {
        identity: identity.to_string(),
        message: e.to_string(),
    })
}

fn decode_row<S: DeserializeOwned>(row: &PgRow) -> MirrorResult<MirrorRow<S>> {
    let identity: String = row.try_get("identity").map_err(DbError::Query)?;
    let action: String = row.try_get("last_action").map_err(DbError::Query)?;
    let snapshot: serde_json::Value = row.try_get("snapshot").map_err(DbError::Query)?;

    Ok(MirrorRow {
        uid: row.try_get("uid").map_err(DbError::Query)?,
        last_action: decode_action(&identity, &action)?,
        deleted: row.try_get("deleted").map_err(DbError::Query)?,
        snapshot: decode_snapshot(&identity, snapshot)?,
        resource_version: row.try_get("resource_version").map_err(DbError::Query)?,
        observed_at: row.try_get("observed_at").map_err(DbError::Query)?,
        identity: identity.clone(),
    })
}

const MIRROR_COLUMNS: &str =
    "identity, uid, last_action, deleted, snapshot, resource_version, observed_at";

#[async_trait]
impl MirrorWriter for PgMirror {
    #[instrument(skip(self, event), fields(identity = %event.identity(), action = %event.action()))]
    async fn upsert_node_snapshot(&self, event: &NodeEvent) -> MirrorResult<()> {
        let row = MirrorRow::from_event(event);
        let snapshot = serde_json::to_value(&row.snapshot).map_err(DbError::Serialization)?;

        sqlx::query(
            r#"
            INSERT INTO node_mirror (
                identity, uid, last_action, deleted, snapshot, resource_version,
                observed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, now())
            ON CONFLICT (identity) DO UPDATE SET
                uid = EXCLUDED.uid,
                last_action = EXCLUDED.last_action,
                deleted = EXCLUDED.deleted,
                snapshot = EXCLUDED.snapshot,
                resource_version = EXCLUDED.resource_version,
                observed_at = EXCLUDED.observed_at,
                updated_at = now()
            "#,
        )
        .bind(&row.identity)
        .bind(&row.uid)
        .bind(row.last_action.as_str())
        .bind(row.deleted)
        .bind(&snapshot)
        .bind(row.resource_version.as_deref())
        .bind(row.observed_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        debug!("Mirrored node");
        Ok(())
    }

    #[instrument(skip(self, event), fields(identity = %event.identity(), action = %event.action()))]
    async fn upsert_workload_unit_event(&self, event: &WorkloadUnitEvent) -> MirrorResult<()> {
        let row = MirrorRow::from_event(event);
        let snapshot = serde_json::to_value(&row.snapshot).map_err(DbError::Serialization)?;

        sqlx::query(
            r#"
            INSERT INTO workload_unit_mirror (
                identity, namespace, name, uid, last_action, deleted, node_name,
                snapshot, resource_version, observed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
            ON CONFLICT (identity) DO UPDATE SET
                uid = EXCLUDED.uid,
                last_action = EXCLUDED.last_action,
                deleted = EXCLUDED.deleted,
                node_name = EXCLUDED.node_name,
                snapshot = EXCLUDED.snapshot,
                resource_version = EXCLUDED.resource_version,
                observed_at = EXCLUDED.observed_at,
                updated_at = now()
            "#,
        )
        .bind(&row.identity)
        .bind(row.snapshot.namespace())
        .bind(&row.snapshot.meta.name)
        .bind(&row.uid)
        .bind(row.last_action.as_str())
        .bind(row.deleted)
        .bind(row.snapshot.node_name.as_deref())
        .bind(&snapshot)
        .bind(row.resource_version.as_deref())
        .bind(row.observed_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        debug!("Mirrored workload unit");
        Ok(())
    }
}

#[async_trait]
impl MirrorReader for PgMirror {
    async fn list_nodes(&self) -> MirrorResult<Vec<NodeRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {MIRROR_COLUMNS} FROM node_mirror ORDER BY identity"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        rows.iter().map(decode_row).collect()
    }

    async fn get_node(&self, name: &str) -> MirrorResult<Option<NodeRow>> {
        let row = sqlx::query(&format!(
            "SELECT {MIRROR_COLUMNS} FROM node_mirror WHERE identity = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn list_workload_units(&self) -> MirrorResult<Vec<WorkloadUnitRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {MIRROR_COLUMNS} FROM workload_unit_mirror ORDER BY identity"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        rows.iter().map(decode_row).collect()
    }

    async fn get_workload_unit(&self, identity: &str) -> MirrorResult<Option<WorkloadUnitRow>> {
        let row = sqlx::query(&format!(
            "SELECT {MIRROR_COLUMNS} FROM workload_unit_mirror WHERE identity = $1"
        ))
        .bind(identity)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.as_ref().map(decode_row).transpose()
    }
}
