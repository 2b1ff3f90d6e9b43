//! `steep_repl.audit_log` — append-only audit trail.
//!
//! Column set taken from the extension's table definition. Every RPC that
//! mutates state writes one row here, success or failure; rows are never
//! updated or deleted by the core.

use chrono::{DateTime, Utc};
use postgres::GenericClient;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub action: &'a str,
    pub actor: &'a str,
    pub target_type: &'a str,
    pub target_id: &'a str,
    pub old_value: Option<&'a Value>,
    pub new_value: Option<&'a Value>,
    pub client_ip: Option<&'a str>,
    pub success: bool,
    pub error_message: Option<&'a str>,
}

pub fn append<C: GenericClient>(client: &mut C, entry: &AuditEntry<'_>) -> anyhow::Result<()> {
    client.execute(
        "INSERT INTO steep_repl.audit_log \
         (action, actor, target_type, target_id, old_value, new_value, client_ip, success, error_message) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        &[
            &entry.action,
            &entry.actor,
            &entry.target_type,
            &entry.target_id,
            &entry.old_value,
            &entry.new_value,
            &entry.client_ip,
            &entry.success,
            &entry.error_message,
        ],
    )?;
    Ok(())
}

/// Convenience wrapper for the common case: a successful action with no
/// before/after value pair to record (e.g. a heartbeat or a read-only RPC
/// that still needs a trail entry).
pub fn record_success<C: GenericClient>(
    client: &mut C,
    action: &str,
    actor: &str,
    target_type: &str,
    target_id: &str,
) -> anyhow::Result<()> {
    append(
        client,
        &AuditEntry {
            action,
            actor,
            target_type,
            target_id,
            old_value: None,
            new_value: None,
            client_ip: None,
            success: true,
            error_message: None,
        },
    )
}

/// Convenience wrapper for a failed action; `error_message` should be the
/// `Display` form of the `CoordinatorError` that was returned to the caller.
pub fn record_failure<C: GenericClient>(
    client: &mut C,
    action: &str,
    actor: &str,
    target_type: &str,
    target_id: &str,
    error_message: &str,
) -> anyhow::Result<()> {
    append(
        client,
        &AuditEntry {
            action,
            actor,
            target_type,
            target_id,
            old_value: None,
            new_value: None,
            client_ip: None,
            success: false,
            error_message: Some(error_message),
        },
    )
}

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    pub target_type: String,
    pub target_id: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub client_ip: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

fn from_row(row: &postgres::Row) -> AuditRow {
    AuditRow {
        id: row.get("id"),
        occurred_at: row.get("occurred_at"),
        action: row.get("action"),
        actor: row.get("actor"),
        target_type: row.get("target_type"),
        target_id: row.get("target_id"),
        old_value: row.get("old_value"),
        new_value: row.get("new_value"),
        client_ip: row.get("client_ip"),
        success: row.get("success"),
        error_message: row.get("error_message"),
    }
}

/// Recent history for one target, newest first, for the operator-facing
/// side of `GetProgress`/diagnostics.
pub fn for_target<C: GenericClient>(
    client: &mut C,
    target_type: &str,
    target_id: &str,
    limit: i64,
) -> anyhow::Result<Vec<AuditRow>> {
    let rows = client.query(
        "SELECT * FROM steep_repl.audit_log \
         WHERE target_type = $1 AND target_id = $2 \
         ORDER BY occurred_at DESC LIMIT $3",
        &[&target_type, &target_id, &limit],
    )?;
    Ok(rows.iter().map(from_row).collect())
}
