//! `steep_repl.merge_audit_log` — durable record of every merge decision.
//!
//! Not present in the retrieved extension source (which predates the merge
//! feature); the column set below adds the `incident` resolution value
//! this crate needs for the partial-commit window described in
//! `DESIGN.md`. Row shape otherwise mirrors `audit_log`'s JSONB-before/
//! after convention.

use chrono::{DateTime, Utc};
use postgres::GenericClient;
use serde_json::Value;

use crate::overlap::OverlapCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeptA,
    KeptB,
    Skipped,
    NotApplicable,
    /// A committed, B did not: see `IntegrityError::PartialMergeCommit`.
    Incident,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::KeptA => "kept_a",
            Resolution::KeptB => "kept_b",
            Resolution::Skipped => "skipped",
            Resolution::NotApplicable => "n_a",
            Resolution::Incident => "incident",
        }
    }
}

pub struct MergeAuditEntry<'a> {
    pub merge_id: &'a str,
    pub table_schema: &'a str,
    pub table_name: &'a str,
    pub pk_value: &'a Value,
    pub category: OverlapCategory,
    pub node_a_value: Option<&'a Value>,
    pub node_b_value: Option<&'a Value>,
    pub resolution: Resolution,
}

pub fn append<C: GenericClient>(client: &mut C, entry: &MergeAuditEntry<'_>) -> anyhow::Result<()> {
    client.execute(
        "INSERT INTO steep_repl.merge_audit_log \
         (merge_id, table_schema, table_name, pk_value, category, node_a_value, node_b_value, resolution, occurred_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())",
        &[
            &entry.merge_id,
            &entry.table_schema,
            &entry.table_name,
            entry.pk_value,
            &entry.category.as_str(),
            &entry.node_a_value,
            &entry.node_b_value,
            &entry.resolution.as_str(),
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MergeAuditRow {
    pub merge_id: String,
    pub table_schema: String,
    pub table_name: String,
    pub pk_value: Value,
    pub category: String,
    pub resolution: String,
    pub occurred_at: DateTime<Utc>,
}

pub fn for_merge<C: GenericClient>(client: &mut C, merge_id: &str) -> anyhow::Result<Vec<MergeAuditRow>> {
    let rows = client.query(
        "SELECT merge_id, table_schema, table_name, pk_value, category, resolution, occurred_at \
         FROM steep_repl.merge_audit_log WHERE merge_id = $1 ORDER BY occurred_at ASC",
        &[&merge_id],
    )?;
    Ok(rows
        .iter()
        .map(|row| MergeAuditRow {
            merge_id: row.get("merge_id"),
            table_schema: row.get("table_schema"),
            table_name: row.get("table_name"),
            pk_value: row.get("pk_value"),
            category: row.get("category"),
            resolution: row.get("resolution"),
            occurred_at: row.get("occurred_at"),
        })
        .collect())
}
