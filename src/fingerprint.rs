//! Schema fingerprint / sync-mode module.
//!
//! Wraps the extension's `compute_fingerprint`/`capture_all_fingerprints`
//! SQL functions; the core never reimplements the hashing itself.

use postgres::GenericClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PreconditionError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    pub nullable: String,
    pub default: Option<String>,
    pub position: i32,
}

#[derive(Debug, Clone)]
pub struct SchemaFingerprint {
    pub table_schema: String,
    pub table_name: String,
    pub fingerprint: String,
    pub column_count: i32,
    pub column_definitions: Vec<ColumnDefinition>,
}

/// Calls `steep_repl.capture_fingerprint(schema, table)` and reads back the
/// stored row.
pub fn capture<C: GenericClient>(
    client: &mut C,
    table_schema: &str,
    table_name: &str,
) -> anyhow::Result<SchemaFingerprint> {
    client.query(
        "SELECT steep_repl.capture_fingerprint($1, $2)",
        &[&table_schema, &table_name],
    )?;
    let row = client.query_one(
        "SELECT table_schema, table_name, fingerprint, column_count, column_definitions \
         FROM steep_repl.schema_fingerprints WHERE table_schema = $1 AND table_name = $2",
        &[&table_schema, &table_name],
    )?;
    let column_definitions: Value = row.get("column_definitions");
    Ok(SchemaFingerprint {
        table_schema: row.get("table_schema"),
        table_name: row.get("table_name"),
        fingerprint: row.get("fingerprint"),
        column_count: row.get("column_count"),
        column_definitions: serde_json::from_value(column_definitions)?,
    })
}

/// Calls `steep_repl.capture_all_fingerprints()`, returning the number of
/// tables fingerprinted.
pub fn capture_all<C: GenericClient>(client: &mut C) -> anyhow::Result<i32> {
    let row = client.query_one("SELECT steep_repl.capture_all_fingerprints()", &[])?;
    Ok(row.get(0))
}

pub fn get_all<C: GenericClient>(client: &mut C) -> anyhow::Result<Vec<SchemaFingerprint>> {
    let rows = client.query(
        "SELECT table_schema, table_name, fingerprint, column_count, column_definitions \
         FROM steep_repl.schema_fingerprints ORDER BY table_schema, table_name",
        &[],
    )?;
    rows.iter()
        .map(|row| {
            let column_definitions: Value = row.get("column_definitions");
            Ok(SchemaFingerprint {
                table_schema: row.get("table_schema"),
                table_name: row.get("table_name"),
                fingerprint: row.get("fingerprint"),
                column_count: row.get("column_count"),
                column_definitions: serde_json::from_value(column_definitions)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaSyncMode {
    Strict,
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableDiffStatus {
    Match,
    Mismatch,
    LocalOnly,
    RemoteOnly,
}

#[derive(Debug, Clone)]
pub struct TableDiff {
    pub table_schema: String,
    pub table_name: String,
    pub status: TableDiffStatus,
    pub local_fp: Option<String>,
    pub remote_fp: Option<String>,
    pub remote_columns: Vec<ColumnDefinition>,
}

/// Compares a local fingerprint set to a remote one, producing one
/// `TableDiff` per table seen on either side.
pub fn diff(local: &[SchemaFingerprint], remote: &[SchemaFingerprint]) -> Vec<TableDiff> {
    use std::collections::HashMap;

    let local_by_key: HashMap<(&str, &str), &SchemaFingerprint> = local
        .iter()
        .map(|f| ((f.table_schema.as_str(), f.table_name.as_str()), f))
        .collect();
    let remote_by_key: HashMap<(&str, &str), &SchemaFingerprint> = remote
        .iter()
        .map(|f| ((f.table_schema.as_str(), f.table_name.as_str()), f))
        .collect();

    let mut diffs = Vec::new();
    for (key, local_fp) in &local_by_key {
        match remote_by_key.get(key) {
            Some(remote_fp) => {
                let status = if local_fp.fingerprint == remote_fp.fingerprint {
                    TableDiffStatus::Match
                } else {
                    TableDiffStatus::Mismatch
                };
                diffs.push(TableDiff {
                    table_schema: key.0.to_string(),
                    table_name: key.1.to_string(),
                    status,
                    local_fp: Some(local_fp.fingerprint.clone()),
                    remote_fp: Some(remote_fp.fingerprint.clone()),
                    remote_columns: remote_fp.column_definitions.clone(),
                });
            }
            None => diffs.push(TableDiff {
                table_schema: key.0.to_string(),
                table_name: key.1.to_string(),
                status: TableDiffStatus::LocalOnly,
                local_fp: Some(local_fp.fingerprint.clone()),
                remote_fp: None,
                remote_columns: Vec::new(),
            }),
        }
    }
    for (key, remote_fp) in &remote_by_key {
        if !local_by_key.contains_key(key) {
            diffs.push(TableDiff {
                table_schema: key.0.to_string(),
                table_name: key.1.to_string(),
                status: TableDiffStatus::RemoteOnly,
                local_fp: None,
                remote_fp: Some(remote_fp.fingerprint.clone()),
                remote_columns: remote_fp.column_definitions.clone(),
            });
        }
    }
    diffs
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub mode: SchemaSyncMode,
    pub action: &'static str,
    pub applied_count: usize,
    pub skipped_count: usize,
    pub ddl_statements: Vec<String>,
    pub warning_message: Option<String>,
}

/// Generates additive DDL for a `RemoteOnly`/`Mismatch` diff: `CREATE
/// TABLE` for tables missing locally, `ALTER TABLE ADD COLUMN` for columns
/// the remote has that the local lacks. Type changes and dropped columns
/// are skipped (counted), never attempted.
fn ddl_for_diff(diff: &TableDiff, local_columns: &[ColumnDefinition]) -> (Vec<String>, bool) {
    let mut statements = Vec::new();
    match diff.status {
        TableDiffStatus::RemoteOnly => {
            let mut cols = diff.remote_columns.clone();
            cols.sort_by_key(|c| c.position);
            let col_sql = cols
                .iter()
                .map(|c| {
                    let nullability = if c.nullable == "NO" { " NOT NULL" } else { "" };
                    format!("{} {}{}", c.name, c.sql_type, nullability)
                })
                .collect::<Vec<_>>()
                .join(", ");
            statements.push(format!(
                "CREATE TABLE {}.{} ({})",
                diff.table_schema, diff.table_name, col_sql
            ));
            (statements, false)
        }
        TableDiffStatus::Mismatch => {
            let local_names: std::collections::HashSet<&str> =
                local_columns.iter().map(|c| c.name.as_str()).collect();
            let mut skipped = false;
            for col in &diff.remote_columns {
                if !local_names.contains(col.name.as_str()) {
                    statements.push(format!(
                        "ALTER TABLE {}.{} ADD COLUMN {} {}",
                        diff.table_schema, diff.table_name, col.name, col.sql_type
                    ));
                } else {
                    // Column exists on both sides but fingerprints differ
                    // elsewhere (type/default change) -- unsupported, skip.
                    skipped = true;
                }
            }
            (statements, skipped)
        }
        _ => (statements, false),
    }
}

/// Applies the schema-sync handler's behavior for one mode over a full
/// diff set.
pub fn sync<C: GenericClient>(
    client: &mut C,
    mode: SchemaSyncMode,
    diffs: &[TableDiff],
    local_columns_by_table: &std::collections::HashMap<(String, String), Vec<ColumnDefinition>>,
) -> Result<SyncOutcome, PreconditionError> {
    let non_matching: Vec<&TableDiff> = diffs
        .iter()
        .filter(|d| d.status != TableDiffStatus::Match)
        .collect();

    match mode {
        SchemaSyncMode::Strict => {
            if non_matching.is_empty() {
                Ok(SyncOutcome {
                    mode,
                    action: "passed",
                    applied_count: 0,
                    skipped_count: 0,
                    ddl_statements: Vec::new(),
                    warning_message: None,
                })
            } else {
                let names: Vec<String> = non_matching
                    .iter()
                    .map(|d| format!("{}.{} ({:?})", d.table_schema, d.table_name, d.status))
                    .collect();
                Err(PreconditionError::SchemaMismatch(names.join(", ")))
            }
        }
        SchemaSyncMode::Auto => {
            let mut applied = 0usize;
            let mut skipped = 0usize;
            let mut statements = Vec::new();
            for diff in &non_matching {
                let local_columns = local_columns_by_table
                    .get(&(diff.table_schema.clone(), diff.table_name.clone()))
                    .cloned()
                    .unwrap_or_default();
                let (ddl, had_skip) = ddl_for_diff(diff, &local_columns);
                if had_skip {
                    skipped += 1;
                }
                for stmt in &ddl {
                    client
                        .simple_query(stmt)
                        .map_err(|e| PreconditionError::Other(e.to_string()))?;
                    applied += 1;
                }
                statements.extend(ddl);
            }
            Ok(SyncOutcome {
                mode,
                action: "applied",
                applied_count: applied,
                skipped_count: skipped,
                ddl_statements: statements,
                warning_message: None,
            })
        }
        SchemaSyncMode::Manual => {
            let warning_message = if non_matching.is_empty() {
                None
            } else {
                Some(format!(
                    "{} table(s) differ from the source schema; no changes applied",
                    non_matching.len()
                ))
            };
            Ok(SyncOutcome {
                mode,
                action: "warned",
                applied_count: 0,
                skipped_count: 0,
                ddl_statements: Vec::new(),
                warning_message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(schema: &str, table: &str, hash: &str) -> SchemaFingerprint {
        SchemaFingerprint {
            table_schema: schema.to_string(),
            table_name: table.to_string(),
            fingerprint: hash.to_string(),
            column_count: 1,
            column_definitions: vec![],
        }
    }

    #[test]
    fn identical_fingerprints_are_a_match() {
        let local = vec![fp("public", "users", "abc")];
        let remote = vec![fp("public", "users", "abc")];
        let diffs = diff(&local, &remote);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].status, TableDiffStatus::Match);
    }

    #[test]
    fn differing_fingerprints_are_a_mismatch() {
        let local = vec![fp("public", "users", "abc")];
        let remote = vec![fp("public", "users", "def")];
        let diffs = diff(&local, &remote);
        assert_eq!(diffs[0].status, TableDiffStatus::Mismatch);
    }

    #[test]
    fn table_missing_locally_is_remote_only() {
        let local = vec![];
        let remote = vec![fp("public", "extra", "abc")];
        let diffs = diff(&local, &remote);
        assert_eq!(diffs[0].status, TableDiffStatus::RemoteOnly);
    }
}
