//! Conflict resolver and merge executor.
//!
//! Built directly on `overlap::analyze` for categorization and
//! `fk::topological_sort` for ordering; this module decides what to do
//! with each categorized row and carries out the two-sided atomic merge
//! envelope, recording every decision via `db::merge_audit`.

use std::fmt;
use std::str::FromStr;

use postgres::types::ToSql;
use postgres::{Client, GenericClient};
use serde_json::Value;

use crate::db::merge_audit::{self, MergeAuditEntry, Resolution};
use crate::error::{CoordinatorError, IntegrityError, ValidationError};
use crate::overlap::{self, MergeComparisonRow, OverlapCategory, OverlapSummary};
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    PreferNodeA,
    PreferNodeB,
    LastModified,
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::PreferNodeA => "prefer_node_a",
            ResolutionStrategy::PreferNodeB => "prefer_node_b",
            ResolutionStrategy::LastModified => "last_modified",
            ResolutionStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "prefer_node_a" => ResolutionStrategy::PreferNodeA,
            "prefer_node_b" => ResolutionStrategy::PreferNodeB,
            "last_modified" => ResolutionStrategy::LastModified,
            "manual" => ResolutionStrategy::Manual,
            other => return Err(ValidationError::Other(format!("unknown resolution strategy: {other}"))),
        })
    }
}

/// One row of the manual-mode conflict report.
#[derive(Debug, Clone)]
pub struct ConflictReportEntry {
    pub table_schema: String,
    pub table_name: String,
    pub pk_value: Value,
    pub node_a_value: Option<Value>,
    pub node_b_value: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub summary: OverlapSummary,
    pub applied_count: usize,
    pub skipped_count: usize,
    pub conflict_report: Vec<ConflictReportEntry>,
}

/// A table to merge plus its primary key columns, already ordered so
/// parents precede children (`fk::topological_sort`'s output).
pub struct MergeTarget {
    pub table: Table,
    pub pk_columns: Vec<String>,
}

pub struct MergeInput<'a> {
    pub merge_id: &'a str,
    pub strategy: ResolutionStrategy,
    pub dry_run: bool,
    pub tables: &'a [MergeTarget],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    CopyAtoB,
    CopyBtoA,
    Skip,
    NotApplicable,
}

/// Decides what to do with one categorized row, per the configured
/// resolution strategy. `last_modified` ties (including the case where
/// either side is missing a commit timestamp) break to `prefer_node_a`.
fn decide(row: &MergeComparisonRow, strategy: ResolutionStrategy) -> Decision {
    match row.category {
        OverlapCategory::Match => Decision::NotApplicable,
        OverlapCategory::LocalOnly => Decision::CopyAtoB,
        OverlapCategory::RemoteOnly => Decision::CopyBtoA,
        OverlapCategory::Conflict => match strategy {
            ResolutionStrategy::PreferNodeA => Decision::CopyAtoB,
            ResolutionStrategy::PreferNodeB => Decision::CopyBtoA,
            ResolutionStrategy::Manual => Decision::Skip,
            ResolutionStrategy::LastModified => match (row.node_a_commit_ts, row.node_b_commit_ts) {
                (Some(a), Some(b)) if b > a => Decision::CopyBtoA,
                _ => Decision::CopyAtoB,
            },
        },
    }
}

/// Checks for open transactions on `client` older than `threshold_secs`;
/// this is advisory only, the caller logs a warning and proceeds rather
/// than failing the merge.
pub fn long_running_transactions<C: GenericClient>(
    client: &mut C,
    threshold_secs: i64,
) -> anyhow::Result<Vec<i32>> {
    let rows = client.query(
        "SELECT pid FROM pg_stat_activity \
         WHERE state = 'active' AND xact_start < now() - ($1 || ' seconds')::interval",
        &[&threshold_secs.to_string()],
    )?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

fn pk_text_values(pk_value: &Value) -> anyhow::Result<Vec<String>> {
    let arr = pk_value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("pk_value {pk_value} is not a JSON array"))?;
    Ok(arr
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect())
}

/// Reads the full row matching `pk_value` as a single `jsonb` object, so
/// it can be carried across to the other node without the caller needing
/// to know the table's column list in advance.
fn fetch_full_row<C: GenericClient>(
    client: &mut C,
    table: &Table,
    pk_columns: &[String],
    pk_value: &Value,
) -> anyhow::Result<Option<Value>> {
    let values = pk_text_values(pk_value)?;
    let conds: Vec<String> = pk_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c}::text = ${}", i + 1))
        .collect();
    let sql = format!("SELECT to_jsonb(t) AS row FROM {table} t WHERE {}", conds.join(" AND "));
    let params: Vec<&(dyn ToSql + Sync)> = values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
    let row = client.query_opt(&sql, &params)?;
    Ok(row.map(|r| r.get::<_, Value>("row")))
}

/// Writes `row_json` into `table` via `jsonb_populate_record`, upserting
/// on the primary key so a conflict-resolution overwrite and a plain
/// local-only/remote-only transfer share the same code path.
fn upsert_row<C: GenericClient>(
    client: &mut C,
    table: &Table,
    pk_columns: &[String],
    row_json: &Value,
) -> anyhow::Result<()> {
    let obj = row_json
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("row for {table} is not a JSON object"))?;
    let set_clause: Vec<String> = obj
        .keys()
        .filter(|k| !pk_columns.contains(k))
        .map(|k| format!("{k} = EXCLUDED.{k}"))
        .collect();
    let conflict_cols = pk_columns.join(", ");
    let sql = if set_clause.is_empty() {
        format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1) \
             ON CONFLICT ({conflict_cols}) DO NOTHING"
        )
    } else {
        format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1) \
             ON CONFLICT ({conflict_cols}) DO UPDATE SET {}",
            set_clause.join(", ")
        )
    };
    client.execute(&sql, &[row_json])?;
    Ok(())
}

fn table_schema(table: &Table) -> String {
    table.schema.clone().unwrap_or_else(|| "public".to_string())
}

/// Runs the overlap analyzer over every table in `input.tables`, in the
/// order given (parents before children, so a dry run still reports
/// accurate counts without touching data).
fn analyze_all(
    node_a: &mut Client,
    node_b: &mut Client,
    tables: &[MergeTarget],
) -> anyhow::Result<Vec<(Table, Vec<String>, Vec<MergeComparisonRow>, OverlapSummary)>> {
    let mut per_table = Vec::with_capacity(tables.len());
    for target in tables {
        let (rows, summary) = overlap::analyze(node_a, node_b, &target.table, &target.pk_columns)?;
        per_table.push((target.table.clone(), target.pk_columns.clone(), rows, summary));
    }
    Ok(per_table)
}

fn aggregate(per_table: &[(Table, Vec<String>, Vec<MergeComparisonRow>, OverlapSummary)]) -> OverlapSummary {
    let mut total = OverlapSummary::default();
    for (_, _, _, summary) in per_table {
        total.total_rows += summary.total_rows;
        total.matches += summary.matches;
        total.conflicts += summary.conflicts;
        total.local_only += summary.local_only;
        total.remote_only += summary.remote_only;
    }
    total
}

/// Runs bidirectional merge over `input.tables`.
///
/// Pre-flight: every target must carry a non-empty primary key (callers
/// populate `pk_columns` from `Table::get_primary_key_info`, which already
/// fails on an unkeyed table; this re-checks defensively before any I/O).
///
/// `dry_run=true` performs only the analysis pass and returns counts
/// (and, in `manual` mode, the full conflict report) with no write
/// transaction opened on either side.
///
/// Otherwise the merge executes inside one transaction per node: every
/// decision is applied and audited against both, `node_a`'s transaction
/// commits first, then `node_b`'s. If `node_b`'s commit fails after
/// `node_a`'s has already succeeded, the merge returns
/// `IntegrityError::PartialMergeCommit` and records an `incident` audit
/// row per table on `node_a` (already-committed and now unreachable from
/// `node_b`'s transaction, so a direct statement is used instead).
pub fn execute(node_a: &mut Client, node_b: &mut Client, input: &MergeInput<'_>) -> Result<MergeOutcome, CoordinatorError> {
    for target in input.tables {
        if target.pk_columns.is_empty() {
            return Err(ValidationError::MissingPrimaryKey {
                schema: table_schema(&target.table),
                table: target.table.name.clone(),
            }
            .into());
        }
    }

    let per_table = analyze_all(node_a, node_b, input.tables)?;
    let summary = aggregate(&per_table);

    let mut conflict_report = Vec::new();
    if input.strategy == ResolutionStrategy::Manual {
        for (table, pk_columns, rows, _) in &per_table {
            for row in rows {
                if row.category == OverlapCategory::Conflict {
                    let a_value = fetch_full_row(node_a, table, pk_columns, &row.pk_value)?;
                    let b_value = fetch_full_row(node_b, table, pk_columns, &row.pk_value)?;
                    conflict_report.push(ConflictReportEntry {
                        table_schema: table_schema(table),
                        table_name: table.name.clone(),
                        pk_value: row.pk_value.clone(),
                        node_a_value: a_value,
                        node_b_value: b_value,
                    });
                }
            }
        }
    }

    if input.dry_run {
        return Ok(MergeOutcome {
            summary,
            applied_count: 0,
            skipped_count: summary.conflicts + summary.local_only + summary.remote_only,
            conflict_report,
        });
    }

    let mut txn_a = node_a.transaction()?;
    let mut txn_b = node_b.transaction()?;

    let mut applied = 0usize;
    let mut skipped = 0usize;

    for (table, pk_columns, rows, _) in &per_table {
        let schema = table_schema(table);
        for row in rows {
            let decision = decide(row, input.strategy);
            let (resolution, node_a_value, node_b_value) = match decision {
                Decision::NotApplicable => (Resolution::NotApplicable, None, None),
                Decision::Skip => {
                    skipped += 1;
                    (Resolution::Skipped, None, None)
                }
                Decision::CopyAtoB => {
                    let value = fetch_full_row(&mut txn_a, table, pk_columns, &row.pk_value)?
                        .ok_or_else(|| anyhow::anyhow!("row for {table} pk {} vanished mid-merge", row.pk_value))?;
                    upsert_row(&mut txn_b, table, pk_columns, &value)?;
                    applied += 1;
                    (Resolution::KeptA, Some(value), None)
                }
                Decision::CopyBtoA => {
                    let value = fetch_full_row(&mut txn_b, table, pk_columns, &row.pk_value)?
                        .ok_or_else(|| anyhow::anyhow!("row for {table} pk {} vanished mid-merge", row.pk_value))?;
                    upsert_row(&mut txn_a, table, pk_columns, &value)?;
                    applied += 1;
                    (Resolution::KeptB, None, Some(value))
                }
            };
            merge_audit::append(
                &mut txn_a,
                &MergeAuditEntry {
                    merge_id: input.merge_id,
                    table_schema: &schema,
                    table_name: &table.name,
                    pk_value: &row.pk_value,
                    category: row.category,
                    node_a_value: node_a_value.as_ref(),
                    node_b_value: node_b_value.as_ref(),
                    resolution,
                },
            )?;
        }
    }

    txn_a.commit()?;
    if let Err(err) = txn_b.commit() {
        for target in input.tables {
            let schema = table_schema(&target.table);
            let _ = merge_audit::append(
                node_a,
                &MergeAuditEntry {
                    merge_id: input.merge_id,
                    table_schema: &schema,
                    table_name: &target.table.name,
                    pk_value: &Value::Null,
                    category: OverlapCategory::Conflict,
                    node_a_value: None,
                    node_b_value: None,
                    resolution: Resolution::Incident,
                },
            );
        }
        tracing::error!(error = %err, merge_id = input.merge_id, "node B commit failed after node A committed");
        let first = &input.tables[0].table;
        return Err(IntegrityError::PartialMergeCommit {
            table_schema: table_schema(first),
            table_name: first.name.clone(),
        }
        .into());
    }

    Ok(MergeOutcome {
        summary,
        applied_count: applied,
        skipped_count: skipped,
        conflict_report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn row(category: OverlapCategory, a_ts: Option<i64>, b_ts: Option<i64>) -> MergeComparisonRow {
        MergeComparisonRow {
            pk_value: Value::from(1),
            category,
            node_a_row_hash: Some("a".into()),
            node_b_row_hash: Some("b".into()),
            node_a_commit_ts: a_ts.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            node_b_commit_ts: b_ts.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
        }
    }

    #[test]
    fn strategy_round_trips_through_string() {
        for s in ["prefer_node_a", "prefer_node_b", "last_modified", "manual"] {
            let strategy: ResolutionStrategy = s.parse().unwrap();
            assert_eq!(strategy.to_string(), s);
        }
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!("whatever".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn prefer_node_a_always_keeps_a_on_conflict() {
        let r = row(OverlapCategory::Conflict, Some(100), Some(200));
        assert_eq!(decide(&r, ResolutionStrategy::PreferNodeA), Decision::CopyAtoB);
    }

    #[test]
    fn last_modified_picks_the_later_commit() {
        let r = row(OverlapCategory::Conflict, Some(100), Some(200));
        assert_eq!(decide(&r, ResolutionStrategy::LastModified), Decision::CopyBtoA);
    }

    #[test]
    fn last_modified_ties_break_to_prefer_node_a() {
        let tie = row(OverlapCategory::Conflict, Some(100), Some(100));
        assert_eq!(decide(&tie, ResolutionStrategy::LastModified), Decision::CopyAtoB);
        let missing = row(OverlapCategory::Conflict, Some(100), None);
        assert_eq!(decide(&missing, ResolutionStrategy::LastModified), Decision::CopyAtoB);
    }

    #[test]
    fn manual_strategy_skips_conflicts() {
        let r = row(OverlapCategory::Conflict, None, None);
        assert_eq!(decide(&r, ResolutionStrategy::Manual), Decision::Skip);
    }

    #[test]
    fn local_only_and_remote_only_always_transfer() {
        let local = row(OverlapCategory::LocalOnly, None, None);
        let remote = row(OverlapCategory::RemoteOnly, None, None);
        for strategy in [
            ResolutionStrategy::PreferNodeA,
            ResolutionStrategy::PreferNodeB,
            ResolutionStrategy::LastModified,
            ResolutionStrategy::Manual,
        ] {
            assert_eq!(decide(&local, strategy), Decision::CopyAtoB);
            assert_eq!(decide(&remote, strategy), Decision::CopyBtoA);
        }
    }

    #[test]
    fn matches_are_never_applicable() {
        let r = row(OverlapCategory::Match, None, None);
        for strategy in [
            ResolutionStrategy::PreferNodeA,
            ResolutionStrategy::PreferNodeB,
            ResolutionStrategy::LastModified,
            ResolutionStrategy::Manual,
        ] {
            assert_eq!(decide(&r, strategy), Decision::NotApplicable);
        }
    }
}
