//! Overlap analyzer: categorizes primary-key tuples across two nodes via
//! the extension's `row_hash` function.

use std::collections::HashMap;
use std::fmt;

use postgres::GenericClient;
use serde_json::Value;

use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapCategory {
    Match,
    Conflict,
    LocalOnly,
    RemoteOnly,
}

impl OverlapCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            OverlapCategory::Match => "match",
            OverlapCategory::Conflict => "conflict",
            OverlapCategory::LocalOnly => "local_only",
            OverlapCategory::RemoteOnly => "remote_only",
        }
    }
}

impl fmt::Display for OverlapCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single PK tuple's comparison outcome, streamed from the analyzer.
/// `pk_value` is a JSON array so composite keys are supported uniformly.
#[derive(Debug, Clone)]
pub struct MergeComparisonRow {
    pub pk_value: Value,
    pub category: OverlapCategory,
    pub node_a_row_hash: Option<String>,
    pub node_b_row_hash: Option<String>,
    pub node_a_commit_ts: Option<chrono::DateTime<chrono::Utc>>,
    pub node_b_commit_ts: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlapSummary {
    pub total_rows: usize,
    pub matches: usize,
    pub conflicts: usize,
    pub local_only: usize,
    pub remote_only: usize,
}

/// One side's `{pk tuple -> row_hash}` map, read via the extension's
/// `row_hash(rowtype)` so full rows never cross the network for
/// categorization purposes. Keyed by the PK tuple's canonical JSON
/// serialization rather than by `Value` itself, since `serde_json::Value`
/// does not implement `Hash`.
type RowHashMap = HashMap<String, (Value, String, Option<chrono::DateTime<chrono::Utc>>)>;

fn fetch_row_hashes<C: GenericClient>(
    client: &mut C,
    table: &Table,
    pk_columns: &[String],
) -> anyhow::Result<RowHashMap> {
    let sql = format!(
        "SELECT jsonb_build_array({cols}) AS pk, steep_repl.row_hash(t) AS row_hash, \
                pg_xact_commit_timestamp(xmin) AS commit_ts \
         FROM {table} t",
        cols = pk_columns.join(", "),
        table = table,
    );
    let rows = client.query(&sql, &[])?;
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let pk: Value = row.get("pk");
        let hash: String = row.get("row_hash");
        let commit_ts: Option<chrono::DateTime<chrono::Utc>> = row.get("commit_ts");
        let key = serde_json::to_string(&pk)?;
        out.insert(key, (pk, hash, commit_ts));
    }
    Ok(out)
}

/// Categorizes every PK tuple found on either side of `table` into
/// {match, conflict, local_only, remote_only}. `local` and
/// `remote` are connections to node A's and node B's databases
/// respectively; composite primary keys are supported since `pk_value` is
/// always a JSON array.
pub fn analyze<CA: GenericClient, CB: GenericClient>(
    local: &mut CA,
    remote: &mut CB,
    table: &Table,
    pk_columns: &[String],
) -> anyhow::Result<(Vec<MergeComparisonRow>, OverlapSummary)> {
    let local_hashes = fetch_row_hashes(local, table, pk_columns)?;
    let remote_hashes = fetch_row_hashes(remote, table, pk_columns)?;

    let mut rows = Vec::new();
    let mut summary = OverlapSummary::default();

    for (key, (pk, local_hash, local_ts)) in &local_hashes {
        let row = if let Some((_, remote_hash, remote_ts)) = remote_hashes.get(key) {
            let category = if local_hash == remote_hash {
                summary.matches += 1;
                OverlapCategory::Match
            } else {
                summary.conflicts += 1;
                OverlapCategory::Conflict
            };
            MergeComparisonRow {
                pk_value: pk.clone(),
                category,
                node_a_row_hash: Some(local_hash.clone()),
                node_b_row_hash: Some(remote_hash.clone()),
                node_a_commit_ts: *local_ts,
                node_b_commit_ts: *remote_ts,
            }
        } else {
            summary.local_only += 1;
            MergeComparisonRow {
                pk_value: pk.clone(),
                category: OverlapCategory::LocalOnly,
                node_a_row_hash: Some(local_hash.clone()),
                node_b_row_hash: None,
                node_a_commit_ts: *local_ts,
                node_b_commit_ts: None,
            }
        };
        rows.push(row);
    }

    for (key, (pk, remote_hash, remote_ts)) in &remote_hashes {
        if !local_hashes.contains_key(key) {
            summary.remote_only += 1;
            rows.push(MergeComparisonRow {
                pk_value: pk.clone(),
                category: OverlapCategory::RemoteOnly,
                node_a_row_hash: None,
                node_b_row_hash: Some(remote_hash.clone()),
                node_a_commit_ts: None,
                node_b_commit_ts: *remote_ts,
            });
        }
    }

    summary.total_rows = summary.matches + summary.conflicts + summary.local_only + summary.remote_only;
    Ok((rows, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_of_no_rows_is_all_zero() {
        let summary = OverlapSummary::default();
        assert_eq!(summary.total_rows, 0);
        assert_eq!(summary.matches, 0);
    }

    #[test]
    fn category_string_forms_match_merge_audit_log_constraint() {
        assert_eq!(OverlapCategory::Match.as_str(), "match");
        assert_eq!(OverlapCategory::Conflict.as_str(), "conflict");
        assert_eq!(OverlapCategory::LocalOnly.as_str(), "local_only");
        assert_eq!(OverlapCategory::RemoteOnly.as_str(), "remote_only");
    }
}
