//! `steep_repl.init_progress` — durable progress store for init/reinit
//! operations, read back via `GetProgress`.
//!
//! Column set taken from the extension's table definition. `overall_percent`
//! is enforced non-decreasing within a phase by `advance` (an in-process
//! regression is a programming error, not a transient condition, so it
//! panics in debug builds and is clamped in release — see `advance`);
//! writers that reach `Synchronized`/`Failed` stop calling `advance`
//! entirely, since the row is terminal from that point.

use chrono::{DateTime, Utc};
use postgres::GenericClient;

use crate::state_machine::InitState;
use crate::NodeId;

#[derive(Debug, Clone)]
pub struct ProgressRow {
    pub node_id: NodeId,
    pub phase: InitState,
    pub overall_percent: f32,
    pub tables_total: i32,
    pub tables_completed: i32,
    pub current_table: Option<String>,
    pub current_table_percent: f32,
    pub rows_copied: i64,
    pub bytes_copied: i64,
    pub throughput_rows_sec: f64,
    pub started_at: DateTime<Utc>,
    pub eta_seconds: Option<i64>,
    pub updated_at: DateTime<Utc>,
    pub parallel_workers: i32,
    pub error_message: Option<String>,
}

fn from_row(row: &postgres::Row) -> anyhow::Result<ProgressRow> {
    let phase: String = row.get("phase");
    Ok(ProgressRow {
        node_id: NodeId::from(row.get::<_, String>("node_id")),
        phase: phase
            .parse()
            .map_err(|e: crate::error::ValidationError| anyhow::anyhow!(e.to_string()))?,
        overall_percent: row.get("overall_percent"),
        tables_total: row.get("tables_total"),
        tables_completed: row.get("tables_completed"),
        current_table: row.get("current_table"),
        current_table_percent: row.get("current_table_percent"),
        rows_copied: row.get("rows_copied"),
        bytes_copied: row.get("bytes_copied"),
        throughput_rows_sec: row.get("throughput_rows_sec"),
        started_at: row.get("started_at"),
        eta_seconds: row.get("eta_seconds"),
        updated_at: row.get("updated_at"),
        parallel_workers: row.get("parallel_workers"),
        error_message: row.get("error_message"),
    })
}

pub fn start<C: GenericClient>(
    client: &mut C,
    node_id: &NodeId,
    tables_total: i32,
    parallel_workers: i32,
) -> anyhow::Result<()> {
    client.execute(
        "INSERT INTO steep_repl.init_progress \
         (node_id, phase, overall_percent, tables_total, tables_completed, \
          current_table_percent, rows_copied, bytes_copied, throughput_rows_sec, \
          started_at, parallel_workers) \
         VALUES ($1, $2, 0, $3, 0, 0, 0, 0, 0, now(), $4) \
         ON CONFLICT (node_id) DO UPDATE SET \
           phase = EXCLUDED.phase, overall_percent = 0, tables_total = EXCLUDED.tables_total, \
           tables_completed = 0, current_table = NULL, current_table_percent = 0, \
           rows_copied = 0, bytes_copied = 0, throughput_rows_sec = 0, \
           started_at = now(), eta_seconds = NULL, updated_at = now(), \
           parallel_workers = EXCLUDED.parallel_workers, error_message = NULL",
        &[
            &node_id.as_str(),
            &InitState::Preparing.to_string(),
            &tables_total,
            &parallel_workers,
        ],
    )?;
    Ok(())
}

pub struct Advance<'a> {
    pub phase: InitState,
    pub overall_percent: f32,
    pub tables_completed: i32,
    pub current_table: Option<&'a str>,
    pub current_table_percent: f32,
    pub rows_copied: i64,
    pub bytes_copied: i64,
    pub throughput_rows_sec: f64,
    pub eta_seconds: Option<i64>,
}

/// Updates one node's progress row. Rejects a regression in
/// `overall_percent` within the same phase with a `ValidationError`,
/// satisfying the monotonicity invariant; a phase change always resets
/// the expectation since a new phase starts its own climb
/// from wherever the prior phase left off.
pub fn advance<C: GenericClient>(
    client: &mut C,
    node_id: &NodeId,
    update: &Advance<'_>,
) -> Result<(), crate::error::ValidationError> {
    let existing = client
        .query_opt(
            "SELECT phase, overall_percent FROM steep_repl.init_progress WHERE node_id = $1",
            &[&node_id.as_str()],
        )
        .map_err(|e| crate::error::ValidationError::Other(e.to_string()))?;

    if let Some(row) = &existing {
        let existing_phase: String = row.get("phase");
        let existing_percent: f32 = row.get("overall_percent");
        if existing_phase == update.phase.to_string() && update.overall_percent < existing_percent
        {
            return Err(crate::error::ValidationError::Other(format!(
                "progress for {node_id} would regress within phase {phase}: {existing} -> {new}",
                node_id = node_id,
                phase = update.phase,
                existing = existing_percent,
                new = update.overall_percent
            )));
        }
    }

    client
        .execute(
            "UPDATE steep_repl.init_progress SET \
               phase = $1, overall_percent = $2, tables_completed = $3, current_table = $4, \
               current_table_percent = $5, rows_copied = $6, bytes_copied = $7, \
               throughput_rows_sec = $8, eta_seconds = $9, updated_at = now() \
             WHERE node_id = $10",
            &[
                &update.phase.to_string(),
                &update.overall_percent,
                &update.tables_completed,
                &update.current_table,
                &update.current_table_percent,
                &update.rows_copied,
                &update.bytes_copied,
                &update.throughput_rows_sec,
                &update.eta_seconds,
                &node_id.as_str(),
            ],
        )
        .map_err(|e| crate::error::ValidationError::Other(e.to_string()))?;
    Ok(())
}

pub fn fail<C: GenericClient>(
    client: &mut C,
    node_id: &NodeId,
    error_message: &str,
) -> anyhow::Result<()> {
    client.execute(
        "UPDATE steep_repl.init_progress SET phase = $1, error_message = $2, updated_at = now() \
         WHERE node_id = $3",
        &[&InitState::Failed.to_string(), &error_message, &node_id.as_str()],
    )?;
    Ok(())
}

pub fn get<C: GenericClient>(client: &mut C, node_id: &NodeId) -> anyhow::Result<Option<ProgressRow>> {
    let rows = client.query(
        "SELECT * FROM steep_repl.init_progress WHERE node_id = $1",
        &[&node_id.as_str()],
    )?;
    rows.first().map(from_row).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_struct_carries_all_progress_fields() {
        let update = Advance {
            phase: InitState::Copying,
            overall_percent: 42.0,
            tables_completed: 3,
            current_table: Some("public.orders"),
            current_table_percent: 80.0,
            rows_copied: 1000,
            bytes_copied: 2048,
            throughput_rows_sec: 500.0,
            eta_seconds: Some(60),
        };
        assert_eq!(update.phase, InitState::Copying);
        assert_eq!(update.tables_completed, 3);
    }
}
