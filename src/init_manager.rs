//! The init manager: the central state machine driving node initialization.
//!
//! `StartInit` runs its preflight checks (operation slot, extension
//! presence on both sides, schema-sync) synchronously and returns as soon
//! as they pass; the baseline copy and catch-up wait run on a detached
//! worker thread, observable through the durable progress store and
//! cancellable through the operation registry — `StartInit` itself streams
//! nothing and returns only an ack.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use postgres::{Client, NoTls};

use crate::config::CoordinatorConfig;
use crate::db::{init_slots, nodes, Catalog};
use crate::error::{CoordinatorResult, PreconditionError, ValidationError};
use crate::fingerprint::{self, SchemaSyncMode};
use crate::logical_replication::{Lsn, Publication, Slot, Subscription};
use crate::operation::{CancelLatch, InitMethod, Operation, OperationRegistry};
use crate::state_machine::InitState;
use crate::table::Table;
use crate::{audit, copier, progress};
use crate::NodeId;

/// Everything `StartInit` needs beyond the three ids: the explicit table
/// set for this operation (this core does not itself enumerate a source's
/// publication membership), worker count, schema-sync mode, and the peer
/// record to register if this is the first time this source has been seen.
pub struct StartInitOptions {
    pub tables: Vec<Table>,
    pub parallel_workers: Option<usize>,
    pub schema_sync_mode: SchemaSyncMode,
    pub source_node_name: String,
    pub source_host: String,
    pub source_port: i32,
    pub source_priority: i32,
}

/// `StartReinit`'s scope parameter.
pub enum ReinitScope {
    Full,
    Schema(String),
    Tables(Vec<Table>),
}

pub struct InitManager {
    target: Catalog,
    target_conn_info: String,
    config: CoordinatorConfig,
    registry: OperationRegistry,
}

impl InitManager {
    pub fn new(target_conn_info: String, config: CoordinatorConfig) -> anyhow::Result<Self> {
        let target = Catalog::connect(&target_conn_info)?;
        Ok(Self {
            target,
            target_conn_info,
            config,
            registry: OperationRegistry::new(),
        })
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Boot-time reconciliation: a freshly-constructed registry is
    /// necessarily empty, so any node left in a non-terminal
    /// `init_state` from a prior process is marked `failed`.
    pub fn reconcile_on_boot(&self) -> CoordinatorResult<u64> {
        let mut conn = self.target.get()?;
        Ok(nodes::fail_all_non_terminal_on_boot(&mut *conn)?)
    }

    /// Registers `target`'s operation slot, runs the synchronous preflight
    /// (extension presence on both sides, schema-sync), then hands the
    /// baseline copy and catch-up wait to a detached worker thread.
    /// `source_conn_info` is a libpq connection string for the source node.
    pub fn start_init(
        &self,
        target: NodeId,
        source: NodeId,
        method: InitMethod,
        options: StartInitOptions,
        source_conn_info: &str,
    ) -> CoordinatorResult<()> {
        if method != InitMethod::AutomaticSnapshot {
            return Err(ValidationError::InvalidMethod(
                "two_phase init is driven via PrepareInit/CompleteInit, not StartInit".to_string(),
            )
            .into());
        }

        let worker_count = options
            .parallel_workers
            .map(|w| self.config.clamp_workers(w as i64))
            .unwrap_or(self.config.default_workers);

        let operation = Operation::new(
            target.clone(),
            Some(source.clone()),
            Some(method),
            worker_count,
            InitState::Preparing,
        );
        let handle = self.registry.start(target.clone(), operation)?;

        let mut conn = self.target.get()?;
        nodes::register_node(
            &mut *conn,
            &source,
            &options.source_node_name,
            &options.source_host,
            options.source_port,
            options.source_priority,
        )?;
        nodes::set_init_state(&mut *conn, &target, InitState::Preparing, Some(&source))?;
        progress::start(&mut *conn, &target, options.tables.len() as i32, worker_count as i32)?;
        audit::record_success(&mut *conn, "init.started", "coordinator", "node", target.as_str())?;
        drop(conn);

        let source_catalog = Catalog::connect(source_conn_info)
            .map_err(|e| PreconditionError::SourceUnreachable(e.to_string()))?;
        source_catalog
            .ensure_extension()
            .map_err(|e| PreconditionError::SourceUnreachable(e.to_string()))?;
        self.target.ensure_extension()?;

        if let Err(err) = self.check_schema(&source_catalog, &options) {
            self.fail_operation(&handle, &target, &source, &err.to_string());
            return Err(err);
        }

        let target_conn_info = self.target_conn_info.clone();
        let target_catalog = self.target.clone();
        let config = self.config.clone();
        let source_conn_info = source_conn_info.to_string();
        let tables = options.tables;

        thread::spawn(move || {
            let result = run_automatic_snapshot(
                &handle,
                &target,
                &source,
                &tables,
                &source_catalog,
                &source_conn_info,
                &target_catalog,
                &target_conn_info,
                &config,
                worker_count,
            );
            if let Err(err) = result {
                // The reserve-phase slot is created on the source before the
                // copy starts, so it (and its `init_slots` row) outlives
                // almost every failure this thread can hit. Best-effort drop
                // it here: a slot that never made it past `create_slot_at_lsn`
                // simply won't exist, and `drop_slot`'s error is swallowed
                // along with the rest of this cleanup path.
                let slot_name = config.naming.init_slot_name(source.as_str());
                if let Ok(mut source_conn) = source_catalog.get() {
                    let _ = Slot::new(slot_name.clone()).drop_slot(&mut *source_conn);
                }

                let mut conn = match target_catalog.get() {
                    Ok(c) => c,
                    Err(_) => return,
                };
                let _ = init_slots::delete(&mut *conn, &slot_name);
                let _ = nodes::set_init_state(&mut *conn, &target, InitState::Failed, Some(&source));
                let _ = progress::fail(&mut *conn, &target, &err.to_string());
                let _ = audit::record_failure(
                    &mut *conn,
                    "init.failed",
                    "coordinator",
                    "node",
                    target.as_str(),
                    &err.to_string(),
                );
                handle.set_phase(InitState::Failed);
            }
        });

        Ok(())
    }

    fn check_schema(&self, source: &Catalog, options: &StartInitOptions) -> CoordinatorResult<()> {
        let mut target_conn = self.target.get()?;
        let mut source_conn = source.get()?;
        let mut local = Vec::with_capacity(options.tables.len());
        let mut remote = Vec::with_capacity(options.tables.len());
        for table in &options.tables {
            let schema = table.schema.as_deref().unwrap_or("public");
            if let Ok(fp) = fingerprint::capture(&mut *target_conn, schema, &table.name) {
                local.push(fp);
            }
            remote.push(fingerprint::capture(&mut *source_conn, schema, &table.name)?);
        }
        let diffs = fingerprint::diff(&local, &remote);
        let mut local_columns = std::collections::HashMap::new();
        for diff in &diffs {
            if let Ok(fp) = fingerprint::capture(&mut *target_conn, &diff.table_schema, &diff.table_name) {
                local_columns.insert((diff.table_schema.clone(), diff.table_name.clone()), fp.column_definitions);
            }
        }
        fingerprint::sync(&mut *target_conn, options.schema_sync_mode, &diffs, &local_columns)?;
        Ok(())
    }

    fn fail_operation(&self, handle: &Arc<Operation>, target: &NodeId, source: &NodeId, message: &str) {
        if let Ok(mut conn) = self.target.get() {
            let _ = nodes::set_init_state(&mut *conn, target, InitState::Failed, Some(source));
            let _ = progress::fail(&mut *conn, target, message);
            let _ = audit::record_failure(&mut *conn, "init.failed", "coordinator", "node", target.as_str(), message);
        }
        handle.set_phase(InitState::Failed);
    }

    /// Idempotent: cancelling a missing or already-terminal operation is a
    /// no-op success.
    pub fn cancel_init(&self, node_id: &NodeId) -> CoordinatorResult<()> {
        self.registry.cancel(node_id);
        let mut conn = self.target.get()?;
        audit::record_success(&mut *conn, "init.cancelled", "coordinator", "node", node_id.as_str())?;
        Ok(())
    }

    pub fn get_progress(&self, node_id: &NodeId) -> CoordinatorResult<Option<progress::ProgressRow>> {
        let mut conn = self.target.get()?;
        Ok(progress::get(&mut *conn, node_id)?)
    }

    /// `StartReinit`: full reinit drops the subscription, truncates every
    /// subscribed table, and resets state to `uninitialized` (the caller
    /// follows with a fresh `StartInit`); partial reinit truncates the
    /// named tables and forces the existing subscription's tablesync
    /// worker to recopy them. Returns `tables_affected` exactly.
    pub fn start_reinit(&self, node_id: &NodeId, source: &NodeId, scope: ReinitScope) -> CoordinatorResult<u64> {
        let mut conn = self.target.get()?;
        let node = nodes::get_node(&mut *conn, node_id)?
            .ok_or_else(|| ValidationError::Other(format!("unknown node {node_id}")))?;
        if node.init_state != InitState::Synchronized {
            return Err(ValidationError::InvalidTransition {
                from: node.init_state.to_string(),
                to: InitState::Reinitializing.to_string(),
            }
            .into());
        }

        nodes::set_init_state(&mut *conn, node_id, InitState::Reinitializing, Some(source))?;

        let sub_name = self.config.naming.subscription_name(node_id.as_str(), source.as_str());

        let affected = match scope {
            ReinitScope::Full => {
                // The subscribed-table list must be read before the
                // subscription is dropped: `pg_subscription_rel` rows go
                // with it.
                let tables = tables_for_subscription(&mut *conn, &sub_name)?;
                let subscription = Subscription::new(sub_name, String::new(), String::new());
                subscription.drop(&mut *conn)?;
                for table in &tables {
                    conn.simple_query(&format!("TRUNCATE TABLE {table}"))?;
                }
                nodes::set_init_state(&mut *conn, node_id, InitState::Uninitialized, None)?;
                tables.len() as u64
            }
            ReinitScope::Schema(schema) => {
                let rows = conn.query(
                    "SELECT table_name FROM information_schema.tables WHERE table_schema = $1",
                    &[&schema],
                )?;
                let tables: Vec<Table> = rows
                    .iter()
                    .map(|r| Table {
                        schema: Some(schema.clone()),
                        name: r.get("table_name"),
                    })
                    .collect();
                self.truncate_and_resync(&mut *conn, &sub_name, &tables)?;
                nodes::set_init_state(&mut *conn, node_id, InitState::CatchingUp, Some(source))?;
                tables.len() as u64
            }
            ReinitScope::Tables(tables) => {
                self.truncate_and_resync(&mut *conn, &sub_name, &tables)?;
                nodes::set_init_state(&mut *conn, node_id, InitState::CatchingUp, Some(source))?;
                tables.len() as u64
            }
        };

        audit::record_success(&mut *conn, "init.reinit", "coordinator", "node", node_id.as_str())?;
        Ok(affected)
    }

    fn truncate_and_resync(&self, conn: &mut Client, sub_name: &str, tables: &[Table]) -> anyhow::Result<()> {
        for table in tables {
            conn.simple_query(&format!("TRUNCATE TABLE {table}"))?;
            resync_table(conn, sub_name, table)?;
        }
        Ok(())
    }

    /// `PrepareInit` (two-phase, source side): creates a logical
    /// replication slot at the current LSN and records it durably.
    pub fn prepare_init(&self, node_id: &NodeId, slot_name: &str) -> CoordinatorResult<Lsn> {
        let mut conn = self.target.get()?;
        let slot = Slot::new(slot_name.to_string());
        if slot.exists(&mut *conn)? {
            return Err(PreconditionError::SlotExists(slot_name.to_string()).into());
        }
        let lsn = slot.create_slot_at_lsn(&mut *conn)?;
        init_slots::record(&mut *conn, slot_name, node_id, lsn)?;
        audit::record_success(&mut *conn, "init.prepared", "coordinator", "node", node_id.as_str())?;
        Ok(lsn)
    }

    /// `CompleteInit` (two-phase, target side): optionally verifies
    /// fingerprints, attaches a subscription to the slot `PrepareInit`
    /// reserved with `copy_data = false` and origin tracking disabled,
    /// then waits for catch-up to `source_lsn` before transitioning to
    /// `synchronized`.
    pub fn complete_init(
        &self,
        target: &NodeId,
        source: &NodeId,
        source_lsn: Lsn,
        slot_name: &str,
        schema_sync_mode: SchemaSyncMode,
        source_conn_info: &str,
        skip_schema_check: bool,
    ) -> CoordinatorResult<()> {
        let mut conn = self.target.get()?;

        if !skip_schema_check {
            let source_catalog = Catalog::connect(source_conn_info)
                .map_err(|e| PreconditionError::SourceUnreachable(e.to_string()))?;
            let mut source_conn = source_catalog.get()?;
            let local = fingerprint::get_all(&mut *conn)?;
            let remote = fingerprint::get_all(&mut *source_conn)?;
            let diffs = fingerprint::diff(&local, &remote);
            let mut local_columns = std::collections::HashMap::new();
            for diff in &diffs {
                if let Ok(fp) = fingerprint::capture(&mut *conn, &diff.table_schema, &diff.table_name) {
                    local_columns.insert((diff.table_schema.clone(), diff.table_name.clone()), fp.column_definitions);
                }
            }
            fingerprint::sync(&mut *conn, schema_sync_mode, &diffs, &local_columns)?;
        }

        let sub_name = self.config.naming.subscription_name(target.as_str(), source.as_str());
        let pub_name = self.config.naming.publication_name(source.as_str());
        let subscription = Subscription::new(sub_name, source_conn_info.to_string(), pub_name);
        subscription.create_with_existing_slot(&mut *conn, slot_name, false, false)?;

        nodes::set_init_state(&mut *conn, target, InitState::CatchingUp, Some(source))?;
        drop(conn);

        // Two-phase completion is not yet tied into the operation registry,
        // so this latch never fires; the wait always ends in catch-up.
        let cancel = CancelLatch::new();
        wait_for_catchup(&subscription, &self.target, source_lsn, &cancel, self.config.catchup_poll_interval)?;

        let mut conn = self.target.get()?;
        nodes::set_init_state(&mut *conn, target, InitState::Synchronized, Some(source))?;
        init_slots::delete(&mut *conn, slot_name)?;
        audit::record_success(&mut *conn, "init.completed", "coordinator", "node", target.as_str())?;
        Ok(())
    }
}

/// Polls until caught up or cancelled. Returns `true` on catch-up, `false`
/// if `cancel` fired first — the caller decides what cancellation during
/// this phase means (see Open Question decision #1 in DESIGN.md: a cancel
/// during `catching_up` drops the subscription but leaves already-applied
/// data and `init_state` alone, rather than resetting).
fn wait_for_catchup(
    subscription: &Subscription,
    catalog: &Catalog,
    target_lsn: Lsn,
    cancel: &CancelLatch,
    poll_interval: Duration,
) -> anyhow::Result<bool> {
    loop {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let mut conn = catalog.get()?;
        if subscription.has_caught_up_to(&mut *conn, target_lsn)? {
            return Ok(true);
        }
        drop(conn);
        thread::sleep(poll_interval);
    }
}

/// Forces the apply worker to recopy one table already tracked by a
/// subscription, by resetting its `pg_subscription_rel` state back to
/// `init` (`'i'`) — the same mechanism `ALTER SUBSCRIPTION ... REFRESH
/// PUBLICATION` relies on for newly-added tables, applied here to a table
/// that was already syncing so a partial reinit gets a fresh copy without
/// tearing down the whole subscription.
fn resync_table(conn: &mut Client, sub_name: &str, table: &Table) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE pg_subscription_rel SET srsubstate = 'i', srsublsn = NULL \
         WHERE srrelid = $1::regclass AND srsubid = (SELECT oid FROM pg_subscription WHERE subname = $2)",
        &[&table.to_string(), &sub_name],
    )?;
    Ok(())
}

/// Tables tracked by a subscription's tablesync workers, read from
/// `pg_subscription_rel` while the subscription still exists (the rows
/// disappear along with it on `DROP SUBSCRIPTION`).
fn tables_for_subscription(conn: &mut Client, sub_name: &str) -> anyhow::Result<Vec<Table>> {
    let rows = conn.query(
        "SELECT n.nspname AS schema, c.relname AS name \
         FROM pg_subscription_rel sr \
         JOIN pg_class c ON c.oid = sr.srrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         JOIN pg_subscription s ON s.oid = sr.srsubid \
         WHERE s.subname = $1",
        &[&sub_name],
    )?;
    Ok(rows
        .iter()
        .map(|r| Table {
            schema: Some(r.get("schema")),
            name: r.get("name"),
        })
        .collect())
}

#[allow(clippy::too_many_arguments)]
fn run_automatic_snapshot(
    handle: &Arc<Operation>,
    target: &NodeId,
    source: &NodeId,
    tables: &[Table],
    source_catalog: &Catalog,
    source_conn_info: &str,
    target_catalog: &Catalog,
    target_conn_info: &str,
    config: &CoordinatorConfig,
    worker_count: usize,
) -> anyhow::Result<()> {
    let naming = &config.naming;
    let pub_name = naming.publication_name(source.as_str());
    let slot_name = naming.init_slot_name(source.as_str());
    let sub_name = naming.subscription_name(target.as_str(), source.as_str());

    let mut source_conn = source_catalog.get()?;
    Publication::new(pub_name.clone(), tables.to_vec()).create_if_absent(&mut *source_conn)?;

    // The slot is reserved before the copier runs so every write landing
    // during the copy is captured and replayed during catch-up rather than
    // silently missed.
    let slot = Slot::new(slot_name.clone());
    let lsn: Lsn = slot.create_slot_at_lsn(&mut *source_conn)?;
    init_slots::record(&mut *target_catalog.get()?, &slot_name, target, lsn)?;

    {
        let mut target_conn = target_catalog.get()?;
        nodes::set_init_state(&mut *target_conn, target, InitState::Copying, Some(source))?;
    }
    handle.set_phase(InitState::Copying);

    let jobs = build_copy_jobs(&mut *source_conn, tables)?;
    drop(source_conn);

    let pool = copier::build_pool(worker_count)?;
    // `copy_chunk_rows` bounds how often cancellation is observed; the
    // copier chunks by bytes, so this is a rough rows-to-bytes conversion
    // rather than an exact row count.
    let chunk_bytes = config.copy_chunk_rows.saturating_mul(256).max(64 * 1024);

    let source_conn_str = source_conn_info.to_string();
    let target_conn_str = target_conn_info.to_string();
    let connect = move || -> anyhow::Result<(Client, Client)> {
        let source = Client::connect(&source_conn_str, NoTls)?;
        let target = Client::connect(&target_conn_str, NoTls)?;
        Ok((source, target))
    };

    let total_tables = jobs.len().max(1);
    let completed = Arc::new(AtomicUsize::new(0));
    let progress_catalog = target_catalog.clone();
    let progress_target = target.clone();
    let on_progress = move |outcome: &copier::CopyOutcome| {
        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut conn) = progress_catalog.get() {
            let current_table = outcome.table.to_string();
            let _ = progress::advance(
                &mut *conn,
                &progress_target,
                &progress::Advance {
                    phase: InitState::Copying,
                    overall_percent: 100.0 * done as f32 / total_tables as f32,
                    tables_completed: done as i32,
                    current_table: Some(current_table.as_str()),
                    current_table_percent: 100.0,
                    rows_copied: outcome.rows_copied,
                    bytes_copied: outcome.bytes_copied,
                    throughput_rows_sec: 0.0,
                    eta_seconds: None,
                },
            );
        }
    };

    copier::copy_all(&pool, jobs, chunk_bytes, &handle.cancel, connect, &on_progress)?;

    {
        let mut target_conn = target_catalog.get()?;
        nodes::set_init_state(&mut *target_conn, target, InitState::CatchingUp, Some(source))?;
    }
    handle.set_phase(InitState::CatchingUp);

    let subscription = Subscription::new(sub_name, source_conn_info.to_string(), pub_name);
    {
        let mut target_conn = target_catalog.get()?;
        subscription.create_with_existing_slot(&mut *target_conn, &slot_name, false, true)?;
    }

    let caught_up = wait_for_catchup(&subscription, target_catalog, lsn, &handle.cancel, config.catchup_poll_interval)?;
    if !caught_up {
        // Decision #1 (DESIGN.md): cancelling during catching_up drops the
        // subscription this run created but leaves init_state and already-
        // applied data alone rather than resetting to uninitialized.
        let mut target_conn = target_catalog.get()?;
        subscription.drop(&mut *target_conn)?;
        init_slots::delete(&mut *target_conn, &slot_name)?;
        audit::record_success(
            &mut *target_conn,
            "init.cancelled",
            "coordinator",
            "node",
            target.as_str(),
        )?;
        return Ok(());
    }

    let mut target_conn = target_catalog.get()?;
    nodes::set_init_state(&mut *target_conn, target, InitState::Synchronized, Some(source))?;
    progress::advance(
        &mut *target_conn,
        target,
        &progress::Advance {
            phase: InitState::Synchronized,
            overall_percent: 100.0,
            tables_completed: total_tables as i32,
            current_table: None,
            current_table_percent: 100.0,
            rows_copied: 0,
            bytes_copied: 0,
            throughput_rows_sec: 0.0,
            eta_seconds: Some(0),
        },
    )?;
    init_slots::delete(&mut *target_conn, &slot_name)?;
    audit::record_success(&mut *target_conn, "init.completed", "coordinator", "node", target.as_str())?;
    handle.set_phase(InitState::Synchronized);

    Ok(())
}

fn build_copy_jobs<C: postgres::GenericClient>(client: &mut C, tables: &[Table]) -> anyhow::Result<Vec<copier::CopyJob>> {
    let mut jobs = Vec::with_capacity(tables.len());
    for table in tables {
        let columns = table.get_columns(client)?;
        let size_row = client.query_one(&format!("SELECT pg_total_relation_size('{table}'::regclass)"), &[])?;
        let size_bytes: i64 = size_row.get(0);
        jobs.push(copier::CopyJob {
            table: table.clone(),
            columns,
            size_bytes,
        });
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinit_scope_tables_carries_the_table_list() {
        let scope = ReinitScope::Tables(vec![Table::new("public.orders")]);
        match scope {
            ReinitScope::Tables(tables) => assert_eq!(tables.len(), 1),
            _ => panic!("expected Tables variant"),
        }
    }
}
