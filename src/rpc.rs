//! Control-plane surface: one `Coordinator` method per unary RPC returning
//! `CoordinatorResult<T>`, one per streaming RPC returning
//! `std::sync::mpsc::Receiver<Update>`. A `Coordinator` manages exactly one
//! local PostgreSQL node — cross-node calls (`StartInit`'s source,
//! `CompleteInit`'s source, merge's peer) take an explicit libpq connection
//! string the same way `InitManager::start_init` already does, rather than
//! this crate owning a directory of every cluster member's credentials.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use postgres::{Client, NoTls};
use sha2::{Digest, Sha256};

use crate::conflict::{self, MergeInput, MergeOutcome, MergeTarget, ResolutionStrategy};
use crate::config::CoordinatorConfig;
use crate::copier;
use crate::db::{nodes, snapshots, Catalog};
use crate::error::{CoordinatorError, CoordinatorResult, PreconditionError, ValidationError};
use crate::fingerprint::{self, SchemaFingerprint};
use crate::fk;
use crate::init_manager::{InitManager, ReinitScope, StartInitOptions};
use crate::logical_replication::Lsn;
use crate::operation::{CancelLatch, InitMethod};
use crate::progress;
use crate::snapshot::{self, ApplyProgress, ApplySnapshotInput, GenerateProgress, GenerateSnapshotInput};
use crate::table::Table;
use crate::{audit, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Serving,
    NotServing,
}

/// `HealthCheck() -> {status, components{postgresql, grpc, ipc}}`. `grpc`
/// and `ipc` report the transport layers this crate does not itself own
/// (the daemon's job, per `lib.rs`'s module doc); they read `true` here
/// since reaching this code at all means both are up.
#[derive(Debug, Clone, Copy)]
pub struct HealthStatus {
    pub status: ServingStatus,
    pub postgresql: bool,
    pub grpc: bool,
    pub ipc: bool,
}

/// One node's progress row, as emitted by `StreamSnapshotProgress` — named
/// distinctly from `progress::ProgressRow` because the stream also carries
/// the node id the row belongs to.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub node_id: NodeId,
    pub row: progress::ProgressRow,
}

/// `ExecuteMerge`'s inputs. Modeled here on `StartInit`'s shape — an
/// explicit peer connection string, since the local node is always one
/// side of a merge.
pub struct ExecuteMergeInput {
    pub merge_id: String,
    pub peer_conn_info: String,
    pub strategy: ResolutionStrategy,
    pub dry_run: bool,
    pub tables: Vec<Table>,
}

/// Manages one local PostgreSQL node's init/reinit/merge/snapshot surface.
/// Wraps an `InitManager` for the state-machine RPCs and adds the
/// node-registry, schema-fingerprint, snapshot, and merge RPCs alongside it.
pub struct Coordinator {
    init_manager: InitManager,
    local: Catalog,
    local_conn_info: String,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(local_conn_info: String, config: CoordinatorConfig) -> anyhow::Result<Self> {
        let local = Catalog::connect(&local_conn_info)?;
        let init_manager = InitManager::new(local_conn_info.clone(), config.clone())?;
        Ok(Self {
            init_manager,
            local,
            local_conn_info,
            config,
        })
    }

    pub fn init_manager(&self) -> &InitManager {
        &self.init_manager
    }

    /// Boot-time reconciliation; see `InitManager::reconcile_on_boot`.
    pub fn reconcile_on_boot(&self) -> CoordinatorResult<u64> {
        self.init_manager.reconcile_on_boot()
    }

    // --- Cluster membership -------------------------------------------

    /// `RegisterNode(node_id, node_name, host, port(1..65535), priority(1..100))`.
    /// Range validation happens here, ahead of the table's own CHECK
    /// constraints, so a malformed request is rejected as a
    /// `ValidationError` rather than a generic constraint-violation string.
    pub fn register_node(
        &self,
        node_id: &NodeId,
        node_name: &str,
        host: &str,
        port: i32,
        priority: i32,
    ) -> CoordinatorResult<()> {
        if !(1..=65535).contains(&port) {
            return Err(ValidationError::Other(format!("port {port} out of range 1..65535")).into());
        }
        if !(1..=100).contains(&priority) {
            return Err(ValidationError::Other(format!("priority {priority} out of range 1..100")).into());
        }
        if host.trim().is_empty() {
            return Err(ValidationError::Other("host must not be empty".to_string()).into());
        }
        let mut conn = self.local.get()?;
        nodes::register_node(&mut *conn, node_id, node_name, host, port, priority)?;
        audit::record_success(&mut *conn, "node.registered", "coordinator", "node", node_id.as_str())?;
        Ok(())
    }

    /// `GetNodes() -> ordered by priority desc`.
    pub fn get_nodes(&self) -> CoordinatorResult<Vec<nodes::Node>> {
        let mut conn = self.local.get()?;
        Ok(nodes::get_nodes(&mut *conn)?)
    }

    pub fn heartbeat(&self, node_id: &NodeId) -> CoordinatorResult<()> {
        let mut conn = self.local.get()?;
        Ok(nodes::heartbeat(&mut *conn, node_id)?)
    }

    pub fn health_check(&self) -> HealthStatus {
        let postgresql = self.local.get().is_ok();
        HealthStatus {
            status: if postgresql {
                ServingStatus::Serving
            } else {
                ServingStatus::NotServing
            },
            postgresql,
            grpc: true,
            ipc: true,
        }
    }

    // --- Init / reinit / two-phase, delegated to InitManager -----------

    pub fn start_init(
        &self,
        target: NodeId,
        source: NodeId,
        method: InitMethod,
        options: StartInitOptions,
        source_conn_info: &str,
    ) -> CoordinatorResult<()> {
        self.init_manager.start_init(target, source, method, options, source_conn_info)
    }

    pub fn cancel_init(&self, node_id: &NodeId) -> CoordinatorResult<()> {
        self.init_manager.cancel_init(node_id)
    }

    pub fn get_progress(&self, node_id: &NodeId) -> CoordinatorResult<Option<progress::ProgressRow>> {
        self.init_manager.get_progress(node_id)
    }

    pub fn start_reinit(&self, node_id: &NodeId, source: &NodeId, scope: ReinitScope) -> CoordinatorResult<u64> {
        self.init_manager.start_reinit(node_id, source, scope)
    }

    pub fn prepare_init(&self, node_id: &NodeId, slot_name: &str) -> CoordinatorResult<Lsn> {
        self.init_manager.prepare_init(node_id, slot_name)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_init(
        &self,
        target: &NodeId,
        source: &NodeId,
        source_lsn: Lsn,
        slot_name: &str,
        schema_sync_mode: fingerprint::SchemaSyncMode,
        source_conn_info: &str,
        skip_schema_check: bool,
    ) -> CoordinatorResult<()> {
        self.init_manager.complete_init(
            target,
            source,
            source_lsn,
            slot_name,
            schema_sync_mode,
            source_conn_info,
            skip_schema_check,
        )
    }

    // --- Schema fingerprints --------------------------------------------

    /// `GetSchemaFingerprints() -> [{schema, table, fingerprint, column_definitions}]`.
    pub fn get_schema_fingerprints(&self) -> CoordinatorResult<Vec<SchemaFingerprint>> {
        let mut conn = self.local.get()?;
        Ok(fingerprint::get_all(&mut *conn)?)
    }

    // --- Snapshots -------------------------------------------------------

    /// `GetSnapshotProgress(snapshot_id) -> {has_progress, progress?}`.
    pub fn get_snapshot_progress(&self, snapshot_id: &str) -> CoordinatorResult<Option<snapshots::SnapshotProgressRow>> {
        let mut conn = self.local.get()?;
        Ok(snapshots::get_progress(&mut *conn, snapshot_id)?)
    }

    /// `GenerateSnapshot(source_node_id, output_path, parallel_workers,
    /// compression) -> stream of SnapshotProgress`. Runs on a detached
    /// worker thread, per the same "synchronous preflight, async body"
    /// split `StartInit` uses; here the preflight is just the initial
    /// `snapshots` row insert, so a caller who never reads the channel
    /// still sees `snapshot_record.status = creating` recorded.
    pub fn generate_snapshot(
        &self,
        input: GenerateSnapshotInput,
    ) -> CoordinatorResult<mpsc::Receiver<GenerateProgress>> {
        let mut conn = self.local.get()?;
        snapshots::insert_creating(
            &mut *conn,
            &snapshots::NewSnapshot {
                snapshot_id: &input.snapshot_id,
                source_node_id: &NodeId::from(input.source_node_id.clone()),
                lsn: "",
                storage_path: &input.output_path.to_string_lossy(),
                compression: input.compression,
            },
        )?;
        drop(conn);

        let (tx, rx) = mpsc::channel();
        let local = self.local.clone();
        let conn_info = self.local_conn_info.clone();
        let snapshot_id = input.snapshot_id.clone();
        let worker_count = self.config.clamp_workers(input.parallel_workers as i64);
        let config = self.config.clone();
        let mut input = input;
        input.parallel_workers = worker_count;

        thread::spawn(move || {
            let outcome = (|| -> anyhow::Result<()> {
                let pool = copier::build_pool(input.parallel_workers.max(1))?;
                let cancel = CancelLatch::new();
                let mut source = Client::connect(&conn_info, NoTls)?;
                let connect_conn_info = conn_info.clone();
                let connect = move || -> anyhow::Result<Client> { Ok(Client::connect(&connect_conn_info, NoTls)?) };

                let progress_local = local.clone();
                let progress_snapshot_id = snapshot_id.clone();
                let tx_progress = tx.clone();
                let on_progress = move |update: GenerateProgress| {
                    if let Ok(mut c) = progress_local.get() {
                        let _ = snapshots::upsert_progress(
                            &mut *c,
                            &progress_snapshot_id,
                            &update.phase,
                            update.current_table.as_deref(),
                            update.overall_percent,
                            update.error.as_deref(),
                        );
                    }
                    let _ = tx_progress.send(update);
                };

                let manifest =
                    snapshot::generate(&mut source, &input, &config.naming, &pool, &cancel, connect, &on_progress)?;
                let checksum_digest = aggregate_checksum(manifest.tables.iter().map(|t| t.checksum.as_str()));
                let mut c = local.get()?;
                snapshots::mark_complete(
                    &mut *c,
                    &snapshot_id,
                    manifest.tables.len() as i32,
                    manifest.total_size_bytes,
                    &checksum_digest,
                )?;
                Ok(())
            })();

            if let Err(err) = outcome {
                if let Ok(mut c) = local.get() {
                    let _ = snapshots::mark_failed(&mut *c, &snapshot_id);
                    let _ = snapshots::upsert_progress(&mut *c, &snapshot_id, "failed", None, 100.0, Some(&err.to_string()));
                }
            }
        });

        Ok(rx)
    }

    /// `ApplySnapshot(target_node_id, input_path, parallel_workers,
    /// verify_checksums) -> stream of SnapshotProgress`.
    pub fn apply_snapshot(&self, input: ApplySnapshotInput) -> CoordinatorResult<mpsc::Receiver<ApplyProgress>> {
        let (tx, rx) = mpsc::channel();
        let conn_info = self.local_conn_info.clone();
        let mut input = input;
        input.parallel_workers = self.config.clamp_workers(input.parallel_workers as i64);

        thread::spawn(move || {
            let outcome = (|| -> anyhow::Result<()> {
                let pool = copier::build_pool(input.parallel_workers.max(1))?;
                let mut target = Client::connect(&conn_info, NoTls)?;
                let connect_conn_info = conn_info.clone();
                let connect = move || -> anyhow::Result<Client> { Ok(Client::connect(&connect_conn_info, NoTls)?) };

                let tx_progress = tx.clone();
                let on_progress = move |update: ApplyProgress| {
                    let _ = tx_progress.send(update);
                };

                snapshot::apply(&mut target, &input, &pool, connect, &on_progress)
            })();

            if let Err(err) = outcome {
                let _ = tx.send(ApplyProgress {
                    phase: "failed".to_string(),
                    current_table: None,
                    overall_percent: 100.0,
                    error: Some(err.to_string()),
                });
            }
        });

        Ok(rx)
    }

    /// `StreamSnapshotProgress(interval_ms, include_completed) -> stream of
    /// ProgressUpdate`. Polls the durable `init_progress` store for every
    /// known node on `interval` — the same polling idiom `wait_for_catchup`
    /// uses for subscription catch-up — rather than pushing updates from
    /// inside every writer.
    pub fn stream_snapshot_progress(&self, interval: Duration, include_completed: bool) -> mpsc::Receiver<ProgressUpdate> {
        let (tx, rx) = mpsc::channel();
        let local = self.local.clone();

        thread::spawn(move || loop {
            let snapshot: anyhow::Result<Vec<ProgressUpdate>> = (|| {
                let mut conn = local.get()?;
                let known = nodes::get_nodes(&mut *conn)?;
                let mut updates = Vec::with_capacity(known.len());
                for node in known {
                    if let Some(row) = progress::get(&mut *conn, &node.node_id)? {
                        if include_completed || !row.phase.is_terminal() {
                            updates.push(ProgressUpdate {
                                node_id: node.node_id.clone(),
                                row,
                            });
                        }
                    }
                }
                Ok(updates)
            })();

            let Ok(updates) = snapshot else {
                thread::sleep(interval);
                continue;
            };
            for update in updates {
                if tx.send(update).is_err() {
                    return;
                }
            }
            thread::sleep(interval);
        });

        rx
    }

    // --- Merge ------------------------------------------------------------

    /// Runs a bidirectional merge between this node (node A) and
    /// `input.peer_conn_info` (node B): extracts FK dependencies over
    /// `input.tables`, topologically sorts them so parents precede
    /// children, resolves each table's primary key, then hands the ordered
    /// set to `conflict::execute`.
    pub fn execute_merge(&self, input: ExecuteMergeInput) -> CoordinatorResult<MergeOutcome> {
        let mut node_a = Client::connect(&self.local_conn_info, NoTls)?;
        let mut node_b = Client::connect(&input.peer_conn_info, NoTls)
            .map_err(|e| PreconditionError::SourceUnreachable(e.to_string()))?;

        let deps = fk::extract_dependencies(&mut node_a, &input.tables)?;
        let ordered = fk::topological_sort(&input.tables, &deps)?;

        let mut targets = Vec::with_capacity(ordered.len());
        for table in ordered {
            let pk_columns = table
                .get_primary_key_info(&mut node_a)?
                .into_iter()
                .map(|pk| pk.name)
                .collect::<Vec<_>>();
            targets.push(MergeTarget { table, pk_columns });
        }

        let merge_input = MergeInput {
            merge_id: &input.merge_id,
            strategy: input.strategy,
            dry_run: input.dry_run,
            tables: &targets,
        };
        let outcome = conflict::execute(&mut node_a, &mut node_b, &merge_input)?;

        let mut conn = self.local.get()?;
        audit::record_success(&mut *conn, "merge.executed", "coordinator", "merge", &input.merge_id)?;
        Ok(outcome)
    }
}

/// A single manifest-level checksum over every table's per-file SHA-256,
/// recorded in `snapshots.checksum` (the extension's table predates the
/// two-phase snapshot feature and stores one digest per row, not one per
/// table — `manifest.json` already carries the per-table detail).
fn aggregate_checksum<'a>(table_checksums: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    let mut sorted: Vec<&str> = table_checksums.collect();
    sorted.sort_unstable();
    for checksum in sorted {
        hasher.update(checksum.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_checksum_is_order_independent() {
        let a = aggregate_checksum(vec!["bb", "aa"].into_iter());
        let b = aggregate_checksum(vec!["aa", "bb"].into_iter());
        assert_eq!(a, b);
    }

    #[test]
    fn aggregate_checksum_changes_with_content() {
        let a = aggregate_checksum(vec!["aa"].into_iter());
        let b = aggregate_checksum(vec!["bb"].into_iter());
        assert_ne!(a, b);
    }
}
