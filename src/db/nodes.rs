//! `steep_repl.nodes` — cluster node registration and status.
//!
//! Column set taken verbatim from the extension's table definition. Note
//! `status` has five values (`unknown, healthy, degraded, unreachable,
//! offline`), richer than the coordinator's own simplified
//! `{healthy, degraded, down}`; the coordinator maps `down` to
//! `unreachable`/`offline` at its own boundary (see `NodeStatus`).

use chrono::{DateTime, Utc};
use postgres::GenericClient;

use crate::state_machine::InitState;
use crate::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
    Offline,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Healthy => "healthy",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Unreachable => "unreachable",
            NodeStatus::Offline => "offline",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "unknown" => NodeStatus::Unknown,
            "healthy" => NodeStatus::Healthy,
            "degraded" => NodeStatus::Degraded,
            "unreachable" => NodeStatus::Unreachable,
            "offline" => NodeStatus::Offline,
            other => anyhow::bail!("unknown node status: {other}"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: NodeId,
    pub node_name: String,
    pub host: String,
    pub port: i32,
    pub priority: i32,
    pub is_coordinator: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: NodeStatus,
    pub init_state: InitState,
    pub init_source_node: Option<NodeId>,
    pub init_started_at: Option<DateTime<Utc>>,
    pub init_completed_at: Option<DateTime<Utc>>,
}

impl Node {
    fn from_row(row: &postgres::Row) -> anyhow::Result<Self> {
        let status: String = row.get("status");
        let init_state: String = row.get("init_state");
        Ok(Node {
            node_id: NodeId::from(row.get::<_, String>("node_id")),
            node_name: row.get("node_name"),
            host: row.get("host"),
            port: row.get("port"),
            priority: row.get("priority"),
            is_coordinator: row.get("is_coordinator"),
            last_seen: row.get("last_seen"),
            status: NodeStatus::from_str(&status)?,
            init_state: init_state.parse().map_err(|e: crate::error::ValidationError| {
                anyhow::anyhow!(e.to_string())
            })?,
            init_source_node: row
                .get::<_, Option<String>>("init_source_node")
                .map(NodeId::from),
            init_started_at: row.get("init_started_at"),
            init_completed_at: row.get("init_completed_at"),
        })
    }
}

/// `RegisterNode(node_id, node_name, host, port(1..65535), priority(1..100))`.
/// Validation (port/priority range, non-empty host) is enforced by the
/// table's own CHECK constraints; a constraint violation surfaces as a
/// `postgres::Error` the caller converts to `ValidationError` at the RPC
/// boundary.
pub fn register_node<C: GenericClient>(
    client: &mut C,
    node_id: &NodeId,
    node_name: &str,
    host: &str,
    port: i32,
    priority: i32,
) -> anyhow::Result<()> {
    client.execute(
        "INSERT INTO steep_repl.nodes (node_id, node_name, host, port, priority) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (node_id) DO UPDATE SET \
           node_name = EXCLUDED.node_name, host = EXCLUDED.host, \
           port = EXCLUDED.port, priority = EXCLUDED.priority",
        &[&node_id.as_str(), &node_name, &host, &port, &priority],
    )?;
    Ok(())
}

/// `GetNodes() -> ordered by priority desc`.
pub fn get_nodes<C: GenericClient>(client: &mut C) -> anyhow::Result<Vec<Node>> {
    let rows = client.query(
        "SELECT * FROM steep_repl.nodes ORDER BY priority DESC, node_id ASC",
        &[],
    )?;
    rows.iter().map(Node::from_row).collect()
}

pub fn get_node<C: GenericClient>(client: &mut C, node_id: &NodeId) -> anyhow::Result<Option<Node>> {
    let rows = client.query(
        "SELECT * FROM steep_repl.nodes WHERE node_id = $1",
        &[&node_id.as_str()],
    )?;
    rows.first().map(Node::from_row).transpose()
}

pub fn heartbeat<C: GenericClient>(client: &mut C, node_id: &NodeId) -> anyhow::Result<()> {
    client.execute(
        "UPDATE steep_repl.nodes SET last_seen = now(), status = 'healthy' WHERE node_id = $1",
        &[&node_id.as_str()],
    )?;
    Ok(())
}

pub fn set_status<C: GenericClient>(
    client: &mut C,
    node_id: &NodeId,
    status: NodeStatus,
) -> anyhow::Result<()> {
    client.execute(
        "UPDATE steep_repl.nodes SET status = $1 WHERE node_id = $2",
        &[&status.as_str(), &node_id.as_str()],
    )?;
    Ok(())
}

/// Advances `init_state` and, where applicable, the source/timestamp
/// columns. Called only after `InitState::apply` has validated the
/// transition in memory; this is the durable mirror of that decision.
pub fn set_init_state<C: GenericClient>(
    client: &mut C,
    node_id: &NodeId,
    state: InitState,
    init_source_node: Option<&NodeId>,
) -> anyhow::Result<()> {
    match state {
        InitState::Preparing => {
            client.execute(
                "UPDATE steep_repl.nodes SET init_state = $1, init_source_node = $2, \
                 init_started_at = COALESCE(init_started_at, now()) WHERE node_id = $3",
                &[
                    &state.to_string(),
                    &init_source_node.map(|n| n.as_str()),
                    &node_id.as_str(),
                ],
            )?;
        }
        InitState::Synchronized => {
            client.execute(
                "UPDATE steep_repl.nodes SET init_state = $1, init_completed_at = now() \
                 WHERE node_id = $2",
                &[&state.to_string(), &node_id.as_str()],
            )?;
        }
        InitState::Uninitialized => {
            client.execute(
                "UPDATE steep_repl.nodes SET init_state = $1, init_source_node = NULL, \
                 init_started_at = NULL, init_completed_at = NULL WHERE node_id = $2",
                &[&state.to_string(), &node_id.as_str()],
            )?;
        }
        _ => {
            client.execute(
                "UPDATE steep_repl.nodes SET init_state = $1 WHERE node_id = $2",
                &[&state.to_string(), &node_id.as_str()],
            )?;
        }
    }
    Ok(())
}

/// Boot-time reconciliation: any operation
/// whose `init_state` is non-terminal at boot is marked `failed` if no live
/// operation exists for it in the (freshly-constructed, necessarily empty)
/// in-memory registry.
pub fn fail_all_non_terminal_on_boot<C: GenericClient>(client: &mut C) -> anyhow::Result<u64> {
    let rows_affected = client.execute(
        "UPDATE steep_repl.nodes SET init_state = 'failed' \
         WHERE init_state NOT IN ('uninitialized', 'synchronized', 'failed')",
        &[],
    )?;
    Ok(rows_affected)
}
