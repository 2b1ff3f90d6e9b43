//! `steep_repl.init_slots` — replication slots reserved for the manual
//! (two-phase) initialization workflow. Persists until completion or
//! explicit drop.

use chrono::{DateTime, Utc};
use postgres::GenericClient;

use crate::logical_replication::Lsn;
use crate::NodeId;

#[derive(Debug, Clone)]
pub struct InitSlot {
    pub slot_name: String,
    pub node_id: NodeId,
    pub lsn: Lsn,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub used_by_node: Option<NodeId>,
    pub used_at: Option<DateTime<Utc>>,
}

pub fn record<C: GenericClient>(
    client: &mut C,
    slot_name: &str,
    node_id: &NodeId,
    lsn: Lsn,
) -> anyhow::Result<()> {
    client.execute(
        "INSERT INTO steep_repl.init_slots (slot_name, node_id, lsn) VALUES ($1, $2, $3)",
        &[&slot_name, &node_id.as_str(), &lsn.to_pg_string()],
    )?;
    Ok(())
}

pub fn get<C: GenericClient>(client: &mut C, slot_name: &str) -> anyhow::Result<Option<InitSlot>> {
    let rows = client.query(
        "SELECT slot_name, node_id, lsn, created_at, expires_at, used_by_node, used_at \
         FROM steep_repl.init_slots WHERE slot_name = $1",
        &[&slot_name],
    )?;
    rows.into_iter()
        .next()
        .map(|row| {
            let lsn_str: String = row.get("lsn");
            Ok(InitSlot {
                slot_name: row.get("slot_name"),
                node_id: NodeId::from(row.get::<_, String>("node_id")),
                lsn: Lsn::from_pg_string(&lsn_str)
                    .ok_or_else(|| anyhow::anyhow!("invalid stored lsn: {lsn_str}"))?,
                created_at: row.get("created_at"),
                expires_at: row.get("expires_at"),
                used_by_node: row
                    .get::<_, Option<String>>("used_by_node")
                    .map(NodeId::from),
                used_at: row.get("used_at"),
            })
        })
        .transpose()
}

pub fn mark_used<C: GenericClient>(
    client: &mut C,
    slot_name: &str,
    used_by: &NodeId,
) -> anyhow::Result<()> {
    client.execute(
        "UPDATE steep_repl.init_slots SET used_by_node = $1, used_at = now() WHERE slot_name = $2",
        &[&used_by.as_str(), &slot_name],
    )?;
    Ok(())
}

pub fn delete<C: GenericClient>(client: &mut C, slot_name: &str) -> anyhow::Result<()> {
    client.execute(
        "DELETE FROM steep_repl.init_slots WHERE slot_name = $1",
        &[&slot_name],
    )?;
    Ok(())
}
