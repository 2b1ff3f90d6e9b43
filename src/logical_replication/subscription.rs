// Subscription management for logical replication.
//
// Exclusive per target (`steep_sub_{target_node_id}_from_{source_node_id}`),
// dropped on full reinit or on cancel of the operation that created it.

use super::message::Lsn;

#[derive(Clone)]
pub struct Subscription {
    pub name: String,
    pub connection_info: String,
    pub publication_name: String,
}

impl Subscription {
    pub fn new(name: String, connection_info: String, publication_name: String) -> Self {
        Subscription {
            name,
            connection_info,
            publication_name,
        }
    }

    pub fn exists<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<bool> {
        let row = client.query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_subscription WHERE subname = $1)",
            &[&self.name],
        )?;
        Ok(row.get(0))
    }

    /// Automatic-method creation: copies existing table data then streams.
    pub fn create<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<()> {
        self.create_with_options(client, true, true, None)
    }

    /// Two-phase completion: data was already loaded externally
    /// (`copy_data = false`), and replication origin tracking is disabled
    /// to prevent feedback loops between bidirectionally-replicating nodes.
    pub fn create_for_complete_init<C: postgres::GenericClient>(
        &self,
        client: &mut C,
    ) -> anyhow::Result<()> {
        self.create_with_options(client, false, false, None)
    }

    /// Attaches to a replication slot the caller already created (via
    /// `Slot::create_slot_at_lsn`) instead of letting `CREATE SUBSCRIPTION`
    /// make its own. Used by automatic-snapshot init, where the slot is
    /// reserved before the parallel copier runs so no write landing during
    /// the copy is missed, and by two-phase completion against the slot
    /// `PrepareInit` recorded.
    pub fn create_with_existing_slot<C: postgres::GenericClient>(
        &self,
        client: &mut C,
        slot_name: &str,
        copy_data: bool,
        origin_tracking: bool,
    ) -> anyhow::Result<()> {
        self.create_with_options(client, copy_data, origin_tracking, Some(slot_name))
    }

    fn create_with_options<C: postgres::GenericClient>(
        &self,
        client: &mut C,
        copy_data: bool,
        origin_tracking: bool,
        existing_slot: Option<&str>,
    ) -> anyhow::Result<()> {
        let origin = if origin_tracking { "any" } else { "none" };
        let mut options = vec![format!("copy_data = {copy_data}"), format!("origin = {origin}")];
        match existing_slot {
            Some(name) => {
                options.push("create_slot = false".to_string());
                options.push(format!("slot_name = '{name}'"));
            }
            None => options.push("create_slot = true".to_string()),
        }
        let sql = format!(
            "CREATE SUBSCRIPTION {} CONNECTION '{}' PUBLICATION {} WITH ({})",
            self.name,
            self.connection_info,
            self.publication_name,
            options.join(", ")
        );
        client.simple_query(&sql)?;
        Ok(())
    }

    pub fn drop<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<()> {
        let sql = format!("DROP SUBSCRIPTION IF EXISTS {}", self.name);
        client.simple_query(&sql)?;
        Ok(())
    }

    /// The subscription's last-applied LSN, read from `pg_stat_subscription`.
    /// Used to wait for catch-up in `CompleteInit` without consuming the
    /// replication stream directly.
    pub fn applied_lsn<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<Option<Lsn>> {
        let rows = client.query(
            "SELECT latest_end_lsn FROM pg_stat_subscription \
             WHERE subname = $1 AND latest_end_lsn IS NOT NULL",
            &[&self.name],
        )?;
        match rows.into_iter().next() {
            Some(row) => {
                let pg_lsn: postgres::types::PgLsn = row.get(0);
                Ok(Lsn::from_pg_string(&pg_lsn.to_string()))
            }
            None => Ok(None),
        }
    }

    /// True once `applied_lsn >= target`, the condition `CompleteInit` waits
    /// on before transitioning `catching_up -> synchronized`.
    pub fn has_caught_up_to<C: postgres::GenericClient>(
        &self,
        client: &mut C,
        target: Lsn,
    ) -> anyhow::Result<bool> {
        Ok(self.applied_lsn(client)?.is_some_and(|lsn| lsn >= target))
    }
}
