// Slot management for logical replication

#[derive(Clone)]
pub struct Slot {
    pub name: String,
    pub plugin: String,
}

impl Slot {
    pub fn new(name: String) -> Self {
        Slot {
            name,
            plugin: "wal2json".to_string(),
        }
    }

    pub fn create_slot<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<()> {
        let create_slot_statement = format!(
            "SELECT pg_create_logical_replication_slot('{}', '{}')",
            self.name, self.plugin
        );
        client.simple_query(&create_slot_statement)?;
        Ok(())
    }

    /// Creates the slot and returns the LSN it was created at, for the
    /// prepare/reserve phases of two-phase snapshot and manual-init flows.
    pub fn create_slot_at_lsn<C: postgres::GenericClient>(
        &self,
        client: &mut C,
    ) -> anyhow::Result<super::message::Lsn> {
        let row = client.query_one(
            "SELECT lsn FROM pg_create_logical_replication_slot($1, $2)",
            &[&self.name, &self.plugin],
        )?;
        let pg_lsn: postgres::types::PgLsn = row.get(0);
        super::message::Lsn::from_pg_string(&pg_lsn.to_string()).ok_or_else(|| {
            anyhow::anyhow!("failed to parse LSN returned by slot creation: {}", pg_lsn)
        })
    }

    pub fn exists<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<bool> {
        let row = client.query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
            &[&self.name],
        )?;
        Ok(row.get(0))
    }

    pub fn drop_slot<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<()> {
        let drop_slot_statement = format!("SELECT pg_drop_replication_slot('{}')", self.name);
        client.simple_query(&drop_slot_statement)?;
        Ok(())
    }

    pub fn get_changes<C: postgres::GenericClient>(
        &self,
        client: &mut C,
        upto_n_changes: i64,
    ) -> anyhow::Result<Vec<postgres::Row>> {
        let get_changes_statement = format!(
            "SELECT * FROM pg_logical_slot_get_changes('{}', NULL, {})",
            self.name, upto_n_changes
        );
        let rows = client.query(&get_changes_statement, &[])?;
        Ok(rows)
    }

    /// Fetch the confirmed_flush_lsn for this slot from the database.
    pub fn confirmed_flush_lsn(
        &self,
        client: &mut postgres::Client,
    ) -> anyhow::Result<crate::logical_replication::message::Lsn> {
        let row = client.query_one(
            &format!(
                "SELECT confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = '{}'",
                self.name
            ),
            &[],
        )?;
        let pg_lsn: postgres::types::PgLsn = row.get(0);
        let lsn_str = pg_lsn.to_string();
        crate::logical_replication::message::Lsn::from_pg_string(&lsn_str)
            .ok_or_else(|| anyhow::anyhow!("Failed to parse confirmed_flush_lsn: {}", lsn_str))
    }
}
