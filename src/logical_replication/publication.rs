// Publication management for logical replication

use crate::table::Table;

/// A named publication covering one or more tables. Publications
/// (`steep_pub_{source_node_id}`) are shared and idempotent: the
/// coordinator creates-if-absent and does not drop them on cancel.
#[derive(Clone)]
pub struct Publication {
    pub name: String,
    pub tables: Vec<Table>,
}

impl Publication {
    pub fn new(name: String, tables: Vec<Table>) -> Self {
        Publication { name, tables }
    }

    pub fn exists<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<bool> {
        let row = client.query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
            &[&self.name],
        )?;
        Ok(row.get(0))
    }

    /// Sets `REPLICA IDENTITY FULL` on every table (required so row-hash-
    /// based overlap comparisons and updates/deletes replicate correctly
    /// without a declared unique index) and creates the publication.
    pub fn create<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<()> {
        for table in &self.tables {
            let identity_sql = format!("ALTER TABLE {table} REPLICA IDENTITY FULL");
            client.simple_query(&identity_sql)?;
        }
        let table_list = self
            .tables
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let create_pub_sql = format!("CREATE PUBLICATION {} FOR TABLE {}", self.name, table_list);
        client.simple_query(&create_pub_sql)?;
        Ok(())
    }

    pub fn create_if_absent<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<()> {
        if !self.exists(client)? {
            self.create(client)?;
        }
        Ok(())
    }

    pub fn drop<C: postgres::GenericClient>(&self, client: &mut C) -> anyhow::Result<()> {
        let drop_pub_sql = format!("DROP PUBLICATION IF EXISTS {}", self.name);
        client.simple_query(&drop_pub_sql)?;
        Ok(())
    }
}
