//! Catalog gateway: a thin layer over one PostgreSQL connection pool per
//! node. Exposes parameterized helpers for the coordinator's own
//! bookkeeping tables, all of which live in the `steep_repl` schema owned by
//! the PostgreSQL extension (out of scope for this crate — the extension's
//! exact table/column definitions are reproduced here as the contract this
//! module binds against).

pub mod coordinator_state;
pub mod init_slots;
pub mod merge_audit;
pub mod nodes;
pub mod snapshots;

use r2d2::Pool;
use r2d2_postgres::postgres::NoTls;
use r2d2_postgres::PostgresConnectionManager;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;
pub type PgConn = r2d2::PooledConnection<PostgresConnectionManager<NoTls>>;

/// One `Catalog` per participating node; wraps its connection pool and
/// exposes every bookkeeping helper the coordinator needs against that
/// node's database.
#[derive(Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub fn connect(conn_str: &str) -> anyhow::Result<Self> {
        let manager = PostgresConnectionManager::new(conn_str.parse()?, NoTls);
        let pool = Pool::builder().max_size(8).build(manager)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn get(&self) -> anyhow::Result<PgConn> {
        Ok(self.pool.get()?)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Confirms the `steep_repl` extension is installed and reports a
    /// supported version. Returns `PreconditionError::ExtensionMissing`
    /// (wrapped in `anyhow`, converted at the RPC boundary) otherwise.
    pub fn ensure_extension(&self) -> anyhow::Result<()> {
        let mut client = self.get()?;
        let row = client.query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_namespace WHERE nspname = 'steep_repl')",
            &[],
        )?;
        let present: bool = row.get(0);
        if !present {
            return Err(crate::error::PreconditionError::ExtensionMissing.into());
        }
        let version_row = client.query_one("SELECT steep_repl.steep_repl_min_pg_version()", &[])?;
        let min_pg_version: i32 = version_row.get(0);
        let server_row = client.query_one("SHOW server_version_num", &[])?;
        let server_version_num: i32 = server_row.get::<_, String>(0).parse()?;
        if server_version_num < min_pg_version {
            anyhow::bail!(
                "server version {server_version_num} below steep_repl's minimum {min_pg_version}"
            );
        }
        Ok(())
    }
}
