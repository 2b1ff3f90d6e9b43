//! `steep_repl.snapshots` and `steep_repl.snapshot_progress`.
//!
//! `snapshots` columns follow the extension's table, with `status` extended
//! to include `failed` by the supplemental migration in `sql/`
//! (`DESIGN.md` records why). `snapshot_progress` is new: the extension has
//! no analogue, as it predates the snapshot feature.

use chrono::{DateTime, Utc};
use postgres::GenericClient;

use crate::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Creating,
    Complete,
    Applied,
    Expired,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotStatus::Creating => "pending",
            SnapshotStatus::Complete => "complete",
            SnapshotStatus::Applied => "applied",
            SnapshotStatus::Expired => "expired",
            SnapshotStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Lz4 => ".lz4",
            Compression::Zstd => ".zst",
        }
    }

    pub fn parse(s: &str) -> Result<Self, crate::error::ValidationError> {
        Ok(match s {
            "none" => Compression::None,
            "gzip" => Compression::Gzip,
            "lz4" => Compression::Lz4,
            "zstd" => Compression::Zstd,
            other => {
                return Err(crate::error::ValidationError::UnknownCompression(
                    other.to_string(),
                ));
            }
        })
    }
}

pub struct NewSnapshot<'a> {
    pub snapshot_id: &'a str,
    pub source_node_id: &'a NodeId,
    pub lsn: &'a str,
    pub storage_path: &'a str,
    pub compression: Compression,
}

pub fn insert_creating<C: GenericClient>(client: &mut C, snap: &NewSnapshot<'_>) -> anyhow::Result<()> {
    client.execute(
        "INSERT INTO steep_repl.snapshots \
         (snapshot_id, source_node_id, lsn, storage_path, size_bytes, table_count, compression, checksum, status) \
         VALUES ($1, $2, $3, $4, 0, 0, $5, '', $6)",
        &[
            &snap.snapshot_id,
            &snap.source_node_id.as_str(),
            &snap.lsn,
            &snap.storage_path,
            &snap.compression.as_str(),
            &SnapshotStatus::Creating.as_str(),
        ],
    )?;
    Ok(())
}

pub fn mark_complete<C: GenericClient>(
    client: &mut C,
    snapshot_id: &str,
    table_count: i32,
    total_size_bytes: i64,
    manifest_checksum: &str,
) -> anyhow::Result<()> {
    client.execute(
        "UPDATE steep_repl.snapshots SET status = $1, table_count = $2, size_bytes = $3, checksum = $4 \
         WHERE snapshot_id = $5",
        &[
            &SnapshotStatus::Complete.as_str(),
            &table_count,
            &total_size_bytes,
            &manifest_checksum,
            &snapshot_id,
        ],
    )?;
    Ok(())
}

pub fn mark_failed<C: GenericClient>(client: &mut C, snapshot_id: &str) -> anyhow::Result<()> {
    client.execute(
        "UPDATE steep_repl.snapshots SET status = $1 WHERE snapshot_id = $2",
        &[&SnapshotStatus::Failed.as_str(), &snapshot_id],
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub source_node_id: NodeId,
    pub lsn: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub table_count: i32,
    pub compression: String,
    pub checksum: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

pub fn get<C: GenericClient>(client: &mut C, snapshot_id: &str) -> anyhow::Result<Option<SnapshotRecord>> {
    let rows = client.query(
        "SELECT snapshot_id, source_node_id, lsn, storage_path, size_bytes, table_count, \
                compression, checksum, status, created_at \
         FROM steep_repl.snapshots WHERE snapshot_id = $1",
        &[&snapshot_id],
    )?;
    Ok(rows.into_iter().next().map(|row| SnapshotRecord {
        snapshot_id: row.get("snapshot_id"),
        source_node_id: NodeId::from(row.get::<_, String>("source_node_id")),
        lsn: row.get("lsn"),
        storage_path: row.get("storage_path"),
        size_bytes: row.get("size_bytes"),
        table_count: row.get("table_count"),
        compression: row.get("compression"),
        checksum: row.get("checksum"),
        status: row.get("status"),
        created_at: row.get("created_at"),
    }))
}

/// `GetSnapshotProgress(snapshot_id) -> {has_progress, progress?}`.
#[derive(Debug, Clone)]
pub struct SnapshotProgressRow {
    pub phase: String,
    pub current_table: Option<String>,
    pub overall_percent: f32,
    pub error_message: Option<String>,
}

pub fn upsert_progress<C: GenericClient>(
    client: &mut C,
    snapshot_id: &str,
    phase: &str,
    current_table: Option<&str>,
    overall_percent: f32,
    error_message: Option<&str>,
) -> anyhow::Result<()> {
    client.execute(
        "INSERT INTO steep_repl.snapshot_progress \
         (snapshot_id, phase, current_table, overall_percent, error_message, updated_at) \
         VALUES ($1, $2, $3, $4, $5, now()) \
         ON CONFLICT (snapshot_id) DO UPDATE SET \
           phase = EXCLUDED.phase, current_table = EXCLUDED.current_table, \
           overall_percent = EXCLUDED.overall_percent, error_message = EXCLUDED.error_message, \
           updated_at = now()",
        &[
            &snapshot_id,
            &phase,
            &current_table,
            &overall_percent,
            &error_message,
        ],
    )?;
    Ok(())
}

pub fn get_progress<C: GenericClient>(
    client: &mut C,
    snapshot_id: &str,
) -> anyhow::Result<Option<SnapshotProgressRow>> {
    let rows = client.query(
        "SELECT phase, current_table, overall_percent, error_message \
         FROM steep_repl.snapshot_progress WHERE snapshot_id = $1",
        &[&snapshot_id],
    )?;
    Ok(rows.into_iter().next().map(|row| SnapshotProgressRow {
        phase: row.get("phase"),
        current_table: row.get("current_table"),
        overall_percent: row.get("overall_percent"),
        error_message: row.get("error_message"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_suffix_mapping_matches_spec() {
        assert_eq!(Compression::None.suffix(), "");
        assert_eq!(Compression::Gzip.suffix(), ".gz");
        assert_eq!(Compression::Lz4.suffix(), ".lz4");
        assert_eq!(Compression::Zstd.suffix(), ".zst");
    }

    #[test]
    fn unknown_compression_is_rejected_before_starting() {
        assert!(Compression::parse("brotli").is_err());
    }
}
