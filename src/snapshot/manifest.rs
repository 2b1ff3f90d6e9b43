//! Snapshot manifest codec.
//!
//! `manifest.json` is the self-describing index for a snapshot directory:
//! every table's file, size, row count, checksum, and column definitions,
//! plus the sequences captured and the LSN the snapshot was taken at.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::snapshots::Compression;
use crate::error::{IntegrityError, ValidationError};
use crate::fingerprint::ColumnDefinition;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub schema: String,
    pub name: String,
    pub file: String,
    pub byte_size: i64,
    pub row_count: i64,
    pub checksum: String,
    pub column_definitions: Vec<ColumnDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub schema: String,
    pub name: String,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub snapshot_id: String,
    pub source_node: String,
    pub lsn: String,
    pub created_at: DateTime<Utc>,
    pub compression: String,
    pub tables: Vec<TableEntry>,
    pub sequences: Vec<SequenceEntry>,
    pub total_size_bytes: i64,
}

impl Manifest {
    pub fn write_to(&self, dir: &Path) -> anyhow::Result<()> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Parses `manifest.json` from `dir`, rejecting a malformed manifest:
    /// unknown compression suffix, a missing/malformed checksum, or an
    /// empty LSN.
    pub fn load_from(dir: &Path) -> anyhow::Result<Manifest> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let file = File::open(&path)?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(file))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.lsn.trim().is_empty() {
            return Err(ValidationError::Other("manifest LSN is empty".to_string()));
        }
        Compression::parse(&self.compression)?;
        for table in &self.tables {
            if table.checksum.len() != 64 || !table.checksum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ValidationError::Other(format!(
                    "manifest checksum for {}.{} is missing or not a valid SHA-256 hex digest",
                    table.schema, table.name
                )));
            }
        }
        Ok(())
    }
}

/// Streams `reader` through a SHA-256 hasher in fixed-size chunks, writing
/// every byte read to `writer` unchanged. Used both when producing a data
/// file (hash-while-writing) and when verifying one (hash-while-discarding,
/// with `writer` a no-op sink).
pub fn hash_stream<R: Read, W: Write>(mut reader: R, mut writer: W) -> anyhow::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok((total, format!("{:x}", hasher.finalize())))
}

/// Opens `path` through the decompressor matching `compression`. The
/// generator hashes table data before it passes through the compressing
/// writer, so reading it back for verification or import must undo the
/// same codec to land on the same bytes.
pub fn reader_for(path: &Path, compression: Compression) -> anyhow::Result<Box<dyn Read>> {
    let file = File::open(path)?;
    Ok(match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(file)),
        Compression::Zstd => Box::new(zstd::stream::Decoder::new(file)?),
    })
}

/// Decompresses `file_path` under `compression` and re-hashes it against
/// `expected_checksum`. Used by the applier's optional verify phase and by
/// `VerifySnapshot`-style standalone checks: modifying any data file after
/// it was written causes verification to fail.
pub fn verify_file_checksum(
    file_path: &Path,
    compression: Compression,
    expected_checksum: &str,
) -> Result<(), IntegrityError> {
    let reader = reader_for(file_path, compression).map_err(|e| IntegrityError::Other(e.to_string()))?;
    let (_, actual) =
        hash_stream(BufReader::new(reader), std::io::sink()).map_err(|e| IntegrityError::Other(e.to_string()))?;
    if actual != expected_checksum {
        return Err(IntegrityError::ChecksumMismatch {
            file: file_path.display().to_string(),
            expected: expected_checksum.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn hash_stream_reproduces_sha256_of_input() {
        let data = b"hello world".to_vec();
        let (n, digest) = hash_stream(Cursor::new(data.clone()), std::io::sink()).unwrap();
        assert_eq!(n, data.len() as u64);
        // sha256("hello world")
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn manifest_rejects_empty_lsn() {
        let manifest = Manifest {
            snapshot_id: "snap1".into(),
            source_node: "node_a".into(),
            lsn: "".into(),
            created_at: chrono::Utc::now(),
            compression: "none".into(),
            tables: vec![],
            sequences: vec![],
            total_size_bytes: 0,
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn manifest_rejects_unknown_compression() {
        let manifest = Manifest {
            snapshot_id: "snap1".into(),
            source_node: "node_a".into(),
            lsn: "0/1000000".into(),
            created_at: chrono::Utc::now(),
            compression: "brotli".into(),
            tables: vec![],
            sequences: vec![],
            total_size_bytes: 0,
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn manifest_rejects_malformed_checksum() {
        let manifest = Manifest {
            snapshot_id: "snap1".into(),
            source_node: "node_a".into(),
            lsn: "0/1000000".into(),
            created_at: chrono::Utc::now(),
            compression: "none".into(),
            tables: vec![TableEntry {
                schema: "public".into(),
                name: "orders".into(),
                file: "public.orders".into(),
                byte_size: 10,
                row_count: 1,
                checksum: "not-a-hash".into(),
                column_definitions: vec![],
            }],
            sequences: vec![],
            total_size_bytes: 10,
        };
        assert!(manifest.validate().is_err());
    }
}
