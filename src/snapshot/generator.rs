//! Two-phase snapshot generator.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use postgres::{Client, IsolationLevel};
use rayon::ThreadPool;

use crate::config::NamingConfig;
use crate::db::snapshots::Compression;
use crate::error::ValidationError;
use crate::fingerprint::ColumnDefinition;
use crate::logical_replication::{Lsn, Slot};
use crate::operation::CancelLatch;
use crate::table::Table;

use super::manifest::{hash_stream, Manifest, SequenceEntry, TableEntry};

pub struct GenerateSnapshotInput {
    pub snapshot_id: String,
    pub source_node_id: String,
    pub output_path: PathBuf,
    pub parallel_workers: usize,
    pub compression: Compression,
    pub tables: Vec<Table>,
    pub sequences: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub enum GeneratorPhase {
    Schema,
    Data,
    Sequences,
    Complete,
}

#[derive(Debug, Clone)]
pub struct GenerateProgress {
    pub phase: String,
    pub current_table: Option<String>,
    pub overall_percent: f32,
    pub snapshot_id: String,
    pub lsn: Option<String>,
    pub error: Option<String>,
}

pub type ProgressSink = dyn Fn(GenerateProgress) + Send + Sync;

/// `lz4_flex`'s frame encoder needs an explicit `finish()` to write its end
/// marker; type-erasing it behind `Box<dyn Write>` alongside the other
/// codecs would drop that call. This wrapper calls it on drop instead.
struct Lz4OnDrop(Option<lz4_flex::frame::FrameEncoder<BufWriter<File>>>);

impl Write for Lz4OnDrop {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.as_mut().expect("lz4 encoder already finished").write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.as_mut().expect("lz4 encoder already finished").flush()
    }
}

impl Drop for Lz4OnDrop {
    fn drop(&mut self) {
        if let Some(enc) = self.0.take() {
            let _ = enc.finish();
        }
    }
}

fn writer_for(path: &Path, compression: Compression) -> anyhow::Result<Box<dyn Write>> {
    let file = File::create(path)?;
    Ok(match compression {
        Compression::None => Box::new(BufWriter::new(file)),
        Compression::Gzip => Box::new(GzEncoder::new(BufWriter::new(file), GzLevel::default())),
        Compression::Lz4 => Box::new(Lz4OnDrop(Some(lz4_flex::frame::FrameEncoder::new(BufWriter::new(file))))),
        Compression::Zstd => Box::new(zstd::stream::Encoder::new(BufWriter::new(file), 0)?.auto_finish()),
    })
}

/// Validates inputs: non-empty, creatable output path;
/// `parallel_workers` in `1..16` (the caller is expected to have already
/// clamped via `CoordinatorConfig::clamp_workers`, this is the last-ditch
/// rejection of a truly invalid value); known compression.
fn validate_input(input: &GenerateSnapshotInput) -> Result<(), ValidationError> {
    if input.output_path.as_os_str().is_empty() {
        return Err(ValidationError::EmptyOutputPath);
    }
    if !(1..=16).contains(&input.parallel_workers) {
        return Err(ValidationError::Other(format!(
            "parallel_workers must be in 1..16, got {}",
            input.parallel_workers
        )));
    }
    Ok(())
}

/// Runs the full generator protocol (reserve, enumerate, schema, data,
/// sequences, manifest, commit) against an already-open source connection.
/// `pool` bounds the data-phase worker concurrency; `connect` opens a fresh
/// connection per worker table (each worker needs its own session bound to
/// the exported snapshot).
pub fn generate<F>(
    source: &mut Client,
    input: &GenerateSnapshotInput,
    naming: &NamingConfig,
    pool: &ThreadPool,
    cancel: &CancelLatch,
    connect: F,
    on_progress: &ProgressSink,
) -> anyhow::Result<Manifest>
where
    F: Fn() -> anyhow::Result<Client> + Sync,
{
    validate_input(input)?;
    fs::create_dir_all(&input.output_path)?;

    // 1. Reserve: repeatable-read transaction exporting its snapshot via a
    // logical replication slot created at the transaction's LSN.
    let mut txn = source.build_transaction().isolation_level(IsolationLevel::RepeatableRead).start()?;
    let slot = Slot::new(naming.snapshot_slot_name(&input.snapshot_id));
    let lsn: Lsn = slot.create_slot_at_lsn(&mut txn)?;

    on_progress(GenerateProgress {
        phase: "schema".to_string(),
        current_table: None,
        overall_percent: 0.0,
        snapshot_id: input.snapshot_id.clone(),
        lsn: Some(lsn.to_pg_string()),
        error: None,
    });

    // 2. Enumerate: deterministic schema ASC, table ASC order.
    let mut tables = input.tables.clone();
    tables.sort_by(|a, b| {
        a.schema
            .clone()
            .unwrap_or_default()
            .cmp(&b.schema.clone().unwrap_or_default())
            .then(a.name.cmp(&b.name))
    });

    // 3. Schema phase: capture column definitions per table.
    let mut column_defs: Vec<(Table, Vec<ColumnDefinition>)> = Vec::with_capacity(tables.len());
    for table in &tables {
        let columns = crate::fingerprint::capture(
            &mut txn,
            table.schema.as_deref().unwrap_or("public"),
            &table.name,
        )?;
        column_defs.push((table.clone(), columns.column_definitions));
    }
    txn.commit()?;

    let total_tables = tables.len().max(1);
    let completed = std::sync::atomic::AtomicUsize::new(0);
    let results: std::sync::Mutex<Vec<anyhow::Result<TableEntry>>> =
        std::sync::Mutex::new(Vec::with_capacity(tables.len()));

    // 4. Data phase: up to `parallel_workers` tables copied concurrently,
    // each via its own connection pinned to the exported snapshot.
    pool.scope(|scope| {
        for (table, columns) in &column_defs {
            if cancel.is_cancelled() {
                break;
            }
            scope.spawn(|_| {
                let outcome = (|| -> anyhow::Result<TableEntry> {
                    let mut worker_conn = connect()?;
                    worker_conn
                        .batch_execute(&format!(
                            "BEGIN ISOLATION LEVEL REPEATABLE READ; SET TRANSACTION SNAPSHOT '{}';",
                            slot.name
                        ))?;

                    let file_name = format!(
                        "{}.{}{}",
                        table.schema_or_public(),
                        table.name,
                        input.compression.suffix()
                    );
                    let file_path = input.output_path.join(&file_name);
                    let mut out = writer_for(&file_path, input.compression)?;

                    let copy_sql = format!("COPY (SELECT * FROM {table}) TO STDOUT");
                    let mut reader = worker_conn.copy_out(copy_sql.as_str())?;
                    let (bytes_written, checksum) = hash_stream(&mut reader, &mut out)?;
                    out.flush()?;
                    drop(out);
                    worker_conn.batch_execute("COMMIT;")?;

                    let row_count = count_lines(&file_path, input.compression)?;

                    Ok(TableEntry {
                        schema: table.schema_or_public().to_string(),
                        name: table.name.clone(),
                        file: file_name,
                        byte_size: bytes_written as i64,
                        row_count,
                        checksum,
                        column_definitions: columns.clone(),
                    })
                })();

                if let Ok(entry) = &outcome {
                    let done = completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    on_progress(GenerateProgress {
                        phase: "data".to_string(),
                        current_table: Some(format!("{}.{}", entry.schema, entry.name)),
                        overall_percent: 100.0 * done as f32 / total_tables as f32,
                        snapshot_id: input.snapshot_id.clone(),
                        lsn: Some(lsn.to_pg_string()),
                        error: None,
                    });
                }
                results.lock().expect("generator results lock poisoned").push(outcome);
            });
        }
    });

    if cancel.is_cancelled() {
        let _ = fs::remove_dir_all(&input.output_path);
        anyhow::bail!("snapshot generation cancelled during data phase");
    }

    let mut table_entries: Vec<TableEntry> = results
        .into_inner()
        .expect("generator results lock poisoned")
        .into_iter()
        .collect::<anyhow::Result<Vec<_>>>()?;
    table_entries.sort_by(|a, b| a.schema.cmp(&b.schema).then(a.name.cmp(&b.name)));
    let total_size_bytes: i64 = table_entries.iter().map(|t| t.byte_size).sum();

    // 5. Sequence phase.
    let mut sequences = Vec::with_capacity(input.sequences.len());
    for (schema, name) in &input.sequences {
        let row = source.query_one(&format!("SELECT last_value FROM {schema}.{name}"), &[])?;
        let value: i64 = row.get(0);
        sequences.push(SequenceEntry {
            schema: schema.clone(),
            name: name.clone(),
            value,
        });
    }
    on_progress(GenerateProgress {
        phase: "sequences".to_string(),
        current_table: None,
        overall_percent: 100.0,
        snapshot_id: input.snapshot_id.clone(),
        lsn: Some(lsn.to_pg_string()),
        error: None,
    });

    // 6. Manifest.
    let manifest = Manifest {
        snapshot_id: input.snapshot_id.clone(),
        source_node: input.source_node_id.clone(),
        lsn: lsn.to_pg_string(),
        created_at: chrono::Utc::now(),
        compression: input.compression.as_str().to_string(),
        tables: table_entries,
        sequences,
        total_size_bytes,
    };
    manifest.write_to(&input.output_path)?;

    slot.drop_slot(source).ok();

    on_progress(GenerateProgress {
        phase: "complete".to_string(),
        current_table: None,
        overall_percent: 100.0,
        snapshot_id: input.snapshot_id.clone(),
        lsn: Some(lsn.to_pg_string()),
        error: None,
    });

    Ok(manifest)
}

/// Counts data rows in a (possibly compressed) COPY text-format output file
/// by counting newlines, since `COPY ... TO STDOUT` in text format emits
/// exactly one line per row.
fn count_lines(path: &Path, compression: Compression) -> anyhow::Result<i64> {
    use std::io::Read;
    let file = File::open(path)?;
    let mut reader: Box<dyn Read> = match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(file)),
        Compression::Zstd => Box::new(zstd::stream::Decoder::new(file)?),
    };
    let mut buf = [0u8; 64 * 1024];
    let mut count = 0i64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        count += buf[..n].iter().filter(|&&b| b == b'\n').count() as i64;
    }
    Ok(count)
}

impl Table {
    fn schema_or_public(&self) -> &str {
        self.schema.as_deref().unwrap_or("public")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_output_path() {
        let input = GenerateSnapshotInput {
            snapshot_id: "s1".into(),
            source_node_id: "node_a".into(),
            output_path: PathBuf::new(),
            parallel_workers: 4,
            compression: Compression::None,
            tables: vec![],
            sequences: vec![],
        };
        assert!(validate_input(&input).is_err());
    }

    #[test]
    fn rejects_worker_count_out_of_range() {
        let input = GenerateSnapshotInput {
            snapshot_id: "s1".into(),
            source_node_id: "node_a".into(),
            output_path: PathBuf::from("/tmp/snap"),
            parallel_workers: 64,
            compression: Compression::None,
            tables: vec![],
            sequences: vec![],
        };
        assert!(validate_input(&input).is_err());
    }
}
