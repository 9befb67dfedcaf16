//! Parallel transform coordinator
//!
//! Turns one XML input stream into a complete set of per-table spool
//! files without losing entries and without unbounded buffering. Three
//! roles are connected by two bounded channels:
//!
//! reader (XML parse) -> [entries] -> worker pool (row encode) -> [batches] -> writer
//!
//! Backpressure falls out of the bounds: a slow writer blocks the
//! workers, slow workers block the reader. All rows of one entry travel
//! as a single batch, so an entry never appears partially spooled. On any
//! fatal error or cancellation the spool directory is deleted; partial
//! spool files are never left behind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::encode::{encode_entry, EntryRows};
use crate::error::{EtlError, Result};
use crate::model::{Entry, Profile};
use crate::schema;
use crate::xml::EntryReader;

/// Cooperative cancellation flag shared between the coordinator and its
/// caller. Cancelling stops the reader; in-flight entries drain and the
/// spool directory is removed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Tuning knobs for one transform run.
#[derive(Debug, Clone, Copy)]
pub struct TransformOptions {
    pub workers: usize,
    /// Bound of each channel, in entries.
    pub queue_depth: usize,
    pub profile: Profile,
}

impl Default for TransformOptions {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers,
            queue_depth: workers * 2,
            profile: Profile::Standard,
        }
    }
}

/// Outcome of a successful transform run.
#[derive(Debug, Clone, Default)]
pub struct TransformReport {
    /// Release tag from the document root, when the root carried one.
    pub release: Option<String>,
    /// Entries successfully transformed.
    pub entries: u64,
    /// Malformed entries skipped.
    pub skipped: u64,
    /// Rows written per table.
    pub rows: BTreeMap<&'static str, u64>,
}

/// Transform one XML input into per-table spool files under `spool_dir`.
///
/// The directory is created if needed and wiped again on failure or
/// cancellation. Spool files exist only for tables that received rows.
pub fn transform_to_spool(
    input: &Path,
    spool_dir: &Path,
    options: &TransformOptions,
    cancel: &CancelToken,
) -> Result<TransformReport> {
    let workers = options.workers.max(1);
    let queue_depth = options.queue_depth.max(1);

    let mut reader = EntryReader::open(input)?;
    let release = reader.release()?.map(str::to_string);
    fs::create_dir_all(spool_dir)?;

    info!(
        input = %input.display(),
        spool_dir = %spool_dir.display(),
        workers,
        queue_depth,
        profile = %options.profile,
        "starting transform"
    );

    let result = run_stages(reader, spool_dir, workers, queue_depth, options.profile, cancel);

    match result {
        Ok((entries, skipped, rows)) => {
            info!(entries, skipped, "transform finished");
            Ok(TransformReport {
                release,
                entries,
                skipped,
                rows,
            })
        }
        Err(err) => {
            warn!(error = %err, "transform aborted, removing spool files");
            remove_spool_dir(spool_dir);
            match err {
                EtlError::Cancelled => Err(EtlError::Cancelled),
                EtlError::TransformFailure(msg) => Err(EtlError::TransformFailure(msg)),
                other => Err(EtlError::TransformFailure(other.to_string())),
            }
        }
    }
}

/// Remove the spool directory, logging rather than failing on error.
pub fn remove_spool_dir(spool_dir: &Path) {
    if spool_dir.exists() {
        if let Err(err) = fs::remove_dir_all(spool_dir) {
            warn!(spool_dir = %spool_dir.display(), error = %err, "failed to remove spool directory");
        }
    }
}

type StageOutcome = (u64, u64, BTreeMap<&'static str, u64>);

fn run_stages<R: std::io::BufRead + Send>(
    mut reader: EntryReader<R>,
    spool_dir: &Path,
    workers: usize,
    queue_depth: usize,
    profile: Profile,
    cancel: &CancelToken,
) -> Result<StageOutcome> {
    let (entry_tx, entry_rx) = bounded::<Entry>(queue_depth);
    let (batch_tx, batch_rx) = bounded::<EntryRows>(queue_depth);

    thread::scope(|scope| {
        let writer_handle = {
            let spool_dir = spool_dir.to_path_buf();
            thread::Builder::new()
                .name("spool-writer".to_string())
                .spawn_scoped(scope, move || writer_loop(batch_rx, &spool_dir))
                .expect("failed to spawn writer thread")
        };

        let mut worker_handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx: Receiver<Entry> = entry_rx.clone();
            let tx: Sender<EntryRows> = batch_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("transform-{id}"))
                .spawn_scoped(scope, move || {
                    while let Ok(entry) = rx.recv() {
                        let batch = encode_entry(&entry, profile);
                        if tx.send(batch).is_err() {
                            break;
                        }
                    }
                })
                .expect("failed to spawn transform worker");
            worker_handles.push(handle);
        }
        drop(entry_rx);
        drop(batch_tx);

        let mut entries = 0u64;
        let mut skipped = 0u64;
        let mut aborted = false;
        let mut fatal: Option<EtlError> = None;
        loop {
            if cancel.is_cancelled() {
                fatal = Some(EtlError::Cancelled);
                break;
            }
            match reader.next_entry() {
                Ok(Some(entry)) => {
                    entries += 1;
                    if entry_tx.send(entry).is_err() {
                        // Writer or workers went away; their error surfaces
                        // from the join below.
                        aborted = true;
                        break;
                    }
                    if entries % 100_000 == 0 {
                        debug!(entries, "transform progress");
                    }
                }
                Ok(None) => break,
                Err(EtlError::InvalidEntry(msg)) => {
                    skipped += 1;
                    warn!(reason = %msg, "skipping malformed entry");
                }
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }
        }
        drop(entry_tx);

        for handle in worker_handles {
            let _ = handle.join();
        }
        let writer_result = writer_handle
            .join()
            .unwrap_or_else(|_| Err(EtlError::TransformFailure("spool writer panicked".into())));

        match (fatal, writer_result) {
            (Some(err), _) => Err(err),
            (None, Err(err)) => Err(err),
            (None, Ok(_)) if aborted => Err(EtlError::TransformFailure(
                "transform stage exited before the input was fully read".into(),
            )),
            (None, Ok(rows)) => Ok((entries, skipped, rows)),
        }
    })
}

struct SpoolFile {
    writer: BufWriter<GzEncoder<File>>,
    rows: u64,
}

impl SpoolFile {
    fn create(spool_dir: &Path, table: &str) -> Result<Self> {
        let path: PathBuf = spool_dir.join(schema::spool_file_name(table));
        let file = File::create(&path)?;
        Ok(Self {
            writer: BufWriter::new(GzEncoder::new(file, Compression::fast())),
            rows: 0,
        })
    }

    fn write_row(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.rows += 1;
        Ok(())
    }

    fn finish(self) -> Result<u64> {
        let encoder = self
            .writer
            .into_inner()
            .map_err(|e| EtlError::Io(e.into_error()))?;
        encoder.finish()?;
        Ok(self.rows)
    }
}

/// Single writer over all spool files. Files are created lazily so empty
/// tables never produce a spool. Taxonomy rows are deduplicated across
/// the whole run since many entries share an organism.
fn writer_loop(
    batch_rx: Receiver<EntryRows>,
    spool_dir: &Path,
) -> Result<BTreeMap<&'static str, u64>> {
    let mut files: HashMap<&'static str, SpoolFile> = HashMap::new();
    let mut seen_taxids: HashSet<i64> = HashSet::new();

    while let Ok(batch) = batch_rx.recv() {
        for (table, line) in &batch.rows {
            if *table == schema::TAXONOMY {
                let taxid = line
                    .split('\t')
                    .next()
                    .and_then(|v| v.parse::<i64>().ok());
                if let Some(taxid) = taxid {
                    if !seen_taxids.insert(taxid) {
                        continue;
                    }
                }
            }
            if !files.contains_key(table) {
                files.insert(*table, SpoolFile::create(spool_dir, table)?);
            }
            let file = files.get_mut(table).expect("spool file just inserted");
            file.write_row(line)?;
        }
    }

    let mut counts = BTreeMap::new();
    for (table, file) in files {
        counts.insert(table, file.finish()?);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn default_options_bound_queues_by_worker_count() {
        let opts = TransformOptions::default();
        assert!(opts.workers >= 1);
        assert_eq!(opts.queue_depth, opts.workers * 2);
    }
}
