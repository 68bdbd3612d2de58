//! Bulk-Load Pipeline
//!
//! One reader on the calling thread streams data files into a bounded queue of
//! batch groups; a pool of writer threads, created once per job, commits them.
//! Stages run strictly one after another: every group of a stage is finished
//! before the first row of the next stage is read.

pub mod cancel;
pub mod phase;
pub mod row_log;
pub mod summary;
pub mod worker;

pub use cancel::CancellationToken;
pub use phase::{plan, Phase, Stage};
pub use row_log::{RowCategory, RowLogs};
pub use summary::{LoadStats, LoadSummary};

use crate::config::{GeneratorUnit, LoaderConfig};
use crate::error::{LoaderError, Result};
use crate::reader::{get_header, header_index, open_data_file, parse_line, HeaderIndex};
use crate::store::GraphStore;
use cancel::POLL_INTERVAL;
use crossbeam_channel::{bounded, SendTimeoutError, Sender};
use row_log::source_name;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use worker::{BatchGroup, FileContext, InFlight, RowRecord, WorkItem, WriterShared, BATCH_GROUP_SIZE};

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub database: String,
    pub allow_multi_insert: bool,
}

/// A unit whose settings, value types and headers all resolved
struct PreparedUnit<'a> {
    unit: &'a GeneratorUnit,
    separator: char,
    rows_per_commit: usize,
    files: Vec<DataFile>,
}

/// A data file with its resolved header
struct DataFile {
    path: PathBuf,
    header: HeaderIndex,
    /// Number of header columns; rows with more fields are malformed
    width: usize,
}

pub struct BulkLoader {
    config: LoaderConfig,
    options: LoadOptions,
    cancel: CancellationToken,
}

impl BulkLoader {
    pub fn new(config: LoaderConfig, options: LoadOptions) -> Self {
        Self {
            config,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Token that stops the running job when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load every stage into `store`. The database must exist and hold the schema.
    pub fn run(&self, store: &dyn GraphStore) -> Result<LoadSummary> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let database = self.options.database.as_str();
        info!(%run_id, database, "Starting load");

        let logs = RowLogs::new(self.config.log_directory())?;
        let stats = LoadStats::default();
        let stages = plan(&self.config);

        let mut prepared = HashMap::new();
        let mut failed_units = Vec::new();
        for key in stages.iter().flat_map(|s| s.unit_keys.iter()) {
            let Some(unit) = self.config.unit(key) else { continue };
            match self.prepare_unit(store, unit) {
                Ok(p) => {
                    prepared.insert(key.as_str(), p);
                }
                Err(e) if e.is_configuration() => {
                    error!(unit = %key, error = %e, "Skipping generator");
                    failed_units.push(format!("{}: {}", key, e));
                }
                Err(e) => return Err(e),
            }
        }

        let session = store.session(database)?;
        let workers = self.config.parallelism();
        let (tx, rx) = bounded::<WorkItem<'_>>(self.config.queue_capacity());
        let shared = WriterShared {
            session: session.as_ref(),
            cancel: self.cancel.clone(),
            logs: &logs,
            stats: &stats,
            retry: self.config.global.retry.clone(),
            allow_multi_insert: self.options.allow_multi_insert,
            in_flight: InFlight::default(),
            fatal: Mutex::new(None),
        };
        info!(workers, queue = self.config.queue_capacity(), stages = stages.len(), "Writer pool ready");

        let fed = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for i in 0..workers {
                let (rx, tx, shared) = (rx.clone(), tx.clone(), &shared);
                let spawned = thread::Builder::new()
                    .name(format!("graphload-writer-{}", i))
                    .spawn_scoped(scope, move || worker::run_writer(shared, rx, tx));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        self.cancel.cancel();
                        return Err(LoaderError::Io(e));
                    }
                }
            }

            let mut fed = self.feed_stages(&stages, &prepared, &shared, &tx);
            if fed.is_err() {
                self.cancel.cancel();
            }
            for _ in 0..workers {
                if !self.enqueue(&tx, WorkItem::EndOfStream) {
                    break;
                }
            }
            for handle in handles {
                if handle.join().is_err() {
                    self.cancel.cancel();
                    fed = fed.and(Err(LoaderError::Aborted("writer thread panicked".to_string())));
                }
            }
            fed
        });
        logs.flush()?;

        let elapsed = started.elapsed();
        let failure = match (fed, shared.take_fatal()) {
            (Err(e), _) | (Ok(()), Some(e)) => Some(e),
            (Ok(()), None) if self.cancel.is_cancelled() => {
                Some(LoaderError::Aborted("load cancelled".to_string()))
            }
            _ => None,
        };
        if let Some(e) = failure {
            error!(%run_id, ?elapsed, error = %e, "Load aborted");
            return Err(e);
        }
        info!(%run_id, ?elapsed, "Load finished");
        Ok(stats.summary(run_id, failed_units, elapsed))
    }

    /// Resolve separator, batch size and value types, and check every file header.
    /// Value types are written here, before any writer runs.
    fn prepare_unit<'a>(&self, store: &dyn GraphStore, unit: &'a GeneratorUnit) -> Result<PreparedUnit<'a>> {
        let separator = self.config.separator_for(unit)?;
        let rows_per_commit = self.config.rows_per_commit_for(unit)?;

        for spec in unit.definition.ownership_specs() {
            let value_type = store
                .attribute_value_type(&self.options.database, &spec.attribute)?
                .ok_or_else(|| {
                    LoaderError::Config(format!(
                        "attribute type '{}' is not defined in the schema",
                        spec.attribute
                    ))
                })?;
            spec.set_value_type(value_type);
        }

        let columns = unit.definition.columns();
        let mut files = Vec::with_capacity(unit.data_paths.len());
        for path in &unit.data_paths {
            let header = get_header(path, separator).map_err(|e| {
                LoaderError::Config(format!("cannot read header of {}: {}", path.display(), e))
            })?;
            let index = header_index(&header);
            if let Some(missing) = columns.iter().find(|c| !index.contains_key(**c)) {
                return Err(LoaderError::Config(format!(
                    "column '{}' is not in the header of {}",
                    missing,
                    path.display()
                )));
            }
            files.push(DataFile {
                path: path.to_path_buf(),
                header: index,
                width: header.len(),
            });
        }
        Ok(PreparedUnit {
            unit,
            separator,
            rows_per_commit,
            files,
        })
    }

    fn feed_stages<'a>(
        &self,
        stages: &[Stage],
        prepared: &HashMap<&str, PreparedUnit<'a>>,
        shared: &WriterShared<'_>,
        tx: &Sender<WorkItem<'a>>,
    ) -> Result<()> {
        let mut current = Phase::Pending;
        for stage in stages {
            if self.cancel.is_cancelled() {
                break;
            }
            if stage.phase != current {
                info!(from = %current, to = %stage.phase, "Phase transition");
                current = stage.phase;
            }
            for key in &stage.unit_keys {
                let Some(unit) = prepared.get(key.as_str()) else { continue };
                info!(unit = %key, kind = %unit.unit.kind(), files = unit.files.len(), "Loading generator");
                for file in &unit.files {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.feed_file(unit, file, shared, tx)?;
                }
            }
            shared.in_flight.wait_idle(&self.cancel);
        }
        if !self.cancel.is_cancelled() {
            info!(from = %current, to = %Phase::Done, "Phase transition");
        }
        Ok(())
    }

    /// Stream one file into batch groups. Stops early when the job is cancelled.
    fn feed_file<'a>(
        &self,
        unit: &PreparedUnit<'a>,
        data: &DataFile,
        shared: &WriterShared<'_>,
        tx: &Sender<WorkItem<'a>>,
    ) -> Result<()> {
        let file = Arc::new(FileContext {
            unit: unit.unit,
            source: source_name(&data.path),
            header: data.header.clone(),
        });
        let started = Instant::now();
        let progress_interval = self.config.progress_interval() as u64;
        info!(unit = %unit.unit.key, file = %file.source, "Reading file");

        let reader = open_data_file(&data.path)?;
        let mut rows = 0u64;
        let mut batch = Vec::with_capacity(unit.rows_per_commit);
        let mut group = Vec::with_capacity(BATCH_GROUP_SIZE);

        // line 1 is the header
        for (idx, line) in reader.split(b'\n').enumerate().skip(1) {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let bytes = line?;
            let text = String::from_utf8_lossy(&bytes);
            let text = text.strip_suffix('\r').unwrap_or(&text);
            if text.trim().is_empty() {
                continue;
            }
            rows += 1;
            LoadStats::add(&shared.stats.rows_read, 1);

            let fields = parse_line(text, unit.separator);
            if fields.is_empty() || fields.len() > data.width {
                debug!(file = %file.source, line = idx + 1, fields = fields.len(), "Malformed row");
                LoadStats::add(&shared.stats.malformed, 1);
                shared.logs.write(&file.source, RowCategory::Malformed, text)?;
                continue;
            }
            batch.push(RowRecord {
                line_no: idx + 1,
                raw: text.to_string(),
                fields,
            });
            if batch.len() == unit.rows_per_commit {
                group.push(std::mem::replace(&mut batch, Vec::with_capacity(unit.rows_per_commit)));
                if group.len() == BATCH_GROUP_SIZE && !self.send_group(shared, tx, &file, &mut group) {
                    return Ok(());
                }
            }
            if rows % progress_interval == 0 {
                let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);
                info!(unit = %unit.unit.key, file = %file.source, rows, rate = %format!("{:.0} rows/s", rows as f64 / secs), "Progress");
            }
        }

        if !batch.is_empty() {
            group.push(batch);
        }
        if !group.is_empty() && !self.send_group(shared, tx, &file, &mut group) {
            return Ok(());
        }
        info!(unit = %unit.unit.key, file = %file.source, rows, elapsed = ?started.elapsed(), "File read");
        Ok(())
    }

    fn send_group<'a>(
        &self,
        shared: &WriterShared<'_>,
        tx: &Sender<WorkItem<'a>>,
        file: &Arc<FileContext<'a>>,
        group: &mut Vec<Vec<RowRecord>>,
    ) -> bool {
        let batches = std::mem::replace(group, Vec::with_capacity(BATCH_GROUP_SIZE));
        shared.in_flight.add();
        let sent = self.enqueue(
            tx,
            WorkItem::Group(BatchGroup {
                file: Arc::clone(file),
                batches,
            }),
        );
        if !sent {
            shared.in_flight.done();
        }
        sent
    }

    /// Blocking put that gives up once the job is cancelled
    fn enqueue<'a>(&self, tx: &Sender<WorkItem<'a>>, item: WorkItem<'a>) -> bool {
        let mut item = item;
        loop {
            match tx.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.cancel.is_cancelled() {
                        return false;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    warn!("Writer queue closed");
                    return false;
                }
            }
        }
    }
}
