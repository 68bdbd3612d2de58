//! Writer threads: dequeue batch groups, generate statements and commit one
//! transaction per batch.

use crate::config::{GeneratorKind, GeneratorUnit, RetryConfig};
use crate::error::{LoaderError, Result};
use crate::generator::{generate, ColumnTypeIssue, GeneratedStatement, Mutation, RowContext};
use crate::pipeline::cancel::{CancellationToken, POLL_INTERVAL};
use crate::pipeline::row_log::{RowCategory, RowLogs};
use crate::pipeline::summary::LoadStats;
use crate::query::MatchInsertQuery;
use crate::reader::{Field, HeaderIndex};
use crate::store::{Session, StoreResult, WriteTransaction};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, error, warn};

/// Number of batches the reader packs into one queue item
pub const BATCH_GROUP_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct RowRecord {
    pub line_no: usize,
    pub raw: String,
    pub fields: Vec<Field>,
}

/// Everything a writer needs to know about the file a batch came from
#[derive(Debug)]
pub struct FileContext<'a> {
    pub unit: &'a GeneratorUnit,
    pub source: String,
    pub header: HeaderIndex,
}

pub struct BatchGroup<'a> {
    pub file: Arc<FileContext<'a>>,
    pub batches: Vec<Vec<RowRecord>>,
}

pub enum WorkItem<'a> {
    Group(BatchGroup<'a>),
    EndOfStream,
}

/// Count of enqueued groups not yet finished by a writer
#[derive(Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    pub fn add(&self) {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    pub fn done(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until every enqueued group is finished or the job is cancelled
    pub fn wait_idle(&self, cancel: &CancellationToken) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 && !cancel.is_cancelled() {
            count = match self.idle.wait_timeout(count, POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

/// State shared by all writers of one job
pub struct WriterShared<'a> {
    pub session: &'a dyn Session,
    pub cancel: CancellationToken,
    pub logs: &'a RowLogs,
    pub stats: &'a LoadStats,
    pub retry: RetryConfig,
    pub allow_multi_insert: bool,
    pub in_flight: InFlight,
    pub fatal: Mutex<Option<LoaderError>>,
}

impl WriterShared<'_> {
    fn record_fatal(&self, err: LoaderError) {
        let mut slot = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn take_fatal(&self) -> Option<LoaderError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Marks a dequeued group finished, also when the writer unwinds. A panicking
/// writer cancels the job so the reader never waits on its group.
struct GroupFinished<'s, 'a> {
    shared: &'s WriterShared<'a>,
}

impl Drop for GroupFinished<'_, '_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("Writer panicked, stopping the load");
            self.shared
                .record_fatal(LoaderError::Aborted("writer thread panicked".to_string()));
            self.shared.cancel.cancel();
        }
        self.shared.in_flight.done();
    }
}

pub fn run_writer<'a>(shared: &WriterShared<'a>, rx: Receiver<WorkItem<'a>>, tx: Sender<WorkItem<'a>>) {
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(WorkItem::Group(group)) => {
                let result = {
                    let _finished = GroupFinished { shared };
                    process_group(shared, &group)
                };
                if let Err(e) = result {
                    error!(unit = %group.file.unit.key, file = %group.file.source, error = %e, "Writer failed, stopping the load");
                    shared.record_fatal(e);
                    shared.cancel.cancel();
                    // a sibling blocked on the queue must not wait for work that never comes
                    let _ = tx.try_send(WorkItem::EndOfStream);
                    break;
                }
            }
            Ok(WorkItem::EndOfStream) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn process_group(shared: &WriterShared<'_>, group: &BatchGroup<'_>) -> Result<()> {
    let retry_transient = group.file.unit.kind() == GeneratorKind::AppendOrInsert;
    for batch in &group.batches {
        if shared.cancel.is_cancelled() {
            return Ok(());
        }
        let report = if retry_transient {
            write_with_retry(shared, &group.file, batch)?
        } else {
            write_batch(shared, &group.file, batch, false)?
        };
        apply_report(shared, &group.file, report)?;
    }
    Ok(())
}

/// Batch retried as a whole on transient store errors, with exponential backoff
fn write_with_retry(
    shared: &WriterShared<'_>,
    file: &FileContext<'_>,
    batch: &[RowRecord],
) -> Result<BatchReport> {
    let mut attempt = 0u32;
    loop {
        match write_batch(shared, file, batch, true) {
            Ok(report) => return Ok(report),
            Err(e) if e.is_transient() => {
                attempt += 1;
                LoadStats::add(&shared.stats.retries, 1);
                if attempt >= shared.retry.max_attempts {
                    return Err(LoaderError::Aborted(format!(
                        "batch of {} rows from {} still failing after {} attempts: {}",
                        batch.len(),
                        file.source,
                        attempt,
                        e
                    )));
                }
                let delay = shared.retry.delay_for(attempt);
                warn!(unit = %file.unit.key, file = %file.source, attempt, ?delay, error = %e, "Retrying batch");
                if !shared.cancel.sleep(delay) {
                    return Ok(BatchReport::default());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Diagnostics of one batch attempt, applied only once the attempt is final
#[derive(Debug, Default)]
struct BatchReport {
    committed: u64,
    transactions: u64,
    invalid: Vec<(usize, String, String)>,
    unavailable: Vec<String>,
    column_types: Vec<(usize, ColumnTypeIssue)>,
}

fn apply_report(shared: &WriterShared<'_>, file: &FileContext<'_>, report: BatchReport) -> Result<()> {
    let stats = shared.stats;
    LoadStats::add(&stats.rows_committed, report.committed);
    LoadStats::add(&stats.transactions, report.transactions);
    LoadStats::add(&stats.invalid, report.invalid.len() as u64);
    LoadStats::add(&stats.unavailable, report.unavailable.len() as u64);
    LoadStats::add(&stats.column_type_errors, report.column_types.len() as u64);

    for (line_no, raw, reason) in &report.invalid {
        debug!(file = %file.source, line = line_no, reason = %reason, "Invalid row");
        shared.logs.write(&file.source, RowCategory::Invalid, raw)?;
    }
    for raw in &report.unavailable {
        shared.logs.write(&file.source, RowCategory::Unavailable, raw)?;
    }
    for (line_no, issue) in &report.column_types {
        warn!(file = %file.source, line = line_no, "{}", issue);
        shared
            .logs
            .write(&file.source, RowCategory::ColumnType, &format!("line {}: {}", line_no, issue))?;
    }
    Ok(())
}

enum Outcome {
    Written,
    NoMatch,
    Ambiguous(usize),
    NothingToAppend,
}

/// One transaction for the batch. With `retry_transient` any transient error aborts the
/// attempt; otherwise the affected rows are reported unavailable and dropped.
fn write_batch(
    shared: &WriterShared<'_>,
    file: &FileContext<'_>,
    batch: &[RowRecord],
    retry_transient: bool,
) -> StoreResult<BatchReport> {
    let mut report = BatchReport::default();
    let mut tx = match shared.session.write_transaction() {
        Ok(tx) => tx,
        Err(e) if e.is_transient() && !retry_transient => {
            warn!(file = %file.source, error = %e, "Store unavailable, dropping batch");
            report.unavailable = batch.iter().map(|r| r.raw.clone()).collect();
            return Ok(report);
        }
        Err(e) => return Err(e),
    };

    let mut staged: Vec<&RowRecord> = Vec::with_capacity(batch.len());
    for record in batch {
        let row = RowContext::new(&file.source, record.line_no, &record.fields, &file.header);
        let mut issues = Vec::new();
        let statement = generate(&file.unit.definition, &row, &mut issues);
        report
            .column_types
            .extend(issues.into_iter().map(|issue| (record.line_no, issue)));

        if let Some(reason) = statement.invalid_reason() {
            report.invalid.push((record.line_no, record.raw.clone(), reason.to_string()));
            continue;
        }
        match execute(tx.as_mut(), &statement, shared.allow_multi_insert) {
            Ok(Outcome::Written) => staged.push(record),
            Ok(Outcome::NoMatch) => report.invalid.push((
                record.line_no,
                record.raw.clone(),
                format!("no match for: {}", statement.mutation),
            )),
            Ok(Outcome::Ambiguous(answers)) => report.invalid.push((
                record.line_no,
                record.raw.clone(),
                format!("match has {} answers and multi-insert is not allowed", answers),
            )),
            Ok(Outcome::NothingToAppend) => report.invalid.push((
                record.line_no,
                record.raw.clone(),
                "matched thing exists and the row has no ownership to append".to_string(),
            )),
            Err(e) if e.is_transient() && !retry_transient => {
                warn!(file = %file.source, line = record.line_no, error = %e, "Store unavailable, dropping row");
                report.unavailable.push(record.raw.clone());
            }
            Err(e) => return Err(e),
        }
    }

    if staged.is_empty() {
        return Ok(report);
    }
    match tx.commit() {
        Ok(()) => {
            report.committed = staged.len() as u64;
            report.transactions = 1;
        }
        Err(e) if e.is_transient() && !retry_transient => {
            warn!(file = %file.source, rows = staged.len(), error = %e, "Commit failed, dropping batch");
            report.unavailable.extend(staged.iter().map(|r| r.raw.clone()));
        }
        Err(e) => return Err(e),
    }
    Ok(report)
}

fn execute(
    tx: &mut dyn WriteTransaction,
    statement: &GeneratedStatement,
    allow_multi_insert: bool,
) -> StoreResult<Outcome> {
    match &statement.mutation {
        Mutation::Insert(query) => {
            tx.insert(query)?;
            Ok(Outcome::Written)
        }
        Mutation::MatchInsert(query) => guarded_match_insert(tx, query, allow_multi_insert),
        Mutation::AppendOrInsert { append, insert } => {
            if let Some(append) = append {
                if append.insert.is_empty() {
                    // nothing to append: an existing target only blocks the insert
                    if tx.count_matches(&append.matches, 1)? > 0 {
                        return Ok(Outcome::NothingToAppend);
                    }
                } else {
                    match guarded_match_insert(tx, append, allow_multi_insert)? {
                        Outcome::NoMatch => {}
                        decided => return Ok(decided),
                    }
                }
            }
            tx.insert(insert)?;
            Ok(Outcome::Written)
        }
    }
}

fn guarded_match_insert(
    tx: &mut dyn WriteTransaction,
    query: &MatchInsertQuery,
    allow_multi_insert: bool,
) -> StoreResult<Outcome> {
    if !allow_multi_insert {
        match tx.count_matches(&query.matches, 2)? {
            0 => return Ok(Outcome::NoMatch),
            1 => {}
            answers => return Ok(Outcome::Ambiguous(answers)),
        }
    }
    match tx.match_insert(query)? {
        0 => Ok(Outcome::NoMatch),
        _ => Ok(Outcome::Written),
    }
}
