use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Counters shared by the reader and the writers
#[derive(Debug, Default)]
pub struct LoadStats {
    pub rows_read: AtomicU64,
    pub rows_committed: AtomicU64,
    pub transactions: AtomicU64,
    pub malformed: AtomicU64,
    pub invalid: AtomicU64,
    pub unavailable: AtomicU64,
    pub column_type_errors: AtomicU64,
    pub retries: AtomicU64,
}

impl LoadStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn summary(&self, run_id: Uuid, failed_units: Vec<String>, elapsed: Duration) -> LoadSummary {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LoadSummary {
            run_id,
            rows_read: get(&self.rows_read),
            rows_committed: get(&self.rows_committed),
            transactions: get(&self.transactions),
            malformed: get(&self.malformed),
            invalid: get(&self.invalid),
            unavailable: get(&self.unavailable),
            column_type_errors: get(&self.column_type_errors),
            retries: get(&self.retries),
            failed_units,
            elapsed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub rows_read: u64,
    pub rows_committed: u64,
    pub transactions: u64,
    pub malformed: u64,
    pub invalid: u64,
    pub unavailable: u64,
    pub column_type_errors: u64,
    pub retries: u64,
    /// Units skipped because of configuration errors, with the reason
    pub failed_units: Vec<String>,
    pub elapsed: Duration,
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Load {} finished in {:.2?}", self.run_id, self.elapsed)?;
        writeln!(f, "  rows read:          {}", self.rows_read)?;
        writeln!(f, "  rows committed:     {}", self.rows_committed)?;
        writeln!(f, "  transactions:       {}", self.transactions)?;
        writeln!(f, "  malformed rows:     {}", self.malformed)?;
        writeln!(f, "  invalid rows:       {}", self.invalid)?;
        writeln!(f, "  unavailable rows:   {}", self.unavailable)?;
        writeln!(f, "  column type errors: {}", self.column_type_errors)?;
        write!(f, "  batch retries:      {}", self.retries)?;
        for unit in &self.failed_units {
            write!(f, "\n  skipped unit: {}", unit)?;
        }
        Ok(())
    }
}
