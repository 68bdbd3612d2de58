//! Per-row side-channel logs
//!
//! One append-only file per source file and category, named
//! `<basename>_<category>.log`. Sinks open lazily and are shared by all writers.

use crate::error::Result;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowCategory {
    Malformed,
    Invalid,
    Unavailable,
    ColumnType,
}

impl RowCategory {
    pub fn name(&self) -> &'static str {
        match self {
            RowCategory::Malformed => "malformed",
            RowCategory::Invalid => "invalid",
            RowCategory::Unavailable => "unavailable",
            RowCategory::ColumnType => "column_type",
        }
    }
}

pub struct RowLogs {
    dir: PathBuf,
    sinks: Mutex<HashMap<(String, RowCategory), BufWriter<File>>>,
}

impl RowLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            sinks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, source: &str, category: RowCategory) -> PathBuf {
        self.dir.join(format!("{}_{}.log", source, category.name()))
    }

    /// Append one line; the literal substring `null` is removed first
    pub fn write(&self, source: &str, category: RowCategory, line: &str) -> Result<()> {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let key = (source.to_string(), category);
        if !sinks.contains_key(&key) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(source, category))?;
            sinks.insert(key.clone(), BufWriter::new(file));
        }
        if let Some(sink) = sinks.get_mut(&key) {
            writeln!(sink, "{}", line.replace("null", ""))?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.values_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}

impl Drop for RowLogs {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Base name used for the log files of a data file
pub fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
