//! Tabular Reader
//!
//! Line tokenizer for CSV / TSV data files. Data files are read line by line,
//! so a quoted field cannot span several lines.

use crate::error::{LoaderError, Result};
use csv::ReaderBuilder;
use flate2::read::MultiGzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Column name -> field position
pub type HeaderIndex = HashMap<String, usize>;

/// One tokenized field; `None` for the null tokens `\N` and `null`
pub type Field = Option<String>;

fn tokenize(line: &str, separator: u8) -> std::result::Result<Vec<Field>, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(separator)
        .from_reader(line.as_bytes());

    match rdr.records().next() {
        Some(record) => Ok(record?.iter().map(normalize_null).collect()),
        None => Ok(Vec::new()),
    }
}

fn normalize_null(token: &str) -> Field {
    if token == "\\N" || token.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(token.to_string())
    }
}

/// True when every field that opens with a double quote closes it right
/// before a separator or the end of the line. Quotes inside unquoted fields
/// are literal.
fn well_quoted(line: &str, separator: u8) -> bool {
    let bytes = line.as_bytes();
    let mut i = 0;
    loop {
        if bytes.get(i) == Some(&b'"') {
            i += 1;
            loop {
                match bytes.get(i) {
                    None => return false,
                    Some(b'"') if bytes.get(i + 1) == Some(&b'"') => i += 2,
                    Some(b'"') => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
            match bytes.get(i) {
                None => return true,
                Some(&b) if b == separator => {
                    i += 1;
                    continue;
                }
                Some(_) => return false,
            }
        }
        match bytes[i..].iter().position(|&b| b == separator) {
            Some(pos) => i += pos + 1,
            None => return true,
        }
    }
}

/// Split one line into fields.
///
/// A line with broken quoting, or one the CSV parser rejects, is retried once
/// with every double quote removed. An empty result means the row could not be
/// read at all.
pub fn parse_line(line: &str, separator: char) -> Vec<Field> {
    let Ok(sep) = u8::try_from(separator) else {
        return Vec::new();
    };
    let parsed = if well_quoted(line, sep) {
        tokenize(line, sep).ok()
    } else {
        None
    };
    match parsed {
        Some(fields) => fields,
        None => tokenize(&line.replace('"', ""), sep).unwrap_or_default(),
    }
}

/// Strip quotes and backslashes, then trim
pub fn clean_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| *c != '"' && *c != '\\')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Open a data file, decompressing `.gz` files on the fly
pub fn open_data_file(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)
        .map_err(|e| LoaderError::Csv(format!("cannot open data file {}: {}", path.display(), e)))?;
    let is_gzip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if is_gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read only the first line of a data file and return its cleaned column names
pub fn get_header(path: &Path, separator: char) -> Result<Vec<String>> {
    let mut reader = open_data_file(path)?;
    let mut first = String::new();
    reader.read_line(&mut first)?;
    let first = first.trim_end_matches(['\r', '\n']);
    if first.is_empty() {
        return Err(LoaderError::Csv(format!("data file {} has no header line", path.display())));
    }
    let columns = parse_line(first, separator);
    if columns.is_empty() {
        return Err(LoaderError::Csv(format!(
            "cannot tokenize header of {}",
            path.display()
        )));
    }
    Ok(columns
        .into_iter()
        .map(|c| c.map(|name| clean_token(&name)).unwrap_or_default())
        .collect())
}

pub fn header_index(columns: &[String]) -> HeaderIndex {
    let mut index = HeaderIndex::new();
    for (pos, name) in columns.iter().enumerate() {
        // first occurrence wins for duplicated column names
        index.entry(name.clone()).or_insert(pos);
    }
    index
}
