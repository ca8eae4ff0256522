//! Delimited-text ingestion of the shelter dataset into `SourceRow`s.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use evac_core::{columns, SourceRow};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "evac-adapters";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("File does not exist. Check to make sure the file path to your csv is correct: {}", .0.display())]
    NotFound(PathBuf),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing delimited text: {0}")]
    Csv(#[from] csv::Error),
    #[error("input is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

#[derive(Debug, Clone, Copy)]
pub struct CsvOptions {
    pub delimiter: u8,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

/// A loaded input file: its rows plus a content fingerprint for run reporting.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub sha256: String,
    pub rows: Vec<SourceRow>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Load and validate a shelter file. A missing file or column fails before any row is produced.
pub fn load_source_file(path: impl AsRef<Path>, options: CsvOptions) -> Result<SourceFile, IngestError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(IngestError::NotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rows = read_source_rows(bytes.as_slice(), options)?;
    debug!(path = %path.display(), rows = rows.len(), "loaded source rows");
    Ok(SourceFile {
        path: path.to_path_buf(),
        sha256: sha256_hex(&bytes),
        rows,
    })
}

pub fn read_source_rows<R: Read>(mut reader: R, options: CsvOptions) -> Result<Vec<SourceRow>, IngestError> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).map_err(|source| IngestError::Io {
        path: PathBuf::from("<reader>"),
        source,
    })?;
    let body = raw.strip_prefix(UTF8_BOM).unwrap_or(&raw);

    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .trim(csv::Trim::All)
        .from_reader(body);

    let headers = rdr.headers()?.clone();
    validate_headers(&headers)?;

    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .collect::<SourceRow>(),
        );
    }
    Ok(rows)
}

fn validate_headers(headers: &csv::StringRecord) -> Result<(), IngestError> {
    let missing = columns::REQUIRED
        .iter()
        .filter(|required| !headers.iter().any(|h| h == **required))
        .map(|c| (*c).to_string())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(IngestError::MissingColumns(missing))
    }
}
