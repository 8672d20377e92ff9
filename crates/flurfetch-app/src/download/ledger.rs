//! Append-only CSV ledger of terminal download outcomes.
//!
//! The ledger is the authoritative answer to "is this record done": it is
//! read once at startup and appended once per terminal job, which is what
//! makes the whole pipeline idempotent across restarts.

use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use thiserror::Error;
use tracing::debug;

use crate::download::types::{DownloadStatus, LedgerEntry};

#[derive(Debug, Error, Clone)]
pub enum LedgerError {
    #[error("failed to open ledger {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("ledger {path} is malformed: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: Arc<csv::Error>,
    },
}

/// Durable record of outcomes keyed by `(flur, ogc_fid)`.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the `(flur, ogc_fid)` pairs already recorded as `Success`.
    ///
    /// A missing ledger file means no prior completions, not an error.
    pub fn load_completed(&self) -> Result<HashSet<(String, String)>, LedgerError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no ledger yet; starting fresh");
                return Ok(HashSet::new());
            }
            Err(err) => {
                return Err(LedgerError::Open {
                    path: self.path.clone(),
                    source: Arc::new(err),
                });
            }
        };

        let mut reader = csv::Reader::from_reader(file);
        let mut completed = HashSet::new();
        for row in reader.deserialize::<LedgerEntry>() {
            let entry = row.map_err(|err| LedgerError::Csv {
                path: self.path.clone(),
                source: Arc::new(err),
            })?;
            if entry.status == DownloadStatus::Success {
                completed.insert((entry.flur, entry.ogc_fid));
            }
        }
        Ok(completed)
    }

    /// Append one terminal outcome, writing the header first when the
    /// backing file does not exist yet. Rows from earlier runs are never
    /// touched.
    pub fn append(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let write_header = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| LedgerError::Open {
                path: self.path.clone(),
                source: Arc::new(err),
            })?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        writer.serialize(entry).map_err(|err| LedgerError::Csv {
            path: self.path.clone(),
            source: Arc::new(err),
        })?;
        writer.flush().map_err(|err| LedgerError::Csv {
            path: self.path.clone(),
            source: Arc::new(csv::Error::from(err)),
        })?;
        Ok(())
    }
}

/// Local timestamp in the ledger's `%Y-%m-%dT%H-%M-%S` format.
pub fn ledger_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H-%M-%S").to_string()
}
