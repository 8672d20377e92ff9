use std::{io, path::PathBuf, sync::Arc};

use bon::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::ParseError;

use crate::download::ledger::LedgerError;

/// One unit of work: a cadastral record identified by its natural key.
///
/// The `(flur, ogc_fid)` pair is unique across the whole pipeline and must
/// never be requested again once a `Success` ledger entry exists for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalRecord {
    pub flur: String,
    pub ogc_fid: String,
}

impl LogicalRecord {
    pub fn new(flur: impl Into<String>, ogc_fid: impl Into<String>) -> Self {
        Self {
            flur: flur.into(),
            ogc_fid: ogc_fid.into(),
        }
    }

    /// Ledger lookup key.
    pub fn key(&self) -> (String, String) {
        (self.flur.clone(), self.ogc_fid.clone())
    }
}

/// One in-flight remote conversion job.
///
/// Attempt count and backoff are owned here rather than in shared counters,
/// so every chunk starts from a clean slate.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub record: LogicalRecord,
    /// Status polls issued so far; monotonically increasing.
    pub attempts: u32,
    /// Current delay before the next poll, grown multiplicatively.
    pub backoff_secs: f64,
}

impl JobHandle {
    pub fn new(job_id: impl Into<String>, record: LogicalRecord, initial_wait_secs: f64) -> Self {
        Self {
            job_id: job_id.into(),
            record,
            attempts: 0,
            backoff_secs: initial_wait_secs,
        }
    }
}

/// Terminal outcome recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Success,
    Failed,
}

/// One durable ledger row per job that reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(rename = "Download ID")]
    pub job_id: String,
    #[serde(rename = "OGC FID")]
    pub ogc_fid: String,
    #[serde(rename = "Flur")]
    pub flur: String,
    #[serde(rename = "Download Status")]
    pub status: DownloadStatus,
    #[serde(rename = "Download Attempts")]
    pub attempts: u32,
    #[serde(rename = "Download Time")]
    pub time: String,
}

/// Options for one fetch run.
#[derive(Debug, Clone, Builder)]
pub struct FetchOptions {
    /// Catalog CSV listing the full work list (`flur`, `ogc_fid` columns).
    #[builder(into)]
    pub catalog_path: PathBuf,
    /// Append-only outcome ledger.
    #[builder(into)]
    pub ledger_path: PathBuf,
    /// Directory receiving retrieved archives.
    #[builder(into)]
    pub download_dir: PathBuf,
    #[builder(default = 5.0)]
    pub initial_wait_secs: f64,
    #[builder(default = 1.2)]
    pub backoff_multiplier: f64,
    #[builder(default = 50)]
    pub attempt_ceiling: u32,
    #[builder(default = 20)]
    pub chunk_size: usize,
    #[builder(default = 5.0)]
    pub chunk_pause_secs: f64,
}

/// Final tally produced by a fetch run.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchSummary {
    /// Records skipped because the ledger already marks them `Success`.
    pub skipped_completed: usize,
    /// Jobs successfully created upstream.
    pub requested: usize,
    /// Job creations rejected by the remote service (soft failures).
    pub rejected: usize,
    /// Archives retrieved and recorded as `Success`.
    pub downloaded: usize,
    /// Jobs that reported a terminal error status, recorded as `Failed`.
    pub failed: usize,
}

/// Error type shared across the download pipeline.
#[derive(Debug, Error, Clone)]
pub enum FetchError {
    #[error("invalid base URL `{0}`")]
    InvalidBaseUrl(String),
    #[error("failed to join `{path}` onto base URL: {source}")]
    UrlJoin {
        path: String,
        #[source]
        source: Arc<ParseError>,
    },
    #[error("request error during `{stage}`: {source}")]
    Request {
        stage: &'static str,
        #[source]
        source: Arc<reqwest::Error>,
    },
    #[error("unexpected HTTP status {status} during `{stage}`")]
    HttpStatus { stage: &'static str, status: u16 },
    #[error("failed to read HTTP body during `{stage}`: {source}")]
    Body {
        stage: &'static str,
        #[source]
        source: Arc<reqwest::Error>,
    },
    #[error("JSON decode error during `{stage}`: {source}")]
    Json {
        stage: &'static str,
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("parse error during `{stage}`: {message}")]
    Parse {
        stage: &'static str,
        message: String,
    },
    #[error("invalid chunk size {0}; must be positive")]
    InvalidChunkSize(usize),
    #[error("invalid backoff multiplier {0}; must be >= 1")]
    InvalidMultiplier(f64),
    #[error("invalid initial wait {0}; must be non-negative")]
    InvalidInitialWait(f64),
    #[error("job `{job_id}` exceeded the attempt ceiling after {attempts} polls; aborting run")]
    AttemptsExhausted { job_id: String, attempts: u32 },
    #[error("failed to read work list {path}: {source}")]
    WorkList {
        path: PathBuf,
        #[source]
        source: Arc<csv::Error>,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("filesystem error: {source}")]
    Io {
        #[from]
        source: Arc<io::Error>,
    },
}

impl From<io::Error> for FetchError {
    fn from(value: io::Error) -> Self {
        Self::Io {
            source: Arc::new(value),
        }
    }
}

impl FetchError {
    pub fn request(stage: &'static str, error: reqwest::Error) -> Self {
        Self::Request {
            stage,
            source: Arc::new(error),
        }
    }

    pub fn body(stage: &'static str, error: reqwest::Error) -> Self {
        Self::Body {
            stage,
            source: Arc::new(error),
        }
    }

    pub fn json(stage: &'static str, error: serde_json::Error) -> Self {
        Self::Json {
            stage,
            source: Arc::new(error),
        }
    }

    pub fn parse(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            stage,
            message: message.into(),
        }
    }
}
