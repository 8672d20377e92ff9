//! The resumable job-based download pipeline: ledger, scheduler,
//! job requestor, poll-and-backoff engine and retriever.

pub mod client;
pub mod engine;
pub mod ledger;
pub mod types;

pub use client::{FetchClient, StatusProbe, archive_file_name};
pub use engine::{FetchPipeline, partition};
pub use ledger::{Ledger, LedgerError, ledger_timestamp};
pub use types::{
    DownloadStatus, FetchError, FetchOptions, FetchSummary, JobHandle, LedgerEntry, LogicalRecord,
};
