//! Batch scheduler and poll-and-backoff engine.
//!
//! Jobs are created one chunk at a time and then polled strictly
//! sequentially to a terminal state; the only suspension points are the
//! backoff sleeps and the inter-chunk pause.

use std::{path::Path, sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::download::{
    client::{FetchClient, StatusProbe},
    ledger::{Ledger, ledger_timestamp},
    types::{
        DownloadStatus, FetchError, FetchOptions, FetchSummary, JobHandle, LedgerEntry,
        LogicalRecord,
    },
};

const STATUS_DONE: &str = "done";
const STATUS_WAIT: &str = "wait";

/// Partition `work` into order-preserving chunks of at most `chunk_size`
/// records. Bounds how many remote jobs are tracked at once. `chunk_size`
/// is validated by `FetchPipeline::new` before it reaches this point.
pub fn partition<T>(work: &[T], chunk_size: usize) -> impl Iterator<Item = &[T]> {
    assert!(chunk_size > 0, "chunk size must be positive");
    work.chunks(chunk_size)
}

/// Next backoff delay after a wait or malformed-response cycle.
fn next_backoff(backoff_secs: f64, multiplier: f64) -> f64 {
    backoff_secs * multiplier
}

/// Terminal outcome of polling one job. Exhaustion is not represented here:
/// it aborts the whole run as `FetchError::AttemptsExhausted`.
#[derive(Debug)]
pub(crate) enum JobOutcome {
    Done { archive: std::path::PathBuf },
    Failed { status: String },
}

#[derive(Debug, Deserialize)]
struct WorkRow {
    flur: String,
    ogc_fid: String,
}

/// The resumable download pipeline.
#[derive(Debug)]
pub struct FetchPipeline {
    client: FetchClient,
    ledger: Ledger,
    options: FetchOptions,
}

impl FetchPipeline {
    /// Build a pipeline, rejecting tuning knobs the polling loop cannot run
    /// with. These values arrive straight from the CLI, so they error like
    /// any other bad input instead of panicking.
    pub fn new(client: FetchClient, options: FetchOptions) -> Result<Self, FetchError> {
        if options.chunk_size == 0 {
            return Err(FetchError::InvalidChunkSize(options.chunk_size));
        }
        if options.backoff_multiplier < 1.0 {
            return Err(FetchError::InvalidMultiplier(options.backoff_multiplier));
        }
        if options.initial_wait_secs < 0.0 {
            return Err(FetchError::InvalidInitialWait(options.initial_wait_secs));
        }
        let ledger = Ledger::new(&options.ledger_path);
        Ok(Self {
            client,
            ledger,
            options,
        })
    }

    /// Run the pipeline over every catalog record not yet marked `Success`.
    pub async fn run(&self) -> Result<FetchSummary, FetchError> {
        let completed = self.ledger.load_completed()?;
        info!(
            completed = completed.len(),
            path = %self.ledger.path().display(),
            "loaded download ledger"
        );

        let all = load_work_list(&self.options.catalog_path)?;
        let total = all.len();
        let work: Vec<LogicalRecord> = all
            .into_iter()
            .filter(|record| !completed.contains(&record.key()))
            .collect();
        let mut summary = FetchSummary {
            skipped_completed: total - work.len(),
            ..FetchSummary::default()
        };
        info!(
            outstanding = work.len(),
            skipped = summary.skipped_completed,
            "filtered work list against ledger"
        );

        tokio::fs::create_dir_all(&self.options.download_dir).await?;

        let total_chunks = work.len().div_ceil(self.options.chunk_size);
        for (index, chunk) in partition(&work, self.options.chunk_size).enumerate() {
            info!(
                chunk = index + 1,
                total_chunks,
                records = chunk.len(),
                "processing chunk"
            );
            self.run_chunk(chunk, &mut summary).await?;

            if index + 1 < total_chunks && self.options.chunk_pause_secs > 0.0 {
                info!(
                    pause_secs = self.options.chunk_pause_secs,
                    "pausing before next chunk"
                );
                sleep(Duration::from_secs_f64(self.options.chunk_pause_secs)).await;
            }
        }

        Ok(summary)
    }

    /// Create every job of the chunk in one pass, then poll each to a
    /// terminal state in request order.
    async fn run_chunk(
        &self,
        chunk: &[LogicalRecord],
        summary: &mut FetchSummary,
    ) -> Result<(), FetchError> {
        let mut handles = Vec::with_capacity(chunk.len());
        for record in chunk {
            info!(
                flur = %record.flur,
                ogc_fid = %record.ogc_fid,
                "requesting download job"
            );
            match self
                .client
                .request_job(record, self.options.initial_wait_secs)
                .await?
            {
                Some(handle) => {
                    summary.requested += 1;
                    handles.push(handle);
                }
                None => summary.rejected += 1,
            }
        }

        for mut handle in handles {
            let outcome = self.poll_job(&mut handle).await?;
            let (status, detail) = match &outcome {
                JobOutcome::Done { archive } => {
                    summary.downloaded += 1;
                    (DownloadStatus::Success, archive.display().to_string())
                }
                JobOutcome::Failed { status } => {
                    summary.failed += 1;
                    (DownloadStatus::Failed, status.clone())
                }
            };
            self.ledger.append(&LedgerEntry {
                job_id: handle.job_id.clone(),
                ogc_fid: handle.record.ogc_fid.clone(),
                flur: handle.record.flur.clone(),
                status,
                attempts: handle.attempts,
                time: ledger_timestamp(),
            })?;
            info!(
                job_id = %handle.job_id,
                attempts = handle.attempts,
                ?status,
                detail = %detail,
                "recorded terminal outcome"
            );
        }

        Ok(())
    }

    /// Poll one job until it reaches a terminal state.
    ///
    /// Bounded iteration: each pass consumes one attempt, and crossing the
    /// ceiling aborts the entire run rather than skipping the job, since
    /// repeated exhaustion signals the service itself is down.
    async fn poll_job(&self, handle: &mut JobHandle) -> Result<JobOutcome, FetchError> {
        loop {
            handle.attempts += 1;
            if handle.attempts > self.options.attempt_ceiling {
                error!(
                    job_id = %handle.job_id,
                    attempts = handle.attempts,
                    ceiling = self.options.attempt_ceiling,
                    "attempt ceiling exceeded; aborting the whole run"
                );
                return Err(FetchError::AttemptsExhausted {
                    job_id: handle.job_id.clone(),
                    attempts: handle.attempts,
                });
            }

            info!(
                job_id = %handle.job_id,
                attempt = handle.attempts,
                "checking job status"
            );

            match self.client.probe_status(&handle.job_id).await? {
                StatusProbe::Malformed(raw) => {
                    warn!(
                        job_id = %handle.job_id,
                        body = %raw,
                        "unparseable status response; backing off and retrying"
                    );
                    self.back_off(handle).await;
                }
                StatusProbe::Parsed(status) => match status.status.as_str() {
                    STATUS_DONE => {
                        let url = status.download_url.ok_or_else(|| {
                            FetchError::parse("job_status", "done response without downloadUrl")
                        })?;
                        info!(job_id = %handle.job_id, "job done; retrieving archive");
                        let archive = self
                            .client
                            .retrieve(
                                &url,
                                &handle.record,
                                &handle.job_id,
                                &self.options.download_dir,
                            )
                            .await?;
                        return Ok(JobOutcome::Done { archive });
                    }
                    STATUS_WAIT => {
                        info!(
                            job_id = %handle.job_id,
                            wait_secs = handle.backoff_secs,
                            "job not ready; waiting"
                        );
                        self.back_off(handle).await;
                    }
                    other => {
                        warn!(
                            job_id = %handle.job_id,
                            status = other,
                            "job reported an unrecognized status; recording failure"
                        );
                        return Ok(JobOutcome::Failed {
                            status: other.to_string(),
                        });
                    }
                },
            }
        }
    }

    /// Sleep for the current backoff, then grow it. Backoff state lives in
    /// the handle, so a fresh chunk always starts at the initial value.
    async fn back_off(&self, handle: &mut JobHandle) {
        sleep(Duration::from_secs_f64(handle.backoff_secs)).await;
        handle.backoff_secs = next_backoff(handle.backoff_secs, self.options.backoff_multiplier);
    }
}

/// Read the outstanding work list from the catalog CSV. Rows without both
/// keys (failed catalog lookups) are skipped.
fn load_work_list(path: &Path) -> Result<Vec<LogicalRecord>, FetchError> {
    let mut reader = csv::Reader::from_path(path).map_err(|err| FetchError::WorkList {
        path: path.to_path_buf(),
        source: Arc::new(err),
    })?;

    let mut records = Vec::new();
    for row in reader.deserialize::<WorkRow>() {
        let row = row.map_err(|err| FetchError::WorkList {
            path: path.to_path_buf(),
            source: Arc::new(err),
        })?;
        if row.flur.is_empty() || row.ogc_fid.is_empty() {
            continue;
        }
        records.push(LogicalRecord::new(row.flur, row.ogc_fid));
    }
    Ok(records)
}
