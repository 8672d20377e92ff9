//! HTTP client for the job-based download API: job creation, status
//! probing and archive retrieval.

use std::{path::Path, path::PathBuf, sync::Arc, time::Duration};

use futures_util::StreamExt;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::download::types::{FetchError, JobHandle, LogicalRecord};

const JOB_ENDPOINT: &str = "multi.php";
const DATASET_TYPE: &str = "alkis";

#[derive(Deserialize)]
struct JobCreationResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    id: Option<String>,
}

/// Parsed job status payload.
#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusResponse {
    pub status: String,
    #[serde(rename = "downloadUrl", default)]
    pub download_url: Option<String>,
}

/// Result of one status query. The engine owns the malformed-response
/// transition, so an unparseable body is data here, not an error.
#[derive(Debug, Clone)]
pub enum StatusProbe {
    Parsed(JobStatusResponse),
    Malformed(String),
}

/// Client for the remote download service.
#[derive(Debug, Clone)]
pub struct FetchClient {
    base_url: Url,
    http: Client,
}

impl FetchClient {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let parsed =
            Url::parse(base_url).map_err(|_| FetchError::InvalidBaseUrl(base_url.to_string()))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("flurfetch/0.1")
            .build()
            .map_err(|err| FetchError::request("build_client", err))?;

        Ok(Self {
            base_url: parsed,
            http,
        })
    }

    fn join(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url.join(path).map_err(|err| FetchError::UrlJoin {
            path: path.to_string(),
            source: Arc::new(err),
        })
    }

    /// Ask the remote service to start preparing an archive for `record`.
    ///
    /// A rejection by the service (HTTP error status, `success: false` or a
    /// missing job id) is a soft per-record failure: it is logged and `None`
    /// is returned so the rest of the batch proceeds. Transport failures
    /// propagate, since they signal a systemic problem.
    pub async fn request_job(
        &self,
        record: &LogicalRecord,
        initial_wait_secs: f64,
    ) -> Result<Option<JobHandle>, FetchError> {
        let stage = "job_create";
        let url = self.join(JOB_ENDPOINT)?;

        let response = self
            .http
            .get(url)
            .query(&[
                ("url", format!("{}.xml.gz", record.flur)),
                ("buttonClass", "file1".to_string()),
                ("id", record.ogc_fid.clone()),
                ("type", DATASET_TYPE.to_string()),
                ("action", "start".to_string()),
            ])
            .send()
            .await
            .map_err(|err| FetchError::request(stage, err))?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                stage,
                flur = %record.flur,
                ogc_fid = %record.ogc_fid,
                status = status.as_u16(),
                "job creation rejected with HTTP error; skipping record"
            );
            return Ok(None);
        }

        let payload = response
            .bytes()
            .await
            .map_err(|err| FetchError::body(stage, err))?;
        let creation = serde_json::from_slice::<JobCreationResponse>(&payload)
            .map_err(|err| FetchError::json(stage, err))?;

        match creation {
            JobCreationResponse {
                success: true,
                id: Some(job_id),
            } => {
                info!(
                    flur = %record.flur,
                    ogc_fid = %record.ogc_fid,
                    job_id = %job_id,
                    "received download job id"
                );
                Ok(Some(JobHandle::new(
                    job_id,
                    record.clone(),
                    initial_wait_secs,
                )))
            }
            _ => {
                warn!(
                    stage,
                    flur = %record.flur,
                    ogc_fid = %record.ogc_fid,
                    "remote service declined to create a job; skipping record"
                );
                Ok(None)
            }
        }
    }

    /// Query the status of an in-flight job.
    ///
    /// The upstream occasionally answers with HTML error pages instead of
    /// JSON, so the body is probed rather than decoded strictly; the HTTP
    /// status code is deliberately ignored, matching that failure mode.
    pub async fn probe_status(&self, job_id: &str) -> Result<StatusProbe, FetchError> {
        let stage = "job_status";
        let url = self.join(JOB_ENDPOINT)?;

        let response = self
            .http
            .get(url)
            .query(&[("action", "status"), ("job", job_id)])
            .send()
            .await
            .map_err(|err| FetchError::request(stage, err))?;

        let payload = response
            .bytes()
            .await
            .map_err(|err| FetchError::body(stage, err))?;

        match serde_json::from_slice::<JobStatusResponse>(&payload) {
            Ok(parsed) => Ok(StatusProbe::Parsed(parsed)),
            Err(_) => Ok(StatusProbe::Malformed(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
        }
    }

    /// Stream the finished archive to its deterministic path.
    ///
    /// Writes chunk by chunk and overwrites any previous file of the same
    /// name, so repeating a retrieval after a crash is safe.
    pub async fn retrieve(
        &self,
        download_url: &str,
        record: &LogicalRecord,
        job_id: &str,
        download_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        let stage = "archive_download";
        // join() keeps relative URLs relative to the portal and passes
        // absolute ones through unchanged.
        let url = self.join(download_url)?;
        let target = download_dir.join(archive_file_name(record, job_id));

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::request(stage, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                stage,
                status: status.as_u16(),
            });
        }

        let mut file = File::create(&target).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| FetchError::body(stage, err))?;
            file.write_all(&chunk).await?;
            written += chunk.len();
        }
        file.flush().await?;

        info!(
            job_id,
            flur = %record.flur,
            ogc_fid = %record.ogc_fid,
            bytes = written,
            path = %target.display(),
            "stored archive"
        );
        Ok(target)
    }
}

/// Deterministic archive name for a `(record, job)` pair.
pub fn archive_file_name(record: &LogicalRecord, job_id: &str) -> String {
    format!(
        "ogc_fid-{}_flur-{}_downloadID-{}.zip",
        record.ogc_fid, record.flur, job_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_name_is_deterministic() {
        let record = LogicalRecord::new("12", "7");
        assert_eq!(
            archive_file_name(&record, "100"),
            "ogc_fid-7_flur-12_downloadID-100.zip"
        );
    }

    #[test]
    fn status_payload_tolerates_missing_download_url() {
        let parsed: JobStatusResponse = serde_json::from_str(r#"{"status":"wait"}"#).unwrap();
        assert_eq!(parsed.status, "wait");
        assert!(parsed.download_url.is_none());
    }
}
