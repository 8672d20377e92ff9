//! Catalog enumeration: sequentially query the details endpoint for every
//! record id and flatten the responses into a CSV work list.

use std::{
    fs, io,
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const DETAILS_ENDPOINT: &str = "_ajax/details.php";
const DATASET_TYPE: &str = "alkis";

type GenericRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid base URL `{0}`")]
    InvalidBaseUrl(String),
    #[error("invalid request rate `{0}`; must be positive")]
    InvalidRate(u32),
    #[error("failed to join `{path}` onto base URL: {source}")]
    UrlJoin {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request error for catalog id {id}: {source}")]
    Request {
        id: u64,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected HTTP status {status} for catalog id {id}")]
    HttpStatus { id: u64, status: u16 },
    #[error("JSON decode error for catalog id {id}: {source}")]
    Json {
        id: u64,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One flattened catalog row. Failed lookups keep their row (with empty
/// attribute columns) so the output stays aligned with the id range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub success: String,
    pub status: String,
    pub gemarkung: String,
    pub flur: String,
    pub a_datum: String,
    pub a_datum_dmy: String,
    pub quartal: String,
    pub gemeinde: String,
    pub ogc_fid: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl CatalogRow {
    /// Flatten one details response. The `object` payload mixes strings and
    /// numbers, so every attribute is rendered to text.
    pub fn from_response(payload: &Value) -> Self {
        let success = payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !success {
            return Self {
                success: "false".to_string(),
                status: "false".to_string(),
                ..Self::default()
            };
        }

        let object = payload.get("object");
        let field = |key: &str| -> String {
            object
                .and_then(|obj| obj.get(key))
                .map(render_value)
                .unwrap_or_default()
        };

        Self {
            success: "true".to_string(),
            status: "true".to_string(),
            gemarkung: field("gemarkung"),
            flur: field("flur"),
            a_datum: field("a_datum"),
            a_datum_dmy: field("a_datum_dmy"),
            quartal: field("quartal"),
            gemeinde: field("gemeinde"),
            ogc_fid: field("ogc_fid"),
            kind: field("type"),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success == "true"
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Upstream error message of a failed details response, if any.
pub fn error_message(payload: &Value) -> Option<&str> {
    payload.get("message").and_then(Value::as_str)
}

/// Rate-limited client for the catalog details endpoint.
#[derive(Debug)]
pub struct CatalogClient {
    base_url: Url,
    http: Client,
    rate_limiter: GenericRateLimiter,
}

impl CatalogClient {
    pub fn new(base_url: &str, requests_per_second: u32) -> Result<Self, CatalogError> {
        let parsed =
            Url::parse(base_url).map_err(|_| CatalogError::InvalidBaseUrl(base_url.to_string()))?;
        let rate = NonZeroU32::new(requests_per_second)
            .ok_or(CatalogError::InvalidRate(requests_per_second))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("flurfetch/0.1")
            .build()
            .map_err(|err| CatalogError::Request { id: 0, source: err })?;

        Ok(Self {
            base_url: parsed,
            http,
            rate_limiter: RateLimiter::direct(Quota::per_second(rate)),
        })
    }

    /// Fetch the raw details payload for one catalog id, honoring the
    /// client-side rate cap.
    pub async fn fetch_entry(&self, id: u64) -> Result<Value, CatalogError> {
        self.rate_limiter.until_ready().await;

        let url = self
            .base_url
            .join(DETAILS_ENDPOINT)
            .map_err(|err| CatalogError::UrlJoin {
                path: DETAILS_ENDPOINT.to_string(),
                source: err,
            })?;

        let response = self
            .http
            .get(url)
            .query(&[("type", DATASET_TYPE.to_string()), ("id", id.to_string())])
            .send()
            .await
            .map_err(|err| CatalogError::Request { id, source: err })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::HttpStatus {
                id,
                status: status.as_u16(),
            });
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| CatalogError::Json { id, source: err })?;
        debug!(id, "fetched catalog entry");
        Ok(payload)
    }
}

/// CSV writer for flattened catalog rows. Recreates the file on open, one
/// header row followed by one row per enumerated id.
pub struct CatalogWriter {
    writer: csv::Writer<fs::File>,
    path: PathBuf,
}

impl CatalogWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let file = fs::File::create(&path).map_err(|err| CatalogError::Io {
            path: path.clone(),
            source: err,
        })?;
        Ok(Self {
            writer: csv::Writer::from_writer(file),
            path,
        })
    }

    pub fn write(&mut self, row: &CatalogRow) -> Result<(), CatalogError> {
        self.writer.serialize(row).map_err(|err| CatalogError::Csv {
            path: self.path.clone(),
            source: err,
        })
    }

    pub fn finish(mut self) -> Result<(), CatalogError> {
        self.writer.flush().map_err(|err| CatalogError::Io {
            path: self.path.clone(),
            source: err,
        })
    }
}

/// Dump the accumulated successful payloads as one `responses.json` array
/// under `dir`, next to the per-id files.
pub fn dump_aggregate(dir: &Path, payloads: &[Value]) -> Result<(), CatalogError> {
    fs::create_dir_all(dir).map_err(|err| CatalogError::Io {
        path: dir.to_path_buf(),
        source: err,
    })?;
    let path = dir.join("responses.json");
    let text = serde_json::to_string(payloads).map_err(|err| CatalogError::Io {
        path: path.clone(),
        source: io::Error::new(io::ErrorKind::InvalidData, err),
    })?;
    fs::write(&path, text).map_err(|err| CatalogError::Io { path, source: err })
}

/// Dump one raw details payload as `{id}.json` under `dir`.
pub fn dump_response(dir: &Path, id: u64, payload: &Value) -> Result<(), CatalogError> {
    fs::create_dir_all(dir).map_err(|err| CatalogError::Io {
        path: dir.to_path_buf(),
        source: err,
    })?;
    let path = dir.join(format!("{id}.json"));
    let text = serde_json::to_string(payload).map_err(|err| CatalogError::Io {
        path: path.clone(),
        source: io::Error::new(io::ErrorKind::InvalidData, err),
    })?;
    fs::write(&path, text).map_err(|err| CatalogError::Io { path, source: err })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn successful_response_flattens_all_columns() {
        let payload = json!({
            "success": true,
            "object": {
                "gemarkung": "Testorf",
                "flur": "12",
                "a_datum": "2023-10-01",
                "a_datum_dmy": "01.10.2023",
                "quartal": "Q4 2023",
                "gemeinde": "Kiel",
                "ogc_fid": 7,
                "type": "alkis"
            }
        });

        let row = CatalogRow::from_response(&payload);
        assert!(row.is_success());
        assert_eq!(row.flur, "12");
        assert_eq!(row.ogc_fid, "7");
        assert_eq!(row.gemeinde, "Kiel");
        assert_eq!(row.kind, "alkis");
    }

    #[test]
    fn failed_response_keeps_empty_attribute_columns() {
        let payload = json!({ "success": false, "message": "no such id" });

        let row = CatalogRow::from_response(&payload);
        assert!(!row.is_success());
        assert_eq!(row.status, "false");
        assert_eq!(row.flur, "");
        assert_eq!(row.ogc_fid, "");
        assert_eq!(error_message(&payload), Some("no such id"));
    }

    #[test]
    fn numeric_attributes_are_rendered_to_text() {
        let payload = json!({
            "success": true,
            "object": { "flur": 960, "ogc_fid": 18171 }
        });

        let row = CatalogRow::from_response(&payload);
        assert_eq!(row.flur, "960");
        assert_eq!(row.ogc_fid, "18171");
        assert_eq!(row.gemarkung, "");
    }
}
