//! Conversion collaborator: unpack downloaded archives and hand the XML
//! payload to the external `ogr2ogr` converter, then sort its output by
//! attribute.
//!
//! The converter itself is opaque; this module only arranges files around
//! it. A conversion ledger makes the step restart-safe the same way the
//! download ledger does.

use std::{
    collections::HashSet,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use bon::Builder;
use chrono::Local;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Shapefile component extensions emitted by the converter.
const SHAPE_EXTENSIONS: &[&str] = &["shp", "shx", "dbf", "prj", "cpg", "sbn", "sbx"];

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("conversion ledger {path} is malformed: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to read archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("archive {path} contains no .xml.gz payload")]
    MissingPayload { path: PathBuf },
    #[error("converter `{program}` exited with {code:?} for {path}")]
    Converter {
        program: String,
        code: Option<i32>,
        path: PathBuf,
    },
}

fn io_err(path: &Path, source: io::Error) -> ConvertError {
    ConvertError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Options for one conversion run.
#[derive(Debug, Clone, Builder)]
pub struct ConvertOptions {
    #[builder(into)]
    pub download_dir: PathBuf,
    #[builder(into)]
    pub db_path: PathBuf,
    #[builder(into)]
    pub sorted_dir: PathBuf,
    #[builder(into)]
    pub extract_dir: PathBuf,
    #[builder(into)]
    pub converted_dir: PathBuf,
    #[builder(default = "ogr2ogr".to_string(), into)]
    pub ogr2ogr: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertSummary {
    pub processed: usize,
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConvertDbRow {
    status: String,
    target_format: String,
    flur: String,
    ogc_id: String,
    converted_time: String,
}

/// Convert every not-yet-processed archive in the download directory.
///
/// Per-archive problems (bad name, missing payload, converter failure) are
/// logged and counted but do not stop the run.
pub fn run(options: &ConvertOptions) -> Result<ConvertSummary, ConvertError> {
    let processed = load_processed(&options.db_path)?;
    info!(
        processed = processed.len(),
        path = %options.db_path.display(),
        "loaded conversion ledger"
    );

    for dir in [
        &options.extract_dir,
        &options.converted_dir,
        &options.sorted_dir,
    ] {
        fs::create_dir_all(dir).map_err(|err| io_err(dir, err))?;
    }

    let archives = collect_archives(&options.download_dir)?;
    info!(archives = archives.len(), "scanned download directory");

    let mut summary = ConvertSummary::default();
    for archive in archives {
        summary.processed += 1;
        let name = archive
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();

        let Some((ogc_fid, flur)) = parse_archive_name(name) else {
            warn!(archive = %archive.display(), "unrecognized archive name; skipping");
            summary.failed += 1;
            continue;
        };

        if processed.contains(&(flur.clone(), ogc_fid.clone())) {
            info!(flur = %flur, ogc_fid = %ogc_fid, "already converted; skipping");
            summary.skipped += 1;
            continue;
        }

        match convert_archive(options, &archive, &flur, &ogc_fid) {
            Ok(moved) => {
                append_db(&options.db_path, &flur, &ogc_fid)?;
                summary.converted += 1;
                info!(
                    flur = %flur,
                    ogc_fid = %ogc_fid,
                    components = moved,
                    "converted archive"
                );
            }
            Err(err) => {
                warn!(archive = %archive.display(), error = %err, "conversion failed");
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}

/// Parse `(ogc_fid, flur)` back out of the deterministic archive name
/// written by the retriever.
pub fn parse_archive_name(name: &str) -> Option<(String, String)> {
    let rest = name.strip_suffix(".zip")?;
    let rest = rest.strip_prefix("ogc_fid-")?;
    let (ogc_fid, rest) = rest.split_once("_flur-")?;
    let (flur, job_id) = rest.split_once("_downloadID-")?;
    if ogc_fid.is_empty() || flur.is_empty() || job_id.is_empty() {
        return None;
    }
    Some((ogc_fid.to_string(), flur.to_string()))
}

fn convert_archive(
    options: &ConvertOptions,
    archive: &Path,
    flur: &str,
    ogc_fid: &str,
) -> Result<usize, ConvertError> {
    let xml_path = extract_payload(archive, &options.extract_dir)?;
    let out_dir = options
        .converted_dir
        .join(format!("converted_shapes_{flur}_{ogc_fid}"));
    fs::create_dir_all(&out_dir).map_err(|err| io_err(&out_dir, err))?;

    run_converter(&options.ogr2ogr, &xml_path, &out_dir)?;
    sort_components(&out_dir, &options.sorted_dir, flur, ogc_fid)
}

/// Pull the inner `.xml.gz` out of the archive and gunzip it, returning the
/// path of the plain XML file.
fn extract_payload(archive: &Path, extract_dir: &Path) -> Result<PathBuf, ConvertError> {
    let file = File::open(archive).map_err(|err| io_err(archive, err))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|err| ConvertError::Zip {
        path: archive.to_path_buf(),
        source: err,
    })?;

    let index = (0..zip.len())
        .find(|&i| {
            zip.by_index(i)
                .map(|entry| entry.name().ends_with(".xml.gz"))
                .unwrap_or(false)
        })
        .ok_or_else(|| ConvertError::MissingPayload {
            path: archive.to_path_buf(),
        })?;

    let mut entry = zip.by_index(index).map_err(|err| ConvertError::Zip {
        path: archive.to_path_buf(),
        source: err,
    })?;
    let entry_name = Path::new(entry.name())
        .file_name()
        .map(|name| name.to_owned())
        .ok_or_else(|| ConvertError::MissingPayload {
            path: archive.to_path_buf(),
        })?;

    let gz_path = extract_dir.join(&entry_name);
    let mut gz_file = File::create(&gz_path).map_err(|err| io_err(&gz_path, err))?;
    io::copy(&mut entry, &mut gz_file).map_err(|err| io_err(&gz_path, err))?;
    drop(gz_file);

    let xml_path = gz_path.with_extension("");
    let gz_reader = File::open(&gz_path).map_err(|err| io_err(&gz_path, err))?;
    let mut decoder = GzDecoder::new(gz_reader);
    let mut xml_file = File::create(&xml_path).map_err(|err| io_err(&xml_path, err))?;
    io::copy(&mut decoder, &mut xml_file).map_err(|err| io_err(&xml_path, err))?;

    Ok(xml_path)
}

fn run_converter(program: &str, xml_path: &Path, out_dir: &Path) -> Result<(), ConvertError> {
    let status = Command::new(program)
        .arg("-f")
        .arg("ESRI Shapefile")
        .arg(out_dir)
        .arg(xml_path)
        .args(["--config", "OGR2OGR_SKIP_FAILURES", "YES"])
        .args(["--config", "OGR2OGR_WARN_ON_FAILURE", "YES"])
        .stderr(Stdio::null())
        .status()
        .map_err(|err| io_err(Path::new(program), err))?;

    if !status.success() {
        return Err(ConvertError::Converter {
            program: program.to_string(),
            code: status.code(),
            path: xml_path.to_path_buf(),
        });
    }
    Ok(())
}

/// Move every emitted shapefile (plus sidecars) into
/// `sorted/<attribute>/{flur}-{ogc_fid}-{attribute}.<ext>`. Returns the
/// number of moved components.
fn sort_components(
    out_dir: &Path,
    sorted_dir: &Path,
    flur: &str,
    ogc_fid: &str,
) -> Result<usize, ConvertError> {
    let mut moved = 0usize;
    let entries = fs::read_dir(out_dir).map_err(|err| io_err(out_dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| io_err(out_dir, err))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("shp") {
            continue;
        }
        let Some(attribute) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };

        let target_dir = sorted_dir.join(attribute);
        fs::create_dir_all(&target_dir).map_err(|err| io_err(&target_dir, err))?;

        for extension in SHAPE_EXTENSIONS {
            let component = out_dir.join(format!("{attribute}.{extension}"));
            if !component.exists() {
                continue;
            }
            let target = target_dir.join(format!("{flur}-{ogc_fid}-{attribute}.{extension}"));
            fs::rename(&component, &target).map_err(|err| io_err(&component, err))?;
            moved += 1;
        }
    }
    Ok(moved)
}

/// Recursively collect ZIP archives under `dir`.
fn collect_archives(dir: &Path) -> Result<Vec<PathBuf>, ConvertError> {
    let mut archives = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = fs::read_dir(&current).map_err(|err| io_err(&current, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| io_err(&current, err))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|ext| ext.to_str()) == Some("zip") {
                archives.push(path);
            }
        }
    }
    archives.sort();
    Ok(archives)
}

fn load_processed(db_path: &Path) -> Result<HashSet<(String, String)>, ConvertError> {
    let file = match File::open(db_path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(err) => return Err(io_err(db_path, err)),
    };

    let mut reader = csv::Reader::from_reader(file);
    let mut processed = HashSet::new();
    for row in reader.deserialize::<ConvertDbRow>() {
        let row = row.map_err(|err| ConvertError::Csv {
            path: db_path.to_path_buf(),
            source: err,
        })?;
        if row.status == "converted" && row.target_format == "shapes" {
            processed.insert((row.flur, row.ogc_id));
        }
    }
    Ok(processed)
}

fn append_db(db_path: &Path, flur: &str, ogc_fid: &str) -> Result<(), ConvertError> {
    let write_header = !db_path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path)
        .map_err(|err| io_err(db_path, err))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    writer
        .serialize(ConvertDbRow {
            status: "converted".to_string(),
            target_format: "shapes".to_string(),
            flur: flur.to_string(),
            ogc_id: ogc_fid.to_string(),
            converted_time: Local::now().format("%Y%m%d_%H%M%S").to_string(),
        })
        .map_err(|err| ConvertError::Csv {
            path: db_path.to_path_buf(),
            source: err,
        })?;
    writer.flush().map_err(|err| io_err(db_path, err))?;
    Ok(())
}
