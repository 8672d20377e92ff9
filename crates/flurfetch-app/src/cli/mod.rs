use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

pub const DEFAULT_BASE_URL: &str =
    "https://geodaten.schleswig-holstein.de/gaialight-sh/_apps/dladownload/";

/// Total number of catalog ids exposed by the upstream details endpoint.
pub const DEFAULT_CATALOG_COUNT: u64 = 18_172;

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "flurfetch",
    version,
    author,
    about = "ALKIS parcel archive downloader"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            command: None,
            verbose: 0,
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Enumerate the upstream catalog and flatten it into a CSV work list.
    Gather(GatherArgs),
    /// Request, poll and download parcel archives for outstanding records.
    Fetch(FetchArgs),
    /// Convert downloaded archives to shapefiles sorted by attribute.
    Convert(ConvertArgs),
}

/// Enumerate catalog records from the details endpoint.
#[derive(Debug, Args)]
pub struct GatherArgs {
    /// Base URL of the download portal.
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub url: String,
    /// Number of catalog ids to enumerate, starting at 0.
    #[arg(long, default_value_t = DEFAULT_CATALOG_COUNT)]
    pub count: u64,
    /// CSV file receiving one flattened row per catalog id.
    #[arg(long, value_name = "FILE", default_value = "responses.csv")]
    pub output: PathBuf,
    /// Optional directory for raw per-id JSON dumps.
    #[arg(long, value_name = "DIR")]
    pub dump_dir: Option<PathBuf>,
    /// Request rate cap in requests per second (config default: 10).
    #[arg(long)]
    pub rate: Option<u32>,
}

/// Download parcel archives via the asynchronous job API.
#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Base URL of the download portal.
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub url: String,
    /// Catalog CSV produced by `gather` (needs `flur` and `ogc_fid` columns).
    #[arg(long, value_name = "FILE", default_value = "responses.csv")]
    pub catalog: PathBuf,
    /// Append-only ledger of terminal download outcomes.
    #[arg(long, value_name = "FILE", default_value = "download_ids.csv")]
    pub ledger: PathBuf,
    /// Directory receiving the downloaded archives.
    #[arg(long, value_name = "DIR", default_value = "download")]
    pub download_dir: PathBuf,
    /// Initial poll backoff in seconds (config default: 5).
    #[arg(long)]
    pub initial_wait: Option<f64>,
    /// Backoff growth factor applied after every wait (config default: 1.2).
    #[arg(long)]
    pub multiplier: Option<f64>,
    /// Poll attempts per job before the whole run aborts (config default: 50).
    #[arg(long)]
    pub attempt_ceiling: Option<u32>,
    /// Records per batch of simultaneously tracked jobs (config default: 20).
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Pause between batches in seconds (config default: 5).
    #[arg(long)]
    pub chunk_pause: Option<f64>,
}

/// Convert downloaded ZIP archives to attribute-sorted shapefiles.
#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Directory holding the downloaded archives.
    #[arg(long, value_name = "DIR", default_value = "download")]
    pub download_dir: PathBuf,
    /// Append-only ledger of completed conversions.
    #[arg(long, value_name = "FILE", default_value = "convert-db.csv")]
    pub db: PathBuf,
    /// Directory receiving attribute-sorted shapefile components.
    #[arg(long, value_name = "DIR", default_value = "sorted")]
    pub sorted_dir: PathBuf,
    /// Scratch directory for extracted XML payloads.
    #[arg(long, value_name = "DIR", default_value = "extracted")]
    pub extract_dir: PathBuf,
    /// Scratch directory for raw converter output.
    #[arg(long, value_name = "DIR", default_value = "converted")]
    pub converted_dir: PathBuf,
    /// Name or path of the external vector-format converter binary.
    #[arg(long, default_value = "ogr2ogr")]
    pub ogr2ogr: String,
}
