use std::{process, time::Duration};

use flurfetch_app::catalog::{self, CatalogClient, CatalogRow, CatalogWriter};
use flurfetch_app::cli::{Cli, Commands, ConvertArgs, FetchArgs, GatherArgs};
use flurfetch_app::config;
use flurfetch_app::convert::{self, ConvertOptions};
use flurfetch_app::download::{FetchClient, FetchOptions, FetchPipeline};
use flurfetch_app::error::AppError;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing_subscriber::{filter::LevelFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        // Gather drives a progress bar at verbosity 0, so logs stay off.
        Some(Commands::Gather(_)) => match cli.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        Some(Commands::Fetch(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        Some(Commands::Convert(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        None => LevelFilter::OFF,
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let verbosity = cli.verbose;

    match cli.command {
        Some(Commands::Gather(args)) => {
            run_gather(args, verbosity).await?;
        }
        Some(Commands::Fetch(args)) => {
            run_fetch(args).await?;
        }
        Some(Commands::Convert(args)) => {
            run_convert(args)?;
        }
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}

async fn run_gather(args: GatherArgs, verbosity: u8) -> Result<(), AppError> {
    let config = config::load()?;
    let rate = args.rate.unwrap_or(config.catalog.requests_per_second);

    let client = CatalogClient::new(&args.url, rate)?;
    let mut writer = CatalogWriter::create(&args.output)?;
    let progress = (verbosity == 0).then(|| make_progress_bar(args.count));

    let mut failed = 0u64;
    let mut successes = Vec::new();
    for id in 0..args.count {
        let payload = client.fetch_entry(id).await?;
        let row = CatalogRow::from_response(&payload);
        if row.is_success() {
            if let Some(dir) = &args.dump_dir {
                catalog::dump_response(dir, id, &payload)?;
                successes.push(payload);
            }
        } else {
            failed += 1;
            tracing::warn!(
                id,
                message = catalog::error_message(&payload).unwrap_or("<none>"),
                "catalog lookup failed"
            );
        }
        writer.write(&row)?;

        if let Some(pb) = &progress {
            pb.inc(1);
        }
    }
    writer.finish()?;
    if let Some(dir) = &args.dump_dir {
        catalog::dump_aggregate(dir, &successes)?;
    }

    if let Some(pb) = progress {
        pb.finish_with_message(format!(
            "Completed: {}/{} entries ({} failed)",
            args.count - failed,
            args.count,
            failed
        ));
    } else {
        tracing::info!(
            entries = args.count,
            failed,
            output = %args.output.display(),
            "catalog enumeration completed"
        );
    }

    Ok(())
}

async fn run_fetch(args: FetchArgs) -> Result<(), AppError> {
    let config = config::load()?;
    let fetch = config.fetch;

    let options = FetchOptions::builder()
        .catalog_path(args.catalog)
        .ledger_path(args.ledger)
        .download_dir(args.download_dir)
        .initial_wait_secs(args.initial_wait.unwrap_or(fetch.initial_wait_secs))
        .backoff_multiplier(args.multiplier.unwrap_or(fetch.backoff_multiplier))
        .attempt_ceiling(args.attempt_ceiling.unwrap_or(fetch.attempt_ceiling))
        .chunk_size(args.chunk_size.unwrap_or(fetch.chunk_size))
        .chunk_pause_secs(args.chunk_pause.unwrap_or(fetch.chunk_pause_secs))
        .build();

    let client = FetchClient::new(&args.url)?;
    let summary = FetchPipeline::new(client, options)?.run().await?;

    println!(
        "Completed: {} downloaded, {} failed, {} rejected, {} already done",
        summary.downloaded, summary.failed, summary.rejected, summary.skipped_completed
    );
    Ok(())
}

fn run_convert(args: ConvertArgs) -> Result<(), AppError> {
    let options = ConvertOptions::builder()
        .download_dir(args.download_dir)
        .db_path(args.db)
        .sorted_dir(args.sorted_dir)
        .extract_dir(args.extract_dir)
        .converted_dir(args.converted_dir)
        .ogr2ogr(args.ogr2ogr)
        .build();

    let summary = convert::run(&options)?;
    println!(
        "Completed: {} converted, {} skipped, {} failed of {} archives",
        summary.converted, summary.skipped, summary.failed, summary.processed
    );
    Ok(())
}

fn make_progress_bar(length: u64) -> ProgressBar {
    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {pos}/{len} entries ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(12));
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}
