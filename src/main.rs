use std::fs;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use albumgraph::config;
use albumgraph::driver::{self, RunOptions};

#[derive(Debug, Parser)]
#[command(name = "albumgraph", about = "Indexes a directory of photos and reports duplicates/similars")]
struct Cli {
    /// Verbosity (-v, -vv, -vvv, ...). Default level is info.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    subcommand: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk (or load a cache for) a photo directory and emit a report.
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    /// Root directory to analyse. Must exist and be a directory.
    #[arg(short = 'p', long = "photos-path")]
    photos_path: Utf8PathBuf,

    /// Path to the persistent cache file.
    #[arg(short = 'c', long = "cache-file")]
    cache_file: Option<Utf8PathBuf>,

    /// Include a duplicates section in the report.
    #[arg(short = 'd', long = "analyze-duplicates")]
    analyze_duplicates: bool,

    /// A query image to check for perceptual similarity. Repeatable.
    #[arg(short = 's', long = "check-similars")]
    check_similars: Vec<Utf8PathBuf>,

    /// Report destination; stdout if omitted.
    #[arg(short = 'o', long = "output")]
    output: Option<Utf8PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let conf = config::load().unwrap_or_else(|e| {
        tracing::warn!("failed to load configuration, using defaults: {e:#}");
        config::Configuration::default()
    });

    match cli.subcommand {
        Command::Analyze(args) => run_analyze(args, conf),
    }
}

fn run_analyze(args: AnalyzeArgs, conf: config::Configuration) -> Result<()> {
    let cache_file = args
        .cache_file
        .unwrap_or_else(|| Utf8PathBuf::from(conf.default_cache_file.clone()));

    let opts = RunOptions {
        photos_path: args.photos_path,
        cache_file,
        analyze_duplicates: args.analyze_duplicates,
        check_similars: args.check_similars,
        threads: conf.threads,
        threshold: conf.default_similarity_threshold,
        max_k: albumgraph::similarity::DEFAULT_MAX_K,
    };

    let report = driver::run(opts)?;
    let json = report.to_json_pretty()?;

    match &args.output {
        Some(path) => {
            let mut file = fs::File::create(path)
                .with_context(|| format!("couldn't open {path} for writing"))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("couldn't write report to {path}"))?;
        }
        None => println!("{json}"),
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("couldn't init logging");
}
