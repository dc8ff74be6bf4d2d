use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use images_finder::clip::ClipModel;
use images_finder::config::Config;
use images_finder::logging;
use images_finder::pipeline::{IndexingPipeline, PipelineProgress};
use images_finder::query::{QueryEngine, SearchHit};
use images_finder::scanner::ScanCache;

enum Command {
    Scan(PathBuf),
    Embed {
        fresh: bool,
        workers: Option<usize>,
        partition: Option<(usize, usize)>,
    },
    Regenerate,
    Dedup,
    BuildIndex { force: bool },
    SearchText { query: String, k: Option<usize> },
    SearchImage { path: PathBuf, k: Option<usize> },
    Stats,
    Verify,
    Failures,
    Retry(PathBuf),
    InvalidateCache(PathBuf),
}

struct Args {
    config_path: Option<PathBuf>,
    verbose: bool,
    command: Command,
}

fn usage_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    print_help();
    std::process::exit(1);
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut verbose = false;
    let mut positional = Vec::new();
    let mut fresh = false;
    let mut force = false;
    let mut workers = None;
    let mut partition = None;
    let mut k = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("images-finder {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--verbose" | "-v" => verbose = true,
            "--fresh" => fresh = true,
            "--force" => force = true,
            "--config" | "-c" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = Some(PathBuf::from(path)),
                    None => usage_error("--config requires a path argument"),
                }
            }
            "--workers" => {
                i += 1;
                match args.get(i).and_then(|n| n.parse().ok()) {
                    Some(n) => workers = Some(n),
                    None => usage_error("--workers requires a number"),
                }
            }
            "--worker" => {
                i += 1;
                match args.get(i).and_then(|spec| parse_partition(spec)) {
                    Some(p) => partition = Some(p),
                    None => usage_error("--worker expects I/N with I < N"),
                }
            }
            "-k" | "--top" => {
                i += 1;
                match args.get(i).and_then(|n| n.parse().ok()) {
                    Some(n) => k = Some(n),
                    None => usage_error("-k requires a number"),
                }
            }
            arg if arg.starts_with('-') => usage_error(&format!("Unknown argument: {}", arg)),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let Some(name) = positional.next() else {
        usage_error("missing command");
    };
    let mut operand = |what: &str| -> String {
        positional
            .next()
            .unwrap_or_else(|| usage_error(&format!("{} requires {}", name, what)))
    };

    let command = match name.as_str() {
        "scan" => Command::Scan(PathBuf::from(operand("a directory"))),
        "embed" => Command::Embed {
            fresh,
            workers,
            partition,
        },
        "regenerate" => Command::Regenerate,
        "dedup" => Command::Dedup,
        "build-index" => Command::BuildIndex { force },
        "search-text" => Command::SearchText {
            query: operand("a query"),
            k,
        },
        "search-image" => Command::SearchImage {
            path: PathBuf::from(operand("an image path")),
            k,
        },
        "stats" => Command::Stats,
        "verify" => Command::Verify,
        "failures" => Command::Failures,
        "retry" => Command::Retry(PathBuf::from(operand("a path"))),
        "invalidate-cache" => Command::InvalidateCache(PathBuf::from(operand("a directory"))),
        other => usage_error(&format!("Unknown command: {}", other)),
    };

    Args {
        config_path,
        verbose,
        command,
    }
}

/// `"I/N"` with `I < N`.
fn parse_partition(spec: &str) -> Option<(usize, usize)> {
    let (worker, count) = spec.split_once('/')?;
    let worker: usize = worker.trim().parse().ok()?;
    let count: usize = count.trim().parse().ok()?;
    (worker < count).then_some((worker, count))
}

fn print_help() {
    println!(
        r#"images-finder - semantic search over large image collections

USAGE:
    images-finder [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    scan <DIR>                  Discover and register new images
    embed                       Embed unprocessed images
        --fresh                 Restart job counters instead of resuming
        --workers N             Worker threads (default: pipeline.workers)
        --worker I/N            Run only partition I of N, for multi-process runs
    regenerate                  Re-embed every image into its existing slot
    dedup                       Detect near-duplicates by perceptual hash
    build-index [--force]       Build or extend the search index
    search-text <QUERY> [-k N]  Search by text
    search-image <PATH> [-k N]  Search by example image
    stats                       Show pipeline progress
    verify                      Check catalog and store agree
    failures                    List files that failed to process
    retry <PATH>                Clear a failure so the next scan retries it
    invalidate-cache <DIR>      Drop the cached listing of a directory

OPTIONS:
    --config, -c PATH   Path to config file
    --verbose, -v       Log to stderr
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    IMAGES_FINDER_CONFIG    Path to config file (overrides default location)
    IMAGES_FINDER_LOG       Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/images-finder/config.toml"#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    if args.verbose {
        logging::init_stderr();
    } else {
        let _ = logging::init(Some(Config::config_dir().join("logs")));
    }

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match args.command {
        Command::Scan(dir) => {
            let pipeline = open_pipeline(config, false)?;
            let report = pipeline.scan_and_register(&dir)?;
            println!(
                "Discovered {}, registered {}, skipped {}, failed {}",
                report.discovered, report.registered, report.skipped, report.failed
            );
        }
        Command::Embed {
            fresh,
            workers,
            partition,
        } => {
            if let Some(workers) = workers {
                config.pipeline.workers = workers;
            }
            let pipeline = open_pipeline(config, true)?;
            let report = match partition {
                Some((worker, count)) => {
                    pipeline.generate_embeddings_partition(worker, count, !fresh)?
                }
                None => pipeline.generate_embeddings(!fresh)?,
            };
            println!(
                "Embedded {}, failed {}, deferred batches {}",
                report.processed, report.failed, report.deferred_batches
            );
        }
        Command::Regenerate => {
            let report = open_pipeline(config, true)?.regenerate_embeddings()?;
            println!("Regenerated {}, failed {}", report.processed, report.failed);
        }
        Command::Dedup => {
            let report = open_pipeline(config, false)?.detect_duplicates()?;
            println!(
                "Hashed {}, {} duplicates in {} clusters",
                report.hashed, report.duplicates, report.clusters
            );
        }
        Command::BuildIndex { force } => {
            let report = open_pipeline(config, false)?.build_index(force)?;
            println!(
                "{} index with {} vectors ({} added)",
                report.kind, report.vectors, report.added
            );
        }
        Command::SearchText { query, k } => {
            let k = k.unwrap_or(config.search.default_k);
            let engine = open_engine(&config)?;
            print_hits(&engine.search_text(&query, k)?);
        }
        Command::SearchImage { path, k } => {
            let k = k.unwrap_or(config.search.default_k);
            let engine = open_engine(&config)?;
            print_hits(&engine.search_image(&path, k)?);
        }
        Command::Stats => {
            let stats = open_pipeline(config, false)?.stats()?;
            println!("Images:          {}", stats.total);
            println!("Embedded:        {}", stats.processed);
            println!("Unprocessed:     {}", stats.unprocessed);
            println!("Failed:          {}", stats.failed);
            println!("Duplicates:      {}", stats.duplicates);
            println!("Store slots:     {}", stats.store_slots);
            println!("Pending buffers: {}", stats.pending_buffers);
            println!("Index ready:     {}", stats.index_ready);
        }
        Command::Verify => {
            let report = open_pipeline(config, false)?.verify()?;
            println!("Checked {} records", report.records_checked);
            println!("Out of range:  {}", report.out_of_range.len());
            println!("Zero slots:    {}", report.zero_slots.len());
            println!("Shared slots:  {}", report.shared_slots.len());
            println!("Bad norms:     {}", report.bad_norms.len());
            println!("Orphan slots:  {}", report.orphan_slots);
            if !report.is_consistent() {
                bail!(
                    "{} records need regeneration",
                    report.broken_records().len()
                );
            }
        }
        Command::Failures => {
            let pipeline = open_pipeline(config, false)?;
            for failure in pipeline.catalog().failures()? {
                println!(
                    "{}\t{}\t{}",
                    failure.failed_at, failure.file_path, failure.error_message
                );
            }
        }
        Command::Retry(path) => {
            if open_pipeline(config, false)?.retry_failed(&path)? {
                println!("{} will be retried on the next scan", path.display());
            } else {
                println!("{} is not in the failure log", path.display());
            }
        }
        Command::InvalidateCache(dir) => {
            let cache = ScanCache::new(
                config.scanner.cache_dir.clone(),
                std::time::Duration::from_secs(config.scanner.cache_max_age_secs),
            );
            if cache.invalidate(&dir)? {
                println!("Dropped cached listing for {}", dir.display());
            }
        }
    }

    Ok(())
}

/// Open the pipeline with a progress printer, and the CLIP model when the
/// command embeds.
fn open_pipeline(config: Config, with_model: bool) -> Result<IndexingPipeline> {
    let model = with_model.then(|| ClipModel::new(&config.model));
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for progress in rx {
            match progress {
                PipelineProgress::Discovered { files, unseen } => {
                    eprintln!("Found {} images, {} new", files, unseen)
                }
                PipelineProgress::Registered { done, total } => {
                    eprintln!("Registered {}/{}", done, total)
                }
                PipelineProgress::Embedded {
                    worker,
                    processed,
                    failed,
                    total,
                } => eprintln!(
                    "[worker {}] {}/{} embedded, {} failed",
                    worker, processed, total, failed
                ),
                PipelineProgress::Completed { stage } => eprintln!("{} complete", stage),
            }
        }
    });

    let pipeline = IndexingPipeline::new(config)
        .context("Failed to open pipeline")?
        .with_progress(tx);
    match model {
        Some(model) => pipeline.with_model(Box::new(model)),
        None => Ok(pipeline),
    }
}

fn open_engine(config: &Config) -> Result<QueryEngine> {
    QueryEngine::open(config)?.with_model(Box::new(ClipModel::new(&config.model)))
}

fn print_hits(hits: &[SearchHit]) {
    for (rank, hit) in hits.iter().enumerate() {
        let duplicate = match hit.record.duplicate_of {
            Some(canonical) => format!(" (duplicate of {})", canonical),
            None => String::new(),
        };
        println!(
            "{:>3}. {:.4}  {}{}",
            rank + 1,
            hit.score,
            hit.record.file_path,
            duplicate
        );
    }
}
