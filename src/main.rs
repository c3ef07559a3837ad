//! Gated MapReduce word-count demo
//!
//! Counts the words of a repeated three-sentence corpus and reports how long
//! the pipeline took.

use clap::{Arg, ArgAction, Command};
use gated_mapreduce::{core::Config, system::metrics, MapReduce, Result};
use std::time::Instant;
use tracing::info;

#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

const SENTENCES: &str = "Deer Bear River\nCar Car River\nDeer Car Bear";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("gated-mapreduce")
        .version(gated_mapreduce::VERSION)
        .about("Word count over a synthetic corpus with the gated MapReduce engine.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("N")
                .help("Workers per phase (0 = number of CPUs)")
        )
        .arg(
            Arg::new("repeat")
                .short('r')
                .long("repeat")
                .value_name("N")
                .default_value("500")
                .help("How many times the corpus is repeated")
        )
        .arg(
            Arg::new("gate")
                .long("gate")
                .value_name("KIND")
                .help("Exclusion gate (filter, queue)")
        )
        .arg(
            Arg::new("buckets")
                .long("buckets")
                .value_name("N")
                .help("Bucket count of the shuffle map")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Do not print the counted pairs")
        )
        .arg(
            Arg::new("summary-json")
                .long("summary-json")
                .action(ArgAction::SetTrue)
                .help("Print the run summary as JSON")
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print Prometheus metrics after the run")
        )
        .get_matches();

    // Load configuration
    let mut config = if let Some(config_path) = matches.get_one::<String>("config") {
        let mut config = Config::from_file(config_path)?;
        config.apply_env_overrides()?;
        config
    } else {
        Config::load()?
    };

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    gated_mapreduce::init_with(&config)?;

    let repeat: usize = parse_arg(&matches, "repeat", "repeat count")?.unwrap_or(500);
    let workers = config.optimal_workers();
    let text = vec![SENTENCES; repeat].join("\n");

    let builder = MapReduce::with_input::<String>()
        .with_reader(|input: String| input.split('\n').map(str::to_string).collect::<Vec<_>>())
        .with_mapper(|line: String| {
            line.split(' ').map(|word| (word.to_string(), 1u64)).collect::<Vec<_>>()
        })
        .with_reducer(|_word, counts| counts.into_iter().sum())
        .with_config(&config);

    let builder = if matches.get_flag("quiet") {
        builder.with_writer(|_: &String, _: &u64| {})
    } else {
        builder.with_default_writer()
    };
    let pipeline = builder.build()?;

    info!(
        "Counting words of {} sentences with {} workers ({} gate)",
        repeat * 3,
        workers,
        config.scheduler.gate
    );

    let started = Instant::now();
    let summary = pipeline.run(text, workers).await?;
    let elapsed = started.elapsed();

    println!("Gated MapReduce ran in {}ms", elapsed.as_millis());

    if matches.get_flag("summary-json") {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if matches.get_flag("metrics") {
        print!("{}", metrics::gather_text()?);
    }

    Ok(())
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &clap::ArgMatches) -> Result<()> {
    if let Some(workers) = parse_arg(matches, "workers", "worker count")? {
        config.pipeline.workers = workers;
    }

    if let Some(buckets) = parse_arg(matches, "buckets", "bucket count")? {
        config.pipeline.bucket_count = buckets;
    }

    if let Some(gate) = matches.get_one::<String>("gate") {
        config.scheduler.gate = gate.parse()?;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    Ok(())
}

fn parse_arg(matches: &clap::ArgMatches, id: &str, what: &str) -> Result<Option<usize>> {
    matches
        .get_one::<String>(id)
        .map(|value| {
            value
                .parse()
                .map_err(|e| gated_mapreduce::Error::config(format!("Invalid {}: {}", what, e)))
        })
        .transpose()
}
