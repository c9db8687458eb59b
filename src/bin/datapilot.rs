//! Thin CLI surface over the orchestration core.
//!
//! Argument parsing and report rendering are external collaborators; this
//! binary exists to exercise [`datapilot_core::DataPilotEngine`] end to end
//! and print its result envelope as JSON.

use std::path::PathBuf;

use clap::Parser;
use datapilot_core::core::artefact::NodeId;
use datapilot_core::core::config::Options;
use datapilot_core::DataPilotEngine;

#[derive(Parser, Debug)]
#[command(name = "datapilot", version = datapilot_core::VERSION, about = "Run DataPilot's orchestration core over a tabular file")]
struct Cli {
    /// Path to the input file (CSV, TSV, JSON/JSONL, XLSX/XLS, or Parquet).
    #[arg(long)]
    file: PathBuf,

    /// Comma-separated section ids to run, e.g. `section1,section3`.
    /// Defaults to all six sections.
    #[arg(long, value_delimiter = ',')]
    sections: Vec<String>,

    /// Optional on-disk cache directory; omit to disable persistence.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Allow parallel execution of nodes within a parallel group.
    #[arg(long)]
    parallel: bool,

    /// Cache memory budget, in megabytes.
    #[arg(long, default_value_t = 512)]
    max_memory_mb: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let requested: Vec<NodeId> = if cli.sections.is_empty() {
        NodeId::ALL.to_vec()
    } else {
        cli.sections
            .iter()
            .filter_map(|s| NodeId::parse(s.trim()))
            .collect()
    };

    let mut options = Options::default();
    options.cache_dir = cli.cache_dir;
    options.parallel = cli.parallel;
    options.cache_memory_limit_bytes = cli.max_memory_mb * 1024 * 1024;

    let engine = match DataPilotEngine::new(&options) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("failed to initialise engine: {err}");
            std::process::exit(1);
        }
    };

    let envelope = engine.run(&cli.file, options, &requested);
    let success = envelope.is_success();
    match serde_json::to_string_pretty(&envelope) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to serialise result envelope: {err}"),
    }

    if !success {
        std::process::exit(1);
    }
}
