use std::path::PathBuf;

use anyhow::{Context, Result};
use binlift_analyzer::BinaryAnalyzer;
use binlift_core::{AnalysisConfig, AnalysisEvent};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Static analysis of native executables and their dependencies
#[derive(Debug, Parser)]
#[command(name = "binlift", version, about, long_about = None)]
struct Cli {
    /// Binary file or application directory to analyze
    #[arg(value_name = "PATH")]
    path: PathBuf,

    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the JSON result here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Do not follow imported libraries
    #[arg(long)]
    no_deps: bool,

    /// Debug-level logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors and skip per-file status lines
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "binlift=debug"
    } else if cli.quiet {
        "binlift=error"
    } else {
        "binlift=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => AnalysisConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AnalysisConfig::default(),
    };
    if cli.no_deps {
        config.dependencies.analyze_dependencies = false;
    }

    let mut analyzer = BinaryAnalyzer::new(config);
    if !cli.quiet {
        analyzer.subscribe(|event| match event {
            AnalysisEvent::FileCompleted {
                path,
                functions,
                strings,
            } => eprintln!(
                "ok      {} ({} functions, {} strings)",
                path.display(),
                functions,
                strings
            ),
            AnalysisEvent::FileFailed {
                path,
                stage,
                message,
            } => eprintln!("failed  {} at {}: {}", path.display(), stage, message),
            _ => {}
        });
    }

    let result = analyzer
        .analyze(&cli.path)
        .with_context(|| format!("analyzing {}", cli.path.display()))?;

    let json = serde_json::to_string_pretty(&result)?;
    match &cli.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", json),
    }
    if !cli.quiet {
        eprint!("{}", result.summary());
    }

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
