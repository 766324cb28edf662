mod archive;
mod bytecode;
mod classfile;
mod constant_pool;
mod ir;
mod jstring;
mod passes;
#[cfg(test)]
mod testing;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;

use crate::archive::{RunSummary, process_archive, process_class_file};
use crate::passes::{LongFoldMode, TransformOptions};

/// CLI arguments for destash execution.
#[derive(Parser, Debug)]
#[command(
    name = "destash",
    about = "Restores constants and strings hidden in static lookup tables of JVM class and JAR files.",
    version
)]
struct Cli {
    /// `.jar`/`.zip` archive or single `.class` file.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
    /// Write a JSON run report; `-` for stdout.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Worker threads used to rewrite classes.
    #[arg(long, value_name = "N")]
    jobs: Option<usize>,
    /// Fold `lconst a; lconst b; l<op>` as `a <op> a`.
    #[arg(long)]
    legacy_long_fold: bool,
    #[arg(long, conflicts_with = "quiet")]
    verbose: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum InputKind {
    Archive,
    Class,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli);
    if let Some(jobs) = cli.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .context("failed to configure worker threads")?;
    }
    run(cli)
}

fn init_logger(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Warn
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::builder()
        .format_timestamp(None)
        .format_target(false)
        .filter_level(level)
        .parse_env(env_logger::Env::default())
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }
    let kind = input_kind(&cli.input)?;
    let options = TransformOptions {
        long_fold: if cli.legacy_long_fold {
            LongFoldMode::Legacy
        } else {
            LongFoldMode::Combine
        },
    };

    let started_at = Instant::now();
    let summary = match kind {
        InputKind::Archive => process_archive(&cli.input, &cli.output, &options)?,
        InputKind::Class => process_class_file(&cli.input, &cli.output, &options)?,
    };

    if let Some(report) = cli.report.as_deref() {
        write_report(report, &summary)?;
    }

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} entries={} classes={}",
            started_at.elapsed().as_millis(),
            summary.totals.entries,
            summary.totals.classes
        );
    }

    Ok(())
}

fn input_kind(path: &Path) -> Result<InputKind> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        "jar" | "zip" => Ok(InputKind::Archive),
        "class" => Ok(InputKind::Class),
        _ => anyhow::bail!("unsupported input file: {}", path.display()),
    }
}

fn write_report(path: &Path, summary: &RunSummary) -> Result<()> {
    let mut writer = output_writer(path)?;
    serde_json::to_writer_pretty(&mut writer, summary)
        .context("failed to serialize run report")?;
    writer
        .write_all(b"\n")
        .context("failed to write run report")?;
    Ok(())
}

fn output_writer(path: &Path) -> Result<Box<dyn Write>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    Ok(Box::new(
        File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
    ))
}
