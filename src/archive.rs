use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::classfile::{decode_class, encode_class, looks_like_class};
use crate::passes::{TransformOptions, TransformStats, transform};

/// What happened to one input entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub(crate) enum EntryOutcome {
    /// Rewritten bytes were emitted.
    Transformed { stats: TransformStats },
    /// A class with nothing to rewrite; original bytes were emitted.
    Unchanged,
    /// Not a class; copied as is.
    Copied,
    /// The class could not be decoded; original bytes were emitted.
    Skipped { reason: String },
    /// Rewriting or re-encoding failed; original bytes were emitted.
    Failed { reason: String },
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct EntryReport {
    pub(crate) name: String,
    #[serde(flatten)]
    pub(crate) outcome: EntryOutcome,
}

#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct RunTotals {
    pub(crate) entries: usize,
    pub(crate) classes: usize,
    pub(crate) transformed: usize,
    pub(crate) unchanged: usize,
    pub(crate) copied: usize,
    pub(crate) skipped: usize,
    pub(crate) failed: usize,
    pub(crate) stats: TransformStats,
}

/// Per-entry outcomes of one run, in input order.
#[derive(Clone, Debug, Default, Serialize)]
pub(crate) struct RunSummary {
    pub(crate) entries: Vec<EntryReport>,
    pub(crate) totals: RunTotals,
}

impl RunSummary {
    fn push(&mut self, name: &str, outcome: EntryOutcome) {
        let totals = &mut self.totals;
        totals.entries += 1;
        match &outcome {
            EntryOutcome::Transformed { stats } => {
                totals.classes += 1;
                totals.transformed += 1;
                totals.stats.add(stats);
            }
            EntryOutcome::Unchanged => {
                totals.classes += 1;
                totals.unchanged += 1;
            }
            EntryOutcome::Copied => totals.copied += 1,
            EntryOutcome::Skipped { .. } => {
                totals.classes += 1;
                totals.skipped += 1;
            }
            EntryOutcome::Failed { .. } => {
                totals.classes += 1;
                totals.failed += 1;
            }
        }
        self.entries.push(EntryReport {
            name: name.to_string(),
            outcome,
        });
    }
}

struct ArchiveEntry {
    index: usize,
    name: String,
    data: Vec<u8>,
    is_dir: bool,
    compression: CompressionMethod,
    unix_mode: Option<u32>,
}

/// Decode, rewrite and re-encode one class. Returns new bytes only when a
/// rewrite fired.
pub(crate) fn process_class(
    name: &str,
    data: &[u8],
    options: &TransformOptions,
) -> (EntryOutcome, Option<Vec<u8>>) {
    let mut class = match decode_class(data) {
        Ok(class) => class,
        Err(error) => {
            warn!("skipping {}: {:#}", name, error);
            let reason = format!("{:#}", error);
            return (EntryOutcome::Skipped { reason }, None);
        }
    };
    let stats = match transform(&mut class, options) {
        Ok(stats) => stats,
        Err(error) => {
            warn!("leaving {} unchanged: {}", name, error);
            let reason = error.to_string();
            return (EntryOutcome::Failed { reason }, None);
        }
    };
    if stats.is_empty() {
        debug!("{}: nothing to rewrite", name);
        return (EntryOutcome::Unchanged, None);
    }
    match encode_class(&class) {
        Ok(bytes) => {
            info!(
                "deobfuscated {}: {} folded, {} ints, {} longs, {} strings",
                name,
                stats.folded,
                stats.resolved_ints,
                stats.resolved_longs,
                stats.resolved_strings
            );
            (EntryOutcome::Transformed { stats }, Some(bytes))
        }
        Err(error) => {
            warn!("leaving {} unchanged: failed to encode: {:#}", name, error);
            let reason = format!("{:#}", error);
            (EntryOutcome::Failed { reason }, None)
        }
    }
}

/// Rewrite every class of a jar into a new jar with the same entries in the
/// same order.
pub(crate) fn process_archive(
    input: &Path,
    output: &Path,
    options: &TransformOptions,
) -> Result<RunSummary> {
    let file = File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("failed to read {}", input.display()))?;

    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", input.display()))?;
        let name = entry.name().to_string();
        let is_dir = entry.is_dir();
        let mut data = Vec::new();
        if !is_dir {
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("failed to read {}:{}", input.display(), name))?;
        }
        entries.push(ArchiveEntry {
            index,
            compression: entry.compression(),
            unix_mode: entry.unix_mode(),
            name,
            data,
            is_dir,
        });
    }

    let results: Vec<(EntryOutcome, Option<Vec<u8>>)> = entries
        .par_iter()
        .map(|entry| {
            if !entry.is_dir && looks_like_class(&entry.data) {
                process_class(&entry.name, &entry.data, options)
            } else {
                (EntryOutcome::Copied, None)
            }
        })
        .collect();

    let out = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = ZipWriter::new(BufWriter::new(out));
    let mut summary = RunSummary::default();
    for (entry, (outcome, rewritten)) in entries.iter().zip(results) {
        match &rewritten {
            Some(bytes) => {
                let compression = match entry.compression {
                    CompressionMethod::Stored => CompressionMethod::Stored,
                    _ => CompressionMethod::Deflated,
                };
                let mut file_options =
                    SimpleFileOptions::default().compression_method(compression);
                if let Some(mode) = entry.unix_mode {
                    file_options = file_options.unix_permissions(mode);
                }
                writer
                    .start_file(entry.name.as_str(), file_options)
                    .with_context(|| format!("failed to write {}", entry.name))?;
                writer
                    .write_all(bytes)
                    .with_context(|| format!("failed to write {}", entry.name))?;
            }
            None => {
                let raw = archive
                    .by_index_raw(entry.index)
                    .with_context(|| format!("failed to read {}:{}", input.display(), entry.name))?;
                writer
                    .raw_copy_file(raw)
                    .with_context(|| format!("failed to copy {}", entry.name))?;
            }
        }
        summary.push(&entry.name, outcome);
    }
    writer
        .finish()
        .with_context(|| format!("failed to finish {}", output.display()))?
        .flush()
        .with_context(|| format!("failed to flush {}", output.display()))?;

    info!(
        "wrote {}: deobfuscated {} of {} classes",
        output.display(),
        summary.totals.transformed,
        summary.totals.classes
    );
    Ok(summary)
}

/// Rewrite a single `.class` file.
pub(crate) fn process_class_file(
    input: &Path,
    output: &Path,
    options: &TransformOptions,
) -> Result<RunSummary> {
    let data = fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let name = input.display().to_string();
    let (outcome, rewritten) = if looks_like_class(&data) {
        process_class(&name, &data, options)
    } else {
        warn!("{} is not a class file, copying", name);
        (EntryOutcome::Copied, None)
    };
    fs::write(output, rewritten.as_deref().unwrap_or(&data))
        .with_context(|| format!("failed to write {}", output.display()))?;

    let mut summary = RunSummary::default();
    summary.push(&name, outcome);
    info!(
        "wrote {}: deobfuscated {} of {} classes",
        output.display(),
        summary.totals.transformed,
        summary.totals.classes
    );
    Ok(summary)
}
