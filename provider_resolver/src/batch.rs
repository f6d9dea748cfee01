use anyhow::{Context, Result};
use csv::{Reader, Writer};
use futures::{StreamExt, stream::FuturesUnordered};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::warn;

use crate::error::ResolveError;
use crate::model::{Address, ResolutionQuery};
use crate::pending::{DeferredResolver, PendingReason, ResolutionOutcome};
use crate::resolver::ResolvedBy;

/// One extracted provider per row. Every column is optional.
#[derive(Debug, Default, Deserialize)]
pub struct BatchRow {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub degree: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub npi: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
}

impl BatchRow {
    pub fn into_query(self) -> ResolutionQuery {
        let has_address = [&self.street, &self.city, &self.state, &self.zip_code]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()));
        let location = has_address.then(|| Address {
            street: self.street.unwrap_or_default(),
            city: self.city.unwrap_or_default(),
            state: self.state.unwrap_or_default(),
            zip_code: self.zip_code.unwrap_or_default(),
        });
        ResolutionQuery {
            first_name: self.first_name,
            last_name: self.last_name,
            degree: self.degree,
            email: self.email,
            phone_number: self.phone_number,
            npi: self.npi,
            specialty: self.specialty,
            location,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub resolved: usize,
    pub pending: usize,
    pub invalid: usize,
    /// Rows that could neither resolve nor be queued.
    pub failed: usize,
}

struct RowResult {
    line: usize,
    name: String,
    status: String,
    npi: String,
    resolved_by: String,
    pending_id: String,
    error: String,
}

pub fn read_rows(input_path: &Path) -> Result<Vec<ResolutionQuery>> {
    let mut reader = Reader::from_path(input_path)
        .with_context(|| format!("Failed opening input CSV {}", input_path.display()))?;
    let mut queries = Vec::new();
    for (idx, row) in reader.deserialize::<BatchRow>().enumerate() {
        let row = row.with_context(|| format!("Failed parsing input CSV row {}", idx + 1))?;
        queries.push(row.into_query());
    }
    Ok(queries)
}

/// Resolves every row with at most `concurrency` resolutions in flight and
/// writes one result line per input row, in input order.
pub async fn resolve_batch(
    deferred: &DeferredResolver,
    input_path: &Path,
    output_path: &Path,
    concurrency: usize,
) -> Result<BatchSummary> {
    let queries = read_rows(input_path)?;
    println!(
        "Read {} provider rows from {}",
        queries.len(),
        input_path.display()
    );

    let progress = ProgressBar::new(queries.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [resolve {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
    progress.set_message("starting");

    let mut queue = queries.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    for _ in 0..concurrency.max(1) {
        if let Some((line, query)) = queue.next() {
            in_flight.push(resolve_row(deferred.clone(), line, query));
        }
    }

    let mut summary = BatchSummary::default();
    let mut results = Vec::new();
    while let Some(result) = in_flight.next().await {
        summary.processed += 1;
        match result.status.as_str() {
            "resolved" => summary.resolved += 1,
            "invalid" => summary.invalid += 1,
            "error" => summary.failed += 1,
            _ => summary.pending += 1,
        }
        results.push(result);
        progress.inc(1);
        progress.set_message(format!(
            "resolved={} pending={} invalid={} failed={}",
            summary.resolved, summary.pending, summary.invalid, summary.failed
        ));

        if let Some((line, query)) = queue.next() {
            in_flight.push(resolve_row(deferred.clone(), line, query));
        }
    }
    progress.finish_with_message(format!(
        "done: processed={} resolved={} pending={} invalid={} failed={}",
        summary.processed, summary.resolved, summary.pending, summary.invalid, summary.failed
    ));

    results.sort_by_key(|r| r.line);
    write_results(output_path, &results)?;
    Ok(summary)
}

async fn resolve_row(deferred: DeferredResolver, line: usize, query: ResolutionQuery) -> RowResult {
    let mut result = RowResult {
        line: line + 1,
        name: query.display_name(),
        status: String::new(),
        npi: String::new(),
        resolved_by: String::new(),
        pending_id: String::new(),
        error: String::new(),
    };
    match deferred.resolve_or_defer(&query).await {
        Ok(ResolutionOutcome::Resolved { npi, resolved_by }) => {
            result.status = "resolved".to_string();
            result.npi = npi;
            result.resolved_by = resolved_by_label(resolved_by);
        }
        Ok(ResolutionOutcome::Pending { pending_id, reason }) => {
            result.status = format!("pending_{}", reason.as_str());
            result.pending_id = pending_id.to_string();
            if reason == PendingReason::Ambiguous {
                result.error = "several directory records match".to_string();
            }
        }
        Err(err @ ResolveError::InvalidQuery(_)) => {
            result.status = "invalid".to_string();
            result.error = err.to_string();
        }
        Err(err) => {
            warn!(line = result.line, error = %err, "Row could not be resolved or queued");
            result.status = "error".to_string();
            result.error = err.to_string();
        }
    }
    result
}

fn resolved_by_label(resolved_by: ResolvedBy) -> String {
    match resolved_by {
        ResolvedBy::ProvidedIdentifier => "provided_identifier".to_string(),
        ResolvedBy::DirectoryMatch => "directory_match".to_string(),
        ResolvedBy::Registry(shape) => format!("registry_{}", shape.as_str()),
    }
}

fn write_results(output_path: &Path, results: &[RowResult]) -> Result<()> {
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed creating output directory {}", parent.display())
        })?;
    }

    let file_name = output_path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("resolutions.csv");
    let tmp_path = output_path.with_file_name(format!("{file_name}.tmp"));

    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating temp output CSV {}", tmp_path.display()))?;
    writer
        .write_record([
            "line",
            "name",
            "status",
            "npi",
            "resolved_by",
            "pending_id",
            "error",
        ])
        .context("Failed writing output CSV header")?;
    for r in results {
        let line = r.line.to_string();
        writer
            .write_record([
                line.as_str(),
                r.name.as_str(),
                r.status.as_str(),
                r.npi.as_str(),
                r.resolved_by.as_str(),
                r.pending_id.as_str(),
                r.error.as_str(),
            ])
            .context("Failed writing output CSV row")?;
    }
    writer.flush().context("Failed flushing output CSV writer")?;

    fs::rename(&tmp_path, output_path).with_context(|| {
        format!(
            "Failed moving temp output {} to {}",
            tmp_path.display(),
            output_path.display()
        )
    })?;
    Ok(())
}
