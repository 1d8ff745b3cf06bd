//! Renames finished downloads to the archival filename and marks their rows `Renamed`.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use stalkr_adapters::TabularStore;
use stalkr_core::{
    extract_job_number, generate_filename, normalize_token, BoundaryRule, FilenameParts,
    ProcessingStatus, Region, RowState, SheetRow,
};
use stalkr_storage::{DownloadDir, DownloadedFile, Event, EventLog, RenameOutcome};
use strsim::jaro_winkler;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::OperatorContext;
use crate::driver::{advance, append_event, load_snapshot, BoundaryPolicy};
use crate::writer::StateWriter;
use crate::OperatorPrompt;

pub const FUZZY_MATCH_THRESHOLD: f64 = 0.92;
pub const FALLBACK_JOB_NUMBER: &str = "0000";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenameSummary {
    pub renamed: usize,
    pub already_named: usize,
    pub unmatched: usize,
    pub errors: usize,
}

impl fmt::Display for RenameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} renamed, {} already named, {} without a file, {} errors.",
            self.renamed, self.already_named, self.unmatched, self.errors
        )
    }
}

/// Finds the download for a row title: the normalised title contained in the
/// normalised stem, else the closest stem by Jaro-Winkler above the threshold.
pub fn match_download<'a>(
    title: &str,
    files: &'a [DownloadedFile],
    claimed: &HashSet<String>,
) -> Option<&'a DownloadedFile> {
    let wanted = normalize_token(title);
    if wanted.is_empty() {
        return None;
    }
    let candidates = || files.iter().filter(|f| !claimed.contains(&f.file_name));
    if let Some(file) = candidates().find(|f| normalize_token(&f.stem).contains(&wanted)) {
        return Some(file);
    }
    candidates()
        .map(|f| (jaro_winkler(&wanted, &normalize_token(&f.stem)), f))
        .filter(|(score, _)| *score >= FUZZY_MATCH_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, f)| f)
}

/// Row cell first, then the spreadsheet title prefix, then `0000`.
pub fn resolve_job_number(row: &SheetRow, document_title: Option<&str>) -> String {
    row.job_number
        .clone()
        .or_else(|| document_title.and_then(extract_job_number))
        .unwrap_or_else(|| FALLBACK_JOB_NUMBER.to_string())
}

pub struct Renamer {
    store: Arc<dyn TabularStore>,
    ctx: OperatorContext,
    boundary: BoundaryPolicy,
    downloads: DownloadDir,
    events: Option<EventLog>,
}

impl Renamer {
    pub fn new(store: Arc<dyn TabularStore>, ctx: OperatorContext, rule: BoundaryRule) -> Self {
        let downloads = DownloadDir::new(ctx.download_dir.clone());
        Self {
            store,
            ctx,
            boundary: BoundaryPolicy::new(rule),
            downloads,
            events: None,
        }
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn run(&mut self, prompt: &dyn OperatorPrompt) -> Result<RenameSummary> {
        let span = info_span!("rename", initials = %self.ctx.initials);
        self.run_inner(prompt).instrument(span).await
    }

    async fn run_inner(&mut self, prompt: &dyn OperatorPrompt) -> Result<RenameSummary> {
        let snapshot = load_snapshot(self.store.as_ref()).await?;
        let boundary = self.boundary.resolve(&snapshot, prompt).await?;
        let document_title = match self.store.document_title().await {
            Ok(title) => Some(title),
            Err(err) => {
                warn!(error = %err, "could not read spreadsheet title; job number falls back");
                None
            }
        };
        let files = self.downloads.list_completed().await?;
        let writer = StateWriter::new(self.store.clone(), snapshot.header().clone());
        info!(files = files.len(), "scanning downloads");

        let mut claimed = HashSet::new();
        let mut summary = RenameSummary::default();
        let rows = snapshot.rows().iter().filter(|row| {
            boundary.region_of(row.index) == Region::Research
                && row.is_owned_by(&self.ctx.normalized_initials)
                && row.status == ProcessingStatus::SentToJd2
        });
        for row in rows {
            let result = self
                .rename_row(&writer, row, &files, &mut claimed, document_title.as_deref())
                .await;
            match result {
                Ok(Some(RenameOutcome::Renamed)) => summary.renamed += 1,
                Ok(Some(RenameOutcome::AlreadyNamed)) => summary.already_named += 1,
                Ok(None) => {
                    info!(row = row.row_number(), title = %row.title, "no download found yet");
                    summary.unmatched += 1;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(row = row.row_number(), error = %message, "rename failed");
                    append_event(
                        self.events.as_ref(),
                        Event::new("rename_failed", "error")
                            .row(row.row_number())
                            .error(message),
                    );
                    summary.errors += 1;
                }
            }
        }
        append_event(
            self.events.as_ref(),
            Event::new("rename_complete", if summary.errors == 0 { "success" } else { "partial" })
                .extra("renamed", summary.renamed)
                .extra("already_named", summary.already_named)
                .extra("unmatched", summary.unmatched)
                .extra("errors", summary.errors),
        );
        println!("Rename summary: {summary}");
        Ok(summary)
    }

    async fn rename_row(
        &self,
        writer: &StateWriter,
        row: &SheetRow,
        files: &[DownloadedFile],
        claimed: &mut HashSet<String>,
        document_title: Option<&str>,
    ) -> Result<Option<RenameOutcome>> {
        let id = row
            .content_id()
            .ok_or_else(|| anyhow!("row {} has no platform video id", row.row_number()))?;
        let job_number = resolve_job_number(row, document_title);
        let resolution = row
            .resolution
            .clone()
            .unwrap_or_else(|| self.ctx.default_resolution.clone());
        let target_stem = generate_filename(&FilenameParts {
            content_id: id.as_str(),
            channel: &row.channel,
            job_number: &job_number,
            resolution: &resolution,
            researcher_initials: &row.researcher,
            description: &self.ctx.default_description,
        });

        let found = files
            .iter()
            .find(|f| f.stem == target_stem && !claimed.contains(&f.file_name))
            .or_else(|| match_download(&row.title, files, &*claimed));
        let Some(file) = found else {
            return Ok(None);
        };
        claimed.insert(file.file_name.clone());

        let target = if file.extension.is_empty() {
            target_stem
        } else {
            format!("{target_stem}.{}", file.extension)
        };
        let outcome = self.downloads.rename(&file.file_name, &target).await?;

        let mut state = RowState::Sent;
        advance(&mut state, RowState::Renamed, row.row_number());
        writer
            .write_status(row, &ProcessingStatus::Renamed)
            .await
            .with_context(|| format!("marking row {} renamed", row.row_number()))?;
        info!(row = row.row_number(), from = %file.file_name, to = %target, "download renamed");
        append_event(
            self.events.as_ref(),
            Event::new("file_renamed", "success")
                .row(row.row_number())
                .filename(target.clone())
                .extra("original_filename", file.file_name.clone()),
        );
        Ok(Some(outcome))
    }
}
