use std::collections::HashSet;
use std::fmt;
use std::io::Write as _;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use stalkr_adapters::{AdapterError, DownloadSink, MetadataProvider, TabularStore};
use stalkr_core::{
    BoundaryRule, Column, DuplicateClassification, GraveyardBoundary, HeaderMap, ProcessingStatus,
    RowState, SheetRow, Snapshot, StructuralError, ARCHIVE_ADVISORY,
};
use stalkr_storage::{Event, EventLog};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::{select_rows, DuplicateIndex};
use crate::config::{HoldBehavior, OperatorContext};
use crate::writer::{EnrichOutcome, MetadataEnricher, StateWriter};
use crate::OperatorPrompt;

pub const PREVIEW_LIMIT: usize = 5;

pub const WHOLE_TABLE_QUESTION: &str = "Graveyard/archive section not found (no repeated header row). Proceed with all rows as research? [y/N]";
pub const BATCH_QUESTION: &str = "Proceed to process these rows? [y/N]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    NonPlatformLink,
    ResearchDuplicate,
    NoLongerEligible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RowOutcome {
    Sent,
    Held,
    Skipped(SkipReason),
    Errored(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub sent: usize,
    pub held: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl PassSummary {
    pub fn record(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::Sent => self.sent += 1,
            RowOutcome::Held => self.held += 1,
            RowOutcome::Skipped(_) => self.skipped += 1,
            RowOutcome::Errored(_) => self.errors += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.sent + self.held + self.skipped + self.errors
    }

    fn event_status(&self) -> &'static str {
        if self.errors == 0 {
            "success"
        } else {
            "partial"
        }
    }

    fn to_event(self, action: &str) -> Event {
        Event::new(action, self.event_status())
            .extra("rows_processed", self.sent)
            .extra("holds", self.held)
            .extra("skipped", self.skipped)
            .extra("errors", self.errors)
    }
}

impl AddAssign for PassSummary {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.held += other.held;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sent, {} held, {} skipped, {} errors.",
            self.sent, self.held, self.skipped, self.errors
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub candidates: Vec<usize>,
    /// Candidates the operator refused at the confirmation gate.
    pub declined: Vec<usize>,
    pub summary: PassSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchReport {
    pub polls: usize,
    pub failed_polls: usize,
    pub totals: PassSummary,
}

/// Reads the tab and builds the typed snapshot, appending any missing appendable
/// column to the remote header first.
pub async fn load_snapshot(store: &dyn TabularStore) -> Result<Snapshot> {
    let rows = store
        .fetch_all_rows()
        .await
        .with_context(|| format!("reading {}", store.describe()))?;
    let first = rows.first().ok_or(StructuralError::EmptySnapshot)?;
    let mut header = HeaderMap::from_header_row(first)?;
    for column in header.missing(&Column::REQUIRED) {
        if !column.is_appendable() {
            return Err(StructuralError::MissingColumn(column.header_name()).into());
        }
        let position = store
            .ensure_column(column.header_name())
            .await
            .with_context(|| format!("appending column '{}'", column.header_name()))?;
        warn!(column = column.header_name(), position, "appended missing column");
        header.insert(column, position.saturating_sub(1));
    }
    Ok(Snapshot::with_header(header, rows)?)
}

/// Detects the archive boundary on every pass. When none exists the operator is asked
/// once whether the whole table is research; the answer holds for the process lifetime.
#[derive(Debug, Clone)]
pub struct BoundaryPolicy {
    rule: BoundaryRule,
    whole_table_confirmed: bool,
}

impl BoundaryPolicy {
    pub fn new(rule: BoundaryRule) -> Self {
        Self {
            rule,
            whole_table_confirmed: false,
        }
    }

    pub async fn resolve(
        &mut self,
        snapshot: &Snapshot,
        prompt: &dyn OperatorPrompt,
    ) -> Result<GraveyardBoundary> {
        if let Some(boundary) = GraveyardBoundary::detect(snapshot.raw_rows(), &self.rule) {
            return Ok(boundary);
        }
        if !self.whole_table_confirmed {
            if !prompt.confirm(WHOLE_TABLE_QUESTION).await {
                bail!("no graveyard boundary found and the operator declined to treat the whole table as research");
            }
            warn!("no graveyard boundary; treating the whole table as research");
            self.whole_table_confirmed = true;
        }
        Ok(GraveyardBoundary::whole_table(snapshot.len()))
    }
}

/// Snapshot-derived state shared by every row of one pass.
pub struct Pass {
    pub run_id: Uuid,
    pub snapshot: Snapshot,
    pub boundary: GraveyardBoundary,
    index: DuplicateIndex,
    writer: StateWriter,
}

pub(crate) fn advance(state: &mut RowState, next: RowState, row_number: usize) {
    if !state.can_transition_to(next) {
        warn!(row = row_number, from = ?*state, to = ?next, "unexpected row state transition");
    }
    *state = next;
}

pub(crate) fn append_event(events: Option<&EventLog>, event: Event) {
    if let Some(log) = events {
        if let Err(err) = log.append(&event) {
            warn!(error = %format!("{err:#}"), action = %event.action, "event log append failed");
        }
    }
}

/// `Row 3: Title | URL: ...` for the first few rows, then `...and N more.`
pub fn preview_lines(snapshot: &Snapshot, indices: &[usize]) -> Vec<String> {
    let mut lines: Vec<String> = indices
        .iter()
        .take(PREVIEW_LIMIT)
        .filter_map(|&idx| snapshot.row(idx))
        .map(row_line)
        .collect();
    if indices.len() > PREVIEW_LIMIT {
        lines.push(format!("...and {} more.", indices.len() - PREVIEW_LIMIT));
    }
    lines
}

fn row_line(row: &SheetRow) -> String {
    format!("Row {}: {} | URL: {}", row.row_number(), row.title, row.url)
}

/// Batch and watcher modes over one shared per-row function.
pub struct Reconciler {
    store: Arc<dyn TabularStore>,
    enricher: MetadataEnricher,
    sink: Arc<dyn DownloadSink>,
    ctx: OperatorContext,
    boundary: BoundaryPolicy,
    events: Option<EventLog>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn TabularStore>,
        provider: Arc<dyn MetadataProvider>,
        sink: Arc<dyn DownloadSink>,
        ctx: OperatorContext,
        rule: BoundaryRule,
    ) -> Self {
        Self {
            store,
            enricher: MetadataEnricher::new(provider),
            sink,
            ctx,
            boundary: BoundaryPolicy::new(rule),
            events: None,
        }
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn context(&self) -> &OperatorContext {
        &self.ctx
    }

    fn log_event(&self, event: Event) {
        append_event(self.events.as_ref(), event);
    }

    pub async fn begin_pass(&mut self, prompt: &dyn OperatorPrompt) -> Result<Pass> {
        let snapshot = load_snapshot(self.store.as_ref()).await?;
        let boundary = self.boundary.resolve(&snapshot, prompt).await?;
        let index = DuplicateIndex::build(&snapshot);
        let writer = StateWriter::new(self.store.clone(), snapshot.header().clone());
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            rows = snapshot.len(),
            boundary = boundary.index(),
            boundary_detected = boundary.was_detected(),
            "snapshot loaded"
        );
        Ok(Pass {
            run_id,
            snapshot,
            boundary,
            index,
            writer,
        })
    }

    /// Eligible indices for this pass; out-of-vocabulary statuses are reported here.
    pub fn eligible(&self, pass: &Pass) -> Vec<usize> {
        let selection = select_rows(&pass.snapshot, &pass.boundary, &self.ctx.normalized_initials);
        for (idx, status) in &selection.unrecognized {
            warn!(row = idx + 1, status = %status, "status outside the known vocabulary; row excluded");
        }
        selection.eligible
    }

    pub async fn process_row(&self, pass: &Pass, index: usize) -> RowOutcome {
        let Some(row) = pass.snapshot.row(index) else {
            return RowOutcome::Skipped(SkipReason::NoLongerEligible);
        };
        let span = info_span!("row", row = row.row_number(), run_id = %pass.run_id);
        self.process_sheet_row(pass, row).instrument(span).await
    }

    async fn process_sheet_row(&self, pass: &Pass, row: &SheetRow) -> RowOutcome {
        let writer = &pass.writer;
        let row_number = row.row_number();
        let mut state = RowState::Unscanned;

        let Some(id) = row.content_id() else {
            advance(&mut state, RowState::NonPlatformLink, row_number);
            if let Err(err) = writer
                .write_status(row, &ProcessingStatus::NonPlatformLink)
                .await
            {
                return self.write_failed(row, err);
            }
            if let Err(err) = writer
                .write_duplicate(row, &DuplicateClassification::None)
                .await
            {
                return self.write_failed(row, err);
            }
            info!(url = %row.url, "skipped non-platform link");
            self.log_event(
                Event::new("skip_non_youtube", "info")
                    .row(row_number)
                    .extra("title", row.title.clone())
                    .extra("url", row.url.clone()),
            );
            return RowOutcome::Skipped(SkipReason::NonPlatformLink);
        };

        let classification = pass.index.resolve(&pass.snapshot, &pass.boundary, row.index);
        if let Err(err) = writer.write_duplicate(row, &classification).await {
            return self.write_failed(row, err);
        }
        match &classification {
            DuplicateClassification::ResearchMatch(_) => {
                advance(&mut state, RowState::ResearchDuplicateSkip, row_number);
                if let Err(err) = writer.write_status(row, &ProcessingStatus::Duplicate).await {
                    return self.write_failed(row, err);
                }
                let info = classification.cell_value();
                warn!(content_id = %id, duplicate = %info, "skipped research duplicate");
                self.log_event(
                    Event::new("skip_duplicate_research", "warning")
                        .row(row_number)
                        .extra("url", row.url.clone())
                        .extra("duplicate_info", info),
                );
                return RowOutcome::Skipped(SkipReason::ResearchDuplicate);
            }
            DuplicateClassification::ArchiveMatch => {
                advance(&mut state, RowState::ArchiveDuplicateProceed, row_number);
                warn!(content_id = %id, advisory = ARCHIVE_ADVISORY, "archive duplicate; proceeding");
                self.log_event(
                    Event::new("duplicate_in_graveyard", "warning")
                        .row(row_number)
                        .extra("url", row.url.clone()),
                );
            }
            DuplicateClassification::None => advance(&mut state, RowState::Ready, row_number),
        }

        let mut display_name = row.title.clone();
        if let EnrichOutcome::Written(metadata) = self.enricher.enrich(writer, row, &id).await {
            display_name = metadata.title;
        }
        if display_name.is_empty() {
            display_name = id.to_string();
        }

        self.log_event(
            Event::new("row_processing_started", "info")
                .row(row_number)
                .extra("title", display_name.clone())
                .extra("url", row.url.clone())
                .extra("user", self.ctx.initials.clone()),
        );

        if self.ctx.hold {
            advance(&mut state, RowState::Held, row_number);
            if self.ctx.hold_behavior == HoldBehavior::WriteStatus {
                if let Err(err) = writer.write_status(row, &ProcessingStatus::Hold).await {
                    return self.write_failed(row, err);
                }
            }
            println!("[HOLD] Would send row {row_number} to JD2: {display_name} | {}", row.url);
            info!(content_id = %id, "held; not dispatched");
            self.log_event(
                Event::new("hold_no_download", "info")
                    .row(row_number)
                    .extra("title", display_name)
                    .extra("url", row.url.clone()),
            );
            return RowOutcome::Held;
        }

        match self
            .sink
            .add_link(&row.url, &display_name, &self.ctx.download_dir)
            .await
        {
            Ok(()) => {
                advance(&mut state, RowState::Sent, row_number);
                self.log_event(
                    Event::new("sent_to_jd2", "success")
                        .row(row_number)
                        .extra("title", display_name.clone())
                        .extra("url", row.url.clone())
                        .extra("user", self.ctx.initials.clone()),
                );
                if let Err(err) = writer.write_status(row, &ProcessingStatus::SentToJd2).await {
                    return self.write_failed(row, err);
                }
                println!("Sent to JD2: {display_name} (row {row_number})");
                info!(content_id = %id, "sent to download sink");
                RowOutcome::Sent
            }
            Err(err) => {
                advance(&mut state, RowState::SendError, row_number);
                let message = err.to_string();
                error!(content_id = %id, error = %message, "download sink rejected link");
                self.log_event(
                    Event::new("send_to_jd2_failed", "error")
                        .row(row_number)
                        .error(message.clone())
                        .extra("title", display_name.clone())
                        .extra("url", row.url.clone()),
                );
                if let Err(write_err) = writer
                    .write_status(row, &ProcessingStatus::error(message.clone()))
                    .await
                {
                    warn!(error = %write_err, "could not record send error in the sheet");
                }
                println!("Error sending row {row_number} to JD2: {display_name} | {message}");
                RowOutcome::Errored(message)
            }
        }
    }

    fn write_failed(&self, row: &SheetRow, err: AdapterError) -> RowOutcome {
        let message = err.to_string();
        error!(row = row.row_number(), error = %message, "sheet write failed");
        self.log_event(
            Event::new("sheet_write_failed", "error")
                .row(row.row_number())
                .error(message.clone()),
        );
        RowOutcome::Errored(message)
    }

    /// One confirmed pass over the current eligible set.
    pub async fn run_batch(
        &mut self,
        prompt: &dyn OperatorPrompt,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BatchReport> {
        let span = info_span!("batch", initials = %self.ctx.initials, hold = self.ctx.hold);
        self.run_batch_inner(prompt, shutdown).instrument(span).await
    }

    async fn run_batch_inner(
        &mut self,
        prompt: &dyn OperatorPrompt,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BatchReport> {
        let pass = self.begin_pass(prompt).await?;
        let candidates = self.eligible(&pass);
        println!(
            "\nBatch mode: {} unprocessed row(s) found for user '{}'",
            candidates.len(),
            self.ctx.initials
        );
        for line in preview_lines(&pass.snapshot, &candidates) {
            println!("  {line}");
        }
        if candidates.is_empty() {
            println!("Nothing to process in batch mode.");
            self.log_event(PassSummary::default().to_event("batch_complete"));
            return Ok(BatchReport::default());
        }
        if !prompt.confirm(BATCH_QUESTION).await {
            println!("Batch mode cancelled by user.");
            self.log_event(Event::new("batch_cancelled", "info"));
            return Ok(BatchReport {
                declined: candidates.clone(),
                candidates,
                summary: PassSummary::default(),
            });
        }

        // The sheet may have changed while the operator read the preview.
        let pass = self.begin_pass(prompt).await?;
        let still_eligible: HashSet<usize> = self.eligible(&pass).into_iter().collect();
        let mut summary = PassSummary::default();
        for &idx in &candidates {
            if *shutdown.borrow() {
                warn!("interrupted; remaining batch rows left untouched");
                break;
            }
            let outcome = if still_eligible.contains(&idx) {
                self.process_row(&pass, idx).await
            } else {
                info!(row = idx + 1, "no longer eligible after confirmation");
                RowOutcome::Skipped(SkipReason::NoLongerEligible)
            };
            summary.record(&outcome);
        }
        self.log_event(summary.to_event("batch_complete"));
        println!("\nBatch summary: {summary}");
        Ok(BatchReport {
            candidates,
            declined: Vec::new(),
            summary,
        })
    }

    /// Processes eligible rows not in `seen`. `None` when nothing new turned up.
    pub async fn poll_once(
        &mut self,
        prompt: &dyn OperatorPrompt,
        seen: &mut HashSet<usize>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<PassSummary>> {
        let pass = self.begin_pass(prompt).await?;
        let new_rows: Vec<usize> = self
            .eligible(&pass)
            .into_iter()
            .filter(|idx| !seen.contains(idx))
            .collect();
        if new_rows.is_empty() {
            return Ok(None);
        }
        println!("\n[Watcher] {} new row(s) found for you!", new_rows.len());
        let mut summary = PassSummary::default();
        for idx in new_rows {
            if *shutdown.borrow() {
                break;
            }
            if let Some(row) = pass.snapshot.row(idx) {
                println!("  {}", row_line(row));
            }
            let outcome = self.process_row(&pass, idx).await;
            seen.insert(idx);
            summary.record(&outcome);
        }
        self.log_event(summary.to_event("watcher_found"));
        println!("[Watcher] Summary: {summary}");
        Ok(Some(summary))
    }

    /// Polls until `shutdown` flips to true. Only the first poll's failure is fatal.
    pub async fn run_watcher(
        &mut self,
        prompt: &dyn OperatorPrompt,
        interval: Duration,
        mut seen: HashSet<usize>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WatchReport> {
        println!(
            "\nEntering watcher mode. Polling for new rows every {} seconds. Ctrl+C to exit.",
            interval.as_secs()
        );
        let mut report = WatchReport::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let span = info_span!("watch_poll", poll = report.polls + 1);
            let result = self
                .poll_once(prompt, &mut seen, &shutdown)
                .instrument(span)
                .await;
            match result {
                Ok(Some(summary)) => report.totals += summary,
                Ok(None) => {
                    print!(".");
                    let _ = std::io::stdout().flush();
                }
                Err(err) if report.polls == 0 => return Err(err.context("first watcher poll")),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "watcher poll failed");
                    report.failed_polls += 1;
                }
            }
            report.polls += 1;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        println!("\nWatcher stopped by user. Exiting.");
        self.log_event(
            Event::new("watcher_stopped", "info")
                .extra("polls", report.polls)
                .extra("rows_processed", report.totals.sent),
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_matches_operator_format() {
        let mut summary = PassSummary::default();
        for outcome in [
            RowOutcome::Sent,
            RowOutcome::Sent,
            RowOutcome::Held,
            RowOutcome::Skipped(SkipReason::NonPlatformLink),
            RowOutcome::Errored("boom".into()),
        ] {
            summary.record(&outcome);
        }
        assert_eq!(summary.to_string(), "2 sent, 1 held, 1 skipped, 1 errors.");
        assert_eq!(summary.total(), 5);
    }

    #[test]
    fn preview_is_capped_at_five_rows() {
        let mut rows = vec![[
            "Researcher Name", "URL", "Title", "User", "date", "duration", "Status", "Duplicate",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()];
        for i in 0..7 {
            let url = format!("https://youtu.be/aaaaaaaaaa{i}");
            let title = format!("clip {i}");
            rows.push(
                ["pm", url.as_str(), title.as_str(), "", "", "", "", ""]
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
            );
        }
        let snapshot = Snapshot::from_rows(rows).unwrap();
        let lines = preview_lines(&snapshot, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "Row 2: clip 0 | URL: https://youtu.be/aaaaaaaaaa0");
        assert_eq!(lines[5], "...and 2 more.");
    }

    #[test]
    fn forward_transitions_keep_state_in_step() {
        let mut state = RowState::Unscanned;
        advance(&mut state, RowState::Ready, 2);
        advance(&mut state, RowState::Sent, 2);
        assert_eq!(state, RowState::Sent);
        advance(&mut state, RowState::Ready, 2);
        assert_eq!(state, RowState::Ready);
    }
}
