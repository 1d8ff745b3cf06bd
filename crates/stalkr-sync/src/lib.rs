//! Reconciliation engine: row classification, duplicate resolution, state writes,
//! metadata enrichment, batch/watcher driving and download renaming.

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

pub mod check;
pub mod classify;
pub mod config;
pub mod driver;
pub mod rename;
pub mod writer;

pub use check::{check_metadata, check_sheet, CheckResult};
pub use classify::{eligible_rows, select_rows, DuplicateIndex, RowSelection};
pub use config::{ConfigError, HoldBehavior, OperatorContext, Secrets, UserConfig};
pub use driver::{
    load_snapshot, preview_lines, BatchReport, BoundaryPolicy, PassSummary, Reconciler,
    RowOutcome, SkipReason, WatchReport,
};
pub use rename::{RenameSummary, Renamer};
pub use writer::{EnrichOutcome, MetadataEnricher, StateWriter};

pub const CRATE_NAME: &str = "stalkr-sync";

/// Questions the engine needs a human to answer.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    async fn confirm(&self, question: &str) -> bool;

    /// Index into `options`, or `None` to give up.
    async fn choose(&self, question: &str, options: &[String]) -> Option<usize>;
}

/// Fixed answers, recorded for inspection.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answer: bool,
    choice: Option<usize>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            ..Default::default()
        }
    }

    pub fn with_choice(mut self, choice: usize) -> Self {
        self.choice = Some(choice);
        self
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .map(|asked| asked.clone())
            .unwrap_or_default()
    }

    fn record(&self, question: &str) {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(question.to_string());
        }
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn confirm(&self, question: &str) -> bool {
        self.record(question);
        self.answer
    }

    async fn choose(&self, question: &str, _options: &[String]) -> Option<usize> {
        self.record(question);
        self.choice
    }
}

/// Asks the operator for a tab, either because none is configured or because the
/// configured one (`wanted`) does not exist.
pub async fn choose_tab(
    prompt: &dyn OperatorPrompt,
    wanted: Option<&str>,
    available: &[String],
) -> Result<String> {
    let missing = wanted.unwrap_or_default();
    if available.is_empty() {
        bail!("worksheet '{missing}' not found and the spreadsheet lists no tabs");
    }
    let question = match wanted {
        Some(tab) => format!("Worksheet '{tab}' not found. Choose a tab:"),
        None => "No tab configured. Choose a tab:".to_string(),
    };
    match prompt
        .choose(&question, available)
        .await
        .and_then(|idx| available.get(idx))
    {
        Some(tab) => Ok(tab.clone()),
        None => bail!("worksheet '{missing}' not found and no alternative tab was chosen"),
    }
}
