use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use stalkr_adapters::{
    load_sheet_fixture, AdapterError, DownloadSink, MemoryStore, RecordingSink,
    StaticMetadataProvider, VideoMetadata,
};
use stalkr_core::{BoundaryRule, ARCHIVE_ADVISORY};
use stalkr_storage::EventLog;
use stalkr_sync::{
    HoldBehavior, OperatorContext, OperatorPrompt, PassSummary, Reconciler, ScriptedPrompt,
};
use tokio::sync::watch;

const HEADER: [&str; 8] = [
    "Researcher Name",
    "URL",
    "Title",
    "User",
    "date",
    "duration",
    "Status",
    "Duplicate",
];
const STATUS: usize = 7;
const DUPLICATE: usize = 8;

const RICK: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
const GANGNAM: &str = "https://youtu.be/9bZkp7q19f0";
const DESPACITO: &str = "https://www.youtube.com/shorts/kJQP7kiw5Fk";

fn header() -> Vec<String> {
    HEADER.iter().map(|c| c.to_string()).collect()
}

fn row(researcher: &str, url: &str, title: &str, status: &str) -> Vec<String> {
    [researcher, url, title, "", "", "", status, ""]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn running() -> watch::Receiver<bool> {
    watch::channel(false).1
}

struct Harness {
    store: Arc<MemoryStore>,
    provider: Arc<StaticMetadataProvider>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(rows: Vec<Vec<String>>) -> Self {
        Self::with(MemoryStore::new(rows), StaticMetadataProvider::new(), RecordingSink::new())
    }

    fn with(store: MemoryStore, provider: StaticMetadataProvider, sink: RecordingSink) -> Self {
        Self {
            store: Arc::new(store),
            provider: Arc::new(provider),
            sink: Arc::new(sink),
        }
    }

    fn reconciler(&self, ctx: OperatorContext) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.provider.clone(),
            self.sink.clone(),
            ctx,
            BoundaryRule::default(),
        )
    }
}

fn operator() -> OperatorContext {
    OperatorContext::new("PM", "/data/downloads")
}

#[tokio::test]
async fn non_platform_links_never_reach_the_sink() {
    let h = Harness::new(vec![
        header(),
        row("pm", "https://example.com/abc", "Not a video", ""),
        header(),
    ]);
    let mut reconciler = h.reconciler(operator());
    let report = reconciler
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    assert_eq!(report.summary.skipped, 1);
    assert!(h.sink.calls().await.is_empty());
    assert_eq!(h.store.cell(2, STATUS).await, "Non-YouTube link");
    assert_eq!(h.store.cell(2, DUPLICATE).await, "");
}

#[tokio::test]
async fn hold_mode_writes_hold_and_never_dispatches() {
    let h = Harness::new(vec![
        header(),
        row("pm", RICK, "Rick", ""),
        row("pm", GANGNAM, "Gangnam", "TODO"),
        header(),
    ]);
    let ctx = operator().with_hold(true, HoldBehavior::WriteStatus);
    let report = h
        .reconciler(ctx)
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    assert_eq!(report.summary.held, 2);
    assert!(h.sink.calls().await.is_empty());
    assert_eq!(h.store.cell(2, STATUS).await, "Hold");
    assert_eq!(h.store.cell(3, STATUS).await, "Hold");
}

#[tokio::test]
async fn log_only_hold_leaves_the_sheet_alone() {
    let h = Harness::new(vec![header(), row("pm", RICK, "Rick", ""), header()]);
    let ctx = operator().with_hold(true, HoldBehavior::LogOnly);
    let report = h
        .reconciler(ctx)
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    assert_eq!(report.summary.held, 1);
    assert!(h.sink.calls().await.is_empty());
    assert!(h.store.writes().await.is_empty());
}

#[tokio::test]
async fn research_duplicates_are_blocked_and_described() {
    let h = Harness::new(vec![
        header(),
        row("jd", "https://youtu.be/dQw4w9WgXcQ", "Rick", "Sent to JD2"),
        row("pm", RICK, "Rick again", ""),
        header(),
    ]);
    let report = h
        .reconciler(operator())
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    assert_eq!(report.summary.skipped, 1);
    assert!(h.sink.calls().await.is_empty());
    assert_eq!(h.store.cell(3, STATUS).await, "DUPLICATE");
    assert_eq!(
        h.store.cell(3, DUPLICATE).await,
        "Duplicate of row 2 (jd, Sent to JD2)"
    );
}

#[tokio::test]
async fn archive_duplicates_proceed_with_advisory() {
    let h = Harness::new(vec![
        header(),
        row("pm", RICK, "Rick", ""),
        row("jd", RICK, "Rick", ""),
        header(),
        row("old", "https://youtu.be/dQw4w9WgXcQ", "Rick", "Renamed"),
    ]);
    let report = h
        .reconciler(operator())
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    assert_eq!(report.summary.sent, 1);
    let calls = h.sink.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, RICK);
    assert_eq!(calls[0].destination_dir, PathBuf::from("/data/downloads"));
    assert_eq!(h.store.cell(2, DUPLICATE).await, ARCHIVE_ADVISORY);
    assert_eq!(h.store.cell(2, STATUS).await, "Sent to JD2");
    assert_eq!(h.store.cell(3, STATUS).await, "");
}

#[tokio::test]
async fn send_failures_are_isolated_per_row() {
    let h = Harness::with(
        MemoryStore::new(vec![
            header(),
            row("pm", RICK, "Rick", ""),
            row("pm", GANGNAM, "Gangnam", ""),
            header(),
        ]),
        StaticMetadataProvider::new(),
        RecordingSink::failing("connection refused"),
    );
    let report = h
        .reconciler(operator())
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch completes");

    assert_eq!(
        report.summary,
        PassSummary {
            sent: 0,
            held: 0,
            skipped: 0,
            errors: 2,
        }
    );
    assert_eq!(h.sink.calls().await.len(), 2);
    assert_eq!(h.store.cell(2, STATUS).await, "ERROR: connection refused");
    assert_eq!(h.store.cell(3, STATUS).await, "ERROR: connection refused");
}

#[tokio::test]
async fn enrichment_fills_blank_titles_and_names_the_package() {
    let h = Harness::with(
        MemoryStore::new(vec![header(), row("pm", RICK, "", ""), header()]),
        StaticMetadataProvider::new().with_video(
            "dQw4w9WgXcQ",
            VideoMetadata {
                title: "Never Gonna Give You Up".into(),
                channel: "Rick Astley".into(),
                published_date: "2009-10-25".into(),
                duration: "03:33".into(),
            },
        ),
        RecordingSink::new(),
    );
    h.reconciler(operator())
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    assert_eq!(h.store.cell(2, 3).await, "Never Gonna Give You Up");
    assert_eq!(h.store.cell(2, 6).await, "03:33");
    assert_eq!(h.sink.calls().await[0].display_name, "Never Gonna Give You Up");
}

/// Records sends, and Ctrl+C arrives while the first link is being queued.
struct InterruptedDuringFirstSend {
    sent: RecordingSink,
    shutdown: watch::Sender<bool>,
}

#[async_trait]
impl DownloadSink for InterruptedDuringFirstSend {
    async fn add_link(
        &self,
        url: &str,
        display_name: &str,
        destination_dir: &Path,
    ) -> Result<(), AdapterError> {
        let result = self.sent.add_link(url, display_name, destination_dir).await;
        let _ = self.shutdown.send(true);
        result
    }
}

#[tokio::test]
async fn interrupted_batch_leaves_remaining_rows_untouched() {
    let store = Arc::new(MemoryStore::new(vec![
        header(),
        row("pm", RICK, "Rick", ""),
        row("pm", GANGNAM, "Gangnam", ""),
        row("pm", DESPACITO, "Despacito", "TODO"),
        header(),
    ]));
    let (tx, shutdown) = watch::channel(false);
    let sink = Arc::new(InterruptedDuringFirstSend {
        sent: RecordingSink::new(),
        shutdown: tx,
    });
    let mut reconciler = Reconciler::new(
        store.clone(),
        Arc::new(StaticMetadataProvider::new()),
        sink.clone(),
        operator(),
        BoundaryRule::default(),
    );
    let report = reconciler
        .run_batch(&ScriptedPrompt::new(true), &shutdown)
        .await
        .expect("batch");

    assert_eq!(report.candidates, vec![1, 2, 3]);
    assert_eq!(report.summary.sent, 1);
    assert_eq!(report.summary.total(), 1);
    let calls = sink.sent.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, RICK);

    assert_eq!(store.cell(2, STATUS).await, "Sent to JD2");
    assert_eq!(store.cell(3, STATUS).await, "");
    assert_eq!(store.cell(4, STATUS).await, "TODO");
    assert!(store.writes().await.iter().all(|w| w.row == 2));
}

#[tokio::test]
async fn declined_batch_mutates_nothing() {
    let h = Harness::new(vec![header(), row("pm", RICK, "Rick", ""), header()]);
    let prompt = ScriptedPrompt::new(false);
    let report = h
        .reconciler(operator())
        .run_batch(&prompt, &running())
        .await
        .expect("batch");

    assert_eq!(report.declined, vec![1]);
    assert_eq!(report.summary.total(), 0);
    assert!(h.store.writes().await.is_empty());
    assert!(h.sink.calls().await.is_empty());
    assert_eq!(prompt.asked(), vec!["Proceed to process these rows? [y/N]"]);
}

/// Confirms, but a colleague claims a row while the preview is on screen.
struct ColleagueEditsDuringPrompt {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl OperatorPrompt for ColleagueEditsDuringPrompt {
    async fn confirm(&self, _question: &str) -> bool {
        self.store.edit_cell(3, STATUS, "Sent to JD2").await;
        true
    }

    async fn choose(&self, _question: &str, _options: &[String]) -> Option<usize> {
        None
    }
}

#[tokio::test]
async fn rows_claimed_after_the_preview_are_skipped() {
    let h = Harness::new(vec![
        header(),
        row("pm", RICK, "Rick", ""),
        row("pm", GANGNAM, "Gangnam", ""),
        header(),
    ]);
    let prompt = ColleagueEditsDuringPrompt {
        store: h.store.clone(),
    };
    let report = h
        .reconciler(operator())
        .run_batch(&prompt, &running())
        .await
        .expect("batch");

    assert_eq!(report.candidates, vec![1, 2]);
    assert_eq!(report.summary.sent, 1);
    assert_eq!(report.summary.skipped, 1);
    let calls = h.sink.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, RICK);
}

#[tokio::test]
async fn watcher_only_processes_rows_new_since_the_last_poll() {
    let h = Harness::new(vec![header(), row("pm", RICK, "Rick", "")]);
    let ctx = operator().with_hold(true, HoldBehavior::LogOnly);
    let mut reconciler = h.reconciler(ctx);
    let prompt = ScriptedPrompt::new(true);
    let shutdown = running();
    let mut seen = HashSet::new();

    let first = reconciler
        .poll_once(&prompt, &mut seen, &shutdown)
        .await
        .expect("poll 1");
    assert_eq!(first.map(|s| s.held), Some(1));

    // Log-only hold keeps row 1 eligible; only the seen set stops a second pass over it.
    h.store.push_row(row("pm", GANGNAM, "Gangnam", "")).await;
    let second = reconciler
        .poll_once(&prompt, &mut seen, &shutdown)
        .await
        .expect("poll 2");
    assert_eq!(second.map(|s| s.held), Some(1));
    assert_eq!(seen, HashSet::from([1, 2]));

    let third = reconciler
        .poll_once(&prompt, &mut seen, &shutdown)
        .await
        .expect("poll 3");
    assert_eq!(third, None);
}

#[tokio::test]
async fn watcher_stops_when_shutdown_is_already_requested() {
    let h = Harness::new(vec![header(), row("pm", RICK, "Rick", ""), header()]);
    let (tx, rx) = watch::channel(false);
    tx.send(true).expect("receiver alive");
    let report = h
        .reconciler(operator())
        .run_watcher(
            &ScriptedPrompt::new(true),
            std::time::Duration::from_secs(60),
            HashSet::new(),
            rx,
        )
        .await
        .expect("watcher");
    assert_eq!(report.polls, 0);
    assert!(h.sink.calls().await.is_empty());
}

#[tokio::test]
async fn missing_boundary_needs_one_confirmation() {
    let h = Harness::new(vec![header(), row("pm", RICK, "Rick", "")]);
    let declined = h
        .reconciler(operator())
        .run_batch(&ScriptedPrompt::new(false), &running())
        .await;
    assert!(declined.is_err());
    assert!(h.store.writes().await.is_empty());

    let prompt = ScriptedPrompt::new(true);
    let mut reconciler = h.reconciler(operator());
    let report = reconciler.run_batch(&prompt, &running()).await.expect("batch");
    assert_eq!(report.summary.sent, 1);
    let boundary_questions = prompt
        .asked()
        .iter()
        .filter(|q| q.contains("Graveyard"))
        .count();
    assert_eq!(boundary_questions, 1);
}

#[tokio::test]
async fn missing_status_columns_are_appended_before_processing() {
    let h = Harness::new(vec![
        vec!["Researcher Name".into(), "URL".into(), "Title".into(), "User".into()],
        vec!["pm".into(), RICK.into(), "Rick".into(), "".into()],
        vec!["Researcher Name".into(), "URL".into(), "Title".into(), "User".into()],
    ]);
    h.reconciler(operator())
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    let header_row = h.store.rows().await[0].clone();
    assert_eq!(
        header_row,
        vec!["Researcher Name", "URL", "Title", "User", "date", "duration", "Status", "Duplicate"]
    );
    assert_eq!(h.store.cell(2, 7).await, "Sent to JD2");
}

#[tokio::test]
async fn reprocessing_an_unchanged_snapshot_rewrites_nothing() {
    let h = Harness::new(vec![
        header(),
        row("jd", RICK, "Rick", "Sent to JD2"),
        row("pm", RICK, "Rick", ""),
        header(),
    ]);
    let mut reconciler = h.reconciler(operator());
    let prompt = ScriptedPrompt::new(true);
    let shutdown = running();

    reconciler
        .run_batch(&prompt, &shutdown)
        .await
        .expect("first pass");
    let writes_after_first = h.store.writes().await.len();
    assert_eq!(writes_after_first, 2);

    // Operator resets the status; duplicate text is already correct so only status changes.
    h.store.edit_cell(3, STATUS, "").await;
    let pass = reconciler.begin_pass(&prompt).await.expect("pass");
    reconciler.process_row(&pass, 2).await;
    assert_eq!(h.store.writes().await.len(), writes_after_first + 1);
}

#[tokio::test]
async fn batch_events_land_in_the_daily_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(vec![header(), row("pm", RICK, "Rick", ""), header()]);
    let events = EventLog::new(dir.path(), "PM", "stalkr-sync");
    h.reconciler(operator())
        .with_event_log(events)
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    let log = std::fs::read_dir(dir.path())
        .expect("log dir")
        .next()
        .expect("one log file")
        .expect("entry")
        .path();
    let content = std::fs::read_to_string(log).expect("log content");
    assert!(content.starts_with("timestamp,user_initials,script,action"));
    assert!(content.contains("sent_to_jd2"));
    assert!(content.contains("batch_complete"));
}

#[tokio::test]
async fn sample_tab_fixture_batch() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sheet/sample_tab.json");
    let fixture = load_sheet_fixture(path).expect("fixture");
    let h = Harness::with(
        MemoryStore::from_fixture(fixture),
        StaticMetadataProvider::new(),
        RecordingSink::new(),
    );
    let report = h
        .reconciler(operator())
        .run_batch(&ScriptedPrompt::new(true), &running())
        .await
        .expect("batch");

    assert_eq!(report.candidates, vec![1, 4, 5]);
    assert_eq!(report.summary.to_string(), "1 sent, 0 held, 2 skipped, 0 errors.");
    assert_eq!(h.store.cell(2, STATUS).await, "DUPLICATE");
    assert_eq!(h.store.cell(5, STATUS).await, "Non-YouTube link");
    assert_eq!(h.store.cell(6, STATUS).await, "Sent to JD2");
    let calls = h.sink.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, DESPACITO);
    assert_eq!(calls[0].display_name, "kJQP7kiw5Fk");
}
