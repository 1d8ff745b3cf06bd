use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use stalkr_adapters::{
    AdapterError, GoogleSheetsStore, JDownloaderSink, TabularStore, YouTubeMetadataProvider,
};
use stalkr_storage::{EventLog, HttpClient, HttpClientConfig, TokenBucketConfig};
use stalkr_sync::{
    check_metadata, check_sheet, choose_tab, CheckResult, OperatorContext, OperatorPrompt,
    Reconciler, Renamer, Secrets, UserConfig,
};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EVENT_SCRIPT: &str = "stalkr";

#[derive(Debug, Parser)]
#[command(name = "stalkr")]
#[command(about = "Send your research-sheet rows to JDownloader and keep the sheet in step")]
struct Cli {
    /// Mark eligible rows as held instead of sending them.
    #[arg(long, global = true)]
    hold: bool,

    /// Watcher poll interval in seconds (overrides the config file).
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Batch pass, then watch for new rows until Ctrl+C.
    Run,
    Batch,
    Watch,
    /// Rename finished downloads to the archive filename convention.
    Rename,
    /// Check the sheet, JDownloader and the metadata API.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = UserConfig::default_path();
    let mut config = UserConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    init_tracing(&config.log_level);

    let secrets = Secrets::from_env()?;
    let http = Arc::new(HttpClient::new(HttpClientConfig {
        write_bucket: Some(TokenBucketConfig::sheets_write_quota()),
        ..Default::default()
    })?);
    let shutdown = shutdown_signal();
    let prompt = StdinPrompt::new(shutdown.clone());

    let command = cli.command.unwrap_or(Commands::Run);
    let store = open_sheet(&mut config, &config_path, &http, &secrets, &prompt).await?;
    let provider = Arc::new(YouTubeMetadataProvider::new(
        http.clone(),
        secrets.youtube_api_key.clone(),
    ));
    let sink = Arc::new(JDownloaderSink::new(
        http.clone(),
        config.jdownloader_endpoint.clone(),
    ));
    let ctx = OperatorContext::from_config(&config, cli.hold);
    let events = EventLog::new(&config.log_dir, &ctx.initials, EVENT_SCRIPT);
    let interval = cli
        .interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.poll_interval());
    info!(
        command = ?command,
        initials = %ctx.initials,
        hold = ctx.hold,
        tab = %store.tab(),
        "stalkr starting"
    );

    match command {
        Commands::Run | Commands::Batch | Commands::Watch => {
            let mut reconciler = Reconciler::new(
                store,
                provider,
                sink,
                ctx,
                config.boundary_rule(),
            )
            .with_event_log(events);
            let mut seen = HashSet::new();
            if matches!(command, Commands::Run | Commands::Batch) {
                let report = reconciler.run_batch(&prompt, &shutdown).await?;
                seen.extend(report.candidates);
            }
            if matches!(command, Commands::Run | Commands::Watch) && !*shutdown.borrow() {
                reconciler
                    .run_watcher(&prompt, interval, seen, shutdown.clone())
                    .await?;
            }
        }
        Commands::Rename => {
            let mut renamer =
                Renamer::new(store, ctx, config.boundary_rule()).with_event_log(events);
            let summary = renamer.run(&prompt).await?;
            info!(renamed = summary.renamed, errors = summary.errors, "rename finished");
        }
        Commands::Check => {
            let mut results = vec![check_sheet(&*store, &config.boundary_rule()).await];
            results.push(check_jdownloader(&sink).await);
            results.push(check_metadata(&*provider).await);
            for result in &results {
                println!("{result}");
            }
            let failed = results.iter().filter(|r| !r.ok).count();
            println!("{} OK / {failed} ERROR", results.len() - failed);
            if failed > 0 {
                bail!("{failed} connection check(s) failed");
            }
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    let fallback = ["stalkr", "stalkr_core", "stalkr_storage", "stalkr_adapters", "stalkr_sync"]
        .iter()
        .map(|target| format!("{target}={log_level}"))
        .collect::<Vec<_>>()
        .join(",");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Flips to `true` on the first Ctrl+C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for Ctrl+C");
                // Keep the sender alive so receivers never see a closed channel.
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

/// Opens the configured tab, asking the operator for another one (and saving
/// the choice) when no tab is configured or the configured one is gone.
async fn open_sheet(
    config: &mut UserConfig,
    config_path: &Path,
    http: &Arc<HttpClient>,
    secrets: &Secrets,
    prompt: &dyn OperatorPrompt,
) -> Result<Arc<GoogleSheetsStore>> {
    let sheet_url = config.sheet_url.clone();
    let build = |tab: &str| {
        GoogleSheetsStore::new(
            http.clone(),
            &sheet_url,
            tab.to_string(),
            secrets.sheets_token.clone(),
        )
    };
    let mut tab = match config.tab.clone() {
        Some(tab) => tab,
        None => {
            let available = build("")?
                .list_tabs()
                .await
                .context("listing spreadsheet tabs")?;
            choose_tab(prompt, None, &available).await?
        }
    };
    loop {
        let store = build(&tab)?;
        match store.fetch_all_rows().await {
            Ok(_) => {
                if config.tab.as_deref() != Some(tab.as_str()) {
                    config.save_tab(config_path, &tab)?;
                    info!(tab = %tab, "saved tab choice");
                }
                return Ok(Arc::new(store));
            }
            Err(AdapterError::WorksheetNotFound { tab: missing, available }) => {
                warn!(tab = %missing, "worksheet not found");
                tab = choose_tab(prompt, Some(missing.as_str()), &available).await?;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("opening {}", store.describe()));
            }
        }
    }
}

async fn check_jdownloader(sink: &JDownloaderSink) -> CheckResult {
    const NAME: &str = "jdownloader";
    match sink.probe().await {
        Ok(true) => CheckResult::ok(NAME, format!("listening at {}", sink.endpoint())),
        Ok(false) => CheckResult::error(
            NAME,
            format!("{} answered but is not JDownloader", sink.endpoint()),
        ),
        Err(err) => CheckResult::error(NAME, err.to_string()),
    }
}

/// Asks on stdout and reads the answer from stdin. Ctrl+C while waiting counts
/// as "no".
struct StdinPrompt {
    shutdown: watch::Receiver<bool>,
}

impl StdinPrompt {
    fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    async fn read_answer(&self) -> Option<String> {
        let _ = std::io::stdout().flush();
        // A plain thread, so a pending read never holds up runtime shutdown.
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            let read = std::io::stdin().read_line(&mut line).map(|_| line);
            let _ = tx.send(read);
        });
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            read = rx => match read {
                Ok(Ok(line)) => Some(line),
                _ => None,
            },
            Ok(()) = shutdown.changed() => None,
        }
    }
}

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, question: &str) -> bool {
        print!("{question} ");
        self.read_answer()
            .await
            .is_some_and(|answer| is_affirmative(&answer))
    }

    async fn choose(&self, question: &str, options: &[String]) -> Option<usize> {
        println!("{question}");
        for (n, option) in options.iter().enumerate() {
            println!("  {}. {option}", n + 1);
        }
        print!("Number (blank to cancel): ");
        let answer = self.read_answer().await?;
        parse_choice(&answer, options.len())
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// 1-based menu number to a 0-based index.
fn parse_choice(answer: &str, len: usize) -> Option<usize> {
    let n: usize = answer.trim().parse().ok()?;
    (1..=len).contains(&n).then(|| n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_yes_confirms() {
        assert!(is_affirmative("y\n"));
        assert!(is_affirmative(" YES "));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("n"));
        assert!(!is_affirmative("yep"));
    }

    #[test]
    fn menu_numbers_are_one_based() {
        assert_eq!(parse_choice("1\n", 3), Some(0));
        assert_eq!(parse_choice("3", 3), Some(2));
        assert_eq!(parse_choice("0", 3), None);
        assert_eq!(parse_choice("4", 3), None);
        assert_eq!(parse_choice("", 3), None);
    }

    #[test]
    fn defaults_to_run_and_accepts_global_flags() {
        let cli = Cli::try_parse_from(["stalkr", "--hold", "--interval", "15"]).unwrap();
        assert!(cli.hold);
        assert_eq!(cli.interval, Some(15));
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["stalkr", "watch", "--interval", "5"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Watch)));
        assert_eq!(cli.interval, Some(5));

        assert!(Cli::try_parse_from(["stalkr", "--interval", "0"]).is_err());
        assert!(Cli::try_parse_from(["stalkr", "--dry-run"]).is_err());
    }
}
