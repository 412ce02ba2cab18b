// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use sailor::config::Config;
use sailor::download::{
    dedupe_on_load, DownloadEvent, DownloadManager, StateFile, Task, TaskState,
};
use sailor::error::{format_error, launch_report, state_save_report};
use sailor::search::{ApiBayClient, SearchProvider, SearchResult};
use sailor::utils::{fit_to_width, mask_secret};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code when state could not be saved
const ERROR: i32 = 1;

const LOG_FILE_NAME: &str = "sailor.log";

const COL_NAME: usize = 48;

/// sailor - search torrents, download them with aria2, keep a library.
#[derive(Parser)]
#[command(name = "sailor")]
#[command(version = VERSION)]
#[command(about = "Search torrents, download them with aria2, keep a library.")]
#[command(long_about = "sailor - torrent download manager\n\n\
    Interactive session:  sailor\n\
    One-off search:       sailor search \"ubuntu 24.04\"\n\
    Show saved state:     sailor status\n\n\
    Each download runs in its own aria2c process. State is saved on exit.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Download directory (overrides the config file)
    #[arg(long, global = true, value_name = "DIR")]
    download_dir: Option<PathBuf>,

    /// Log file (default: <download dir>/sailor.log)
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Verbose mode: debug-level logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the index and print the results
    #[command(alias = "s")]
    Search {
        /// Search terms
        #[arg(required = true)]
        query: Vec<String>,
    },

    /// Show saved downloads and library without starting anything
    Status,
}

/// Send logs to a file so they do not interleave with the prompt.
fn init_logging(path: &Path, verbose: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {:?}", parent))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;

    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(dir) = cli.download_dir {
        config.download_dir = dir;
    }

    let log_path = cli
        .log_file
        .unwrap_or_else(|| config.download_dir.join(LOG_FILE_NAME));
    if let Err(e) = init_logging(&log_path, cli.verbose) {
        eprintln!("{} Logging disabled: {:#}", "[!]".yellow(), e);
    }
    tracing::info!(
        version = VERSION,
        download_dir = %config.download_dir.display(),
        rpc_secret = %mask_secret(&config.rpc_secret, 4),
        "sailor starting"
    );

    let config = Arc::new(config);
    match cli.command {
        Some(Commands::Search { query }) => search_once(&config, &query.join(" ")).await,
        Some(Commands::Status) => show_status(&config),
        None => interactive(config).await,
    }
}

async fn search_once(config: &Config, query: &str) -> Result<()> {
    let client = ApiBayClient::new(&config.search_url, config.search_timeout());
    match client.search(query).await {
        Ok(results) => {
            print_results(&results);
            Ok(())
        }
        Err(e) => {
            eprintln!(
                "{}",
                format_error(
                    &format!("Search failed: {}", e),
                    &["No network connection", "The search index is down or blocked"],
                    &[
                        "Check your connection",
                        "Set `search_url` in ~/.sailor/config.json to a mirror",
                    ],
                )
            );
            std::process::exit(ERROR);
        }
    }
}

fn show_status(config: &Config) -> Result<()> {
    let state = StateFile::new(config.state_path());
    let tasks = state
        .load()
        .with_context(|| format!("Could not read {}", state.path().display()))?;
    let (active, stored) = dedupe_on_load(tasks);
    print_downloads(&active);
    print_library(&stored);
    Ok(())
}

/// A line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum SessionCommand {
    Search(String),
    Get(usize),
    Downloads,
    Library,
    Cancel(usize),
    Remove(usize),
    Retry(usize),
    Help,
    Quit,
    Empty,
}

impl SessionCommand {
    /// Parse a prompt line. Numbers are 1-based as printed in the listings.
    fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let index = |what: &str| -> std::result::Result<usize, String> {
            match rest.parse::<usize>() {
                Ok(n) if n > 0 => Ok(n),
                _ => Err(format!("usage: {} <number>", what)),
            }
        };

        match word.to_lowercase().as_str() {
            "" => Ok(Self::Empty),
            "search" | "s" if rest.is_empty() => Err("usage: search <terms>".to_string()),
            "search" | "s" => Ok(Self::Search(rest.to_string())),
            "get" | "g" => index("get").map(Self::Get),
            "downloads" | "d" | "ls" => Ok(Self::Downloads),
            "library" | "lib" | "l" => Ok(Self::Library),
            "cancel" | "c" => index("cancel").map(Self::Cancel),
            "rm" => index("rm").map(Self::Remove),
            "retry" | "r" => index("retry").map(Self::Retry),
            "help" | "h" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(format!("unknown command '{}', type 'help'", other)),
        }
    }
}

fn pick<T>(items: &[T], n: usize) -> Option<&T> {
    n.checked_sub(1).and_then(|i| items.get(i))
}

async fn interactive(config: Arc<Config>) -> Result<()> {
    let manager = DownloadManager::start(Arc::clone(&config)).await;
    if let Some(warning) = manager.load_warning() {
        eprintln!("{}", warning.yellow());
    }
    let search = ApiBayClient::new(&config.search_url, config.search_timeout());

    println!(
        "{} {} - type {} for commands",
        "sailor".bright_cyan().bold(),
        VERSION,
        "help".bright_white()
    );
    let view = manager.view();
    if !view.active.is_empty() {
        println!("{} {} download(s) restored.", "[+]".green(), view.active.len());
    }

    let stdin = BufReader::new(tokio::io::stdin());
    if let Err(e) = run_session(&manager, &search, stdin, ctrl_c(), &config).await {
        eprintln!("{} Session ended: {:#}", "[!]".red(), e);
    }

    match manager.shutdown().await {
        Ok(()) => {
            println!("{} Download state saved.", "[+]".green());
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", state_save_report(manager.state_path(), &e));
            std::process::exit(ERROR);
        }
    }
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Ctrl+C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Prompt loop. Returns when input ends, on `quit`, or once `stop`
/// resolves; a `stop` that fires while a command runs ends the session at
/// the next prompt. Saving is the caller's job.
async fn run_session<R, S, F>(
    manager: &DownloadManager,
    search: &S,
    input: R,
    stop: F,
    config: &Config,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    S: SearchProvider + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(stop);
    let mut events = manager.subscribe();
    let mut results: Vec<SearchResult> = Vec::new();
    let mut lines = input.lines();
    let mut show_prompt = true;

    loop {
        if show_prompt {
            print!("{} ", "sailor>".bright_cyan().bold());
            let _ = std::io::stdout().flush();
        }
        show_prompt = true;

        let line = tokio::select! {
            // Checked first so a pending stop wins over buffered input
            biased;
            _ = &mut stop => {
                println!();
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("{} Input error: {}", "[!]".red(), e);
                    break;
                }
            },
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        println!();
                        print_event(&event, config);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Dropped download events");
                        show_prompt = false;
                    }
                    Err(broadcast::error::RecvError::Closed) => show_prompt = false,
                }
                continue;
            }
        };

        let command = match SessionCommand::parse(&line) {
            Ok(command) => command,
            Err(msg) => {
                eprintln!("{} {}", "[!]".yellow(), msg);
                continue;
            }
        };

        match command {
            SessionCommand::Empty => {}
            SessionCommand::Search(query) => match search.search(&query).await {
                Ok(found) => {
                    results = found;
                    print_results(&results);
                }
                Err(e) => eprintln!("{} Search failed: {}", "[!]".red(), e),
            },
            SessionCommand::Get(n) => match pick(&results, n) {
                Some(candidate) => {
                    manager.request_download(candidate.clone()).await?;
                    println!("{} Queued \"{}\"", "[+]".green(), candidate.display_name);
                }
                None => eprintln!("{} No search result #{}", "[!]".yellow(), n),
            },
            SessionCommand::Downloads => print_downloads(&manager.view().active),
            SessionCommand::Library => print_library(&manager.view().stored),
            SessionCommand::Cancel(n) => match pick(&manager.view().active, n) {
                Some(task) => {
                    manager.request_cancel(&task.content_id).await?;
                    println!("{} Cancelling \"{}\"", "[+]".green(), task.display_name);
                }
                None => eprintln!("{} No download #{}", "[!]".yellow(), n),
            },
            SessionCommand::Remove(n) => match pick(&manager.view().stored, n) {
                Some(task) => {
                    manager.request_library_remove(&task.content_id).await?;
                    println!(
                        "{} Removing \"{}\" and its files",
                        "[+]".green(),
                        task.display_name
                    );
                }
                None => eprintln!("{} No library item #{}", "[!]".yellow(), n),
            },
            SessionCommand::Retry(n) => match pick(&manager.view().active, n) {
                Some(task) if task.state == TaskState::Pending => {
                    manager.request_retry(&task.content_id).await?;
                    println!("{} Retrying \"{}\"", "[+]".green(), task.display_name);
                }
                Some(task) => eprintln!(
                    "{} \"{}\" is {}, only pending downloads can be retried",
                    "[!]".yellow(),
                    task.display_name,
                    task.state
                ),
                None => eprintln!("{} No download #{}", "[!]".yellow(), n),
            },
            SessionCommand::Help => print_help(),
            SessionCommand::Quit => break,
        }
    }

    Ok(())
}

fn print_event(event: &DownloadEvent, config: &Config) {
    match event {
        DownloadEvent::Launched { display_name, .. } => {
            println!("{} Downloading \"{}\"", "[+]".green(), display_name);
        }
        DownloadEvent::LaunchFailed { display_name, error, .. } => {
            let err = anyhow::anyhow!("{}", error);
            eprintln!("{}", launch_report(display_name, &err, &config.downloader));
        }
        DownloadEvent::Stored { content_id } => {
            println!("{} Finished {}, moved to library", "[+]".green(), content_id);
        }
        DownloadEvent::Failed { content_id } => {
            eprintln!(
                "{} Lost contact with download {}, marked failed",
                "[!]".red(),
                content_id
            );
        }
    }
}

fn print_help() {
    println!("{}", "Commands".bold());
    println!("  search <terms>   search the index (alias: s)");
    println!("  get <n>          download search result n");
    println!("  downloads        list active downloads (alias: d)");
    println!("  library          list finished items (alias: l)");
    println!("  cancel <n>       stop download n and delete its files");
    println!("  retry <n>        relaunch a download that failed to start");
    println!("  rm <n>           delete library item n and its files");
    println!("  quit             save and exit (Ctrl+C also saves)");
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("{} No results.", "[i]".bright_black());
        return;
    }
    println!(
        "{:>3}  {}  {:>10}  {:>6}  {:>6}",
        "#".bold(),
        fit_to_width("Name", COL_NAME).as_str().bold(),
        "Size".bold(),
        "Seed".bold(),
        "Leech".bold()
    );
    for (i, r) in results.iter().enumerate() {
        println!(
            "{:>3}  {}  {:>10}  {:>6}  {:>6}",
            i + 1,
            fit_to_width(&r.display_name, COL_NAME),
            sailor::download::format_size(r.total_bytes),
            r.seeders.to_string().as_str().green(),
            r.leechers.to_string().as_str().red()
        );
    }
}

fn state_label(task: &Task) -> colored::ColoredString {
    match task.state {
        TaskState::Pending => task.state.label().yellow(),
        TaskState::Downloading => task.state.label().cyan(),
        TaskState::Complete | TaskState::Stored => task.state.label().green(),
        TaskState::Failed => task.state.label().red(),
    }
}

fn print_downloads(active: &[Task]) {
    if active.is_empty() {
        println!("{} No active downloads.", "[i]".bright_black());
        return;
    }
    for (i, task) in active.iter().enumerate() {
        let percent = task
            .progress_percent()
            .map(|p| format!("{:5.1}%", p))
            .unwrap_or_else(|| "  ?  ".to_string());
        let eta = task.eta_string().unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3}  {}  {:<11}  {}  {:>10} / {:<10}  {:>11}  ETA {}",
            i + 1,
            fit_to_width(&task.display_name, COL_NAME),
            state_label(task),
            percent,
            task.completed_size(),
            task.total_size(),
            task.transfer_rate(),
            eta
        );
    }
}

fn print_library(stored: &[Task]) {
    if stored.is_empty() {
        println!("{} Library is empty.", "[i]".bright_black());
        return;
    }
    for (i, task) in stored.iter().enumerate() {
        println!(
            "{:>3}  {}  {:>10}  {}",
            i + 1,
            fit_to_width(&task.display_name, COL_NAME),
            task.total_size(),
            state_label(task)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sailor::download::WorkerStatus;
    use sailor::rpc::{RpcError, WorkerControl};
    use sailor::search::SearchError;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    /// Returns one result; fires `during_search` while the search runs.
    #[derive(Default)]
    struct StubSearch {
        during_search: Mutex<Option<oneshot::Sender<()>>>,
    }

    #[async_trait]
    impl SearchProvider for StubSearch {
        async fn search(&self, _: &str) -> Result<Vec<SearchResult>, SearchError> {
            if let Some(tx) = self.during_search.lock().unwrap().take() {
                let _ = tx.send(());
            }
            Ok(vec![SearchResult {
                content_id: "0123456789abcdef".into(),
                display_name: "Fixture".into(),
                total_bytes: 10,
                seeders: 1,
                leechers: 0,
                file_count: 1,
            }])
        }
    }

    struct NoWorkers;

    #[async_trait]
    impl WorkerControl for NoWorkers {
        async fn query_active(&self, _: u16, _: &str) -> Result<Vec<WorkerStatus>, RpcError> {
            Ok(Vec::new())
        }
    }

    async fn manager(dir: &TempDir) -> (Arc<Config>, DownloadManager) {
        let mut config = Config::with_download_dir(dir.path());
        config.downloader = "/nonexistent/aria2c".into();
        let config = Arc::new(config);
        let manager =
            DownloadManager::start_with(Arc::clone(&config), Arc::new(NoWorkers), None).await;
        (config, manager)
    }

    #[tokio::test]
    async fn test_stop_during_command_ends_session() {
        let dir = TempDir::new().unwrap();
        let (config, manager) = manager(&dir).await;
        let (tx, rx) = oneshot::channel();
        let search = StubSearch {
            during_search: Mutex::new(Some(tx)),
        };
        let stop = async move {
            let _ = rx.await;
        };

        // Input stays open, so only `stop` can end the session
        let (mut input, reader) = tokio::io::duplex(256);
        input.write_all(b"search fixture\n").await.unwrap();

        let session = run_session(&manager, &search, BufReader::new(reader), stop, &config);
        let outcome = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session ignored the stop signal");
        assert!(outcome.is_ok());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_command_returns_to_caller_for_save() {
        let dir = TempDir::new().unwrap();
        let (config, manager) = manager(&dir).await;
        // Stops the command loop, so the next request cannot be delivered
        manager.shutdown().await.unwrap();
        std::fs::remove_file(config.state_path()).unwrap();

        let input = BufReader::new(&b"search fixture\nget 1\nquit\n"[..]);
        let search = StubSearch::default();
        let err = run_session(&manager, &search, input, std::future::pending(), &config)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("shut down"), "{err:#}");

        manager.shutdown().await.unwrap();
        assert!(config.state_path().exists());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            SessionCommand::parse("search ubuntu iso"),
            Ok(SessionCommand::Search("ubuntu iso".into()))
        );
        assert_eq!(SessionCommand::parse("  get 3 "), Ok(SessionCommand::Get(3)));
        assert_eq!(SessionCommand::parse("D"), Ok(SessionCommand::Downloads));
        assert_eq!(SessionCommand::parse("rm 1"), Ok(SessionCommand::Remove(1)));
        assert_eq!(SessionCommand::parse("quit"), Ok(SessionCommand::Quit));
        assert_eq!(SessionCommand::parse(""), Ok(SessionCommand::Empty));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(SessionCommand::parse("get").is_err());
        assert!(SessionCommand::parse("get 0").is_err());
        assert!(SessionCommand::parse("cancel x").is_err());
        assert!(SessionCommand::parse("search").is_err());
        assert!(SessionCommand::parse("frobnicate").is_err());
    }

    #[test]
    fn test_pick_is_one_based() {
        let items = ["a", "b"];
        assert_eq!(pick(&items, 1), Some(&"a"));
        assert_eq!(pick(&items, 2), Some(&"b"));
        assert_eq!(pick(&items, 3), None);
        assert_eq!(pick(&items, 0), None);
    }
}
