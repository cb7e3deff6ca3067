//! dterm - run a shell command in the context of the current window
//!
//! dterm launches a command through the user's login shell in the working
//! directory of the window it was invoked over, with the selected files in
//! `DTERM_SELECTED_FILES`, and renders the output with backspace overstrike
//! and SGR colors.
//!
//! # Quick Start
//!
//! ```text
//! dterm ls -la                      # Run in the current directory
//! dterm -d ~/src make               # Run in ~/src
//! dterm -s a.txt -s b.txt -- wc -l '$DTERM_SELECTED_FILES'
//! man ls | dterm -c -- cat          # Copy the rendered output
//! ```

mod config;
mod context;
mod core;
mod history;
mod ui;

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{config_dir, Config, ConfigWatcher};
use crate::context::{discover, insert_selection, CurrentDirContext, ExplicitContext};
use crate::core::session::{Run, RunObserver, RunRequest, RunStatus};
use crate::history::{CommandStats, RunHistory};
use crate::ui::{LiveView, Renderer, TerminalNotifier};

/// Command line options
#[derive(Debug, Default)]
struct Options {
    /// Working directory override
    directory: Option<PathBuf>,
    /// Selected files
    selection: Vec<PathBuf>,
    /// Shell override
    shell: Option<String>,
    /// Copy the output to the clipboard when done
    copy: bool,
    /// Cancel after this long
    timeout: Option<Duration>,
    /// Command words
    command: Vec<String>,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pump interval while the run is idle
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often the config file is checked for changes
const RELOAD_INTERVAL: Duration = Duration::from_millis(500);

fn print_version() {
    eprintln!("dterm {}", VERSION);
}

fn print_help() {
    eprintln!("dterm {} - Run a shell command in the current window's context", VERSION);
    eprintln!();
    eprintln!("Usage: dterm [OPTIONS] [--] COMMAND...");
    eprintln!();
    eprintln!("Context options:");
    eprintln!("  -d, --dir <PATH>      Document or directory to run in");
    eprintln!("  -s, --select <PATH>   Selected file (repeatable)");
    eprintln!("                        Use {{}} in COMMAND to insert the selection");
    eprintln!();
    eprintln!("Run options:");
    eprintln!("  --shell <PATH>        Shell to use (absolute path)");
    eprintln!("  -t, --timeout <SECS>  Hang up the command after SECS seconds");
    eprintln!("  -c, --copy            Copy the output to the clipboard");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Without -d, the current directory is used.");
    eprintln!("Selected files are exported as DTERM_SELECTED_FILES.");
    eprintln!();
    eprintln!("Configuration: ~/.dterm/config.toml");
    eprintln!("Log file:      ~/.dterm/dterm.log (level via RUST_LOG)");
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-d" | "--dir" => {
                i += 1;
                let dir = args.get(i).ok_or("Missing directory argument")?;
                options.directory = Some(PathBuf::from(dir));
            }
            "-s" | "--select" => {
                i += 1;
                let path = args.get(i).ok_or("Missing selection argument")?;
                options.selection.push(PathBuf::from(path));
            }
            "--shell" => {
                i += 1;
                let shell = args.get(i).ok_or("Missing shell argument")?;
                options.shell = Some(shell.clone());
            }
            "-c" | "--copy" => {
                options.copy = true;
            }
            "-t" | "--timeout" => {
                i += 1;
                let secs = args.get(i).ok_or("Missing timeout argument")?;
                let secs: f64 = secs
                    .parse()
                    .map_err(|_| format!("Invalid timeout: {}", secs))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(format!("Invalid timeout: {}", secs));
                }
                options.timeout = Some(Duration::from_secs_f64(secs));
            }
            "--" => {
                options.command.extend_from_slice(&args[i + 1..]);
                break;
            }
            arg if arg.starts_with('-') && options.command.is_empty() => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            _ => {
                options.command.extend_from_slice(&args[i..]);
                break;
            }
        }
        i += 1;
    }

    if options.command.is_empty() {
        return Err("Missing command".to_string());
    }

    Ok(options)
}

/// Initialize logging to `~/.dterm/dterm.log`
fn init_logging() {
    let log_path = config_dir()
        .map(|dir| dir.join("dterm.log"))
        .unwrap_or_else(|| PathBuf::from("dterm.log"));

    // Open log file (append mode)
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Streams the foreground run to the terminal
struct Foreground<W: Write> {
    id: u64,
    view: LiveView<W>,
    chunks: usize,
}

impl<W: Write> RunObserver for Foreground<W> {
    fn on_output_appended(&mut self, run: &Run) {
        if run.id() != self.id {
            return;
        }
        self.chunks += 1;
        if let Err(e) = self.view.update(run.buffer()) {
            warn!("Failed to write output: {}", e);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("dterm {} starting...", VERSION);

    let mut config = Config::load();
    if options.shell.is_some() {
        config.shell = options.shell.clone();
    }

    let explicit = ExplicitContext {
        directory: options.directory.clone(),
        selection: options.selection.clone(),
    };
    let window = discover(&[&explicit, &CurrentDirContext]);
    let working_directory = window.working_directory();

    let selection_words = insert_selection(&window.selection, &working_directory, false);
    let command = options
        .command
        .iter()
        .map(|word| word.replace("{}", &selection_words))
        .collect::<Vec<_>>()
        .join(" ");

    let mut history = RunHistory::new(config.preferences(), Box::new(TerminalNotifier))
        .with_stats(CommandStats::load());
    // A foreground run is always in view
    history.set_host_visible(true);

    let id = history.submit(RunRequest {
        command,
        working_directory,
        selection: window.selection,
    });

    if let Some(run) = history.get(id) {
        info!(
            "Run {} uses {} in {}",
            id,
            run.shell(),
            run.working_directory().display()
        );
    }

    let mut watcher = Config::path().map(ConfigWatcher::new);
    let mut last_reload = Instant::now();
    let mut foreground = Foreground {
        id,
        view: LiveView::new(Renderer::for_stdout(), io::stdout()),
        chunks: 0,
    };

    let started = Instant::now();
    while history.is_running() {
        if let Some(limit) = options.timeout {
            if started.elapsed() >= limit {
                warn!("Run {} timed out after {:?}", id, limit);
                history.cancel(id);
                break;
            }
        }

        if last_reload.elapsed() >= RELOAD_INTERVAL {
            last_reload = Instant::now();
            if let Some(mut reloaded) = watcher.as_mut().and_then(ConfigWatcher::poll) {
                if options.shell.is_some() {
                    reloaded.shell = options.shell.clone();
                }
                let prefs = reloaded.preferences();
                if prefs != *history.preferences() {
                    history.apply_preferences(prefs);
                }
            }
        }

        if !history.pump(&mut foreground) {
            thread::sleep(POLL_INTERVAL);
        }
    }
    info!("Run {} done after {} chunks", id, foreground.chunks);

    let run = history.get(id).context("run vanished from history")?;
    foreground
        .view
        .finish(run.buffer())
        .context("failed to write output")?;

    if options.copy {
        let mut clipboard = arboard::Clipboard::new().context("clipboard unavailable")?;
        clipboard
            .set_text(run.buffer().text())
            .context("failed to copy output")?;
    }

    match run.status() {
        RunStatus::FailedToStart(reason) => bail!("{}", reason),
        RunStatus::Cancelled => {
            eprintln!("dterm: command cancelled");
            std::process::exit(129);
        }
        RunStatus::Finished { exit_code } => {
            let code = exit_code.unwrap_or(0);
            if code != 0 {
                std::process::exit(code);
            }
        }
        RunStatus::Running => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let options = parse_args(&args(&["-d", "/tmp", "-s", "a", "--select", "b", "ls", "-la"])).unwrap();
        assert_eq!(options.directory, Some(PathBuf::from("/tmp")));
        assert_eq!(options.selection, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(options.command, vec!["ls", "-la"]);
        assert!(!options.copy);
    }

    #[test]
    fn test_parse_args_separator() {
        let options = parse_args(&args(&["-c", "-t", "1.5", "--", "-weird", "cmd"])).unwrap();
        assert!(options.copy);
        assert_eq!(options.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.command, vec!["-weird", "cmd"]);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["-d"])).is_err());
        assert!(parse_args(&args(&["--bogus", "ls"])).is_err());
        assert!(parse_args(&args(&["-t", "soon", "ls"])).is_err());
        assert!(parse_args(&args(&["-t", "0", "ls"])).is_err());
    }
}
