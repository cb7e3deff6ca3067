//! Run management
//!
//! A `Run` is one execution of a submitted command: the shell process, its
//! parser and the styled output it has produced so far.

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tracing::{debug, error, info, warn};

use super::runner::{resolve_shell, LaunchSpec, RunnerEvent, ShellProcess, StreamKind};
use super::term::{OutputState, StreamParser, StyledBuffer};
use crate::config::Preferences;

/// Summary shown for a run that printed nothing
pub const NO_RESULTS: &str = "<no results>";

/// Title of the completion notification
pub const COMPLETION_TITLE: &str = "Command finished";

/// What the user submitted
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub command: String,
    pub working_directory: PathBuf,
    /// Selection as URL strings
    pub selection: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Running,
    Finished { exit_code: Option<i32> },
    Cancelled,
    FailedToStart(String),
}

/// Reported once both output streams have closed and the shell has exited
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub run_id: u64,
    pub command: String,
    /// Last non-empty output line, or `NO_RESULTS`
    pub summary: String,
    pub exit_code: Option<i32>,
}

/// Callbacks for whatever displays runs
pub trait RunObserver {
    fn on_output_appended(&mut self, _run: &Run) {}
    fn on_run_completed(&mut self, _run: &Run, _completion: &Completion) {}
}

bitflags! {
    /// Streams that have not reached end of file
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenStreams: u8 {
        const STDOUT = 0b01;
        const STDERR = 0b10;
    }
}

impl From<StreamKind> for OpenStreams {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Stdout => OpenStreams::STDOUT,
            StreamKind::Stderr => OpenStreams::STDERR,
        }
    }
}

/// One command execution
pub struct Run {
    id: u64,
    request: RunRequest,
    shell: String,
    parser: StreamParser,
    output: OutputState,
    process: Option<ShellProcess>,
    open: OpenStreams,
    status: RunStatus,
    hangups_sent: u32,
}

impl Run {
    /// Launch `request`; a launch failure is reported through the status
    pub fn start(id: u64, request: RunRequest, prefs: &Preferences) -> Self {
        let shell = resolve_shell(prefs.shell.as_deref());
        let launch = LaunchSpec {
            shell: shell.clone(),
            command: request.command.clone(),
            working_directory: request.working_directory.clone(),
            selection: request.selection.clone(),
        };

        let mut run = Self {
            id,
            request,
            shell,
            parser: StreamParser::new(),
            output: OutputState::new(prefs),
            process: None,
            open: OpenStreams::empty(),
            status: RunStatus::Running,
            hangups_sent: 0,
        };

        match ShellProcess::spawn(&launch) {
            Ok(process) => {
                run.process = Some(process);
                run.open = OpenStreams::all();
            }
            Err(e) => {
                error!("Run {} failed to start: {}", id, e);
                run.status = RunStatus::FailedToStart(e.to_string());
            }
        }

        run
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.request.command
    }

    pub fn working_directory(&self) -> &Path {
        &self.request.working_directory
    }

    /// Resolved shell the command runs under
    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn buffer(&self) -> &StyledBuffer {
        &self.output.buffer
    }

    /// Number of hangup signals delivered by `cancel`
    #[cfg(test)]
    pub fn hangups_sent(&self) -> u32 {
        self.hangups_sent
    }

    /// Whether any output pipe is still held open
    #[cfg(test)]
    pub fn is_attached(&self) -> bool {
        self.process.as_ref().map_or(false, ShellProcess::has_open_pipes)
    }

    /// Apply whatever output is available (non-blocking)
    pub fn pump(&mut self, observer: &mut dyn RunObserver) -> bool {
        let Some(process) = self.process.as_mut() else {
            return false;
        };

        let mut appended = false;
        for event in process.poll_output() {
            match event {
                RunnerEvent::Data(kind, bytes) => {
                    debug!("Run {}: {} bytes on {}", self.id, bytes.len(), kind);
                    self.feed(&bytes);
                    appended = true;
                }
                RunnerEvent::Closed(kind) => self.stream_closed(kind),
            }
        }

        let completion = if self.open.is_empty() {
            self.try_finish()
        } else {
            None
        };

        if appended {
            observer.on_output_appended(self);
        }
        if let Some(completion) = &completion {
            observer.on_run_completed(self, completion);
        }

        appended || completion.is_some()
    }

    /// Feed raw output into the run's buffer
    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.feed(bytes, &mut self.output);
    }

    fn stream_closed(&mut self, kind: StreamKind) {
        let stream = OpenStreams::from(kind);
        if self.open.contains(stream) {
            self.open.remove(stream);
            debug!("Run {}: {} closed", self.id, kind);
        }
    }

    /// Both streams are closed; finish once the shell has exited
    fn try_finish(&mut self) -> Option<Completion> {
        let process = self.process.as_mut()?;
        let exit_code = match process.try_exit() {
            Ok(Some(status)) => status.code(),
            Ok(None) => return None,
            Err(e) => {
                warn!("Run {}: failed to query exit status: {}", self.id, e);
                None
            }
        };

        self.process = None;
        self.status = RunStatus::Finished { exit_code };

        let completion = self.completion();
        info!(
            "Run {} finished (exit code {:?}): {}",
            self.id, exit_code, completion.summary
        );
        Some(completion)
    }

    /// Completion details as of now
    pub fn completion(&self) -> Completion {
        let exit_code = match self.status {
            RunStatus::Finished { exit_code } => exit_code,
            _ => None,
        };
        Completion {
            run_id: self.id,
            command: self.request.command.clone(),
            summary: self
                .output
                .buffer
                .last_nonempty_line()
                .unwrap_or_else(|| NO_RESULTS.to_string()),
            exit_code,
        }
    }

    /// Hang up the process group if it is alive, then close both pipes and
    /// let go of the process. Returns whether a signal was sent.
    pub fn cancel(&mut self) -> bool {
        let Some(mut process) = self.process.take() else {
            return false;
        };

        let mut signalled = false;
        if process.is_running() {
            match process.hang_up() {
                Ok(()) => {
                    self.hangups_sent += 1;
                    signalled = true;
                }
                Err(e) => warn!("Run {}: {}", self.id, e),
            }
        }
        // Unread output goes with the pipes
        process.release();

        self.open = OpenStreams::empty();
        self.status = RunStatus::Cancelled;
        info!("Run {} cancelled ({} hangups sent)", self.id, self.hangups_sent);

        signalled
    }

    /// Preferences changed: restyle the output
    pub fn apply_preferences(&mut self, prefs: &Preferences) {
        self.output.apply_preferences(prefs);
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        if self.process.is_some() {
            self.cancel();
        }
    }
}
