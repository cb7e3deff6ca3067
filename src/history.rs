//! Run history for dterm
//!
//! Keeps the most recent runs, decides which one is in view, raises
//! completion notifications and counts submitted commands.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{config_dir, ConfigError, Preferences};
use crate::core::session::{Completion, Run, RunObserver, RunRequest, COMPLETION_TITLE};

/// Receives completion notifications
pub trait Notifier {
    fn notify(&mut self, title: &str, body: &str);
}

/// Bounded list of runs, newest last
pub struct RunHistory {
    runs: VecDeque<Run>,
    next_id: u64,
    selected: Option<u64>,
    host_visible: bool,
    prefs: Preferences,
    notifier: Box<dyn Notifier>,
    stats: Option<CommandStats>,
}

impl RunHistory {
    pub fn new(prefs: Preferences, notifier: Box<dyn Notifier>) -> Self {
        Self {
            runs: VecDeque::new(),
            next_id: 1,
            selected: None,
            host_visible: false,
            prefs,
            notifier,
            stats: None,
        }
    }

    /// Count submitted commands in `stats`
    pub fn with_stats(mut self, stats: CommandStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Start a run for `request`; the new run becomes the selected one
    pub fn submit(&mut self, request: RunRequest) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        info!("Submitting run {}: {:?}", id, request.command);
        let run = Run::start(id, request, &self.prefs);
        self.runs.push_back(run);
        self.selected = Some(id);

        if let Some(stats) = self.stats.as_mut() {
            if let Err(e) = stats.record() {
                warn!("Failed to save command count: {}", e);
            }
        }

        self.evict();
        id
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    #[cfg(test)]
    pub fn runs(&self) -> impl Iterator<Item = &Run> + '_ {
        self.runs.iter()
    }

    pub fn get(&self, id: u64) -> Option<&Run> {
        self.runs.iter().find(|run| run.id() == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Run> {
        self.runs.iter_mut().find(|run| run.id() == id)
    }

    #[allow(dead_code)]
    pub fn selected(&self) -> Option<&Run> {
        self.selected.and_then(|id| self.get(id))
    }

    /// Bring a run into view; unknown ids are ignored
    #[allow(dead_code)]
    pub fn select(&mut self, id: u64) -> bool {
        if self.get(id).is_some() {
            self.selected = Some(id);
            true
        } else {
            false
        }
    }

    /// Whether the host surface is showing the selected run
    pub fn set_host_visible(&mut self, visible: bool) {
        self.host_visible = visible;
    }

    pub fn is_running(&self) -> bool {
        self.runs.iter().any(Run::is_running)
    }

    /// Apply pending output of every run
    pub fn pump(&mut self, observer: &mut dyn RunObserver) -> bool {
        let mut tap = CompletionTap {
            inner: observer,
            completed: Vec::new(),
        };

        let mut progressed = false;
        for run in self.runs.iter_mut() {
            progressed |= run.pump(&mut tap);
        }

        for completion in tap.completed {
            if self.should_notify(completion.run_id) {
                self.notifier.notify(COMPLETION_TITLE, &completion.summary);
            } else {
                debug!("Run {} finished in view", completion.run_id);
            }
        }

        self.evict();
        progressed
    }

    fn should_notify(&self, run_id: u64) -> bool {
        if !self.prefs.notify_on_completion {
            return false;
        }
        !(self.host_visible && self.selected == Some(run_id))
    }

    pub fn cancel(&mut self, id: u64) -> bool {
        self.get_mut(id).map_or(false, Run::cancel)
    }

    /// Push new preferences to every run
    pub fn apply_preferences(&mut self, prefs: Preferences) {
        for run in self.runs.iter_mut() {
            run.apply_preferences(&prefs);
        }
        self.prefs = prefs;
        self.evict();
    }

    pub fn preferences(&self) -> &Preferences {
        &self.prefs
    }

    /// Drop the oldest finished runs beyond the retention count
    fn evict(&mut self) {
        let keep = self.prefs.results_to_keep.max(1);
        while self.runs.len() > keep {
            let Some(index) = self.runs.iter().position(|run| !run.is_running()) else {
                break;
            };
            if let Some(run) = self.runs.remove(index) {
                debug!("Evicting run {}", run.id());
                if self.selected == Some(run.id()) {
                    self.selected = self.runs.back().map(Run::id);
                }
            }
        }
    }
}

/// Forwards observer calls and remembers completions
struct CompletionTap<'a> {
    inner: &'a mut dyn RunObserver,
    completed: Vec<Completion>,
}

impl RunObserver for CompletionTap<'_> {
    fn on_output_appended(&mut self, run: &Run) {
        self.inner.on_output_appended(run);
    }

    fn on_run_completed(&mut self, run: &Run, completion: &Completion) {
        self.inner.on_run_completed(run, completion);
        self.completed.push(completion.clone());
    }
}

/// Persisted usage counter, `~/.dterm/stats.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandStats {
    pub commands_run: u64,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl CommandStats {
    /// Load from the default location; starts at zero if unreadable
    pub fn load() -> Self {
        let Some(path) = config_dir().map(|dir| dir.join("stats.toml")) else {
            return Self::default();
        };
        Self::load_from(&path).unwrap_or_else(|e| {
            warn!("{}; starting a new count", e);
            Self {
                path: Some(path),
                ..Self::default()
            }
        })
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut stats = if path.exists() {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        stats.path = Some(path.to_path_buf());
        Ok(stats)
    }

    /// Count one command and persist
    pub fn record(&mut self) -> Result<(), ConfigError> {
        self.commands_run += 1;
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })
    }
}
