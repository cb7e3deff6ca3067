//! Shell process runner
//!
//! Launches a command through the user's shell with stdout and stderr
//! captured on separate pipes. Both read ends are non-blocking and owned by
//! the `ShellProcess`; its owner drains them with `poll_output` and closing
//! them is a matter of dropping the process.

use std::fmt;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Environment variable listing the selected files
pub const SELECTED_FILES_VAR: &str = "DTERM_SELECTED_FILES";

const FALLBACK_SHELL: &str = "/bin/bash";
const READ_BUFFER_SIZE: usize = 4096;

/// Reads per stream in one `poll_output`, so a chatty child cannot starve the caller
const MAX_READS_PER_POLL: usize = 64;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Working directory is not a directory: {}", .0.display())]
    WorkingDirectory(PathBuf),

    #[error("Failed to spawn {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to capture {0}")]
    MissingPipe(StreamKind),

    #[error("Failed to make {kind} non-blocking: {source}")]
    NonBlocking {
        kind: StreamKind,
        #[source]
        source: Errno,
    },

    #[error("Failed to signal process group {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Which pipe a chunk came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// Produced by `ShellProcess::poll_output`
#[derive(Debug, PartialEq)]
pub enum RunnerEvent {
    Data(StreamKind, Vec<u8>),
    /// End of file or read error; nothing more will come from this stream
    Closed(StreamKind),
}

/// Resolve the shell: absolute preference, then `$SHELL`, then `/bin/bash`
pub fn resolve_shell(preferred: Option<&str>) -> String {
    resolve_shell_from(preferred, std::env::var("SHELL").ok())
}

fn resolve_shell_from(preferred: Option<&str>, env_shell: Option<String>) -> String {
    if let Some(shell) = preferred.filter(|s| s.starts_with('/')) {
        return shell.to_string();
    }
    env_shell
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_SHELL.to_string())
}

/// Interactive shell arguments; `bash` and `sh` are also made login shells
pub fn shell_arguments(shell: &str, command: &str) -> Vec<String> {
    let name = Path::new(shell).file_name().and_then(|n| n.to_str());
    let mut args = Vec::with_capacity(4);
    if matches!(name, Some("bash") | Some("sh")) {
        args.push("-l".to_string());
    }
    args.extend(["-i".to_string(), "-c".to_string(), command.to_string()]);
    args
}

/// Space-joined paths of the `file:` URLs in `selection`
pub fn selected_files_value(selection: &[String]) -> Option<String> {
    let paths: Vec<String> = selection
        .iter()
        .filter_map(|s| Url::parse(s).ok())
        .filter(|url| url.scheme() == "file")
        .filter_map(|url| url.to_file_path().ok())
        .map(|path| path.to_string_lossy().into_owned())
        .collect();

    if paths.is_empty() {
        None
    } else {
        Some(paths.join(" "))
    }
}

/// Everything needed to launch one command
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub shell: String,
    pub command: String,
    pub working_directory: PathBuf,
    /// Selection as URL strings
    pub selection: Vec<String>,
}

impl LaunchSpec {
    pub fn arguments(&self) -> Vec<String> {
        shell_arguments(&self.shell, &self.command)
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.shell);
        command
            .args(self.arguments())
            .current_dir(&self.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        match selected_files_value(&self.selection) {
            Some(value) => command.env(SELECTED_FILES_VAR, value),
            None => command.env_remove(SELECTED_FILES_VAR),
        };

        // Own process group so a hangup reaches the whole pipeline
        command.process_group(0);

        command
    }
}

/// A running shell and the read ends of its output pipes
pub struct ShellProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl ShellProcess {
    /// Spawn the shell with non-blocking output pipes
    pub fn spawn(launch: &LaunchSpec) -> Result<Self> {
        if !launch.working_directory.is_dir() {
            return Err(RunnerError::WorkingDirectory(launch.working_directory.clone()));
        }

        let mut command = launch.to_command();
        let mut child = {
            let _egid = EgidGuard::drop_special();
            command.spawn().map_err(|source| RunnerError::Spawn {
                shell: launch.shell.clone(),
                source,
            })?
        };

        let pipes = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => set_nonblocking(&stdout, StreamKind::Stdout)
                .and_then(|()| set_nonblocking(&stderr, StreamKind::Stderr))
                .map(|()| (stdout, stderr)),
            (stdout, _) => Err(RunnerError::MissingPipe(if stdout.is_none() {
                StreamKind::Stdout
            } else {
                StreamKind::Stderr
            })),
        };
        let (stdout, stderr) = match pipes {
            Ok(pipes) => pipes,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        info!(
            "Spawned {} (pid {}) in {}: {:?}",
            launch.shell,
            child.id(),
            launch.working_directory.display(),
            launch.command
        );

        Ok(Self {
            child,
            stdout: Some(stdout),
            stderr: Some(stderr),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status if the process has exited; never waits
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Whether either pipe is still open
    pub fn has_open_pipes(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }

    /// Read whatever is available on both pipes without blocking
    pub fn poll_output(&mut self) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        drain(StreamKind::Stdout, &mut self.stdout, &mut events);
        drain(StreamKind::Stderr, &mut self.stderr, &mut events);
        events
    }

    /// Send SIGHUP to the process group
    pub fn hang_up(&mut self) -> Result<()> {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pid = self.pid();
        killpg(Pid::from_raw(pid as i32), Signal::SIGHUP)
            .map_err(|source| RunnerError::Signal { pid, source })
    }

    /// Close both pipes and let go of the process. Returns the exit code if
    /// it has already exited; otherwise it is reaped in the background.
    pub fn release(self) -> Option<i32> {
        let Self {
            mut child,
            stdout,
            stderr,
        } = self;
        drop(stdout);
        drop(stderr);

        match child.try_wait() {
            Ok(Some(status)) => status.code(),
            Ok(None) => {
                let pid = child.id();
                thread::spawn(move || {
                    let status = child.wait();
                    debug!("Reaped pid {}: {:?}", pid, status);
                });
                None
            }
            Err(e) => {
                warn!("Failed to query pid {}: {}", child.id(), e);
                None
            }
        }
    }
}

fn set_nonblocking<F: AsFd>(pipe: &F, kind: StreamKind) -> Result<()> {
    let flags = fcntl(pipe, FcntlArg::F_GETFL)
        .map_err(|source| RunnerError::NonBlocking { kind, source })?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(pipe, FcntlArg::F_SETFL(flags))
        .map(drop)
        .map_err(|source| RunnerError::NonBlocking { kind, source })
}

/// Read one pipe until it would block; a closed pipe is dropped
fn drain<R: Read>(kind: StreamKind, pipe: &mut Option<R>, events: &mut Vec<RunnerEvent>) {
    let Some(source) = pipe.as_mut() else {
        return;
    };
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    let mut reads = 0;
    while reads < MAX_READS_PER_POLL {
        match source.read(&mut buffer) {
            Ok(0) => {
                *pipe = None;
                events.push(RunnerEvent::Closed(kind));
                return;
            }
            Ok(n) => {
                events.push(RunnerEvent::Data(kind, buffer[..n].to_vec()));
                reads += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Read from {} failed: {}", kind, e);
                *pipe = None;
                events.push(RunnerEvent::Closed(kind));
                return;
            }
        }
    }
}

/// Runs with the effective group ID set back to the real one, so the shell's
/// init scripts do not inherit a special group. Restored on drop.
struct EgidGuard {
    saved: Option<nix::unistd::Gid>,
}

impl EgidGuard {
    fn drop_special() -> Self {
        use nix::unistd::{getegid, getgid, setegid};

        let (egid, gid) = (getegid(), getgid());
        if egid == gid {
            return Self { saved: None };
        }
        match setegid(gid) {
            Ok(()) => Self { saved: Some(egid) },
            Err(e) => {
                warn!("Failed to reset effective group ID: {}", e);
                Self { saved: None }
            }
        }
    }
}

impl Drop for EgidGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = nix::unistd::setegid(saved) {
                warn!("Failed to restore effective group ID: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn launch(command: &str) -> LaunchSpec {
        LaunchSpec {
            shell: "/bin/sh".to_string(),
            command: command.to_string(),
            working_directory: std::env::temp_dir(),
            selection: Vec::new(),
        }
    }

    #[test]
    fn test_resolve_shell() {
        assert_eq!(resolve_shell_from(Some("/bin/zsh"), Some("/bin/fish".into())), "/bin/zsh");
        // Relative preferences are ignored
        assert_eq!(resolve_shell_from(Some("zsh"), Some("/bin/fish".into())), "/bin/fish");
        assert_eq!(resolve_shell_from(None, Some("/bin/fish".into())), "/bin/fish");
        assert_eq!(resolve_shell_from(None, None), "/bin/bash");
        assert_eq!(resolve_shell_from(None, Some(String::new())), "/bin/bash");
    }

    #[test]
    fn test_shell_arguments() {
        assert_eq!(shell_arguments("/bin/bash", "ls"), vec!["-l", "-i", "-c", "ls"]);
        assert_eq!(shell_arguments("/bin/sh", "ls"), vec!["-l", "-i", "-c", "ls"]);
        assert_eq!(shell_arguments("/usr/local/bin/zsh", "ls -la"), vec!["-i", "-c", "ls -la"]);
        assert_eq!(shell_arguments("/opt/bashful", "x"), vec!["-i", "-c", "x"]);
    }

    #[test]
    fn test_selected_files_value() {
        let selection = vec![
            "file:///Users/me/a.txt".to_string(),
            "https://example.com/b".to_string(),
            "file:///Users/me/My%20Folder".to_string(),
            "not a url".to_string(),
        ];
        assert_eq!(
            selected_files_value(&selection).as_deref(),
            Some("/Users/me/a.txt /Users/me/My Folder")
        );
        assert_eq!(selected_files_value(&["https://example.com".to_string()]), None);
        assert_eq!(selected_files_value(&[]), None);
    }

    #[test]
    fn test_missing_working_directory() {
        let mut spec = launch("true");
        spec.working_directory = PathBuf::from("/definitely/not/here");
        assert!(matches!(
            ShellProcess::spawn(&spec),
            Err(RunnerError::WorkingDirectory(_))
        ));
    }

    #[test]
    fn test_spawn_failure() {
        let mut spec = launch("true");
        spec.shell = "/definitely/not/a/shell".to_string();
        assert!(matches!(ShellProcess::spawn(&spec), Err(RunnerError::Spawn { .. })));
    }

    #[test]
    fn test_poll_output_until_closed() {
        let mut process = ShellProcess::spawn(&launch("echo hello; echo oops 1>&2")).unwrap();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(20);

        while process.has_open_pipes() && Instant::now() < deadline {
            let events = process.poll_output();
            if events.is_empty() {
                std::thread::sleep(Duration::from_millis(10));
            }
            for event in events {
                match event {
                    RunnerEvent::Data(StreamKind::Stdout, bytes) => stdout.extend(bytes),
                    RunnerEvent::Data(StreamKind::Stderr, bytes) => stderr.extend(bytes),
                    RunnerEvent::Closed(_) => {}
                }
            }
        }

        assert!(!process.has_open_pipes());
        assert!(String::from_utf8_lossy(&stdout).contains("hello"));
        assert!(String::from_utf8_lossy(&stderr).contains("oops"));
        // A closed pipe reports nothing more
        assert!(process.poll_output().is_empty());
    }

    #[test]
    fn test_poll_output_does_not_block() {
        let mut process = ShellProcess::spawn(&launch("sleep 5")).unwrap();
        let started = Instant::now();
        let events = process.poll_output();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(events.iter().all(|e| !matches!(e, RunnerEvent::Closed(_))));

        process.hang_up().unwrap();
        let started = Instant::now();
        process.release();
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
