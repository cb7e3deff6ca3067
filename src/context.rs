//! Window context
//!
//! Where a command runs and which files it sees, derived from the document
//! and selection of whatever window the command was invoked over.

use std::path::{Path, PathBuf};

use tracing::debug;
use url::Url;

use crate::config::home_dir;

/// Directory extensions treated as opaque documents
const PACKAGE_EXTENSIONS: &[&str] = &[
    "app", "bundle", "framework", "kext", "pkg", "plugin", "rtfd", "xcodeproj",
    "xcworkspace", "playground",
];

/// Document and selection of the window a command was invoked over
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowContext {
    /// Document URL of the window
    pub document: Option<String>,
    /// Selected items as URL strings
    pub selection: Vec<String>,
}

impl WindowContext {
    /// Directory to run in: the document's folder (or the document itself
    /// when it is a plain directory), then the first selection's parent,
    /// then the home directory.
    pub fn working_directory(&self) -> PathBuf {
        self.document_directory()
            .or_else(|| self.selection_directory())
            .or_else(home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn document_directory(&self) -> Option<PathBuf> {
        let url = Url::parse(self.document.as_deref()?).ok()?;
        if url.scheme() != "file" {
            return None;
        }
        let path = url.to_file_path().ok()?;
        let metadata = path.metadata().ok()?;
        if is_package(&path) || !metadata.is_dir() {
            path.parent().map(Path::to_path_buf)
        } else {
            Some(path)
        }
    }

    fn selection_directory(&self) -> Option<PathBuf> {
        let url = Url::parse(self.selection.first()?).ok()?;
        let path = url.to_file_path().ok()?;
        path.parent().map(Path::to_path_buf)
    }
}

/// Whether `path` is a directory presented as a single document
pub fn is_package(path: &Path) -> bool {
    path.is_dir()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| {
                PACKAGE_EXTENSIONS
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(ext))
            })
}

/// One way of finding the frontmost window's context
pub trait ContextProvider {
    fn name(&self) -> &str;
    fn window_context(&self) -> Option<WindowContext>;
}

/// First provider that answers wins
pub fn discover(providers: &[&dyn ContextProvider]) -> WindowContext {
    for provider in providers {
        if let Some(context) = provider.window_context() {
            debug!("Window context from {}: {:?}", provider.name(), context);
            return context;
        }
    }
    WindowContext::default()
}

/// Context given on the command line
#[derive(Debug, Clone, Default)]
pub struct ExplicitContext {
    pub directory: Option<PathBuf>,
    pub selection: Vec<PathBuf>,
}

impl ContextProvider for ExplicitContext {
    fn name(&self) -> &str {
        "command line"
    }

    fn window_context(&self) -> Option<WindowContext> {
        if self.directory.is_none() && self.selection.is_empty() {
            return None;
        }
        Some(WindowContext {
            document: self.directory.as_deref().and_then(path_to_url),
            selection: self.selection.iter().filter_map(|p| path_to_url(p)).collect(),
        })
    }
}

/// The process's current directory as the document
pub struct CurrentDirContext;

impl ContextProvider for CurrentDirContext {
    fn name(&self) -> &str {
        "current directory"
    }

    fn window_context(&self) -> Option<WindowContext> {
        let cwd = std::env::current_dir().ok()?;
        Some(WindowContext {
            document: path_to_url(&cwd),
            selection: Vec::new(),
        })
    }
}

/// `file:` URL for a path; relative paths are resolved against the current directory
pub fn path_to_url(path: &Path) -> Option<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    Url::from_file_path(absolute).ok().map(String::from)
}

/// Selection as shell words to insert into a command: names relative to
/// `working_directory` where possible, or full paths.
pub fn insert_selection(selection: &[String], working_directory: &Path, full_paths: bool) -> String {
    selection
        .iter()
        .filter_map(|s| Url::parse(s).ok())
        .filter_map(|url| url.to_file_path().ok())
        .map(|path| {
            let shown = if full_paths {
                path.as_path()
            } else {
                path.strip_prefix(working_directory).unwrap_or(&path)
            };
            shell_words::quote(&shown.to_string_lossy()).into_owned()
        })
        .collect::<Vec<_>>()
        .join(" ")
}
