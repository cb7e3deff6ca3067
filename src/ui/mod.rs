//! User interface output.
//!
//! - **renderer**: writes a run's styled buffer to the terminal, live while
//!   the run produces it, and raises completion notifications on stderr

pub mod renderer;

pub use renderer::{LiveView, Renderer, TerminalNotifier};
