//! Core command execution components.
//!
//! This module contains the logic behind a single command run:
//!
//! - **runner**: shell resolution and spawning with captured stdout/stderr
//! - **term**: styled output buffer and the incremental output parser
//! - **session**: `Run`, combining a shell process with its rendered output
//!
//! # Architecture
//!
//! ```text
//! Run
//! ├── ShellProcess (child + stdout/stderr reader threads)
//! ├── StreamParser (carry of unconsumed bytes)
//! └── OutputState
//!     ├── StyledBuffer (text + style runs)
//!     ├── cursor
//!     └── AttributeState (SGR)
//! ```

pub mod runner;
pub mod session;
pub mod term;
