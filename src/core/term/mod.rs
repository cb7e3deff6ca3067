//! Output interpretation: styled buffer state and the stream parser.

pub mod parser;
pub mod state;

pub use parser::StreamParser;
pub use state::{OutputState, StyledBuffer, TextStyle, Underline};
