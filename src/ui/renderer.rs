//! Output renderer using crossterm
//!
//! Writes a styled buffer to a terminal, one attribute change per run.
//! `LiveView` streams a run's output while it is still being produced.

use std::io::{self, IsTerminal, Write};
use std::ops::Range;

use crossterm::{
    queue,
    style::{
        Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor,
    },
    terminal::{Clear, ClearType},
};

use crate::core::term::{StyledBuffer, TextStyle, Underline};
use crate::history::Notifier;

/// Renders styled output
pub struct Renderer {
    /// Emit escape sequences; off when the target is not a terminal
    styled: bool,
}

impl Renderer {
    pub fn new(styled: bool) -> Self {
        Self { styled }
    }

    /// Styled when stdout is a terminal
    pub fn for_stdout() -> Self {
        Self::new(io::stdout().is_terminal())
    }

    pub fn is_styled(&self) -> bool {
        self.styled
    }

    /// Render the characters in `range`
    pub fn render_range<W: Write>(
        &self,
        out: &mut W,
        buffer: &StyledBuffer,
        range: Range<usize>,
    ) -> io::Result<()> {
        if !self.styled {
            return out.write_all(buffer.slice(range).as_bytes());
        }

        for (run, style) in buffer.runs() {
            let start = run.start.max(range.start);
            let end = run.end.min(range.end);
            if start >= end {
                continue;
            }
            self.apply_style(out, style)?;
            queue!(out, Print(buffer.slice(start..end)))?;
        }
        queue!(out, ResetColor, SetAttribute(Attribute::Reset))
    }

    fn apply_style<W: Write>(&self, out: &mut W, style: &TextStyle) -> io::Result<()> {
        queue!(out, SetAttribute(Attribute::Reset), ResetColor)?;

        if style.bold {
            queue!(out, SetAttribute(Attribute::Bold))?;
        }
        match style.underline {
            Underline::None => {}
            Underline::Single => queue!(out, SetAttribute(Attribute::Underlined))?,
            Underline::Double => queue!(out, SetAttribute(Attribute::DoubleUnderlined))?,
        }

        queue!(out, SetForegroundColor(style.fg.to_crossterm()))?;
        if let Some(bg) = style.bg {
            queue!(out, SetBackgroundColor(bg.to_crossterm()))?;
        }

        Ok(())
    }
}

/// Streams a growing buffer. Completed lines are written once; on a
/// terminal the line in progress is redrawn in place, so carriage-return
/// progress output updates live. Changes to lines already written are not
/// shown.
pub struct LiveView<W: Write> {
    renderer: Renderer,
    out: W,
    /// Characters written for good
    emitted: usize,
    /// A partial line is on screen after `emitted`
    partial_shown: bool,
}

impl<W: Write> LiveView<W> {
    pub fn new(renderer: Renderer, out: W) -> Self {
        Self {
            renderer,
            out,
            emitted: 0,
            partial_shown: false,
        }
    }

    /// Show what changed since the last update
    pub fn update(&mut self, buffer: &StyledBuffer) -> io::Result<()> {
        self.emitted = self.emitted.min(buffer.len());
        self.clear_partial()?;

        let complete = buffer.line_start(buffer.len());
        if complete > self.emitted {
            self.renderer
                .render_range(&mut self.out, buffer, self.emitted..complete)?;
            self.emitted = complete;
        }

        if self.renderer.is_styled() && buffer.len() > self.emitted {
            self.renderer
                .render_range(&mut self.out, buffer, self.emitted..buffer.len())?;
            self.partial_shown = true;
        }

        self.out.flush()
    }

    /// Write the rest of the buffer and end the last line
    pub fn finish(&mut self, buffer: &StyledBuffer) -> io::Result<()> {
        self.emitted = self.emitted.min(buffer.len());
        self.clear_partial()?;

        if buffer.len() > self.emitted {
            self.renderer
                .render_range(&mut self.out, buffer, self.emitted..buffer.len())?;
            self.emitted = buffer.len();
        }
        if !buffer.is_empty() && buffer.char_at(buffer.len() - 1) != Some('\n') {
            self.out.write_all(b"\n")?;
        }

        self.out.flush()
    }

    fn clear_partial(&mut self) -> io::Result<()> {
        if self.partial_shown {
            queue!(self.out, Print('\r'), Clear(ClearType::CurrentLine))?;
            self.partial_shown = false;
        }
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

/// Completion notifications on stderr
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&mut self, title: &str, body: &str) {
        let mut stderr = io::stderr();
        let _ = writeln!(stderr, "\x07{}: {}", title, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Preferences;
    use crate::core::term::{OutputState, StreamParser};

    fn buffer_for(input: &[u8]) -> StyledBuffer {
        let mut state = OutputState::new(&Preferences::default());
        StreamParser::new().feed(input, &mut state);
        state.buffer
    }

    fn render(styled: bool, buffer: &StyledBuffer) -> String {
        let mut out = Vec::new();
        Renderer::new(styled)
            .render_range(&mut out, buffer, 0..buffer.len())
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_plain_render() {
        let buffer = buffer_for(b"\x1b[1mbold\x1b[0m and plain");
        assert_eq!(render(false, &buffer), "bold and plain");
    }

    #[test]
    fn test_styled_render() {
        let buffer = buffer_for(b"\x1b[1;31mred\x1b[0m_\x08x");
        let out = render(true, &buffer);

        assert!(out.contains("red"));
        assert!(out.contains("\x1b[1m"), "{:?}", out);
        // Alpha is dropped
        assert!(out.contains("38;2;255;0;0"), "{:?}", out);
        // The underscore overstrike renders an underlined x
        assert!(out.contains("\x1b[4m\x1b[38;2;255;255;255mx"), "{:?}", out);
        assert!(out.ends_with("\x1b[0m"), "{:?}", out);
    }

    #[test]
    fn test_render_partial_range() {
        let buffer = buffer_for(b"ab\x1b[1mcd");
        assert_eq!(render(false, &buffer), "abcd");

        let mut out = Vec::new();
        Renderer::new(false).render_range(&mut out, &buffer, 1..3).unwrap();
        assert_eq!(out, b"bc");
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = StyledBuffer::new();
        assert_eq!(render(false, &buffer), "");
        assert!(!render(true, &buffer).contains("38;2"));
    }

    #[test]
    fn test_live_view_plain_writes_complete_lines() {
        let mut state = OutputState::new(&Preferences::default());
        let mut parser = StreamParser::new();
        let mut view = LiveView::new(Renderer::new(false), Vec::new());

        parser.feed(b"one\ntw", &mut state);
        view.update(&state.buffer).unwrap();
        parser.feed(b"o\nthree", &mut state);
        view.update(&state.buffer).unwrap();
        view.finish(&state.buffer).unwrap();

        assert_eq!(String::from_utf8(view.into_inner()).unwrap(), "one\ntwo\nthree\n");
    }

    #[test]
    fn test_live_view_redraws_progress_line() {
        let mut state = OutputState::new(&Preferences::default());
        let mut parser = StreamParser::new();
        let mut view = LiveView::new(Renderer::new(true), Vec::new());

        parser.feed(b"10%", &mut state);
        view.update(&state.buffer).unwrap();
        parser.feed(b"\r99%", &mut state);
        view.update(&state.buffer).unwrap();
        view.finish(&state.buffer).unwrap();

        let out = String::from_utf8(view.into_inner()).unwrap();
        assert!(out.contains("10%"), "{:?}", out);
        // The partial line is cleared before each redraw
        assert_eq!(out.matches("\r\x1b[2K").count(), 2, "{:?}", out);
        assert!(out.contains("99%"), "{:?}", out);
        assert!(out.ends_with('\n'));
    }
}
