//! Output state management
//!
//! This module defines the styled output buffer, the text attributes applied
//! to it, and the SGR attribute state machine.

use std::ops::Range;

use tracing::debug;

use crate::config::{Preferences, Rgba};

/// The eight basic ANSI colors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnsiColor {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

impl AnsiColor {
    /// Map the last digit of an SGR color code (30-37, 90-97, ...)
    pub fn from_index(n: u16) -> Option<Self> {
        Some(match n {
            0 => AnsiColor::Black,
            1 => AnsiColor::Red,
            2 => AnsiColor::Green,
            3 => AnsiColor::Yellow,
            4 => AnsiColor::Blue,
            5 => AnsiColor::Magenta,
            6 => AnsiColor::Cyan,
            7 => AnsiColor::White,
            _ => return None,
        })
    }

    pub fn rgba(self) -> Rgba {
        match self {
            AnsiColor::Black => Rgba::opaque(0.0, 0.0, 0.0),
            AnsiColor::Red => Rgba::opaque(1.0, 0.0, 0.0),
            AnsiColor::Green => Rgba::opaque(0.0, 1.0, 0.0),
            AnsiColor::Yellow => Rgba::opaque(1.0, 1.0, 0.0),
            AnsiColor::Blue => Rgba::opaque(0.0, 0.0, 1.0),
            AnsiColor::Magenta => Rgba::opaque(1.0, 0.0, 1.0),
            AnsiColor::Cyan => Rgba::opaque(0.0, 1.0, 1.0),
            AnsiColor::White => Rgba::opaque(1.0, 1.0, 1.0),
        }
    }
}

/// Font family and point size
#[derive(Clone, Debug, PartialEq)]
pub struct Font {
    pub family: String,
    pub size: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Underline {
    #[default]
    None,
    Single,
    Double,
}

/// Attributes of a run of text
#[derive(Clone, Debug, PartialEq)]
pub struct TextStyle {
    pub font: Font,
    pub bold: bool,
    pub fg: Rgba,
    /// `None` lets the view's own background show through
    pub bg: Option<Rgba>,
    pub underline: Underline,
}

impl TextStyle {
    pub fn from_preferences(prefs: &Preferences) -> Self {
        Self {
            font: Font {
                family: prefs.font_family.clone(),
                size: prefs.font_size,
            },
            bold: false,
            fg: prefs.text_color,
            bg: None,
            underline: Underline::None,
        }
    }
}

/// A styled range of the buffer
#[derive(Clone, Debug, PartialEq)]
pub struct StyleRun {
    pub len: usize,
    pub style: TextStyle,
}

/// Characters plus the style ranges covering them
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StyledBuffer {
    text: Vec<char>,
    runs: Vec<StyleRun>,
}

impl StyledBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn char_at(&self, index: usize) -> Option<char> {
        self.text.get(index).copied()
    }

    pub fn text(&self) -> String {
        self.text.iter().collect()
    }

    pub fn slice(&self, range: Range<usize>) -> String {
        let end = range.end.min(self.text.len());
        let start = range.start.min(end);
        self.text[start..end].iter().collect()
    }

    /// Style ranges in buffer order
    pub fn runs(&self) -> impl Iterator<Item = (Range<usize>, &TextStyle)> + '_ {
        let mut start = 0;
        self.runs.iter().map(move |run| {
            let range = start..start + run.len;
            start += run.len;
            (range, &run.style)
        })
    }

    #[cfg(test)]
    pub fn style_at(&self, index: usize) -> Option<&TextStyle> {
        self.runs()
            .find(|(range, _)| range.contains(&index))
            .map(|(_, style)| style)
    }

    /// Append characters carrying `style`
    pub fn append(&mut self, chars: &[char], style: &TextStyle) {
        if chars.is_empty() {
            return;
        }
        self.text.extend_from_slice(chars);
        match self.runs.last_mut() {
            Some(last) if last.style == *style => last.len += chars.len(),
            _ => self.runs.push(StyleRun {
                len: chars.len(),
                style: style.clone(),
            }),
        }
    }

    #[cfg(test)]
    pub fn append_str(&mut self, s: &str, style: &TextStyle) {
        let chars: Vec<char> = s.chars().collect();
        self.append(&chars, style);
    }

    /// Append another buffer, keeping its styles
    pub fn append_buffer(&mut self, other: StyledBuffer) {
        let mut start = 0;
        for run in other.runs {
            self.append(&other.text[start..start + run.len], &run.style);
            start += run.len;
        }
    }

    /// Replace one character; it keeps the style already at that position
    pub fn replace_char(&mut self, index: usize, ch: char) {
        if let Some(slot) = self.text.get_mut(index) {
            *slot = ch;
        }
    }

    /// Mutate the style of a single character
    pub fn restyle_char(&mut self, index: usize, f: impl FnOnce(&mut TextStyle)) {
        if index >= self.text.len() {
            return;
        }
        self.split_run_at(index);
        self.split_run_at(index + 1);
        if let Some(run) = self.run_starting_at(index) {
            f(&mut self.runs[run].style);
        }
        self.coalesce();
    }

    /// Mutate every run
    pub fn restyle_all(&mut self, f: impl Fn(&mut TextStyle)) {
        for run in &mut self.runs {
            f(&mut run.style);
        }
        self.coalesce();
    }

    /// Detach everything from `at` onwards
    pub fn split_off(&mut self, at: usize) -> StyledBuffer {
        if at >= self.text.len() {
            return StyledBuffer::new();
        }
        self.split_run_at(at);
        let first_tail_run = self.run_starting_at(at).unwrap_or(self.runs.len());
        StyledBuffer {
            text: self.text.split_off(at),
            runs: self.runs.split_off(first_tail_run),
        }
    }

    /// Offset where the trailing whitespace run begins
    pub fn trailing_whitespace_start(&self) -> usize {
        self.text
            .iter()
            .rposition(|c| !c.is_whitespace())
            .map_or(0, |i| i + 1)
    }

    /// Offset just past the last `\n` before `at`, or 0
    pub fn line_start(&self, at: usize) -> usize {
        let at = at.min(self.text.len());
        self.text[..at]
            .iter()
            .rposition(|c| *c == '\n')
            .map_or(0, |i| i + 1)
    }

    /// Last line with visible content, if any
    pub fn last_nonempty_line(&self) -> Option<String> {
        self.text()
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(str::to_string)
    }

    fn split_run_at(&mut self, pos: usize) {
        let mut start = 0;
        for i in 0..self.runs.len() {
            let end = start + self.runs[i].len;
            if pos > start && pos < end {
                let tail = StyleRun {
                    len: end - pos,
                    style: self.runs[i].style.clone(),
                };
                self.runs[i].len = pos - start;
                self.runs.insert(i + 1, tail);
                return;
            }
            start = end;
        }
    }

    fn run_starting_at(&self, pos: usize) -> Option<usize> {
        let mut start = 0;
        for (i, run) in self.runs.iter().enumerate() {
            if start == pos {
                return Some(i);
            }
            start += run.len;
        }
        None
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<StyleRun> = Vec::with_capacity(self.runs.len());
        for run in self.runs.drain(..) {
            match merged.last_mut() {
                Some(last) if last.style == run.style => last.len += run.len,
                _ => merged.push(run),
            }
        }
        self.runs = merged;
    }
}

/// Current text attributes plus the defaults they reset to
#[derive(Clone, Debug)]
pub struct AttributeState {
    default_fg: Rgba,
    current: TextStyle,
}

impl AttributeState {
    pub fn new(prefs: &Preferences) -> Self {
        Self {
            default_fg: prefs.text_color,
            current: TextStyle::from_preferences(prefs),
        }
    }

    pub fn current(&self) -> &TextStyle {
        &self.current
    }

    pub fn default_fg(&self) -> Rgba {
        self.default_fg
    }

    pub fn set_font(&mut self, font: Font) {
        self.current.font = font;
    }

    pub fn set_text_color(&mut self, color: Rgba) {
        self.default_fg = color;
        self.current.fg = color;
    }

    /// Apply the parameters of one `ESC [ ... m` sequence
    pub fn apply_sgr(&mut self, params: &[&str]) {
        let mut fg = Some(self.current.fg);
        let mut bg = self.current.bg;

        for param in params {
            let code = if param.is_empty() {
                0
            } else {
                match param.parse::<u16>() {
                    Ok(code) => code,
                    Err(_) => {
                        debug!("Ignoring SGR parameter {:?}", param);
                        continue;
                    }
                }
            };

            match code {
                0 => {
                    fg = None;
                    bg = None;
                    self.current.underline = Underline::None;
                    self.current.bold = false;
                }
                1 => self.current.bold = true,
                4 => self.current.underline = Underline::Single,
                // Blink has no rendering
                5 => {}
                7 => {
                    fg = Some(AnsiColor::Black.rgba());
                    bg = Some(AnsiColor::White.rgba());
                }
                8 => fg = bg,
                21 => self.current.underline = Underline::Double,
                22 => self.current.bold = false,
                24 => self.current.underline = Underline::None,
                // Bright colors alias the normal palette
                30..=37 | 90..=97 => fg = AnsiColor::from_index(code % 10).map(AnsiColor::rgba),
                39 => fg = None,
                40..=47 | 100..=107 => bg = AnsiColor::from_index(code % 10).map(AnsiColor::rgba),
                49 => bg = None,
                _ => debug!("Ignoring SGR code {}", code),
            }
        }

        let alpha = self.default_fg.a;
        self.current.fg = fg.map_or(self.default_fg, |c| c.with_alpha(alpha));
        self.current.bg = bg.map(|c| c.with_alpha(alpha));
    }
}

/// Everything a run has rendered so far
#[derive(Clone, Debug)]
pub struct OutputState {
    pub buffer: StyledBuffer,
    /// Logical cursor; may point into the held-back whitespace
    pub cursor: usize,
    pub attrs: AttributeState,
    trailing_whitespace: Option<StyledBuffer>,
}

impl OutputState {
    pub fn new(prefs: &Preferences) -> Self {
        Self {
            buffer: StyledBuffer::new(),
            cursor: 0,
            attrs: AttributeState::new(prefs),
            trailing_whitespace: None,
        }
    }

    /// Cursor clamped to the visible buffer
    #[cfg(test)]
    pub fn visible_cursor(&self) -> usize {
        self.cursor.min(self.buffer.len())
    }

    /// Whitespace currently held out of the visible buffer
    #[cfg(test)]
    pub fn held_whitespace(&self) -> Option<&StyledBuffer> {
        self.trailing_whitespace.as_ref()
    }

    /// Put the held-back whitespace back at the end of the buffer
    pub fn restore_trailing_whitespace(&mut self) {
        if let Some(ws) = self.trailing_whitespace.take() {
            self.buffer.append_buffer(ws);
        }
    }

    /// Detach the trailing whitespace run so it does not show yet
    pub fn hold_trailing_whitespace(&mut self) {
        let start = self.buffer.trailing_whitespace_start();
        if start < self.buffer.len() {
            self.trailing_whitespace = Some(self.buffer.split_off(start));
        }
    }

    /// Move the cursor to column 0 of its line
    pub fn carriage_return(&mut self) {
        while self.cursor > 0 && self.buffer.char_at(self.cursor - 1) != Some('\n') {
            self.cursor -= 1;
        }
    }

    pub fn backspace(&mut self) {
        self.cursor = self.cursor.saturating_sub(1);
    }

    /// Write one character over the one under the cursor
    pub fn overstrike(&mut self, incoming: char) {
        let Some(existing) = self.buffer.char_at(self.cursor) else {
            return;
        };

        if existing == incoming {
            self.buffer.restyle_char(self.cursor, |s| s.bold = true);
        } else if existing == '_' || incoming == '_' {
            if existing == '_' {
                self.buffer.replace_char(self.cursor, incoming);
            }
            self.buffer
                .restyle_char(self.cursor, |s| s.underline = Underline::Single);
        } else if incoming == '\n' {
            while self.cursor < self.buffer.len() && self.buffer.char_at(self.cursor) != Some('\n') {
                self.cursor += 1;
            }
            if self.cursor == self.buffer.len() {
                let style = self.attrs.current().clone();
                self.buffer.append(&['\n'], &style);
            }
        } else {
            self.buffer.replace_char(self.cursor, incoming);
        }
        self.cursor += 1;
    }

    /// Append a run of plain characters at the end
    pub fn append(&mut self, chars: &[char]) {
        let style = self.attrs.current().clone();
        self.buffer.append(chars, &style);
        self.cursor += chars.len();
    }

    /// Preferences changed: restyle existing output and future text
    pub fn apply_preferences(&mut self, prefs: &Preferences) {
        let font = Font {
            family: prefs.font_family.clone(),
            size: prefs.font_size,
        };
        let color = prefs.text_color;
        let restyle = |s: &mut TextStyle| {
            s.font = font.clone();
            s.fg = color;
        };
        self.buffer.restyle_all(restyle);
        if let Some(ws) = self.trailing_whitespace.as_mut() {
            ws.restyle_all(restyle);
        }
        self.attrs.set_font(font);
        self.attrs.set_text_color(color);
    }
}
