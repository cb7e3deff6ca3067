//! Output stream parser
//!
//! Decodes raw child-process output and applies it to an `OutputState`:
//! plain text, backspace/carriage-return overstrike and `ESC [ ... m`
//! sequences. Anything that cannot be interpreted yet (a truncated escape
//! sequence or a partial UTF-8 unit) is carried over to the next chunk.

use tracing::debug;

use super::state::OutputState;

const BS: char = '\x08';
const CR: char = '\x0d';
const ESC: char = '\x1b';

/// Printed in place of bytes that are not valid UTF-8
const REPLACEMENT: char = '?';

/// Longest parameter list kept waiting for its final character
const MAX_PARAMS_LEN: usize = 256;

/// Incremental parser; one per run
#[derive(Debug, Default)]
pub struct StreamParser {
    carry: Vec<u8>,
}

/// Characters decoded from a byte buffer, with their byte offsets
struct Decoded {
    chars: Vec<char>,
    offsets: Vec<usize>,
    /// Bytes from here on are an incomplete UTF-8 sequence
    complete_up_to: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back from the previous chunk
    #[cfg(test)]
    pub fn carry(&self) -> &[u8] {
        &self.carry
    }

    /// Feed one chunk of output
    pub fn feed(&mut self, chunk: &[u8], state: &mut OutputState) {
        if chunk.is_empty() {
            return;
        }

        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);
        let decoded = decode(&bytes);

        state.restore_trailing_whitespace();
        let consumed = self.scan(&decoded.chars, state);
        let carry_from = decoded
            .offsets
            .get(consumed)
            .copied()
            .unwrap_or(decoded.complete_up_to);
        self.carry = bytes[carry_from..].to_vec();
        state.hold_trailing_whitespace();

        if !self.carry.is_empty() {
            debug!("Carrying {} bytes to the next chunk", self.carry.len());
        }
    }

    /// Apply as many characters as possible; returns how many were consumed
    fn scan(&self, chars: &[char], state: &mut OutputState) -> usize {
        let n = chars.len();
        let mut i = 0;

        while i < n {
            match chars[i] {
                ESC => {
                    // ESC [ x is the shortest sequence we can act on
                    if n - i < 3 {
                        break;
                    }
                    if chars[i + 1] != '[' {
                        i += 1;
                        continue;
                    }
                    let params_start = i + 2;
                    let Some(kind_at) = chars[params_start..]
                        .iter()
                        .position(|c| !is_param_char(*c))
                        .map(|p| params_start + p)
                    else {
                        let pending = n - params_start;
                        if pending <= MAX_PARAMS_LEN {
                            // The type character has not arrived yet
                            break;
                        }
                        debug!("Dropping escape sequence with {} parameter characters", pending);
                        i = n;
                        continue;
                    };
                    let params: String = chars[params_start..kind_at].iter().collect();
                    self.dispatch(chars[kind_at], &params, state);
                    i = kind_at + 1;
                }
                BS => {
                    state.backspace();
                    i += 1;
                }
                CR => {
                    i += 1;
                    state.carriage_return();
                }
                ch if state.cursor < state.buffer.len() => {
                    state.overstrike(ch);
                    i += 1;
                }
                _ => {
                    let end = chars[i..]
                        .iter()
                        .position(|c| is_special(*c))
                        .map_or(n, |p| i + p);
                    state.append(&chars[i..end]);
                    i = end;
                }
            }
        }

        i
    }

    fn dispatch(&self, kind: char, params: &str, state: &mut OutputState) {
        match kind {
            'm' => {
                let params: Vec<&str> = params.split(';').collect();
                state.attrs.apply_sgr(&params);
            }
            _ => {
                debug!("Ignoring escape sequence: params={:?}, final={:?}", params, kind);
            }
        }
    }
}

fn is_param_char(c: char) -> bool {
    c.is_ascii_digit() || c == ';'
}

fn is_special(c: char) -> bool {
    c == BS || c == CR || c == ESC
}

/// Decode UTF-8, substituting invalid sequences and stopping before an
/// incomplete trailing one
fn decode(bytes: &[u8]) -> Decoded {
    let mut chars = Vec::with_capacity(bytes.len());
    let mut offsets = Vec::with_capacity(bytes.len());
    let mut pos = 0;

    while pos < bytes.len() {
        let (valid, error_len) = match std::str::from_utf8(&bytes[pos..]) {
            Ok(s) => (s, None),
            Err(e) => {
                let (head, _) = bytes[pos..].split_at(e.valid_up_to());
                // `head` was just validated
                let head = std::str::from_utf8(head).unwrap_or_default();
                match e.error_len() {
                    Some(len) => (head, Some(len)),
                    None => {
                        push_chars(head, pos, &mut chars, &mut offsets);
                        return Decoded {
                            chars,
                            offsets,
                            complete_up_to: pos + head.len(),
                        };
                    }
                }
            }
        };

        push_chars(valid, pos, &mut chars, &mut offsets);
        pos += valid.len();

        if let Some(len) = error_len {
            chars.push(REPLACEMENT);
            offsets.push(pos);
            pos += len;
        }
    }

    Decoded {
        chars,
        offsets,
        complete_up_to: bytes.len(),
    }
}

fn push_chars(s: &str, base: usize, chars: &mut Vec<char>, offsets: &mut Vec<usize>) {
    for (offset, ch) in s.char_indices() {
        chars.push(ch);
        offsets.push(base + offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Preferences, Rgba};
    use crate::core::term::state::{StyledBuffer, Underline};
    use proptest::prelude::*;

    fn feed_all(chunks: &[&[u8]]) -> (StreamParser, OutputState) {
        let mut parser = StreamParser::new();
        let mut state = OutputState::new(&Preferences::default());
        for chunk in chunks {
            parser.feed(chunk, &mut state);
        }
        (parser, state)
    }

    fn red() -> Rgba {
        Rgba::new(1.0, 0.0, 0.0, 0.9)
    }

    #[test]
    fn test_plain_text() {
        let (_, state) = feed_all(&[b"hello world"]);
        assert_eq!(state.buffer.text(), "hello world");
        assert_eq!(state.cursor, 11);
        assert_eq!(state.buffer.runs().count(), 1);
    }

    #[test]
    fn test_backspace_overstrike_bold() {
        let (_, state) = feed_all(&[b"A\x08A"]);
        assert_eq!(state.buffer.text(), "A");
        assert!(state.buffer.style_at(0).unwrap().bold);
        assert_eq!(state.cursor, 1);
    }

    #[test]
    fn test_backspace_underscore_underline() {
        let (_, state) = feed_all(&[b"A\x08_"]);
        assert_eq!(state.buffer.text(), "A");
        assert_eq!(state.buffer.style_at(0).unwrap().underline, Underline::Single);

        let (_, state) = feed_all(&[b"_\x08B"]);
        assert_eq!(state.buffer.text(), "B");
        assert_eq!(state.buffer.style_at(0).unwrap().underline, Underline::Single);
    }

    #[test]
    fn test_man_page_heading() {
        let (_, state) = feed_all(&[b"N\x08NA\x08AM\x08ME\x08E\n"]);
        assert_eq!(state.buffer.text(), "NAME");
        let runs: Vec<_> = state.buffer.runs().map(|(r, s)| (r, s.bold)).collect();
        assert_eq!(runs, vec![(0..4, true)]);
    }

    #[test]
    fn test_sgr_round_trip() {
        let (mut parser, mut state) = feed_all(&[b"\x1b[31mHi \x1b[0m"]);
        assert_eq!(state.buffer.text(), "Hi");
        assert_eq!(state.buffer.style_at(0).unwrap().fg, red());
        assert_eq!(state.held_whitespace().map(StyledBuffer::text).as_deref(), Some(" "));

        parser.feed(b"x", &mut state);
        assert_eq!(state.buffer.text(), "Hi x");
        let plain = state.buffer.style_at(3).unwrap();
        assert_eq!(plain.fg, Preferences::default().text_color);
        assert!(!plain.bold);
        assert_eq!(plain.underline, Underline::None);
    }

    #[test]
    fn test_split_escape_sequence() {
        let (split_parser, split) = feed_all(&[b"\x1b[", b"31mX"]);
        let (_, whole) = feed_all(&[b"\x1b[31mX"]);
        assert_eq!(split.buffer, whole.buffer);
        assert_eq!(split.cursor, whole.cursor);
        assert!(split_parser.carry().is_empty());
        assert_eq!(split.buffer.style_at(0).unwrap().fg, red());
    }

    #[test]
    fn test_truncated_sequence_is_carried() {
        let (parser, state) = feed_all(&[b"abc\x1b[3"]);
        assert_eq!(state.buffer.text(), "abc");
        assert_eq!(parser.carry(), b"\x1b[3");

        let (parser, _) = feed_all(&[b"abc\x1b"]);
        assert_eq!(parser.carry(), b"\x1b");
    }

    #[test]
    fn test_endless_parameters_are_dropped() {
        let mut parser = StreamParser::new();
        let mut state = OutputState::new(&Preferences::default());
        parser.feed(b"ok\x1b[", &mut state);
        for _ in 0..100 {
            parser.feed(b"1;2;3;4;5;", &mut state);
            assert!(parser.carry().len() <= MAX_PARAMS_LEN + 2);
        }

        parser.feed(b"m", &mut state);
        assert!(state.buffer.text().starts_with("ok"));
        assert!(!state.attrs.current().bold);
    }

    #[test]
    fn test_malformed_and_unknown_sequences() {
        let (_, state) = feed_all(&[b"a\x1bXb"]);
        assert_eq!(state.buffer.text(), "aXb");

        let (_, state) = feed_all(&[b"a\x1b[2Kb"]);
        assert_eq!(state.buffer.text(), "ab");
    }

    #[test]
    fn test_empty_sgr_resets() {
        let (_, state) = feed_all(&[b"\x1b[1;4mA\x1b[mB"]);
        assert!(state.buffer.style_at(0).unwrap().bold);
        let b = state.buffer.style_at(1).unwrap();
        assert!(!b.bold);
        assert_eq!(b.underline, Underline::None);
    }

    #[test]
    fn test_trailing_whitespace_holdback() {
        let (mut parser, mut state) = feed_all(&[b"done\n"]);
        assert_eq!(state.buffer.text(), "done");

        parser.feed(b"", &mut state);
        assert_eq!(state.buffer.text(), "done");

        parser.feed(b"next\n", &mut state);
        assert_eq!(state.buffer.text(), "done\nnext");
        assert_eq!(state.cursor, 10);
        assert_eq!(state.visible_cursor(), 9);
    }

    #[test]
    fn test_carriage_return_progress() {
        let (_, state) = feed_all(&[b"10%\r20%\r", b"30%"]);
        assert_eq!(state.buffer.text(), "30%");

        let (_, state) = feed_all(&[b"one\r\ntwo\r\n"]);
        assert_eq!(state.buffer.text(), "one\ntwo");
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let bytes = "héllo".as_bytes();
        let (parser, state) = feed_all(&[&bytes[..2], &bytes[2..]]);
        assert_eq!(state.buffer.text(), "héllo");
        assert!(parser.carry().is_empty());
    }

    #[test]
    fn test_invalid_utf8_becomes_placeholder() {
        let (_, state) = feed_all(&[b"a\xffb"]);
        assert_eq!(state.buffer.text(), "a?b");

        let (_, state) = feed_all(&[b"a\xe2", b"b"]);
        assert_eq!(state.buffer.text(), "a?b");
    }

    fn fragment() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just("a"),
            Just("xyz"),
            Just("_"),
            Just(" "),
            Just("\n"),
            Just("\x08"),
            Just("\r"),
            Just("é"),
            Just("\x1b[31m"),
            Just("\x1b[0m"),
            Just("\x1b[1;4;42m"),
            Just("\x1b[m"),
            Just("\x1b[2K"),
            Just("\x1bX"),
        ]
    }

    proptest! {
        #[test]
        fn chunk_splitting_does_not_change_output(
            fragments in prop::collection::vec(fragment(), 0..40),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let input: Vec<u8> = fragments.concat().into_bytes();

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(input.len() + 1)).collect();
            points.sort_unstable();
            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for point in points {
                chunks.push(&input[start..point]);
                start = point;
            }
            chunks.push(&input[start..]);

            let (whole_parser, whole) = feed_all(&[input.as_slice()]);
            let (split_parser, split) = feed_all(&chunks);

            prop_assert_eq!(&split.buffer, &whole.buffer);
            prop_assert_eq!(split.cursor, whole.cursor);
            prop_assert_eq!(split.held_whitespace(), whole.held_whitespace());
            prop_assert_eq!(split_parser.carry(), whole_parser.carry());
        }

        #[test]
        fn plain_text_is_appended_verbatim(text in "[a-zA-Z0-9 .,:/_-]{0,64}\n?") {
            let (_, state) = feed_all(&[text.as_bytes()]);
            prop_assert_eq!(state.buffer.text(), text.trim_end().to_string());
            prop_assert!(state.buffer.runs().count() <= 1);
        }
    }
}
