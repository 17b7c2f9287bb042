//! Removal of carriage returns and terminal control sequences.
//!
//! Stripping runs a `vte` parser and keeps only printable characters plus
//! line feeds and tabs. The parser state persists across calls, so an escape
//! sequence split over two reads is still removed.

use std::borrow::Cow;

/// Streaming ANSI/VT100 stripper.
pub struct AnsiStripper {
    parser: vte::Parser,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self {
            parser: vte::Parser::new(),
        }
    }
}

struct Printable<'a> {
    out: &'a mut String,
}

impl vte::Perform for Printable<'_> {
    fn print(&mut self, c: char) {
        self.out.push(c);
    }

    fn execute(&mut self, byte: u8) {
        if matches!(byte, b'\n' | b'\t') {
            self.out.push(char::from(byte));
        }
    }
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the printable part of `text` to `out`.
    pub fn strip_into(&mut self, text: &str, out: &mut String) {
        let mut performer = Printable { out };
        self.parser.advance(&mut performer, text.as_bytes());
    }

    /// Forget any partially parsed sequence.
    pub fn reset(&mut self) {
        self.parser = vte::Parser::new();
    }
}

impl std::fmt::Debug for AnsiStripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnsiStripper").finish_non_exhaustive()
    }
}

/// Strip control sequences from a complete piece of text.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    AnsiStripper::new().strip_into(text, &mut out);
    out
}

/// Drop every `\r`.
pub fn remove_carriage_returns(text: &str) -> Cow<'_, str> {
    if memchr::memchr(b'\r', text.as_bytes()).is_none() {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace('\r', ""))
}

/// Normalize text received from the remote side for matching.
pub fn clean_remote_text(text: &str, strip: bool) -> String {
    let text = remove_carriage_returns(text);
    if strip {
        strip_ansi(&text)
    } else {
        text.into_owned()
    }
}
