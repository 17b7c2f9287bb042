//! Channel layer: non-blocking I/O emulation and expect-style matching.
//!
//! This module handles everything between raw shell bytes and the session:
//! retrying would-block primitives, decoding, stripping terminal control
//! sequences, and waiting for ordered pattern sets.

pub mod ansi;
mod blocking;
mod buffer;
mod patterns;
mod pty;

pub use ansi::{clean_remote_text, strip_ansi};
pub use blocking::{Blocking, ReadOutcome};
pub use buffer::{OutputBuffer, lookup_encoding};
pub use patterns::{CompiledMatchSet, MatchSet, compile_pattern};
pub use pty::{ExpectOptions, ExpectResult, PtyChannel, PtyConfig};
