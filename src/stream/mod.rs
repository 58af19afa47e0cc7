//! Byte-to-line framing and JSONL decoding for child process stdio
//!
//! - `buffer`   -- [`buffer::StreamBuffer`], a bounded byte→line framer with
//!   partial-line carry and overflow detection, plus [`buffer::CircularBuffer`]
//!   for fixed-capacity hot paths.
//! - `parser`   -- [`parser::JsonlParser`], schema-checked JSON line decoding.
//! - `event`    -- [`event::StreamEvent`], the tagged-variant sum type decoded
//!   from a session's stdout.

pub mod buffer;
pub mod event;
pub mod parser;

pub use buffer::{CircularBuffer, StreamBuffer, StreamBufferStats};
pub use event::StreamEvent;
pub use parser::{JsonlParser, ParseErrorRecord, ParserStats};
