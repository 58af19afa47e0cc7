//! Bounded byte→line framing buffer, plus a fixed-capacity circular buffer.

use crate::error::CoreError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

const TRUNCATION_MARKER: &str = "... [truncated]";

/// Observable statistics for a [`StreamBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamBufferStats {
    /// Current number of unconsumed bytes held in the byte buffer.
    pub current_size: usize,
    /// Configured maximum size in bytes.
    pub max_size: usize,
    /// Number of complete lines currently queued.
    pub line_count: usize,
    /// Total bytes ever ingested.
    pub total_bytes: u64,
    /// Total lines ever extracted.
    pub total_lines: u64,
    /// Number of times `ingest` rejected a chunk due to overflow.
    pub overflow_count: u64,
    /// Whether a trailing partial line is currently buffered.
    pub has_partial: bool,
}

/// Buffers raw bytes from a child process's stdout and extracts
/// newline-terminated, UTF-8 lines under a hard memory bound.
///
/// The buffer never silently truncates the byte backlog: once `size() >=
/// max_size`, `ingest` rejects further bytes with
/// [`CoreError::ResourceExhausted`]. Individual *lines* longer than
/// `max_line_length` are truncated with an explicit marker rather than
/// dropped, and malformed UTF-8 is replaced lossily — never surfaced as a
/// parse error, since stdout framing must never block on decode failures.
pub struct StreamBuffer {
    buffer: Vec<u8>,
    lines: VecDeque<String>,
    partial_line: String,
    max_size: usize,
    max_line_length: usize,
    total_bytes: u64,
    total_lines: u64,
    overflow_count: u64,
}

impl StreamBuffer {
    /// Create a buffer bounded by `max_size` bytes, truncating individual
    /// lines longer than `max_line_length`.
    pub fn new(max_size: usize, max_line_length: usize) -> Self {
        Self {
            buffer: Vec::new(),
            lines: VecDeque::new(),
            partial_line: String::new(),
            max_size,
            max_line_length,
            total_bytes: 0,
            total_lines: 0,
            overflow_count: 0,
        }
    }

    /// Current number of unconsumed bytes held in the byte buffer.
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Number of complete lines currently queued.
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Append `chunk` to the buffer and extract any complete lines.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ResourceExhausted`] if the buffer is already at
    /// `max_size` before this chunk is appended. The chunk is not partially
    /// applied in that case.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
        if self.buffer.len() >= self.max_size {
            self.overflow_count += 1;
            return Err(CoreError::ResourceExhausted(format!(
                "buffer overflow: {} bytes exceeds max {}",
                self.buffer.len(),
                self.max_size
            )));
        }

        if !chunk.is_empty() {
            self.buffer.extend_from_slice(chunk);
            self.total_bytes += chunk.len() as u64;
            self.extract_lines();
        }

        Ok(())
    }

    fn extract_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line_bytes = &line_bytes[..line_bytes.len() - 1]; // drop the '\n'

            let mut line = String::from_utf8_lossy(line_bytes).into_owned();

            if !self.partial_line.is_empty() {
                line = std::mem::take(&mut self.partial_line) + &line;
            }

            if line.len() > self.max_line_length {
                line.truncate(self.max_line_length);
                line.push_str(TRUNCATION_MARKER);
            }

            self.lines.push_back(line);
            self.total_lines += 1;
        }

        if !self.buffer.is_empty() {
            self.partial_line.push_str(&String::from_utf8_lossy(&self.buffer));
            self.buffer.clear();
        }
    }

    /// Pop the next complete line, if any, without blocking.
    pub fn get_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    /// Drain and return all currently complete lines.
    pub fn get_complete_lines(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }

    /// Emit the trailing partial line (if any) as a final line and clear it.
    ///
    /// Called when the underlying stream reaches EOF so that unterminated
    /// trailing output is not silently dropped.
    pub fn flush(&mut self) -> Vec<String> {
        let mut out: Vec<String> = self.lines.drain(..).collect();
        if !self.partial_line.is_empty() {
            out.push(std::mem::take(&mut self.partial_line));
        }
        if !self.buffer.is_empty() {
            out.push(String::from_utf8_lossy(&self.buffer).into_owned());
            self.buffer.clear();
        }
        out
    }

    /// Clear all buffered bytes, lines, and partial state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.lines.clear();
        self.partial_line.clear();
    }

    /// Snapshot the buffer's observable statistics.
    pub fn stats(&self) -> StreamBufferStats {
        StreamBufferStats {
            current_size: self.size(),
            max_size: self.max_size,
            line_count: self.line_count(),
            total_bytes: self.total_bytes,
            total_lines: self.total_lines,
            overflow_count: self.overflow_count,
            has_partial: !self.partial_line.is_empty(),
        }
    }
}

/// Read from `reader` in `chunk_size` chunks, feeding [`StreamBuffer::ingest`],
/// until a complete line is available, `timeout` elapses, or EOF is reached.
///
/// On EOF, any trailing partial line is returned once and then cleared, the
/// same as [`StreamBuffer::flush`] would produce for just that remainder.
pub async fn read_until_line<R>(
    buf: &mut StreamBuffer,
    reader: &mut R,
    timeout: Option<Duration>,
    chunk_size: usize,
) -> Result<Option<String>, CoreError>
where
    R: AsyncRead + Unpin,
{
    let deadline = timeout.map(|d| Instant::now() + d);
    let mut chunk = vec![0u8; chunk_size];

    loop {
        if let Some(line) = buf.get_line() {
            return Ok(Some(line));
        }

        let remaining = match deadline {
            Some(dl) => match dl.checked_duration_since(Instant::now()) {
                Some(d) => d,
                None => return Ok(None),
            },
            None => Duration::from_secs(u64::MAX / 4),
        };

        let read_fut = reader.read(&mut chunk);
        let n = match tokio::time::timeout(remaining, read_fut).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(CoreError::Io(e)),
            Err(_) => return Ok(None),
        };

        if n == 0 {
            let mut rest = buf.flush();
            return Ok(if rest.is_empty() { None } else { Some(rest.remove(0)) });
        }

        buf.ingest(&chunk[..n])?;
    }
}

/// Fixed-capacity byte ring buffer for hot paths that do not need the
/// framing/overflow-error contract of [`StreamBuffer`].
///
/// Unlike `StreamBuffer`, a full `CircularBuffer` does not error on write:
/// it silently writes only as much as fits and returns the count actually
/// written, leaving overflow detection to the caller.
pub struct CircularBuffer {
    buffer: Vec<u8>,
    capacity: usize,
    read_pos: usize,
    write_pos: usize,
    data_size: usize,
}

impl CircularBuffer {
    /// Create a circular buffer of `capacity` bytes. `capacity` should be a
    /// power of two for the wraparound arithmetic to stay cheap, but any
    /// positive value works.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            capacity,
            read_pos: 0,
            write_pos: 0,
            data_size: 0,
        }
    }

    /// Bytes currently available to read.
    pub fn available(&self) -> usize {
        self.data_size
    }

    /// Free space available to write.
    pub fn free_space(&self) -> usize {
        self.capacity - self.data_size
    }

    /// Write as much of `data` as fits. Returns the number of bytes written;
    /// does not error if `data` is larger than the free space.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() || self.capacity == 0 {
            return 0;
        }

        let writable = data.len().min(self.free_space());
        if writable == 0 {
            return 0;
        }

        if self.write_pos + writable <= self.capacity {
            self.buffer[self.write_pos..self.write_pos + writable].copy_from_slice(&data[..writable]);
            self.write_pos = (self.write_pos + writable) % self.capacity;
        } else {
            let first_part = self.capacity - self.write_pos;
            self.buffer[self.write_pos..].copy_from_slice(&data[..first_part]);
            self.buffer[..writable - first_part].copy_from_slice(&data[first_part..writable]);
            self.write_pos = writable - first_part;
        }

        self.data_size += writable;
        writable
    }

    /// Read up to `size` bytes, consuming them from the ring.
    pub fn read(&mut self, size: usize) -> Vec<u8> {
        if self.data_size == 0 {
            return Vec::new();
        }

        let readable = size.min(self.data_size);
        let data = self.peek(readable);

        self.read_pos = (self.read_pos + readable) % self.capacity;
        self.data_size -= readable;
        data
    }

    /// Read up to `size` bytes without consuming them.
    pub fn peek(&self, size: usize) -> Vec<u8> {
        if self.data_size == 0 {
            return Vec::new();
        }

        let readable = size.min(self.data_size);

        if self.read_pos + readable <= self.capacity {
            self.buffer[self.read_pos..self.read_pos + readable].to_vec()
        } else {
            let first_part = self.capacity - self.read_pos;
            let mut out = self.buffer[self.read_pos..].to_vec();
            out.extend_from_slice(&self.buffer[..readable - first_part]);
            out
        }
    }

    /// Reset the buffer to empty without clearing the underlying storage.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.data_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_extracts_complete_lines_and_carries_partial() {
        let mut buf = StreamBuffer::new(1024, 256);
        buf.ingest(b"{\"a\":1}\n{\"b\":2").unwrap();
        assert_eq!(buf.get_line().as_deref(), Some("{\"a\":1}"));
        assert_eq!(buf.get_line(), None);
        buf.ingest(b"}\n").unwrap();
        assert_eq!(buf.get_line().as_deref(), Some("{\"b\":2}"));
    }

    #[test]
    fn overflow_is_a_hard_error_not_silent_truncation() {
        let mut buf = StreamBuffer::new(4, 256);
        buf.ingest(b"abcd").unwrap();
        let err = buf.ingest(b"e").unwrap_err();
        assert!(matches!(err, CoreError::ResourceExhausted(_)));
        assert_eq!(buf.stats().overflow_count, 1);
    }

    #[test]
    fn exactly_max_size_is_accepted() {
        let mut buf = StreamBuffer::new(4, 256);
        buf.ingest(b"abcd").unwrap();
        assert_eq!(buf.size(), 4);
    }

    #[test]
    fn long_line_is_truncated_with_marker_not_dropped() {
        let mut buf = StreamBuffer::new(1024, 8);
        buf.ingest(b"123456789\n").unwrap();
        let line = buf.get_line().unwrap();
        assert!(line.starts_with("12345678"));
        assert!(line.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn malformed_utf8_is_replaced_lossily() {
        let mut buf = StreamBuffer::new(1024, 256);
        let mut chunk = vec![0xffu8, 0xfe];
        chunk.push(b'\n');
        buf.ingest(&chunk).unwrap();
        let line = buf.get_line().unwrap();
        assert!(line.contains('\u{FFFD}'));
    }

    #[test]
    fn flush_emits_trailing_partial_as_final_line() {
        let mut buf = StreamBuffer::new(1024, 256);
        buf.ingest(b"complete\npartial-no-newline").unwrap();
        let mut lines = buf.flush();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines.remove(0), "complete");
        assert_eq!(lines.remove(0), "partial-no-newline");
        assert_eq!(buf.stats().current_size, 0);
    }

    #[test]
    fn circular_buffer_wraps_and_truncates_writes_silently() {
        let mut ring = CircularBuffer::new(4);
        assert_eq!(ring.write(b"ab"), 2);
        assert_eq!(ring.read(1), b"a");
        assert_eq!(ring.write(b"cde"), 3); // wraps: free space was 3
        assert_eq!(ring.available(), 4);
        assert_eq!(ring.write(b"z"), 0); // full: truncates to 0, does not error
        assert_eq!(ring.read(10), b"bcde");
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn circular_buffer_peek_does_not_consume() {
        let mut ring = CircularBuffer::new(8);
        ring.write(b"hello");
        assert_eq!(ring.peek(5), b"hello");
        assert_eq!(ring.available(), 5);
        assert_eq!(ring.read(5), b"hello");
        assert_eq!(ring.available(), 0);
    }
}
