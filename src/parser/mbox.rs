//! Streaming MBOX parser.
//!
//! Reads MBOX files line-by-line through a large buffer and never loads the
//! whole file into memory. Tolerant of malformed input.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, SummaryError};

/// Default size of the read buffer (1 MB for fast sequential reads on modern SSDs).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default maximum message size in bytes (256 MB).
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

/// Progress is reported every 4 MB.
const PROGRESS_INTERVAL: u64 = 4 * 1024 * 1024;

/// One message found by [`MboxParser`].
#[derive(Debug, Clone, Copy)]
pub struct RawMessage<'a> {
    /// Offset of the `From ` line.
    pub offset: u64,
    /// Bytes the message occupies in the file, up to the next separator.
    pub span: u64,
    /// The message bytes, `From ` line included, cut at the size limit.
    pub data: &'a [u8],
}

impl RawMessage<'_> {
    /// `true` when `data` stops short of the message on disk.
    pub fn is_truncated(&self) -> bool {
        (self.data.len() as u64) < self.span
    }
}

/// Streaming MBOX parser.
///
/// Walks the file sequentially, invoking a caller-supplied callback for every
/// message it finds. The parser is tolerant of:
///
/// - Mixed `\n` and `\r\n` line endings
/// - `From ` lines not preceded by a blank line (logs a warning)
/// - Truncated messages at EOF
/// - NUL bytes and other binary content in the body
/// - UTF-8 BOM at the start of the file
pub struct MboxParser {
    path: PathBuf,
    file_size: u64,
    buffer_size: usize,
    max_message_size: usize,
}

impl MboxParser {
    /// Create a parser for the given MBOX file.
    ///
    /// Verifies that the file exists and is readable, but does NOT validate
    /// that it is actually an MBOX.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SummaryError::FileNotFound(path.clone())
            } else {
                SummaryError::io(&path, e)
            }
        })?;
        Ok(Self {
            path,
            file_size: metadata.len(),
            buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
        })
    }

    /// Use a read buffer of `size` bytes (at least 4 KB).
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(4096);
        self
    }

    /// Cap the bytes kept per message. Longer messages are delivered cut
    /// short, with their full length in [`RawMessage::span`].
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Total size of the underlying file in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the full MBOX. See [`MboxParser::parse_from`].
    pub fn parse(
        &self,
        message_callback: &mut dyn FnMut(RawMessage<'_>) -> bool,
        progress_callback: Option<&dyn Fn(u64, u64)>,
    ) -> Result<u64> {
        self.parse_from(0, message_callback, progress_callback)
    }

    /// Parse messages starting at byte `start`, which must be the beginning
    /// of a `From ` line (or 0).
    ///
    /// The callback receives each [`RawMessage`] and returns `true` to
    /// continue or `false` to stop early. Returns the number of messages
    /// delivered.
    pub fn parse_from(
        &self,
        start: u64,
        message_callback: &mut dyn FnMut(RawMessage<'_>) -> bool,
        progress_callback: Option<&dyn Fn(u64, u64)>,
    ) -> Result<u64> {
        if start >= self.file_size {
            return Ok(0);
        }

        let mut file = File::open(&self.path).map_err(|e| SummaryError::io(&self.path, e))?;
        if start > 0 {
            file.seek(SeekFrom::Start(start))
                .map_err(|e| SummaryError::io(&self.path, e))?;
            debug!(path = %self.path.display(), start, "Resuming mbox scan");
        }
        let mut reader = BufReader::with_capacity(self.buffer_size, file);

        let mut count: u64 = 0;
        let mut current_offset = start;
        let mut message_buf: Vec<u8> = Vec::with_capacity(64 * 1024);
        let mut message_start = start;
        let mut prev_line_was_empty = true;
        let mut first_line = true;
        let mut truncated = false;
        let mut last_progress = start;

        // Reusable line buffer
        let mut line_buf: Vec<u8> = Vec::with_capacity(4096);

        loop {
            line_buf.clear();
            let line_len = {
                let buf = reader
                    .fill_buf()
                    .map_err(|e| SummaryError::io(&self.path, e))?;
                if buf.is_empty() {
                    break; // EOF
                }
                let consume_len = match memchr_newline(buf) {
                    Some(pos) => pos + 1,
                    None => buf.len(),
                };
                line_buf.extend_from_slice(&buf[..consume_len]);
                reader.consume(consume_len);
                consume_len as u64
            };

            if is_mbox_separator(&line_buf) {
                if !first_line && !prev_line_was_empty {
                    warn!(
                        offset = current_offset,
                        "Found 'From ' separator without preceding blank line"
                    );
                }
                if !message_buf.is_empty() {
                    let message = RawMessage {
                        offset: message_start,
                        span: current_offset - message_start,
                        data: &message_buf,
                    };
                    if !message_callback(message) {
                        return Ok(count);
                    }
                    count += 1;
                }
                message_start = current_offset;
                truncated = false;
                message_buf.clear();
                message_buf.extend_from_slice(&line_buf);
            } else if !truncated && message_buf.len() + line_buf.len() <= self.max_message_size {
                message_buf.extend_from_slice(&line_buf);
            } else if !truncated {
                warn!(
                    offset = message_start,
                    max_size = self.max_message_size,
                    "Message exceeds maximum size, truncating body"
                );
                truncated = true;
            }

            prev_line_was_empty = is_blank_line(&line_buf);
            first_line = false;
            current_offset += line_len;

            if let Some(cb) = progress_callback {
                if current_offset - last_progress >= PROGRESS_INTERVAL {
                    cb(current_offset, self.file_size);
                    last_progress = current_offset;
                }
            }
        }

        // Flush last message
        if !message_buf.is_empty() {
            let message = RawMessage {
                offset: message_start,
                span: current_offset - message_start,
                data: &message_buf,
            };
            if message_callback(message) {
                count += 1;
            }
        }

        if let Some(cb) = progress_callback {
            cb(self.file_size, self.file_size);
        }

        Ok(count)
    }

    /// Read `length` bytes at `offset`.
    ///
    /// Uses `seek` to jump directly to the message without scanning the file.
    pub fn read_message_at(path: impl AsRef<Path>, offset: u64, length: u64) -> Result<Vec<u8>> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| SummaryError::io(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SummaryError::io(path, e))?;
        let length = usize::try_from(length).map_err(|_| SummaryError::ParseError {
            offset,
            reason: format!("message length {length} does not fit in memory"),
        })?;
        let mut buffer = vec![0u8; length];
        file.read_exact(&mut buffer)
            .map_err(|e| SummaryError::io(path, e))?;
        Ok(buffer)
    }

    /// `true` when a `From ` line starts exactly at `offset`.
    pub fn separator_at(path: impl AsRef<Path>, offset: u64) -> Result<bool> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| SummaryError::io(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SummaryError::io(path, e))?;
        let mut head = [0u8; 5];
        match file.read_exact(&mut head) {
            Ok(()) => Ok(&head == b"From "),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(SummaryError::io(path, e)),
        }
    }
}

/// Fast newline search (equivalent to memchr for `\n`).
#[inline]
fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Check whether a line is an MBOX separator (`From ` at the start).
pub fn is_mbox_separator(line: &[u8]) -> bool {
    // Skip BOM if present at very start
    let line = line.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(line);
    line.starts_with(b"From ")
}

/// Check whether a line is blank (empty or only whitespace / CR / LF).
fn is_blank_line(line: &[u8]) -> bool {
    line.iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
}
