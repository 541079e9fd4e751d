//! [`LineReader`] – newline-delimited reads with a length limit.
//!
//! All state lives in the reader, so [`LineReader::next_line`] is safe to use
//! as a `tokio::select!` branch: a cancelled call loses no bytes.

use tokio::io::{self, AsyncBufReadExt, AsyncRead, BufReader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// One line without its terminator.  Invalid UTF-8 is replaced lossily.
    Line(String),
    /// A line exceeded the limit; it is skipped up to its newline and
    /// reported once.
    TooLong,
}

pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(256),
            max_line,
            discarding: false,
        }
    }

    /// Next line, or `None` at end of stream.  A final unterminated line is
    /// returned before `None`.
    pub async fn next_line(&mut self) -> io::Result<Option<LineEvent>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                self.discarding = false;
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let discarding = self.discarding;
                    if !discarding {
                        self.buf.extend_from_slice(&available[..pos]);
                    }
                    self.inner.consume(pos + 1);
                    self.discarding = false;
                    if discarding {
                        continue;
                    }
                    if self.buf.len() > self.max_line {
                        self.buf.clear();
                        return Ok(Some(LineEvent::TooLong));
                    }
                    return Ok(Some(self.take_line()));
                }
                None => {
                    let n = available.len();
                    if !self.discarding {
                        self.buf.extend_from_slice(available);
                    }
                    self.inner.consume(n);
                    if !self.discarding && self.buf.len() > self.max_line {
                        self.buf.clear();
                        self.discarding = true;
                        return Ok(Some(LineEvent::TooLong));
                    }
                }
            }
        }
    }

    fn take_line(&mut self) -> LineEvent {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        LineEvent::Line(line)
    }
}
