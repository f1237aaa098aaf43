//! Bounded framed-line reader.
//!
//! The wire protocols here are ASCII and line-delimited with lines no
//! longer than 4096 bytes. The reader enforces that bound: a line longer
//! than the limit is split at the boundary and the remainder continues as
//! the next line, so a misbehaving peer cannot grow a buffer without
//! limit.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Default line limit for the TCP wire protocols.
pub const MAX_LINE: usize = 4096;

/// Reads `\n`-terminated lines from a byte stream, with a hard cap on
/// line length.
pub struct LineReader<R> {
    rdr: R,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    line: Vec<u8>,
    max: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wrap `rdr`, capping lines at `max` bytes.
    pub fn new(rdr: R, max: usize) -> Self {
        Self {
            rdr,
            buf: vec![0; max],
            pos: 0,
            len: 0,
            line: Vec::with_capacity(max),
            max,
            eof: false,
        }
    }

    /// Read the next line, without its trailing `\n`.
    ///
    /// Returns `Ok(None)` at end of stream. A partial line at EOF is
    /// yielded before the stream ends; a line longer than the cap is
    /// yielded in cap-sized pieces.
    pub async fn read_line(&mut self) -> std::io::Result<Option<&[u8]>> {
        self.line.clear();
        loop {
            if self.line.len() >= self.max {
                return Ok(Some(&self.line));
            }
            if self.pos >= self.len {
                if self.eof {
                    if self.line.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(&self.line));
                }
                let n = self.rdr.read(&mut self.buf).await?;
                if n == 0 {
                    self.eof = true;
                    continue;
                }
                self.pos = 0;
                self.len = n;
            }
            let c = self.buf[self.pos];
            self.pos += 1;
            if c == b'\n' {
                return Ok(Some(&self.line));
            }
            self.line.push(c);
        }
    }

    /// Like [`read_line`](Self::read_line) but lossily decoded to a `String`.
    pub async fn read_line_str(&mut self) -> std::io::Result<Option<String>> {
        Ok(self
            .read_line()
            .await?
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn collect(input: &[u8], max: usize) -> Vec<String> {
        let mut rdr = LineReader::new(input, max);
        let mut lines = Vec::new();
        while let Some(line) = rdr.read_line_str().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn splits_on_newlines_and_strips_them() {
        let lines = collect(b"SG-0000000000AA\nHello\n", MAX_LINE).await;
        assert_eq!(lines, vec!["SG-0000000000AA", "Hello"]);
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_yielded() {
        let lines = collect(b"complete\npartial", MAX_LINE).await;
        assert_eq!(lines, vec!["complete", "partial"]);
    }

    #[tokio::test]
    async fn empty_lines_are_preserved() {
        let lines = collect(b"a\n\nb\n", MAX_LINE).await;
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[tokio::test]
    async fn overlong_line_is_split_at_the_cap() {
        // The newline after "efgh" terminates an already-yielded piece, so
        // an empty line follows the split.
        let lines = collect(b"abcdefgh\nxy\n", 4).await;
        assert_eq!(lines, vec!["abcd", "efgh", "", "xy"]);
    }

    #[tokio::test]
    async fn empty_stream_ends_immediately() {
        let lines = collect(b"", MAX_LINE).await;
        assert!(lines.is_empty());
    }
}
