use bskit_common::LogStream;

/// Splits raw output chunks into lines, independently per stream.
///
/// A partial trailing line stays buffered until the next chunk for the same
/// stream or [`LineSplitter::finish`]. Trailing `\r` is stripped, blank lines
/// are dropped, and a line that grows past `max_line_bytes` is emitted in
/// pieces of at most that size. Invalid UTF-8 is replaced, not rejected.
#[derive(Debug)]
pub struct LineSplitter {
    max_line_bytes: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineSplitter {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes: max_line_bytes.max(1),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn buffer(&mut self, stream: LogStream) -> &mut Vec<u8> {
        match stream {
            LogStream::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        }
    }

    /// Feed a chunk; returns the lines it completed, in order.
    pub fn push(&mut self, stream: LogStream, bytes: &[u8]) -> Vec<String> {
        let max = self.max_line_bytes;
        let buf = self.buffer(stream);
        let mut lines = Vec::new();

        for &byte in bytes {
            if byte == b'\n' {
                push_line(&mut lines, buf);
                buf.clear();
                continue;
            }
            buf.push(byte);
            if buf.len() >= max {
                push_line(&mut lines, buf);
                buf.clear();
            }
        }
        lines
    }

    /// Flush whatever partial line is buffered for `stream`.
    pub fn finish(&mut self, stream: LogStream) -> Option<String> {
        let buf = std::mem::take(self.buffer(stream));
        let mut lines = Vec::new();
        push_line(&mut lines, &buf);
        lines.pop()
    }

    pub fn has_partial(&self) -> bool {
        !self.stdout.is_empty() || !self.stderr.is_empty()
    }
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    if !text.trim().is_empty() {
        lines.push(text.into_owned());
    }
}
