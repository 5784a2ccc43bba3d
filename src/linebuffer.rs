//! Bounded buffers of whole lines, used to tail or mail a pipeline's log.
//!
//! The buffer never holds a partial line: overflow evicts the oldest lines,
//! and a single line longer than the line limit is cut and terminated with
//! the truncation marker.

use std::collections::VecDeque;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LineBufferError {
    #[error("not closed")]
    NotClosed,
    #[error("buffer closed")]
    Closed,
}

#[derive(Debug)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    used: usize,
    capacity: usize,
    line_limit: usize,
    trunc: String,
    closed: bool,
}

impl LineBuffer {
    /// `capacity` bounds the total stored bytes; `line_limit` bounds a single
    /// line including its newline and is clamped to `capacity`. A newline is
    /// appended to `trunc` when missing.
    pub fn new(capacity: usize, line_limit: usize, trunc: &str) -> Self {
        let mut trunc = trunc.to_string();
        if !trunc.ends_with('\n') {
            trunc.push('\n');
        }
        let capacity = capacity.max(trunc.len());
        let line_limit = line_limit.clamp(trunc.len(), capacity);
        Self {
            lines: VecDeque::new(),
            used: 0,
            capacity,
            line_limit,
            trunc,
            closed: false,
        }
    }

    /// Append one line; a trailing newline is added when missing.
    pub fn write_line(&mut self, line: &str) -> Result<(), LineBufferError> {
        if self.closed {
            return Err(LineBufferError::Closed);
        }
        let line = line.strip_suffix('\n').unwrap_or(line);
        let stored = if line.len() + 1 > self.line_limit {
            let mut cut = self.line_limit - self.trunc.len();
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}{}", &line[..cut], self.trunc)
        } else {
            format!("{line}\n")
        };

        while self.used + stored.len() > self.capacity {
            match self.lines.pop_front() {
                Some(evicted) => self.used -= evicted.len(),
                None => break,
            }
        }
        self.used += stored.len();
        self.lines.push_back(stored);
        Ok(())
    }

    /// Write every line of a multi-line block.
    pub fn write_lines(&mut self, text: &str) -> Result<(), LineBufferError> {
        for line in text.lines() {
            self.write_line(line)?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Drain the buffer; only valid once it has been closed.
    pub fn read_all(&mut self) -> Result<String, LineBufferError> {
        if !self.closed {
            return Err(LineBufferError::NotClosed);
        }
        let mut out = String::with_capacity(self.used);
        while let Some(line) = self.lines.pop_front() {
            out.push_str(&line);
        }
        self.used = 0;
        Ok(out)
    }

    /// Copy the current contents without consuming them.
    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(self.used);
        for line in &self.lines {
            out.push_str(line);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_keeps_whole_recent_lines() {
        let mut buffer = LineBuffer::new(16, 16, "...");
        buffer.write_line("first").expect("write");
        buffer.write_line("second").expect("write");
        buffer.write_line("third").expect("write");
        assert_eq!(buffer.snapshot(), "second\nthird\n");
        assert!(buffer.len() <= 16);
    }

    #[test]
    fn oversized_line_is_truncated_with_marker() {
        let mut buffer = LineBuffer::new(10, 10, "~");
        buffer.write_line("abcdefghijklmnop").expect("write");
        assert_eq!(buffer.snapshot(), "abcdefgh~\n");
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn destructive_read_requires_close() {
        let mut buffer = LineBuffer::new(64, 32, "[trunc]\n");
        buffer.write_lines("one\ntwo\n").expect("write");
        assert_eq!(buffer.read_all(), Err(LineBufferError::NotClosed));
        buffer.close();
        assert_eq!(buffer.write_line("late"), Err(LineBufferError::Closed));
        assert_eq!(buffer.read_all().expect("read"), "one\ntwo\n");
        assert!(buffer.is_empty());
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let mut buffer = LineBuffer::new(8, 8, "!");
        buffer.write_line("ééééé").expect("write");
        let stored = buffer.snapshot();
        assert!(stored.ends_with("!\n"));
        assert!(stored.len() <= 8);
    }
}
