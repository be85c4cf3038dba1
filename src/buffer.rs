use std::collections::VecDeque;

pub const DEFAULT_BUFFER_CAP: usize = 1000;

/// Capped per-session line buffer with FIFO eviction.
///
/// Markers handed out by [`mark`](Self::mark) are absolute line counts, so
/// they stay valid (and clamp correctly) even after old lines have been
/// evicted.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    cap: usize,
    evicted: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            cap: cap.max(1),
            evicted: 0,
        }
    }

    /// Append a raw output chunk, splitting it into lines.
    pub fn push_chunk(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        for line in chunk.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() && chunk.ends_with('\n') {
                // trailing newline, not an empty line of content
                continue;
            }
            self.push_line(line.to_string());
        }
    }

    pub fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.cap {
            self.lines.pop_front();
            self.evicted += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Absolute number of lines ever appended; used as a task-response marker.
    pub fn mark(&self) -> usize {
        self.evicted + self.lines.len()
    }

    /// Join the lines appended at or after an absolute marker.
    pub fn slice_from(&self, marker: usize) -> String {
        let start = marker.saturating_sub(self.evicted).min(self.lines.len());
        self.lines
            .iter()
            .skip(start)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Join the last `n` lines.
    pub fn tail(&self, n: usize) -> String {
        let start = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(start)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_cap() {
        let mut buffer = OutputBuffer::new(5);
        for i in 0..100 {
            buffer.push_line(format!("line {i}"));
            assert!(buffer.len() <= 5);
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.tail(2), "line 98\nline 99");
    }

    #[test]
    fn fifo_eviction_drops_oldest() {
        let mut buffer = OutputBuffer::new(3);
        for line in ["a", "b", "c", "d"] {
            buffer.push_line(line.to_string());
        }
        assert_eq!(buffer.tail(10), "b\nc\nd");
    }

    #[test]
    fn marker_survives_eviction() {
        let mut buffer = OutputBuffer::new(3);
        buffer.push_line("a".to_string());
        let marker = buffer.mark();
        for line in ["b", "c", "d", "e"] {
            buffer.push_line(line.to_string());
        }
        // "b" was evicted; the slice clamps to what is still buffered
        assert_eq!(buffer.slice_from(marker), "c\nd\ne");
    }

    #[test]
    fn slice_from_current_mark_is_empty() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push_line("a".to_string());
        assert_eq!(buffer.slice_from(buffer.mark()), "");
    }

    #[test]
    fn chunk_splitting() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push_chunk("one\r\ntwo\nthree");
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.tail(3), "one\ntwo\nthree");

        let mut buffer = OutputBuffer::new(10);
        buffer.push_chunk("one\n");
        assert_eq!(buffer.len(), 1);
    }
}
