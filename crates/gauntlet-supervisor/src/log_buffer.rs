use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct LogLine {
    pub seq: u64,
    pub text: String,
}

/// Bounded ring buffer for target process stdio. The supervisor always
/// drains piped stdio into this buffer; an undrained pipe deadlocks the
/// child once the OS buffer fills.
pub struct LogRingBuffer {
    inner: Mutex<RingState>,
    capacity: usize,
}

struct RingState {
    lines: VecDeque<LogLine>,
    next_seq: u64,
    dropped: u64,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingState {
                lines: VecDeque::with_capacity(capacity.min(256)),
                next_seq: 0,
                dropped: 0,
            }),
            capacity,
        }
    }

    pub fn push(&self, text: String) {
        let mut state = self.inner.lock().expect("log buffer poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        if state.lines.len() == self.capacity {
            state.lines.pop_front();
            state.dropped += 1;
        }
        state.lines.push_back(LogLine { seq, text });
    }

    /// Most recent `last_n` lines, oldest first.
    pub fn snapshot(&self, last_n: usize) -> Vec<LogLine> {
        let state = self.inner.lock().expect("log buffer poisoned");
        let skip = state.lines.len().saturating_sub(last_n);
        state.lines.iter().skip(skip).cloned().collect()
    }

    pub fn tail_text(&self, last_n: usize) -> String {
        self.snapshot(last_n)
            .into_iter()
            .map(|l| l.text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner.lock().expect("log buffer poisoned").dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let buf = LogRingBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("line-{i}"));
        }
        let lines = buf.snapshot(10);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text, "line-2");
        assert_eq!(lines[2].text, "line-4");
        assert_eq!(buf.dropped_total(), 2);
    }

    #[test]
    fn snapshot_limits_to_requested_tail() {
        let buf = LogRingBuffer::new(10);
        for i in 0..6 {
            buf.push(format!("l{i}"));
        }
        let lines = buf.snapshot(2);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "l4");
        assert_eq!(lines[1].seq, 5);
    }
}
