//! In-memory log of the most recent events, dumped when a subtest fails

use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing_subscriber::fmt::MakeWriter;

/// Number of log records kept
pub const CAPACITY: usize = 256;

/// A bounded log sink shared between the logging layer and the harness
#[derive(Debug, Clone, Default)]
pub struct RingBuffer {
    records: Arc<Mutex<VecDeque<String>>>,
}

impl RingBuffer {
    pub fn new() -> RingBuffer {
        RingBuffer::default()
    }

    fn records(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, record: String) {
        let mut records = self.records();
        if records.len() == CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Forgets everything logged so far
    pub fn reset(&self) {
        self.records().clear();
    }

    /// Writes the buffered records between markers and empties the buffer
    pub fn dump(&self, out: &mut impl Write) -> io::Result<()> {
        let records = std::mem::take(&mut *self.records());
        writeln!(out, "**** DEBUG ****")?;
        for record in records {
            writeln!(out, "{}", record)?;
        }
        writeln!(out, "****  END  ****")?;
        out.flush()
    }
}

/// Writer handed out per log event, committing its line on drop
#[derive(Debug)]
pub struct RecordWriter {
    ring: RingBuffer,
    buf: Vec<u8>,
}

impl Write for RecordWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines().filter(|line| !line.is_empty()) {
            self.ring.push(line.to_owned());
        }
    }
}

impl<'a> MakeWriter<'a> for RingBuffer {
    type Writer = RecordWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RecordWriter {
            ring: self.clone(),
            buf: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RingBuffer, CAPACITY};
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    fn log(ring: &RingBuffer, line: &str) {
        let mut writer = ring.make_writer();
        writeln!(writer, "{}", line).unwrap();
    }

    #[test]
    fn keeps_the_latest_records() {
        let ring = RingBuffer::new();
        for i in 0..CAPACITY + 10 {
            log(&ring, &format!("record {}", i));
        }
        assert_eq!(ring.len(), CAPACITY);

        let mut out = Vec::new();
        ring.dump(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.first(), Some(&"**** DEBUG ****"));
        assert_eq!(lines.last(), Some(&"****  END  ****"));
        assert_eq!(lines[1], "record 10");
        assert_eq!(lines.len(), CAPACITY + 2);
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn reset_empties() {
        let ring = RingBuffer::new();
        log(&ring, "a");
        ring.reset();
        assert_eq!(ring.len(), 0);
    }
}
