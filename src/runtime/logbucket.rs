//! Per-node log storage.
//!
//! A bucket hands out one append-only writer per node sequence number,
//! backed either by memory or by files under a directory. `reset` truncates
//! every writer so a flow can be replayed with a clean log.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug)]
enum Sink {
    Memory(Vec<u8>),
    File(File),
}

/// Cloneable append-only writer for one node.
#[derive(Debug, Clone)]
pub struct LogWriter {
    sink: Arc<Mutex<Sink>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.sink.lock() {
            Sink::Memory(data) => {
                data.extend_from_slice(buf);
                Ok(buf.len())
            }
            Sink::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.sink.lock() {
            Sink::Memory(_) => Ok(()),
            Sink::File(file) => file.flush(),
        }
    }
}

/// Bucket of per-seq log writers.
#[derive(Debug)]
pub struct LogBucket {
    dir: Option<PathBuf>,
    writers: Mutex<HashMap<usize, LogWriter>>,
}

impl LogBucket {
    /// A bucket keeping logs in memory.
    pub fn memory() -> Self {
        Self {
            dir: None,
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// A bucket writing one file per node under `dir`.
    pub fn directory(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: Some(dir),
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// The writer for `seq`, created on first use.
    pub fn writer(&self, seq: usize) -> io::Result<LogWriter> {
        let mut writers = self.writers.lock();
        if let Some(writer) = writers.get(&seq) {
            return Ok(writer.clone());
        }
        let sink = match &self.dir {
            None => Sink::Memory(Vec::new()),
            Some(dir) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .read(true)
                    .open(dir.join(format!("{seq}.log")))?;
                Sink::File(file)
            }
        };
        let writer = LogWriter {
            sink: Arc::new(Mutex::new(sink)),
        };
        writers.insert(seq, writer.clone());
        Ok(writer)
    }

    /// Truncate every writer in the bucket.
    pub fn reset(&self) -> io::Result<()> {
        for writer in self.writers.lock().values() {
            match &mut *writer.sink.lock() {
                Sink::Memory(data) => data.clear(),
                Sink::File(file) => {
                    file.set_len(0)?;
                    file.seek(SeekFrom::Start(0))?;
                }
            }
        }
        Ok(())
    }

    /// Read back the full log of `seq`.
    pub fn read(&self, seq: usize) -> io::Result<String> {
        let writers = self.writers.lock();
        let Some(writer) = writers.get(&seq) else {
            return Ok(String::new());
        };
        match &mut *writer.sink.lock() {
            Sink::Memory(data) => Ok(String::from_utf8_lossy(data).into_owned()),
            Sink::File(file) => {
                let mut out = String::new();
                file.seek(SeekFrom::Start(0))?;
                file.read_to_string(&mut out)?;
                file.seek(SeekFrom::End(0))?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_round_trip_and_reset() {
        let bucket = LogBucket::memory();
        let mut writer = bucket.writer(3).unwrap();
        writer.write_all(b"one\n").unwrap();
        writer.write_all(b"two\n").unwrap();
        assert_eq!(bucket.read(3).unwrap(), "one\ntwo\n");

        bucket.reset().unwrap();
        assert_eq!(bucket.read(3).unwrap(), "");
    }

    #[test]
    fn file_backed_writers_truncate_on_reset() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = LogBucket::directory(dir.path()).unwrap();
        let mut writer = bucket.writer(1).unwrap();
        writer.write_all(b"persisted\n").unwrap();
        assert_eq!(bucket.read(1).unwrap(), "persisted\n");

        bucket.reset().unwrap();
        assert_eq!(bucket.read(1).unwrap(), "");

        // The same writer handle keeps appending after a reset.
        writer.write_all(b"again\n").unwrap();
        assert_eq!(bucket.read(1).unwrap(), "again\n");
    }

    #[test]
    fn writers_are_shared_per_seq() {
        let bucket = LogBucket::memory();
        let mut a = bucket.writer(7).unwrap();
        let mut b = bucket.writer(7).unwrap();
        a.write_all(b"a").unwrap();
        b.write_all(b"b").unwrap();
        assert_eq!(bucket.read(7).unwrap(), "ab");
    }
}
