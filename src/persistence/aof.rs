// # Append-Only Operation Log
//
// One log file per node. Every record is framed as
//
//   [u32 payload length][u32 crc32 of payload][bincode payload]
//
// and appended under a single-writer lock, so byte positions are record
// boundaries and replay order is commit order. A torn tail (partial frame,
// bad checksum, undecodable payload) is detected by scanning on open and
// truncated away; everything before it replays normally.

use super::{LogRecord, SyncPolicy};
use crate::error::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

const FRAME_HEADER: u64 = 8;

fn codec() -> bincode::config::Configuration {
    bincode::config::standard()
}

struct AofWriter {
    writer: BufWriter<File>,
}

pub struct AofLog {
    path: PathBuf,
    sync_policy: SyncPolicy,
    inner: Mutex<AofWriter>,
    position: AtomicU64,
    records_appended: AtomicU64,
}

/// What `open` found on disk.
#[derive(Debug, Clone, Copy)]
pub struct OpenReport {
    pub initial_size: u64,
    pub truncated_bytes: u64,
}

impl AofLog {
    /// Open (or create) the log in append mode. The tail is scanned and
    /// any unparseable suffix truncated before the writer attaches.
    pub fn open(path: &Path, sync_policy: SyncPolicy) -> Result<(Self, OpenReport)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (valid_len, total_len) = scan_valid_length(path)?;
        let truncated = total_len.saturating_sub(valid_len);
        if truncated > 0 {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            warn!(
                path = %path.display(),
                truncated_bytes = truncated,
                "truncated corrupt tail from operation log"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let log = Self {
            path: path.to_path_buf(),
            sync_policy,
            inner: Mutex::new(AofWriter {
                writer: BufWriter::new(file),
            }),
            position: AtomicU64::new(valid_len),
            records_appended: AtomicU64::new(0),
        };
        Ok((
            log,
            OpenReport {
                initial_size: valid_len,
                truncated_bytes: truncated,
            },
        ))
    }

    /// Append one record. Returns the log position after the record, which
    /// is the replay offset for everything that follows it.
    pub fn append(&self, record: &LogRecord) -> Result<u64> {
        let payload = bincode::serde::encode_to_vec(record, codec())?;
        let crc = crc32fast::hash(&payload);

        let mut inner = self.inner.lock();
        inner.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        inner.writer.write_all(&crc.to_le_bytes())?;
        inner.writer.write_all(&payload)?;
        // Push to the OS on every append; fsync only when the policy says.
        inner.writer.flush()?;
        if self.sync_policy == SyncPolicy::Always {
            inner.writer.get_ref().sync_data()?;
        }
        // Position advances under the writer lock so each returned end
        // matches an actual record boundary.
        let frame_len = FRAME_HEADER + payload.len() as u64;
        let end = self.position.fetch_add(frame_len, Ordering::AcqRel) + frame_len;
        drop(inner);

        self.records_appended.fetch_add(1, Ordering::Relaxed);
        Ok(end)
    }

    /// Flush and fsync. Driven every second by the background task under
    /// the everysec policy, and once more on shutdown.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Current end of the log in bytes.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u64 {
        self.position()
    }

    pub fn records_appended(&self) -> u64 {
        self.records_appended.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read records in order starting at byte offset `start`. Stops cleanly
    /// at a torn tail and reports how many bytes it skipped.
    pub fn replay_from(path: &Path, start: u64) -> Result<ReplayReport> {
        let mut records = Vec::new();
        if !path.exists() {
            return Ok(ReplayReport {
                records,
                valid_end: 0,
                truncated_bytes: 0,
            });
        }

        let mut file = File::open(path)?;
        let total = file.metadata()?.len();
        let mut offset = start.min(total);
        file.seek(SeekFrom::Start(offset))?;

        loop {
            match read_frame(&mut file, total, offset)? {
                Some((record, next_offset)) => {
                    records.push(record);
                    offset = next_offset;
                }
                None => break,
            }
        }

        Ok(ReplayReport {
            records,
            valid_end: offset,
            truncated_bytes: total.saturating_sub(offset),
        })
    }

    /// Rewrite the log as the minimal record set reconstructing current
    /// state, atomically replacing the live file. Returns the new size.
    pub fn compact(&self, records: &[LogRecord]) -> Result<u64> {
        let tmp_path = self.path.with_extension("aof.tmp");
        let mut inner = self.inner.lock();

        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            for record in records {
                let payload = bincode::serde::encode_to_vec(record, codec())?;
                let crc = crc32fast::hash(&payload);
                writer.write_all(&(payload.len() as u32).to_le_bytes())?;
                writer.write_all(&crc.to_le_bytes())?;
                writer.write_all(&payload)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let new_size = file.metadata()?.len();
        inner.writer = BufWriter::new(file);
        self.position.store(new_size, Ordering::Release);
        Ok(new_size)
    }
}

/// Result of a replay pass.
#[derive(Debug)]
pub struct ReplayReport {
    pub records: Vec<LogRecord>,
    pub valid_end: u64,
    pub truncated_bytes: u64,
}

fn scan_valid_length(path: &Path) -> Result<(u64, u64)> {
    if !path.exists() {
        return Ok((0, 0));
    }
    let mut file = File::open(path)?;
    let total = file.metadata()?.len();
    let mut offset = 0u64;
    loop {
        match read_frame(&mut file, total, offset)? {
            Some((_, next_offset)) => offset = next_offset,
            None => break,
        }
    }
    Ok((offset, total))
}

/// Read one frame at `offset`. Returns None on a clean end or any sign of
/// corruption (short frame, checksum mismatch, undecodable payload).
fn read_frame(file: &mut File, total: u64, offset: u64) -> Result<Option<(LogRecord, u64)>> {
    if offset + FRAME_HEADER > total {
        return Ok(None);
    }
    let mut header = [0u8; 8];
    if file.read_exact(&mut header).is_err() {
        return Ok(None);
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if offset + FRAME_HEADER + len > total {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    if file.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    if crc32fast::hash(&payload) != crc {
        return Ok(None);
    }
    match bincode::serde::decode_from_slice::<LogRecord, _>(&payload, codec()) {
        Ok((record, _)) => Ok(Some((record, offset + FRAME_HEADER + len))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::OpKind;
    use tempfile::TempDir;

    fn record(key: &str, value: &str, version: u64) -> LogRecord {
        LogRecord {
            timestamp_ms: 1_700_000_000_000,
            op: OpKind::Set,
            store: "default".to_string(),
            key: key.as_bytes().to_vec(),
            value: Some(value.as_bytes().to_vec()),
            ttl_secs: 0,
            origin: "n1".to_string(),
            version,
        }
    }

    #[test]
    fn test_append_then_replay_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hypercache.aof");
        let (log, report) = AofLog::open(&path, SyncPolicy::Always).unwrap();
        assert_eq!(report.initial_size, 0);

        for i in 0..10u64 {
            log.append(&record(&format!("k{i}"), "v", i + 1)).unwrap();
        }
        assert_eq!(log.records_appended(), 10);

        let replay = AofLog::replay_from(&path, 0).unwrap();
        assert_eq!(replay.records.len(), 10);
        assert_eq!(replay.truncated_bytes, 0);
        assert_eq!(replay.records[3].key, b"k3");
        assert_eq!(replay.valid_end, log.position());
    }

    #[test]
    fn test_replay_from_offset_skips_earlier_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hypercache.aof");
        let (log, _) = AofLog::open(&path, SyncPolicy::Always).unwrap();

        log.append(&record("k1", "v", 1)).unwrap();
        let midpoint = log.append(&record("k2", "v", 2)).unwrap();
        log.append(&record("k3", "v", 3)).unwrap();

        let replay = AofLog::replay_from(&path, midpoint).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.records[0].key, b"k3");
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hypercache.aof");
        let good_end;
        {
            let (log, _) = AofLog::open(&path, SyncPolicy::Always).unwrap();
            log.append(&record("k1", "v1", 1)).unwrap();
            good_end = log.append(&record("k2", "v2", 2)).unwrap();
        }
        // Simulate a crash mid-append: a frame header with no payload.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42u8, 0, 0, 0, 9, 9]).unwrap();
        }

        let (log, report) = AofLog::open(&path, SyncPolicy::Always).unwrap();
        assert_eq!(report.initial_size, good_end);
        assert_eq!(report.truncated_bytes, 6);
        assert_eq!(log.position(), good_end);

        let replay = AofLog::replay_from(&path, 0).unwrap();
        assert_eq!(replay.records.len(), 2);
    }

    #[test]
    fn test_corrupted_payload_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hypercache.aof");
        let first_end;
        {
            let (log, _) = AofLog::open(&path, SyncPolicy::Always).unwrap();
            first_end = log.append(&record("k1", "v1", 1)).unwrap();
            log.append(&record("k2", "v2", 2)).unwrap();
        }
        // Flip a byte inside the second record's payload.
        {
            let mut bytes = std::fs::read(&path).unwrap();
            let index = first_end as usize + 12;
            bytes[index] ^= 0xff;
            std::fs::write(&path, &bytes).unwrap();
        }

        let replay = AofLog::replay_from(&path, 0).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert!(replay.truncated_bytes > 0);
    }

    #[test]
    fn test_compact_rewrites_minimal_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hypercache.aof");
        let (log, _) = AofLog::open(&path, SyncPolicy::Always).unwrap();
        for i in 0..100u64 {
            log.append(&record("hot", &format!("v{i}"), i + 1)).unwrap();
        }
        let before = log.size();

        log.compact(&[record("hot", "v99", 100)]).unwrap();
        assert!(log.size() < before);

        let replay = AofLog::replay_from(&path, 0).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.records[0].version, 100);

        // The log stays appendable after compaction.
        log.append(&record("hot", "v100", 101)).unwrap();
        let replay = AofLog::replay_from(&path, 0).unwrap();
        assert_eq!(replay.records.len(), 2);
    }

    #[test]
    fn test_missing_file_replays_empty() {
        let dir = TempDir::new().unwrap();
        let replay = AofLog::replay_from(&dir.path().join("absent.aof"), 0).unwrap();
        assert!(replay.records.is_empty());
    }
}
