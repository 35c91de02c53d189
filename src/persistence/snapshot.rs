// # Snapshot Manager
//
// Point-in-time dumps of every store, written as
//
//   [u32 header length][bincode header][entry section]
//
// where the entry section is a bincode-encoded Vec of entry records and
// the header carries a format version, the crc32 of the entry section and
// the AOF position the snapshot was started at. The whole file is
// optionally gzip-compressed; the loader sniffs the two magic bytes
// instead of trusting file names. Files are written to a temp path and
// renamed so readers only ever see finalized snapshots.

use crate::common::now_millis;
use crate::error::{CacheError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Bumped when the framing or entry layout changes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const SNAPSHOT_PREFIX: &str = "hypercache-snapshot-";
const SNAPSHOT_SUFFIX: &str = ".rdb";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn codec() -> bincode::config::Configuration {
    bincode::config::standard()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub format_version: u32,
    pub created_at_ms: u64,
    pub origin: String,
    pub entry_count: u64,
    pub compressed: bool,
    /// crc32 of the uncompressed entry section.
    pub checksum: u32,
    /// AOF position when the snapshot began; replay resumes strictly after.
    pub aof_position: u64,
}

/// One entry in the snapshot's entry section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub store: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub version: u64,
}

pub struct SnapshotManager {
    dir: PathBuf,
    origin: String,
    compression_level: u32,
    retain: usize,
}

impl SnapshotManager {
    pub fn new(dir: PathBuf, origin: String, compression_level: u32, retain: usize) -> Self {
        Self {
            dir,
            origin,
            compression_level,
            retain: retain.max(1),
        }
    }

    /// Write a snapshot and apply retention. Returns the finalized path.
    pub fn create(&self, entries: &[SnapshotEntry], aof_position: u64) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let body = bincode::serde::encode_to_vec(entries, codec())?;
        let header = SnapshotHeader {
            format_version: SNAPSHOT_FORMAT_VERSION,
            created_at_ms: now_millis(),
            origin: self.origin.clone(),
            entry_count: entries.len() as u64,
            compressed: self.compression_level > 0,
            checksum: crc32fast::hash(&body),
            aof_position,
        };
        let header_bytes = bincode::serde::encode_to_vec(&header, codec())?;

        let mut raw = Vec::with_capacity(4 + header_bytes.len() + body.len());
        raw.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        raw.extend_from_slice(&header_bytes);
        raw.extend_from_slice(&body);

        let final_path = self.dir.join(self.file_name(header.created_at_ms));
        let tmp_path = final_path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            if self.compression_level > 0 {
                let mut encoder =
                    GzEncoder::new(file, Compression::new(self.compression_level.min(9)));
                encoder.write_all(&raw)?;
                let file = encoder.finish()?;
                file.sync_all()?;
            } else {
                let mut plain = file;
                plain.write_all(&raw)?;
                plain.sync_all()?;
            }
        }
        std::fs::rename(&tmp_path, &final_path)?;

        info!(
            path = %final_path.display(),
            entries = header.entry_count,
            compressed = header.compressed,
            aof_position,
            "snapshot written"
        );

        let removed = self.apply_retention()?;
        if removed > 0 {
            debug!(removed, "snapshot retention removed old files");
        }
        Ok(final_path)
    }

    /// Load the most recent snapshot, if any. A snapshot whose checksum
    /// does not verify is a hard error; the caller refuses to start.
    pub fn load_latest(&self) -> Result<Option<(SnapshotHeader, Vec<SnapshotEntry>)>> {
        let Some(path) = self.latest_file()? else {
            return Ok(None);
        };
        let loaded = self.load(&path)?;
        Ok(Some(loaded))
    }

    pub fn load(&self, path: &Path) -> Result<(SnapshotHeader, Vec<SnapshotEntry>)> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 2];
        let had_magic = file.read_exact(&mut magic).is_ok();

        let mut raw = Vec::new();
        if had_magic && magic == GZIP_MAGIC {
            let reopened = File::open(path)?;
            let mut decoder = GzDecoder::new(reopened);
            decoder.read_to_end(&mut raw)?;
        } else {
            let mut reopened = File::open(path)?;
            reopened.read_to_end(&mut raw)?;
        }

        if raw.len() < 4 {
            return Err(CacheError::PersistenceCorrupt(format!(
                "snapshot {} too short",
                path.display()
            )));
        }
        let header_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        if raw.len() < 4 + header_len {
            return Err(CacheError::PersistenceCorrupt(format!(
                "snapshot {} header extends past end of file",
                path.display()
            )));
        }
        let (header, _): (SnapshotHeader, usize) =
            bincode::serde::decode_from_slice(&raw[4..4 + header_len], codec()).map_err(|e| {
                CacheError::PersistenceCorrupt(format!(
                    "snapshot {} header undecodable: {e}",
                    path.display()
                ))
            })?;
        if header.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(CacheError::PersistenceCorrupt(format!(
                "snapshot {} has unsupported format version {}",
                path.display(),
                header.format_version
            )));
        }

        let body = &raw[4 + header_len..];
        if crc32fast::hash(body) != header.checksum {
            return Err(CacheError::PersistenceCorrupt(format!(
                "snapshot {} failed checksum",
                path.display()
            )));
        }
        let (entries, _): (Vec<SnapshotEntry>, usize) =
            bincode::serde::decode_from_slice(body, codec()).map_err(|e| {
                CacheError::PersistenceCorrupt(format!(
                    "snapshot {} entries undecodable: {e}",
                    path.display()
                ))
            })?;
        if entries.len() as u64 != header.entry_count {
            return Err(CacheError::PersistenceCorrupt(format!(
                "snapshot {} entry count mismatch: header {} body {}",
                path.display(),
                header.entry_count,
                entries.len()
            )));
        }
        Ok((header, entries))
    }

    /// Delete all but the newest `retain` snapshots by modification time.
    pub fn apply_retention(&self) -> Result<usize> {
        let mut files = self.snapshot_files()?;
        if files.len() <= self.retain {
            return Ok(0);
        }
        // Newest first.
        files.sort_by(|a, b| b.1.cmp(&a.1));
        let mut removed = 0;
        for (path, _) in files.into_iter().skip(self.retain) {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshot_files().map(|f| f.len()).unwrap_or(0)
    }

    fn latest_file(&self) -> Result<Option<PathBuf>> {
        let files = self.snapshot_files()?;
        Ok(files
            .into_iter()
            .max_by_key(|(_, modified)| *modified)
            .map(|(path, _)| path))
    }

    fn snapshot_files(&self) -> Result<Vec<(PathBuf, std::time::SystemTime)>> {
        let mut files = Vec::new();
        if !self.dir.exists() {
            return Ok(files);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(SNAPSHOT_SUFFIX) {
                let modified = entry
                    .metadata()?
                    .modified()
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                files.push((entry.path(), modified));
            }
        }
        Ok(files)
    }

    fn file_name(&self, created_at_ms: u64) -> String {
        let secs = (created_at_ms / 1000) as i64;
        let stamp = chrono::DateTime::from_timestamp(secs, ((created_at_ms % 1000) * 1_000_000) as u32)
            .unwrap_or(chrono::DateTime::UNIX_EPOCH)
            .format("%Y%m%dT%H%M%S%.3fZ");
        format!("{SNAPSHOT_PREFIX}{stamp}{SNAPSHOT_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(store: &str, key: &str, value: &str, version: u64) -> SnapshotEntry {
        SnapshotEntry {
            store: store.to_string(),
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            created_at: 1_700_000_000_000,
            expires_at: None,
            version,
        }
    }

    fn manager(dir: &TempDir, level: u32) -> SnapshotManager {
        SnapshotManager::new(dir.path().to_path_buf(), "n1".to_string(), level, 3)
    }

    #[test]
    fn test_round_trip_uncompressed() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 0);
        let entries = vec![entry("default", "k1", "v1", 1), entry("default", "k2", "v2", 4)];
        mgr.create(&entries, 123).unwrap();

        let (header, loaded) = mgr.load_latest().unwrap().unwrap();
        assert_eq!(header.entry_count, 2);
        assert_eq!(header.aof_position, 123);
        assert!(!header.compressed);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].key, b"k2");
        assert_eq!(loaded[1].version, 4);
    }

    #[test]
    fn test_round_trip_compressed() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 6);
        let entries: Vec<SnapshotEntry> = (0..500)
            .map(|i| entry("default", &format!("k{i}"), "same-value-repeated", i))
            .collect();
        let path = mgr.create(&entries, 0).unwrap();

        // Compressed output must actually start with the gzip magic.
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &GZIP_MAGIC);

        let (header, loaded) = mgr.load(&path).unwrap();
        assert!(header.compressed);
        assert_eq!(loaded.len(), 500);
    }

    #[test]
    fn test_checksum_failure_is_hard_error() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 0);
        let path = mgr.create(&[entry("default", "k", "v", 1)], 0).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            mgr.load(&path),
            Err(CacheError::PersistenceCorrupt(_))
        ));
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let mgr = SnapshotManager::new(dir.path().to_path_buf(), "n1".into(), 0, 2);
        for i in 0..4u64 {
            mgr.create(&[entry("default", "k", &format!("v{i}"), i + 1)], i)
                .unwrap();
            // Distinct mtimes so ordering is unambiguous.
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(mgr.snapshot_count(), 2);

        let (header, entries) = mgr.load_latest().unwrap().unwrap();
        assert_eq!(header.aof_position, 3);
        assert_eq!(entries[0].value, b"v3");
    }

    #[test]
    fn test_no_snapshots_loads_none() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 0);
        assert!(mgr.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, 6);
        mgr.create(&[entry("default", "k", "v", 1)], 0).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }
}
