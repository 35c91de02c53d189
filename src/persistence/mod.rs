// # Persistence Engine
//
// Composes the append-only operation log and the snapshot manager into the
// node's durability layer. Mutations are written through to the AOF under
// the configured sync policy; background tasks take periodic snapshots,
// compact the log when it outgrows its threshold, and drive the everysec
// fsync cadence. Recovery seeds state from the newest snapshot and then
// replays the AOF strictly after the snapshot's recorded position, letting
// the highest version per key win.

pub mod aof;
pub mod snapshot;

pub use aof::{AofLog, ReplayReport};
pub use snapshot::{SnapshotEntry, SnapshotHeader, SnapshotManager, SNAPSHOT_FORMAT_VERSION};

use crate::common::now_millis;
use crate::config::{NodeConfig, PersistenceConfig};
use crate::engine::CacheEngine;
use crate::error::{CacheError, Result};
use crate::store::VersionedOp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// File name of the live operation log inside the data directory.
pub const AOF_FILE_NAME: &str = "hypercache.aof";

/// How often the compaction checker looks at the log size.
const COMPACTION_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Operation kinds the log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    Set,
    Del,
    Expire,
    Clear,
}

/// One durable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp_ms: u64,
    pub op: OpKind,
    pub store: String,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// Relative TTL at write time; zero means no expiry.
    pub ttl_secs: u64,
    pub origin: String,
    pub version: u64,
}

impl LogRecord {
    pub fn set(
        store: &str,
        key: &[u8],
        value: &[u8],
        ttl_secs: u64,
        origin: &str,
        version: u64,
    ) -> Self {
        Self {
            timestamp_ms: now_millis(),
            op: OpKind::Set,
            store: store.to_string(),
            key: key.to_vec(),
            value: Some(value.to_vec()),
            ttl_secs,
            origin: origin.to_string(),
            version,
        }
    }

    pub fn del(store: &str, key: &[u8], origin: &str, version: u64) -> Self {
        Self {
            timestamp_ms: now_millis(),
            op: OpKind::Del,
            store: store.to_string(),
            key: key.to_vec(),
            value: None,
            ttl_secs: 0,
            origin: origin.to_string(),
            version,
        }
    }

    pub fn expire(store: &str, key: &[u8], ttl_secs: u64, origin: &str, version: u64) -> Self {
        Self {
            timestamp_ms: now_millis(),
            op: OpKind::Expire,
            store: store.to_string(),
            key: key.to_vec(),
            value: None,
            ttl_secs,
            origin: origin.to_string(),
            version,
        }
    }

    pub fn clear(store: &str, origin: &str) -> Self {
        Self {
            timestamp_ms: now_millis(),
            op: OpKind::Clear,
            store: store.to_string(),
            key: Vec::new(),
            value: None,
            ttl_secs: 0,
            origin: origin.to_string(),
            version: 0,
        }
    }

    /// Absolute expiry instant this record encodes, if any.
    pub fn expires_at(&self) -> Option<u64> {
        (self.ttl_secs > 0).then(|| self.timestamp_ms + self.ttl_secs * 1000)
    }
}

/// When appends reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every record.
    Always,
    /// Batched; a background task fsyncs once per second.
    #[default]
    EverySec,
    /// Leave it to the OS.
    No,
}

/// Which durability mechanisms run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceStrategy {
    Aof,
    Snapshot,
    #[default]
    Hybrid,
}

#[derive(Debug, Default)]
pub struct PersistenceStats {
    pub records_logged: AtomicU64,
    pub snapshots_created: AtomicU64,
    pub compactions: AtomicU64,
    pub recovered_entries: AtomicU64,
    pub replayed_records: AtomicU64,
    pub truncated_bytes: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceStatsSnapshot {
    pub enabled: bool,
    pub records_logged: u64,
    pub snapshots_created: u64,
    pub compactions: u64,
    pub recovered_entries: u64,
    pub replayed_records: u64,
    pub truncated_bytes: u64,
    pub aof_size: u64,
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub snapshot_entries: u64,
    pub replayed_records: u64,
    pub truncated_bytes: u64,
    pub resumed_from: u64,
}

pub struct PersistenceEngine {
    config: PersistenceConfig,
    node_id: String,
    data_dir: PathBuf,
    aof: Option<Arc<AofLog>>,
    snapshots: SnapshotManager,
    stats: PersistenceStats,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistenceEngine {
    pub fn new(config: PersistenceConfig, node: &NodeConfig) -> Result<Self> {
        let data_dir = node.data_dir.clone();
        if config.enabled {
            std::fs::create_dir_all(&data_dir)?;
        }

        let uses_aof = config.enabled
            && matches!(
                config.strategy,
                PersistenceStrategy::Aof | PersistenceStrategy::Hybrid
            );
        let aof = if uses_aof {
            let (log, report) = AofLog::open(&data_dir.join(AOF_FILE_NAME), config.sync_policy)?;
            if report.truncated_bytes > 0 {
                warn!(
                    truncated_bytes = report.truncated_bytes,
                    "operation log opened with a torn tail"
                );
            }
            Some(Arc::new(log))
        } else {
            None
        };

        let snapshots = SnapshotManager::new(
            data_dir.clone(),
            node.id.clone(),
            config.compression_level,
            config.retain_snapshots,
        );
        let (shutdown, _) = watch::channel(false);

        let engine = Self {
            config,
            node_id: node.id.clone(),
            data_dir,
            aof,
            snapshots,
            stats: PersistenceStats::default(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        };
        Ok(engine)
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    fn uses_snapshots(&self) -> bool {
        self.config.enabled
            && matches!(
                self.config.strategy,
                PersistenceStrategy::Snapshot | PersistenceStrategy::Hybrid
            )
    }

    /// Write one operation through to the log. A no-op when persistence is
    /// disabled or the strategy is snapshot-only.
    pub fn log_operation(&self, record: &LogRecord) -> Result<()> {
        let Some(aof) = &self.aof else {
            return Ok(());
        };
        aof.append(record)?;
        self.stats.records_logged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Rebuild engine state: newest snapshot first, then every AOF record
    /// strictly after the snapshot's position. Higher versions win.
    pub fn recover(&self, engine: &CacheEngine) -> Result<RecoveryReport> {
        if !self.config.enabled {
            return Ok(RecoveryReport::default());
        }

        let mut report = RecoveryReport::default();
        let mut resume_from = 0u64;

        if self.uses_snapshots() {
            match self.snapshots.load_latest()? {
                Some((header, entries)) => {
                    resume_from = header.aof_position;
                    for entry in entries {
                        match engine.apply_versioned(
                            &entry.store,
                            &entry.key,
                            VersionedOp::Set {
                                value: entry.value,
                                created_at: entry.created_at,
                                expires_at: entry.expires_at,
                            },
                            entry.version,
                        ) {
                            Ok(true) => report.snapshot_entries += 1,
                            Ok(false) => {}
                            Err(CacheError::UnknownStore(name)) => {
                                warn!(store = %name, "snapshot entry for unconfigured store, skipped");
                            }
                            Err(e) => {
                                warn!(error = %e, "snapshot entry not applied");
                            }
                        }
                    }
                }
                None => {}
            }
        }

        if self.aof.is_some() {
            let replay =
                AofLog::replay_from(&self.data_dir.join(AOF_FILE_NAME), resume_from)?;
            if replay.truncated_bytes > 0 {
                warn!(
                    truncated_bytes = replay.truncated_bytes,
                    "replay stopped at torn log tail"
                );
            }
            for record in &replay.records {
                if let Err(e) = self.apply_record(engine, record) {
                    warn!(error = %e, op = ?record.op, "log record not applied");
                } else {
                    report.replayed_records += 1;
                }
            }
            report.truncated_bytes = replay.truncated_bytes;
        }

        report.resumed_from = resume_from;
        self.stats
            .recovered_entries
            .fetch_add(report.snapshot_entries, Ordering::Relaxed);
        self.stats
            .replayed_records
            .fetch_add(report.replayed_records, Ordering::Relaxed);
        self.stats
            .truncated_bytes
            .fetch_add(report.truncated_bytes, Ordering::Relaxed);

        info!(
            snapshot_entries = report.snapshot_entries,
            replayed = report.replayed_records,
            resumed_from = report.resumed_from,
            "recovery complete"
        );
        Ok(report)
    }

    fn apply_record(&self, engine: &CacheEngine, record: &LogRecord) -> Result<()> {
        match record.op {
            OpKind::Set => {
                let value = record.value.clone().ok_or_else(|| {
                    CacheError::PersistenceCorrupt("SET record missing value".into())
                })?;
                engine.apply_versioned(
                    &record.store,
                    &record.key,
                    VersionedOp::Set {
                        value,
                        created_at: record.timestamp_ms,
                        expires_at: record.expires_at(),
                    },
                    record.version,
                )?;
            }
            OpKind::Del => {
                engine.apply_versioned(
                    &record.store,
                    &record.key,
                    VersionedOp::Delete,
                    record.version,
                )?;
            }
            OpKind::Expire => {
                engine.apply_expire(
                    &record.store,
                    &record.key,
                    record.expires_at(),
                    record.version,
                )?;
            }
            OpKind::Clear => {
                engine.clear(&record.store)?;
            }
        }
        Ok(())
    }

    /// Dump every store into a fresh snapshot tagged with the current AOF
    /// position, then apply retention.
    pub fn create_snapshot(&self, engine: &CacheEngine) -> Result<PathBuf> {
        if !self.uses_snapshots() {
            return Err(CacheError::PersistenceUnavailable(
                "snapshots disabled by strategy".into(),
            ));
        }
        let aof_position = self.aof.as_ref().map(|a| a.position()).unwrap_or(0);
        let mut entries = Vec::new();
        for (store, dumped) in engine.dump_all() {
            for entry in dumped {
                entries.push(SnapshotEntry {
                    store: store.clone(),
                    key: entry.key,
                    value: entry.value,
                    created_at: entry.created_at,
                    expires_at: entry.expires_at,
                    version: entry.version,
                });
            }
        }
        let path = self.snapshots.create(&entries, aof_position)?;
        self.stats.snapshots_created.fetch_add(1, Ordering::Relaxed);
        Ok(path)
    }

    /// Rewrite the AOF as the minimal SET sequence reconstructing current
    /// state.
    pub fn compact(&self, engine: &CacheEngine) -> Result<u64> {
        let Some(aof) = &self.aof else {
            return Err(CacheError::PersistenceUnavailable(
                "no operation log to compact".into(),
            ));
        };
        let now = now_millis();
        let mut records = Vec::new();
        for (store, dumped) in engine.dump_all() {
            for entry in dumped {
                let ttl_secs = match entry.expires_at {
                    Some(at) if at > now => (at - now).div_ceil(1000),
                    Some(_) => continue, // already expired
                    None => 0,
                };
                records.push(LogRecord {
                    timestamp_ms: now,
                    op: OpKind::Set,
                    store: store.clone(),
                    key: entry.key,
                    value: Some(entry.value),
                    ttl_secs,
                    origin: self.node_id.clone(),
                    version: entry.version,
                });
            }
        }
        let new_size = aof.compact(&records)?;
        self.stats.compactions.fetch_add(1, Ordering::Relaxed);
        info!(new_size, records = records.len(), "operation log compacted");
        Ok(new_size)
    }

    /// Spawn the background tickers: snapshot schedule, compaction
    /// threshold checks, and the everysec fsync driver.
    pub fn start(self: &Arc<Self>, engine: Arc<CacheEngine>) {
        if !self.config.enabled {
            return;
        }
        let mut tasks = self.tasks.lock();

        if self.uses_snapshots() && self.config.snapshot_interval_secs > 0 {
            let this = self.clone();
            let engine = engine.clone();
            let mut shutdown = self.shutdown.subscribe();
            let interval = Duration::from_secs(self.config.snapshot_interval_secs);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = this.create_snapshot(&engine) {
                                error!(error = %e, "scheduled snapshot failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        if let Some(aof) = self.aof.clone() {
            if self.config.sync_policy == SyncPolicy::EverySec {
                let mut shutdown = self.shutdown.subscribe();
                tasks.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_secs(1));
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                if let Err(e) = aof.sync() {
                                    error!(error = %e, "everysec fsync failed");
                                }
                            }
                            _ = shutdown.changed() => break,
                        }
                    }
                }));
            }

            let this = self.clone();
            let engine = engine.clone();
            let max_log_size = self.config.max_log_size;
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(COMPACTION_CHECK_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let size = this.aof.as_ref().map(|a| a.size()).unwrap_or(0);
                            if size > max_log_size {
                                info!(size, max_log_size, "log over threshold, compacting");
                                if let Err(e) = this.compact(&engine) {
                                    error!(error = %e, "compaction failed");
                                }
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
    }

    /// Stop background work and flush the log.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(aof) = &self.aof {
            if let Err(e) = aof.sync() {
                error!(error = %e, "final log flush failed");
            }
        }
    }

    pub fn stats(&self) -> PersistenceStatsSnapshot {
        PersistenceStatsSnapshot {
            enabled: self.config.enabled,
            records_logged: self.stats.records_logged.load(Ordering::Relaxed),
            snapshots_created: self.stats.snapshots_created.load(Ordering::Relaxed),
            compactions: self.stats.compactions.load(Ordering::Relaxed),
            recovered_entries: self.stats.recovered_entries.load(Ordering::Relaxed),
            replayed_records: self.stats.replayed_records.load(Ordering::Relaxed),
            truncated_bytes: self.stats.truncated_bytes.load(Ordering::Relaxed),
            aof_size: self.aof.as_ref().map(|a| a.size()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheTuning, StoreConfig};
    use tempfile::TempDir;

    fn node_config(dir: &TempDir) -> NodeConfig {
        NodeConfig {
            id: "n1".to_string(),
            data_dir: dir.path().to_path_buf(),
        }
    }

    fn persistence_config() -> PersistenceConfig {
        PersistenceConfig {
            enabled: true,
            strategy: PersistenceStrategy::Hybrid,
            sync_policy: SyncPolicy::Always,
            snapshot_interval_secs: 0,
            max_log_size: 64 * 1024 * 1024,
            compression_level: 0,
            retain_snapshots: 3,
        }
    }

    fn fresh_engine() -> Arc<CacheEngine> {
        CacheEngine::from_configs(CacheTuning::default(), &[StoreConfig::named("default")])
            .unwrap()
    }

    #[test]
    fn test_disabled_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut config = persistence_config();
        config.enabled = false;
        let persistence = PersistenceEngine::new(config, &node_config(&dir)).unwrap();
        persistence
            .log_operation(&LogRecord::set("default", b"k", b"v", 0, "n1", 1))
            .unwrap();
        let report = persistence.recover(&fresh_engine()).unwrap();
        assert_eq!(report.replayed_records, 0);
        assert_eq!(persistence.stats().records_logged, 0);
    }

    #[test]
    fn test_log_then_recover_round_trip() {
        let dir = TempDir::new().unwrap();
        let node = node_config(&dir);

        {
            let persistence =
                PersistenceEngine::new(persistence_config(), &node).unwrap();
            for i in 0..100u64 {
                let key = format!("k{i}");
                persistence
                    .log_operation(&LogRecord::set(
                        "default",
                        key.as_bytes(),
                        format!("v{i}").as_bytes(),
                        0,
                        "n1",
                        1,
                    ))
                    .unwrap();
            }
            persistence
                .log_operation(&LogRecord::del("default", b"k42", "n1", 2))
                .unwrap();
        }

        let persistence = PersistenceEngine::new(persistence_config(), &node).unwrap();
        let engine = fresh_engine();
        let report = persistence.recover(&engine).unwrap();
        assert_eq!(report.replayed_records, 101);
        assert_eq!(engine.get("default", b"k7").unwrap().0, b"v7");
        assert!(engine.get("default", b"k42").is_err());
        assert_eq!(engine.store("default").unwrap().len(), 99);
    }

    #[test]
    fn test_snapshot_plus_tail_replay() {
        let dir = TempDir::new().unwrap();
        let node = node_config(&dir);
        let engine = fresh_engine();

        let persistence = PersistenceEngine::new(persistence_config(), &node).unwrap();
        // Writes before the snapshot.
        for i in 0..10u64 {
            let key = format!("k{i}");
            engine
                .put("default", key.as_bytes(), b"before".to_vec(), Some(0))
                .unwrap();
            persistence
                .log_operation(&LogRecord::set("default", key.as_bytes(), b"before", 0, "n1", 1))
                .unwrap();
        }
        persistence.create_snapshot(&engine).unwrap();
        // Writes after the snapshot, including an overwrite.
        persistence
            .log_operation(&LogRecord::set("default", b"k3", b"after", 0, "n1", 2))
            .unwrap();
        persistence
            .log_operation(&LogRecord::set("default", b"new", b"tail", 0, "n1", 1))
            .unwrap();

        let recovered_engine = fresh_engine();
        let persistence2 = PersistenceEngine::new(persistence_config(), &node).unwrap();
        let report = persistence2.recover(&recovered_engine).unwrap();

        assert_eq!(report.snapshot_entries, 10);
        // Only the two post-snapshot records replay.
        assert_eq!(report.replayed_records, 2);
        assert_eq!(recovered_engine.get("default", b"k3").unwrap().0, b"after");
        assert_eq!(recovered_engine.get("default", b"new").unwrap().0, b"tail");
        assert_eq!(recovered_engine.get("default", b"k0").unwrap().0, b"before");
    }

    #[test]
    fn test_recovery_equals_direct_application() {
        let dir = TempDir::new().unwrap();
        let node = node_config(&dir);
        let direct = fresh_engine();

        let persistence = PersistenceEngine::new(persistence_config(), &node).unwrap();
        let ops = vec![
            LogRecord::set("default", b"a", b"1", 0, "n1", 1),
            LogRecord::set("default", b"b", b"2", 0, "n1", 1),
            LogRecord::set("default", b"a", b"3", 0, "n1", 2),
            LogRecord::del("default", b"b", "n1", 2),
            LogRecord::set("default", b"c", b"4", 0, "n1", 1),
        ];
        for op in &ops {
            persistence.log_operation(op).unwrap();
            persistence.apply_record(&direct, op).unwrap();
        }

        let recovered = fresh_engine();
        let persistence2 = PersistenceEngine::new(persistence_config(), &node).unwrap();
        persistence2.recover(&recovered).unwrap();

        for key in [b"a".as_slice(), b"b", b"c"] {
            let lhs = direct.get("default", key).ok().map(|(v, _)| v);
            let rhs = recovered.get("default", key).ok().map(|(v, _)| v);
            assert_eq!(lhs, rhs);
        }
    }

    #[test]
    fn test_compaction_shrinks_and_preserves_state() {
        let dir = TempDir::new().unwrap();
        let node = node_config(&dir);
        let engine = fresh_engine();
        let persistence = PersistenceEngine::new(persistence_config(), &node).unwrap();

        for i in 0..200u64 {
            engine
                .put("default", b"churn", format!("v{i}").into_bytes(), Some(0))
                .unwrap();
            persistence
                .log_operation(&LogRecord::set(
                    "default",
                    b"churn",
                    format!("v{i}").as_bytes(),
                    0,
                    "n1",
                    i + 1,
                ))
                .unwrap();
        }
        let before = persistence.stats().aof_size;
        persistence.compact(&engine).unwrap();
        assert!(persistence.stats().aof_size < before);

        let recovered = fresh_engine();
        let persistence2 = PersistenceEngine::new(persistence_config(), &node).unwrap();
        persistence2.recover(&recovered).unwrap();
        assert_eq!(recovered.get("default", b"churn").unwrap().0, b"v199");
    }

    #[test]
    fn test_expire_record_replays() {
        let dir = TempDir::new().unwrap();
        let node = node_config(&dir);
        let persistence = PersistenceEngine::new(persistence_config(), &node).unwrap();
        persistence
            .log_operation(&LogRecord::set("default", b"k", b"v", 0, "n1", 1))
            .unwrap();
        persistence
            .log_operation(&LogRecord::expire("default", b"k", 3600, "n1", 2))
            .unwrap();

        let engine = fresh_engine();
        let persistence2 = PersistenceEngine::new(persistence_config(), &node).unwrap();
        persistence2.recover(&engine).unwrap();
        let (_, info) = engine.get("default", b"k").unwrap();
        assert!(info.expires_at.is_some());
        assert_eq!(info.version, 2);
    }
}
