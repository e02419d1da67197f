use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use common_redis::{Client, ConnectionConfig, CustomRedisError, RedisClient};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::keys::StoreKeys;
use super::metadata::{ArchiveMetadata, Checkpoint};
use super::record::Record;
use crate::export::{ExportHeader, ExportSink, ExportSummary};
use crate::metrics_consts::{
    BATCH_SIZE_HISTOGRAM, ORPHANED_IDS_COUNTER, RECORDS_ADDED_COUNTER, RECORDS_EXPORTED_COUNTER,
    RECORDS_SKIPPED_COUNTER,
};

const DELETE_BATCH_SIZE: usize = 1000;
const STATUS_SAMPLE_SIZE: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub key_prefix: String,
    /// Number of record hashes fetched per pipeline during export.
    pub export_chunk_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "usom:".to_string(),
            export_chunk_size: 1000,
        }
    }
}

/// Records added and skipped by this store instance since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionStats {
    pub added: u64,
    pub skipped: u64,
}

/// Snapshot of the archive namespace, as printed by `usom-archiver status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub db_size: u64,
    pub namespace_keys: usize,
    pub member_count: u64,
    pub sample_ids: Vec<String>,
}

#[derive(Default)]
struct Counters {
    added: AtomicU64,
    skipped: AtomicU64,
}

/// Deduplicating record archive on top of a [`Client`].
///
/// A record is known once its id is a member of `<prefix>ids`; its fields live in
/// `<prefix>record:<id>`. The set is written before the hash, so a failure between the
/// two leaves an orphan id that readers treat as a missing record.
pub struct RecordStore {
    client: Arc<dyn Client + Send + Sync>,
    keys: StoreKeys,
    config: StoreConfig,
    counters: Counters,
}

impl RecordStore {
    pub fn new(client: Arc<dyn Client + Send + Sync>, config: StoreConfig) -> Self {
        Self {
            client,
            keys: StoreKeys::new(config.key_prefix.clone()),
            config,
            counters: Counters::default(),
        }
    }

    /// Connect to the server described by `connection` and open the store.
    pub async fn connect(connection: ConnectionConfig, config: StoreConfig) -> Result<Self> {
        let target = format!("{}:{}", connection.host, connection.port);
        let client = RedisClient::new(connection)
            .await
            .with_context(|| format!("Failed to connect to Redis at {target}"))?;
        info!("Connected to Redis at {} (prefix {})", target, config.key_prefix);
        Ok(Self::new(Arc::new(client), config))
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    pub async fn exists(&self, id: u64) -> Result<bool> {
        self.client
            .sismember(self.keys.ids(), id.to_string())
            .await
            .with_context(|| format!("Failed to check whether record {id} exists"))
    }

    /// Store one record unless its id is already known. Returns whether it was new.
    pub async fn add_record(&self, record: &Record) -> Result<bool> {
        if self.exists(record.id).await? {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            counter!(RECORDS_SKIPPED_COUNTER).increment(1);
            return Ok(false);
        }

        self.client
            .sadd(self.keys.ids(), vec![record.id.to_string()])
            .await
            .with_context(|| format!("Failed to register record {}", record.id))?;
        self.client
            .hset(self.keys.record(record.id), record.to_fields())
            .await
            .with_context(|| format!("Failed to write record {}", record.id))?;

        self.counters.added.fetch_add(1, Ordering::Relaxed);
        counter!(RECORDS_ADDED_COUNTER).increment(1);
        Ok(true)
    }

    /// Store every record of `batch` whose id is not yet known, in one pipeline.
    ///
    /// An id repeated within the batch is stored once; later copies count as skipped.
    /// Returns the number of records inserted.
    pub async fn add_records(&self, batch: &[Record]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        histogram!(BATCH_SIZE_HISTOGRAM).record(batch.len() as f64);

        let ids: Vec<String> = batch.iter().map(|r| r.id.to_string()).collect();
        let known = self
            .client
            .smismember(self.keys.ids(), ids)
            .await
            .context("Failed to check batch membership")?;

        let fresh = new_records(batch, known).context("Failed to check batch membership")?;
        let skipped = (batch.len() - fresh.len()) as u64;
        self.counters.skipped.fetch_add(skipped, Ordering::Relaxed);
        counter!(RECORDS_SKIPPED_COUNTER).increment(skipped);

        if fresh.is_empty() {
            debug!("Batch of {} records contained no new ids", batch.len());
            return Ok(0);
        }

        let members = fresh.iter().map(|r| r.id.to_string()).collect();
        let hashes = fresh
            .iter()
            .map(|r| (self.keys.record(r.id), r.to_fields()))
            .collect();
        self.client
            .batch_sadd_hset(self.keys.ids(), members, hashes)
            .await
            .with_context(|| format!("Failed to store {} new records", fresh.len()))?;

        let inserted = fresh.len();
        self.counters
            .added
            .fetch_add(inserted as u64, Ordering::Relaxed);
        counter!(RECORDS_ADDED_COUNTER).increment(inserted as u64);
        debug!(
            "Stored {} new records, skipped {} duplicates",
            inserted, skipped
        );
        Ok(inserted)
    }

    /// Number of ids in the archive, orphans included.
    pub async fn total_count(&self) -> Result<u64> {
        self.client
            .scard(self.keys.ids())
            .await
            .context("Failed to count archived records")
    }

    pub fn stats(&self) -> IngestionStats {
        IngestionStats {
            added: self.counters.added.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Delete every key under the prefix. Returns how many keys were removed.
    pub async fn clear_all(&self) -> Result<u64> {
        let keys = self
            .client
            .keys(self.keys.pattern())
            .await
            .context("Failed to list archive keys")?;
        if keys.is_empty() {
            info!("No keys under prefix {}", self.keys.prefix());
            return Ok(0);
        }

        let mut deleted = 0;
        for chunk in keys.chunks(DELETE_BATCH_SIZE) {
            deleted += self
                .client
                .del(chunk.to_vec())
                .await
                .context("Failed to delete archive keys")?;
        }
        info!(
            "Deleted {} keys under prefix {}",
            deleted,
            self.keys.prefix()
        );
        Ok(deleted)
    }

    /// Every numeric id in the archive.
    pub async fn existing_ids(&self) -> Result<HashSet<u64>> {
        let members = self
            .client
            .smembers(self.keys.ids())
            .await
            .context("Failed to read archived ids")?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    pub async fn metadata(&self) -> Result<Option<ArchiveMetadata>> {
        let Some(raw) = self
            .client
            .get(self.keys.meta())
            .await
            .context("Failed to read archive metadata")?
        else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!("Ignoring malformed metadata at {}: {}", self.keys.meta(), e);
                Ok(None)
            }
        }
    }

    /// When the last completed run finished, if one ever did.
    pub async fn last_date(&self) -> Result<Option<String>> {
        Ok(self.metadata().await?.and_then(|meta| meta.last_date))
    }

    /// Write `meta` with the current record count and finish time filled in.
    pub async fn save_metadata(&self, mut meta: ArchiveMetadata) -> Result<ArchiveMetadata> {
        meta.total_count = Some(self.total_count().await?);
        meta.last_date = Some(now());
        let json = serde_json::to_string(&meta).context("Failed to serialize metadata")?;
        self.client
            .set(self.keys.meta(), json)
            .await
            .context("Failed to write archive metadata")?;
        Ok(meta)
    }

    pub async fn save_checkpoint(&self, last_batch: u64, page_count: u64) -> Result<()> {
        let checkpoint = Checkpoint {
            last_batch,
            page_count,
            timestamp: now(),
        };
        let json = serde_json::to_string(&checkpoint).context("Failed to serialize checkpoint")?;
        self.client
            .set(self.keys.checkpoint(), json)
            .await
            .context("Failed to write checkpoint")
    }

    pub async fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let Some(raw) = self
            .client
            .get(self.keys.checkpoint())
            .await
            .context("Failed to read checkpoint")?
        else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!("Ignoring malformed checkpoint: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn clear_checkpoint(&self) -> Result<()> {
        self.client
            .del(vec![self.keys.checkpoint()])
            .await
            .context("Failed to clear checkpoint")?;
        Ok(())
    }

    pub async fn status(&self) -> Result<StoreStatus> {
        let db_size = self.client.dbsize().await.context("DBSIZE failed")?;
        let namespace_keys = self
            .client
            .keys(self.keys.pattern())
            .await
            .context("Failed to list archive keys")?
            .len();
        let member_count = self.total_count().await?;
        let sample_ids = self
            .client
            .srandmember(self.keys.ids(), STATUS_SAMPLE_SIZE)
            .await
            .context("Failed to sample archived ids")?;
        Ok(StoreStatus {
            db_size,
            namespace_keys,
            member_count,
            sample_ids,
        })
    }

    /// Stream every stored record, newest first, into `sink`.
    ///
    /// Hashes are fetched `export_chunk_size` at a time. Orphaned ids are skipped.
    pub async fn export_all(&self, sink: &mut dyn ExportSink) -> Result<ExportSummary> {
        let mut ids: Vec<u64> = self.existing_ids().await?.into_iter().collect();
        ids.sort_unstable();
        info!("Exporting {} archived ids", ids.len());

        let chunk_size = self.config.export_chunk_size.max(1);
        let chunk_total = ids.len().div_ceil(chunk_size);
        let mut records = Vec::with_capacity(ids.len());
        let mut orphaned = 0;
        for (index, chunk) in ids.chunks(chunk_size).enumerate() {
            let keys = chunk.iter().map(|id| self.keys.record(*id)).collect();
            let hashes = self
                .client
                .batch_hgetall(keys)
                .await
                .context("Failed to fetch records for export")?;
            check_reply_len("HGETALL", chunk.len(), hashes.len())
                .context("Failed to fetch records for export")?;
            for (id, fields) in chunk.iter().zip(hashes) {
                match Record::from_fields(*id, fields) {
                    Some(record) => records.push(record),
                    None => orphaned += 1,
                }
            }
            info!(
                "Fetched chunk {}/{} ({} records so far)",
                index + 1,
                chunk_total,
                records.len()
            );
        }
        if orphaned > 0 {
            warn!("Skipped {} ids without a stored record", orphaned);
            counter!(ORPHANED_IDS_COUNTER).increment(orphaned as u64);
        }

        records.sort_by(Record::newest_first);

        let header = ExportHeader {
            total_count: records.len() as u64,
            metadata: self.metadata().await?.unwrap_or_default(),
        };
        sink.begin(&header)?;
        for record in &records {
            sink.write_record(record)?;
        }
        sink.finish()?;
        counter!(RECORDS_EXPORTED_COUNTER).increment(records.len() as u64);

        Ok(ExportSummary {
            exported: records.len(),
            orphaned,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.client
            .close()
            .await
            .context("Failed to close Redis connection")
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Records of `batch` that are neither flagged as known nor repeated earlier in the batch.
fn new_records(batch: &[Record], known: Vec<bool>) -> Result<Vec<&Record>, CustomRedisError> {
    check_reply_len("SMISMEMBER", batch.len(), known.len())?;
    let mut seen = HashSet::with_capacity(batch.len());
    Ok(batch
        .iter()
        .zip(known)
        .filter(|(record, known)| !known && seen.insert(record.id))
        .map(|(record, _)| record)
        .collect())
}

fn check_reply_len(command: &str, expected: usize, got: usize) -> Result<(), CustomRedisError> {
    if expected == got {
        Ok(())
    } else {
        Err(CustomRedisError::UnexpectedReply(format!(
            "{command} returned {got} results for {expected} keys"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::VecSink;
    use common_redis::{CustomRedisError, MockRedisClient};

    fn record(id: u64, date: &str) -> Record {
        Record {
            id,
            url: format!("http://{id}.example"),
            kind: "domain".to_string(),
            description: "phishing".to_string(),
            source: "US".to_string(),
            date: date.to_string(),
            criticality_level: 5,
            connectiontype: "ip".to_string(),
        }
    }

    fn store_with(client: &MockRedisClient) -> RecordStore {
        RecordStore::new(Arc::new(client.clone()), StoreConfig::default())
    }

    #[tokio::test]
    async fn test_add_record_skips_known_ids() {
        let client = MockRedisClient::new();
        let store = store_with(&client);

        assert!(store.add_record(&record(1, "2024-01-01")).await.unwrap());
        assert!(!store.add_record(&record(1, "2024-01-01")).await.unwrap());

        assert_eq!(store.stats(), IngestionStats { added: 1, skipped: 1 });
        assert_eq!(
            client.get_ops(),
            vec!["sismember", "sadd", "hset", "sismember"]
        );
        assert!(client.contains_key("usom:record:1"));
    }

    #[tokio::test]
    async fn test_add_records_counts_in_batch_duplicates_once() {
        let client = MockRedisClient::new();
        let store = store_with(&client);
        let batch = vec![record(1, "a"), record(2, "b"), record(1, "a")];

        assert_eq!(store.add_records(&batch).await.unwrap(), 2);
        assert_eq!(store.total_count().await.unwrap(), 2);
        assert_eq!(store.stats(), IngestionStats { added: 2, skipped: 1 });
    }

    #[tokio::test]
    async fn test_add_records_is_idempotent() {
        let client = MockRedisClient::new();
        let store = store_with(&client);
        let batch = vec![record(7, "2024-01-01")];

        assert_eq!(store.add_records(&batch).await.unwrap(), 1);
        client.clear_calls();
        assert_eq!(store.add_records(&batch).await.unwrap(), 0);

        assert_eq!(client.get_ops(), vec!["smismember"]);
        assert_eq!(store.stats(), IngestionStats { added: 1, skipped: 1 });
    }

    #[tokio::test]
    async fn test_single_and_bulk_agree_on_new_ids() {
        let client = MockRedisClient::new().with_set("usom:ids", &["2", "4"]);
        let store = store_with(&client);

        let mut single = Vec::new();
        for id in 1..=5 {
            single.push(!store.exists(id).await.unwrap());
        }
        let batch: Vec<Record> = (1..=5).map(|id| record(id, "")).collect();
        let inserted = store.add_records(&batch).await.unwrap();

        assert_eq!(single, vec![true, false, true, false, true]);
        assert_eq!(inserted, 3);
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_calls() {
        let client = MockRedisClient::new();
        let store = store_with(&client);

        assert_eq!(store.add_records(&[]).await.unwrap(), 0);
        assert!(client.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_does_not_count_as_added() {
        let client = MockRedisClient::new().fail_next(
            "batch_sadd_hset",
            CustomRedisError::connection_lost("reset by peer"),
        );
        let store = store_with(&client);

        let err = store.add_records(&[record(1, "")]).await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to store 1 new records"));
        assert_eq!(store.stats().added, 0);
        assert_eq!(store.total_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hset_failure_leaves_orphan_that_export_skips() {
        let client = MockRedisClient::new().fail_next(
            "hset",
            CustomRedisError::Server("OOM command not allowed".to_string()),
        );
        let store = store_with(&client);

        assert!(store.add_record(&record(1, "2024-01-01")).await.is_err());
        assert!(store.add_record(&record(2, "2024-01-02")).await.unwrap());
        assert_eq!(store.total_count().await.unwrap(), 2);

        let mut sink = VecSink::default();
        let summary = store.export_all(&mut sink).await.unwrap();
        assert_eq!(summary, ExportSummary { exported: 1, orphaned: 1 });
        assert_eq!(sink.records[0].id, 2);
    }

    #[tokio::test]
    async fn test_export_sorts_newest_first_across_chunks() {
        let client = MockRedisClient::new();
        let store = RecordStore::new(
            Arc::new(client.clone()),
            StoreConfig {
                export_chunk_size: 2,
                ..Default::default()
            },
        );
        let batch = vec![
            record(1, "2023-05-01 00:00:00"),
            record(2, "2024-05-01 00:00:00"),
            record(3, ""),
            record(4, "2024-01-01 00:00:00"),
            record(5, "2022-01-01 00:00:00"),
        ];
        store.add_records(&batch).await.unwrap();
        client.clear_calls();

        let mut sink = VecSink::default();
        store.export_all(&mut sink).await.unwrap();

        let ids: Vec<u64> = sink.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 4, 1, 5, 3]);
        assert_eq!(sink.header.as_ref().map(|h| h.total_count), Some(5));
        let fetches = client
            .get_ops()
            .into_iter()
            .filter(|op| op == "batch_hgetall")
            .count();
        assert_eq!(fetches, 3);
    }

    #[test]
    fn test_new_records_rejects_short_membership_reply() {
        let batch = vec![record(1, ""), record(2, ""), record(3, "")];

        let err = new_records(&batch, vec![false, true]).unwrap_err();
        assert!(matches!(err, CustomRedisError::UnexpectedReply(_)));

        let fresh = new_records(&batch, vec![false, true, false]).unwrap();
        let ids: Vec<u64> = fresh.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_clear_all_escapes_glob_characters_in_prefix() {
        let client = MockRedisClient::new().with_set("usomXids", &["9"]);
        let store = RecordStore::new(
            Arc::new(client.clone()),
            StoreConfig {
                key_prefix: "usom?".to_string(),
                ..Default::default()
            },
        );
        store.add_records(&[record(1, "")]).await.unwrap();

        assert_eq!(store.clear_all().await.unwrap(), 2);
        assert!(client.contains_key("usomXids"));
        assert!(!client.contains_key("usom?ids"));
    }

    #[tokio::test]
    async fn test_clear_all_only_touches_the_prefix() {
        let client = MockRedisClient::new().with_string("other:key", "keep");
        let store = store_with(&client);
        store
            .add_records(&[record(1, ""), record(2, "")])
            .await
            .unwrap();
        store.save_checkpoint(3, 10).await.unwrap();

        assert_eq!(store.clear_all().await.unwrap(), 4);
        assert_eq!(store.total_count().await.unwrap(), 0);
        assert!(client.contains_key("other:key"));
        assert_eq!(store.clear_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let client = MockRedisClient::new();
        let store = store_with(&client);
        store.add_records(&[record(1, "")]).await.unwrap();
        assert_eq!(store.last_date().await.unwrap(), None);

        let saved = store
            .save_metadata(ArchiveMetadata {
                page_count: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(saved.total_count, Some(1));

        let loaded = store.metadata().await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.last_date().await.unwrap(), saved.last_date);
    }

    #[tokio::test]
    async fn test_malformed_metadata_reads_as_missing() {
        let client = MockRedisClient::new().with_string("usom:meta", "{not json");
        let store = store_with(&client);
        assert_eq!(store.metadata().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoint_lifecycle() {
        let client = MockRedisClient::new();
        let store = store_with(&client);

        assert_eq!(store.load_checkpoint().await.unwrap(), None);
        store.save_checkpoint(20, 120).await.unwrap();
        let checkpoint = store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!((checkpoint.last_batch, checkpoint.page_count), (20, 120));

        store.clear_checkpoint().await.unwrap();
        assert_eq!(store.load_checkpoint().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_existing_ids_ignores_non_numeric_members() {
        let client = MockRedisClient::new().with_set("usom:ids", &["1", "x", "3"]);
        let store = store_with(&client);
        assert_eq!(
            store.existing_ids().await.unwrap(),
            HashSet::from([1, 3])
        );
    }

    #[tokio::test]
    async fn test_status() {
        let client = MockRedisClient::new().with_string("other", "1");
        let store = store_with(&client);
        store
            .add_records(&[record(1, ""), record(2, "")])
            .await
            .unwrap();

        let status = store.status().await.unwrap();
        assert_eq!(status.db_size, 4);
        assert_eq!(status.namespace_keys, 3);
        assert_eq!(status.member_count, 2);
        assert_eq!(status.sample_ids.len(), 2);
    }
}
