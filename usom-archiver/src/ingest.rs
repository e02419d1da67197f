use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics_consts::{BATCH_PROCESSING_DURATION_HISTOGRAM, CHECKPOINTS_SAVED_COUNTER};
use crate::store::{IngestionStats, Record, RecordBatch, RecordStore, DEFAULT_SOURCE};

/// Shared state of one ingestion run.
///
/// Clones observe the same cancellation signal and batch index, so a signal handler can
/// hold one while the [`Ingestor`] holds another.
#[derive(Debug, Clone, Default)]
pub struct IngestionContext {
    cancel: CancellationToken,
    current_batch: Arc<AtomicU64>,
}

impl IngestionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop. The batch in progress still finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Index of the batch being stored, or the last one stored.
    pub fn current_batch(&self) -> u64 {
        self.current_batch.load(Ordering::Relaxed)
    }

    fn set_current_batch(&self, batch: u64) {
        self.current_batch.store(batch, Ordering::Relaxed);
    }
}

/// One page of the address API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Zero-based position of this page.
    pub page: u64,
    pub page_count: u64,
    pub records: RecordBatch,
}

#[async_trait]
pub trait BatchSource: Send {
    /// The next page, or `None` once the source is exhausted.
    async fn next_batch(&mut self) -> Result<Option<Page>>;
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {} as API pages: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A page document as returned by the address API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiPage {
    pub total_count: u64,
    pub page_count: u64,
    pub models: Vec<Record>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ApiPages {
    Many(Vec<ApiPage>),
    One(ApiPage),
}

/// Pages saved from the address API: one page object or an array of them.
pub struct PageFileSource {
    pages: VecDeque<ApiPage>,
    next_page: u64,
    page_count: u64,
}

impl PageFileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SourceError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&raw).map_err(|source| SourceError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let pages: VecDeque<ApiPage> = match serde_json::from_str(raw)? {
            ApiPages::One(page) => VecDeque::from([page]),
            ApiPages::Many(pages) => pages.into(),
        };
        // Trust the API's page count when it covers what was saved
        let declared = pages.iter().map(|p| p.page_count).max().unwrap_or(0);
        let page_count = declared.max(pages.len() as u64);
        Ok(Self {
            pages,
            next_page: 0,
            page_count,
        })
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }
}

#[async_trait]
impl BatchSource for PageFileSource {
    async fn next_batch(&mut self) -> Result<Option<Page>> {
        let Some(api_page) = self.pages.pop_front() else {
            return Ok(None);
        };
        let page = Page {
            page: self.next_page,
            page_count: self.page_count,
            records: api_page.models,
        };
        self.next_page += 1;
        Ok(Some(page))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    /// Batches stored by this run; skipped resume pages are not counted.
    pub batches: u64,
    pub inserted: u64,
    pub stats: IngestionStats,
    pub total_count: u64,
    /// False when the run stopped on cancellation.
    pub completed: bool,
    pub last_batch: Option<u64>,
}

/// Drives pages from a [`BatchSource`] into a [`RecordStore`].
pub struct Ingestor {
    store: Arc<RecordStore>,
    context: IngestionContext,
    save_interval: u64,
    api_url: String,
}

impl Ingestor {
    pub fn new(
        store: Arc<RecordStore>,
        context: IngestionContext,
        save_interval: u64,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            context,
            save_interval,
            api_url: api_url.into(),
        }
    }

    pub fn context(&self) -> &IngestionContext {
        &self.context
    }

    /// First batch to process when resuming: the one after the saved checkpoint.
    pub async fn resume_from(store: &RecordStore) -> Result<u64> {
        Ok(store
            .load_checkpoint()
            .await?
            .map_or(0, |checkpoint| checkpoint.last_batch + 1))
    }

    /// Store every page from `source`, starting at page `start_batch`.
    ///
    /// Cancellation is checked between batches only. A checkpoint is written every
    /// `save_interval` batches and when the run stops early; a completed run writes
    /// the archive metadata and removes the checkpoint.
    pub async fn run(
        &self,
        source: &mut dyn BatchSource,
        start_batch: u64,
    ) -> Result<IngestionReport> {
        let mut batches = 0;
        let mut inserted = 0;
        let mut page_count = 0;
        let mut last_batch = None;

        if start_batch > 0 {
            info!("Resuming ingestion at batch {}", start_batch);
        }

        loop {
            if self.context.is_cancelled() {
                info!("Ingestion cancelled after {} batches", batches);
                if let Some(last) = last_batch {
                    self.checkpoint(last, page_count).await?;
                }
                return self
                    .report(batches, inserted, false, last_batch)
                    .await;
            }

            let Some(page) = source.next_batch().await.context("Failed to read batch")? else {
                break;
            };
            page_count = page_count.max(page.page_count);
            if page.page < start_batch {
                debug!("Skipping batch {} (already ingested)", page.page);
                continue;
            }

            self.context.set_current_batch(page.page);
            let started = Instant::now();
            let added = match self.store.add_records(&page.records).await {
                Ok(added) => added,
                Err(e) => {
                    error!("Batch {} failed: {:#}", page.page, e);
                    if let Some(last) = last_batch {
                        if let Err(checkpoint_err) = self.checkpoint(last, page_count).await {
                            warn!("Could not save checkpoint: {:#}", checkpoint_err);
                        }
                    }
                    return Err(e.context(format!("Failed to store batch {}", page.page)));
                }
            };
            histogram!(BATCH_PROCESSING_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());

            batches += 1;
            inserted += added as u64;
            last_batch = Some(page.page);
            info!(
                "Batch {}/{}: {} new of {} records",
                page.page + 1,
                page_count,
                added,
                page.records.len()
            );

            if self.save_interval > 0 && batches % self.save_interval == 0 {
                self.checkpoint(page.page, page_count).await?;
            }
        }

        let mut meta = self.store.metadata().await?.unwrap_or_default();
        meta.source = Some(DEFAULT_SOURCE.to_string());
        meta.api_url = Some(self.api_url.clone());
        meta.page_count = Some(page_count);
        self.store.save_metadata(meta).await?;
        self.store.clear_checkpoint().await?;

        let report = self.report(batches, inserted, true, last_batch).await?;
        info!(
            "Ingestion complete: {} batches, {} new records, {} in archive",
            report.batches, report.inserted, report.total_count
        );
        Ok(report)
    }

    async fn checkpoint(&self, last_batch: u64, page_count: u64) -> Result<()> {
        self.store.save_checkpoint(last_batch, page_count).await?;
        counter!(CHECKPOINTS_SAVED_COUNTER).increment(1);
        debug!("Checkpoint saved at batch {}", last_batch);
        Ok(())
    }

    async fn report(
        &self,
        batches: u64,
        inserted: u64,
        completed: bool,
        last_batch: Option<u64>,
    ) -> Result<IngestionReport> {
        Ok(IngestionReport {
            batches,
            inserted,
            stats: self.store.stats(),
            total_count: self.store.total_count().await?,
            completed,
            last_batch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use common_redis::{CustomRedisError, MockRedisClient};

    fn record(id: u64) -> Record {
        Record {
            id,
            url: format!("{id}.example"),
            kind: "domain".to_string(),
            description: "C2".to_string(),
            source: "US".to_string(),
            date: format!("2024-01-{:02} 00:00:00", id % 28 + 1),
            criticality_level: 1,
            connectiontype: "ip".to_string(),
        }
    }

    /// Yields the given pages and cancels `context` once `cancel_after` pages were handed out.
    struct ScriptedSource {
        pages: VecDeque<Page>,
        handed_out: usize,
        cancel_after: Option<(usize, IngestionContext)>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Vec<u64>>) -> Self {
            let page_count = pages.len() as u64;
            let pages = pages
                .into_iter()
                .enumerate()
                .map(|(index, ids)| Page {
                    page: index as u64,
                    page_count,
                    records: ids.into_iter().map(record).collect(),
                })
                .collect();
            Self {
                pages,
                handed_out: 0,
                cancel_after: None,
            }
        }

        fn cancel_after(mut self, pages: usize, context: &IngestionContext) -> Self {
            self.cancel_after = Some((pages, context.clone()));
            self
        }
    }

    #[async_trait]
    impl BatchSource for ScriptedSource {
        async fn next_batch(&mut self) -> Result<Option<Page>> {
            let page = self.pages.pop_front();
            if page.is_some() {
                self.handed_out += 1;
            }
            if let Some((limit, context)) = &self.cancel_after {
                if self.handed_out >= *limit {
                    context.cancel();
                }
            }
            Ok(page)
        }
    }

    fn ingestor(client: &MockRedisClient, save_interval: u64) -> Ingestor {
        let store = RecordStore::new(Arc::new(client.clone()), StoreConfig::default());
        Ingestor::new(
            Arc::new(store),
            IngestionContext::new(),
            save_interval,
            "https://api.example/address",
        )
    }

    #[tokio::test]
    async fn test_completed_run_writes_metadata_and_clears_checkpoint() {
        let client = MockRedisClient::new();
        let ingestor = ingestor(&client, 1);
        let mut source = ScriptedSource::new(vec![vec![1, 2], vec![2, 3], vec![]]);

        let report = ingestor.run(&mut source, 0).await.unwrap();

        assert!(report.completed);
        assert_eq!(report.batches, 3);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.stats, IngestionStats { added: 3, skipped: 1 });
        assert_eq!(report.total_count, 3);
        assert_eq!(report.last_batch, Some(2));
        assert_eq!(ingestor.context().current_batch(), 2);

        let meta = ingestor.store.metadata().await.unwrap().unwrap();
        assert_eq!(meta.page_count, Some(3));
        assert_eq!(meta.api_url.as_deref(), Some("https://api.example/address"));
        assert_eq!(meta.source.as_deref(), Some(DEFAULT_SOURCE));
        assert!(meta.last_date.is_some());
        assert!(!client.contains_key("usom:temp:data"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_batches_and_checkpoints() {
        let client = MockRedisClient::new();
        let ingestor = ingestor(&client, 100);
        let mut source = ScriptedSource::new(vec![vec![1], vec![2], vec![3], vec![4]])
            .cancel_after(2, ingestor.context());

        let report = ingestor.run(&mut source, 0).await.unwrap();

        // The second batch was handed out before the signal was observed, so it is stored
        assert!(!report.completed);
        assert_eq!(report.batches, 2);
        assert_eq!(report.last_batch, Some(1));
        assert_eq!(report.total_count, 2);

        let checkpoint = ingestor.store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(checkpoint.last_batch, 1);
        assert_eq!(Ingestor::resume_from(&ingestor.store).await.unwrap(), 2);
        assert_eq!(ingestor.store.metadata().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resume_skips_stored_batches() {
        let client = MockRedisClient::new();
        let ingestor = ingestor(&client, 10);
        ingestor.store.save_checkpoint(1, 4).await.unwrap();
        let start = Ingestor::resume_from(&ingestor.store).await.unwrap();

        let mut source = ScriptedSource::new(vec![vec![1], vec![2], vec![3], vec![4]]);
        let report = ingestor.run(&mut source, start).await.unwrap();

        assert_eq!(start, 2);
        assert_eq!(report.batches, 2);
        assert_eq!(ingestor.store.existing_ids().await.unwrap().len(), 2);
        assert!(ingestor.store.exists(3).await.unwrap());
        assert!(!ingestor.store.exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_aborts_and_keeps_progress() {
        // Batch 0 only holds a known id and needs no write; batch 1's write fails
        let client = MockRedisClient::new()
            .with_set("usom:ids", &["1"])
            .fail_next("batch_sadd_hset", CustomRedisError::Timeout);
        let ingestor = ingestor(&client, 100);
        let mut source = ScriptedSource::new(vec![vec![1], vec![2], vec![3]]);

        let err = ingestor.run(&mut source, 0).await.unwrap_err();

        assert!(format!("{err:#}").contains("Failed to store batch 1"));
        let checkpoint = ingestor.store.load_checkpoint().await.unwrap().unwrap();
        assert_eq!(checkpoint.last_batch, 0);
        assert_eq!(ingestor.store.total_count().await.unwrap(), 1);
        assert_eq!(ingestor.store.metadata().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_page_file_source_accepts_single_page_and_arrays() {
        let single = r#"{"totalCount":2,"pageCount":1,"models":[{"id":1},{"id":2,"url":"x"}]}"#;
        let mut source = PageFileSource::from_json(single).unwrap();
        let page = source.next_batch().await.unwrap().unwrap();
        assert_eq!((page.page, page.page_count, page.records.len()), (0, 1, 2));
        assert_eq!(source.next_batch().await.unwrap(), None);

        let many = r#"[{"pageCount":5,"models":[{"id":1}]},{"models":[{"id":2}]}]"#;
        let mut source = PageFileSource::from_json(many).unwrap();
        assert_eq!(source.page_count(), 5);
        source.next_batch().await.unwrap();
        let second = source.next_batch().await.unwrap().unwrap();
        assert_eq!(second.page, 1);
        assert_eq!(second.records[0].id, 2);
    }

    #[tokio::test]
    async fn test_page_file_source_reports_bad_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = PageFileSource::open(dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(SourceError::Read { .. })));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[1, 2").unwrap();
        let bad = PageFileSource::open(&path).await;
        assert!(matches!(bad, Err(SourceError::Parse { .. })));
    }
}
