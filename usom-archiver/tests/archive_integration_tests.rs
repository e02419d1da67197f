use std::sync::Arc;

use common_redis::testing::FakeRedisServer;
use serde_json::{json, Value};
use tempfile::TempDir;
use usom_archiver::ingest::ApiPage;
use usom_archiver::store::{StoreConfig, DEFAULT_SOURCE};
use usom_archiver::{IngestionContext, Ingestor, JsonFileSink, PageFileSource, RecordStore};

mod common;
use common::{record, store_on, store_with, test_connection};

const API_URL: &str = "https://www.usom.gov.tr/api/address/index";

fn write_pages(dir: &TempDir, pages: &[Vec<u64>]) -> std::path::PathBuf {
    let pages: Vec<ApiPage> = pages
        .iter()
        .map(|ids| ApiPage {
            total_count: 0,
            page_count: pages.len() as u64,
            models: ids
                .iter()
                .map(|id| {
                    record(
                        *id,
                        &format!("host{id}.example"),
                        &format!("2024-04-{:02} 12:00:00.000000", id),
                    )
                })
                .collect(),
        })
        .collect();
    let path = dir.path().join("pages.json");
    std::fs::write(&path, serde_json::to_string(&pages).unwrap()).unwrap();
    path
}

fn ingestor(store: RecordStore, save_interval: u64) -> Ingestor {
    Ingestor::new(
        Arc::new(store),
        IngestionContext::new(),
        save_interval,
        API_URL,
    )
}

#[tokio::test]
async fn test_ingest_then_export_to_file() {
    let dir = TempDir::new().unwrap();
    let pages = write_pages(&dir, &[vec![1, 2, 3], vec![3, 4], vec![5, 1]]);
    let server = FakeRedisServer::new().with_reply_chunk_size(4);
    let (store, _) = store_on(&server).await;
    let ingestor = ingestor(store, 2);

    let mut source = PageFileSource::open(&pages).await.unwrap();
    let report = ingestor.run(&mut source, 0).await.unwrap();
    assert!(report.completed);
    assert_eq!((report.batches, report.inserted, report.total_count), (3, 5, 5));
    assert_eq!(report.stats.skipped, 2);
    assert!(server.keys_in(0).iter().all(|k| k != "usom:temp:data"));

    let (reader, _) = store_on(&server).await;
    let output = dir.path().join("archive.json");
    let mut sink = JsonFileSink::create(&output, "unused").unwrap();
    let summary = reader.export_all(&mut sink).await.unwrap();
    assert_eq!(summary.exported, 5);

    let doc: Value = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(doc["source"], DEFAULT_SOURCE);
    assert_eq!(doc["apiUrl"], API_URL);
    assert_eq!(doc["totalCount"], 5);
    assert_eq!(doc["pageCount"], 3);
    assert_eq!(doc["dateFilter"], json!({"from": null, "to": null}));
    let ids: Vec<u64> = doc["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![5, 4, 3, 2, 1]);
    assert_eq!(doc["models"][0]["url"], "host5.example");
    assert_eq!(doc["models"][0]["criticality_level"], 3);
}

#[tokio::test]
async fn test_interrupted_run_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let pages = write_pages(&dir, &[vec![1], vec![2], vec![3], vec![4]]);
    let server = FakeRedisServer::new().with_password("secret");
    let connection = test_connection().with_password("secret").with_db(3);

    let (store, _) = store_with(&server, connection.clone(), StoreConfig::default()).await;
    let first = ingestor(store, 1);
    first.context().cancel();
    let mut source = PageFileSource::open(&pages).await.unwrap();
    let report = first.run(&mut source, 0).await.unwrap();
    assert!(!report.completed);
    assert_eq!(report.batches, 0);

    // Pretend the first two pages were stored by an earlier run
    let (store, _) = store_with(&server, connection.clone(), StoreConfig::default()).await;
    store
        .add_records(&[record(1, "", ""), record(2, "", "")])
        .await
        .unwrap();
    store.save_checkpoint(1, 4).await.unwrap();

    let start = Ingestor::resume_from(&store).await.unwrap();
    assert_eq!(start, 2);
    let second = ingestor(store, 1);
    let mut source = PageFileSource::open(&pages).await.unwrap();
    let report = second.run(&mut source, start).await.unwrap();

    assert!(report.completed);
    assert_eq!(report.batches, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.total_count, 4);
    assert!(server.keys_in(0).is_empty());
    assert!(server.keys_in(3).contains(&"usom:meta".to_string()));
    assert!(!server.keys_in(3).contains(&"usom:temp:data".to_string()));
}

#[tokio::test]
async fn test_reingesting_a_file_adds_nothing() {
    let dir = TempDir::new().unwrap();
    let pages = write_pages(&dir, &[vec![7, 8], vec![9]]);
    let server = FakeRedisServer::new();

    let (store, _) = store_on(&server).await;
    let mut source = PageFileSource::open(&pages).await.unwrap();
    assert_eq!(ingestor(store, 10).run(&mut source, 0).await.unwrap().inserted, 3);

    let (store, _) = store_on(&server).await;
    let mut source = PageFileSource::open(&pages).await.unwrap();
    let report = ingestor(store, 10).run(&mut source, 0).await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.stats.skipped, 3);
    assert_eq!(report.total_count, 3);
}
