#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use common_redis::testing::{FakeConnector, FakeRedisServer};
use common_redis::{ConnectionConfig, RedisClient};
use usom_archiver::store::{Record, RecordStore, StoreConfig};

pub fn record(id: u64, url: &str, date: &str) -> Record {
    Record {
        id,
        url: url.to_string(),
        kind: "domain".to_string(),
        description: "BP".to_string(),
        source: "US".to_string(),
        date: date.to_string(),
        criticality_level: 3,
        connectiontype: "ip".to_string(),
    }
}

pub fn test_connection() -> ConnectionConfig {
    ConnectionConfig::default().with_reconnect(3, Duration::from_millis(1))
}

pub async fn store_on(server: &FakeRedisServer) -> (RecordStore, Arc<FakeConnector>) {
    store_with(server, test_connection(), StoreConfig::default()).await
}

pub async fn store_with(
    server: &FakeRedisServer,
    connection: ConnectionConfig,
    config: StoreConfig,
) -> (RecordStore, Arc<FakeConnector>) {
    let connector = Arc::new(FakeConnector::new(server.clone()));
    let client = RedisClient::with_connector(connection, connector.clone())
        .await
        .unwrap();
    (RecordStore::new(Arc::new(client), config), connector)
}
