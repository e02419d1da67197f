mod keys;
mod metadata;
mod record;
mod record_store;

pub use keys::StoreKeys;
pub use metadata::{ArchiveMetadata, Checkpoint, DateFilter, DEFAULT_SOURCE};
pub use record::{Record, RecordBatch};
pub use record_store::{IngestionStats, RecordStore, StoreConfig, StoreStatus};
