//! Archive of the USOM malicious address list, kept in Redis.
//!
//! Pages from the address API are ingested into a deduplicating [`store::RecordStore`] and
//! can be exported as a single JSON document, newest records first.
//!
//! ## Error logging (anyhow)
//!
//! Log `anyhow::Error` values with `{e:#}` so the whole cause chain ends up on one line.
//! When wrapping errors, use `.context()` / `.with_context()` so the original error stays
//! the source.

pub mod config;
pub mod export;
pub mod ingest;
pub mod metrics_consts;
pub mod store;

pub use export::{ExportSink, ExportSummary, JsonFileSink, VecSink};
pub use ingest::{BatchSource, IngestionContext, IngestionReport, Ingestor, PageFileSource};
pub use store::{Record, RecordStore};
