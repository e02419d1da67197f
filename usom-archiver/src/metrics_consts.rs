// ==== Ingestion metrics ====
/// Counter for records stored for the first time
pub const RECORDS_ADDED_COUNTER: &str = "usom_records_added_total";

/// Counter for records skipped because their id was already known
pub const RECORDS_SKIPPED_COUNTER: &str = "usom_records_skipped_total";

/// Histogram for batch size (number of records per ingested batch)
pub const BATCH_SIZE_HISTOGRAM: &str = "usom_batch_size_records";

/// Histogram for time spent storing one batch
pub const BATCH_PROCESSING_DURATION_HISTOGRAM: &str = "usom_batch_processing_duration_seconds";

/// Counter for checkpoints written during ingestion
pub const CHECKPOINTS_SAVED_COUNTER: &str = "usom_checkpoints_saved_total";

// ==== Export metrics ====
/// Counter for records written to an export sink
pub const RECORDS_EXPORTED_COUNTER: &str = "usom_records_exported_total";

/// Counter for ids in the membership set whose record hash is missing
pub const ORPHANED_IDS_COUNTER: &str = "usom_orphaned_ids_total";
